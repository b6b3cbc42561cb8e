//! Actuator bus over UDP.
//!
//! Every command is one JSON datagram sent to `<actuator id>:<relay port>`,
//! so actuator ids are the devices' host names. Boiler-level commands go to
//! the configured boiler host.

use async_trait::async_trait;
use heating_engine::{ActuatorBus, CommandError, HvacMode};
use log::debug;
use serde::Serialize;
use tokio::net::UdpSocket;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RelayControl {
    Temperature { celsius: f64 },
    HvacMode { mode: HvacMode },
    Switch { on: bool },
    Valve { percent: u8 },
    Modulation { percent: u8 },
    FlowTemperature { celsius: f64 },
}

pub struct UdpRelayBus {
    port: u16,
    boiler_host: Option<String>,
}

impl UdpRelayBus {
    pub fn new(port: u16, boiler_host: Option<String>) -> Self {
        UdpRelayBus { port, boiler_host }
    }

    async fn send(&self, host: &str, msg: &RelayControl) -> Result<(), CommandError> {
        let bytes = serde_json::to_vec(msg).map_err(|e| CommandError::Rejected(e.to_string()))?;
        let udp = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| CommandError::Unreachable(format!("bind: {}", e)))?;
        udp.send_to(&bytes, (host, self.port))
            .await
            .map_err(|e| CommandError::Unreachable(format!("{}: {}", host, e)))?;
        debug!("{} <- {:?}", host, msg);
        Ok(())
    }

    async fn send_boiler(&self, msg: RelayControl) -> Result<(), CommandError> {
        match &self.boiler_host {
            Some(host) => self.send(host, &msg).await,
            None => Err(CommandError::Unsupported("no boiler host configured")),
        }
    }
}

#[async_trait]
impl ActuatorBus for UdpRelayBus {
    async fn set_thermostat_temperature(&self, id: &str, celsius: f64) -> Result<(), CommandError> {
        self.send(id, &RelayControl::Temperature { celsius }).await
    }

    async fn set_hvac_mode(&self, id: &str, mode: HvacMode) -> Result<(), CommandError> {
        self.send(id, &RelayControl::HvacMode { mode }).await
    }

    async fn set_switch(&self, id: &str, on: bool) -> Result<(), CommandError> {
        self.send(id, &RelayControl::Switch { on }).await
    }

    async fn set_valve_position(&self, id: &str, percent: u8) -> Result<(), CommandError> {
        self.send(id, &RelayControl::Valve { percent }).await
    }

    async fn set_boiler_modulation(&self, percent: u8) -> Result<(), CommandError> {
        self.send_boiler(RelayControl::Modulation { percent }).await
    }

    async fn set_boiler_flow_temperature(&self, celsius: f64) -> Result<(), CommandError> {
        self.send_boiler(RelayControl::FlowTemperature { celsius }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() -> anyhow::Result<()> {
        let json = serde_json::to_value(RelayControl::Switch { on: true })?;
        assert_eq!(json, serde_json::json!({"command": "switch", "on": true}));
        let json = serde_json::to_value(RelayControl::HvacMode { mode: HvacMode::HeatCool })?;
        assert_eq!(json, serde_json::json!({"command": "hvac_mode", "mode": "heat_cool"}));
        Ok(())
    }

    #[tokio::test]
    async fn datagram_reaches_the_device() -> anyhow::Result<()> {
        let device = UdpSocket::bind("127.0.0.1:0").await?;
        let port = device.local_addr()?.port();
        let bus = UdpRelayBus::new(port, Some("127.0.0.1".into()));

        bus.set_valve_position("127.0.0.1", 40).await?;
        let mut buf = [0; 512];
        let (n, _) = device.recv_from(&mut buf).await?;
        let msg: serde_json::Value = serde_json::from_slice(&buf[..n])?;
        assert_eq!(msg, serde_json::json!({"command": "valve", "percent": 40}));

        bus.set_boiler_flow_temperature(45.5).await?;
        let (n, _) = device.recv_from(&mut buf).await?;
        let msg: serde_json::Value = serde_json::from_slice(&buf[..n])?;
        assert_eq!(msg["celsius"], 45.5);
        Ok(())
    }

    #[tokio::test]
    async fn boiler_without_host_is_unsupported() {
        let bus = UdpRelayBus::new(4210, None);
        assert!(matches!(
            bus.set_boiler_modulation(0).await,
            Err(CommandError::Unsupported(_))
        ));
    }
}
