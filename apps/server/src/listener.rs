//! Device reports arriving over UDP.
//!
//! Sensors and actuators push one JSON object per datagram. Temperatures go
//! straight into the registry. Setpoints reported by thermostats and TRVs are
//! debounced per actuator before they reach the manual-override detector,
//! since a device often reports several intermediate values while a user
//! turns the knob.

use crate::SharedEngine;
use anyhow::{Context, Result};
use chrono::Utc;
use heating_engine::{ActuatorState, CachedRegistry, Debouncer};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

const MAX_UDP: usize = 1460;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceReport {
    Sensor {
        id: String,
        temperature: f64,
    },
    Actuator {
        id: String,
        #[serde(default)]
        on: Option<bool>,
        #[serde(default)]
        setpoint: Option<f64>,
    },
}

pub trait MessageHandler<T> {
    fn on_message(&mut self, src: SocketAddr, msg: T) -> Result<()>;
}

/// Receives datagrams on `bind_addr` forever, handing each decoded message
/// to `handler`. Undecodable datagrams are logged and dropped.
pub async fn main_loop<T, H>(bind_addr: &str, handler: &mut H) -> Result<()>
where
    T: DeserializeOwned,
    H: MessageHandler<T>,
{
    let socket = UdpSocket::bind(bind_addr)
        .await
        .with_context(|| format!("binding report socket {}", bind_addr))?;
    info!("listening for device reports on {}", bind_addr);

    let mut buf = [0; MAX_UDP];
    loop {
        let (sz, src) = socket.recv_from(&mut buf).await?;
        let res = serde_json::from_slice::<T>(&buf[..sz])
            .map_err(anyhow::Error::from)
            .and_then(|msg| handler.on_message(src, msg));
        if let Err(e) = res {
            warn!("{}: {:#}", src, e);
        }
    }
}

pub struct ReportHandler {
    registry: Arc<CachedRegistry>,
    debouncer: Arc<Debouncer<String>>,
    engine: SharedEngine,
}

impl ReportHandler {
    pub fn new(
        registry: Arc<CachedRegistry>,
        debouncer: Arc<Debouncer<String>>,
        engine: SharedEngine,
    ) -> Self {
        ReportHandler {
            registry,
            debouncer,
            engine,
        }
    }
}

impl MessageHandler<DeviceReport> for ReportHandler {
    fn on_message(&mut self, src: SocketAddr, msg: DeviceReport) -> Result<()> {
        match msg {
            DeviceReport::Sensor { id, temperature } => {
                if !temperature.is_finite() {
                    anyhow::bail!("{}: temperature is not a number", id);
                }
                debug!("{} ({}): {:.1}°C", id, src, temperature);
                self.registry.report_temperature(&id, temperature);
            }
            DeviceReport::Actuator { id, on, setpoint } => {
                self.registry.report_actuator(&id, ActuatorState { on, setpoint });
                let Some(setpoint) = setpoint.filter(|s| s.is_finite()) else {
                    return Ok(());
                };
                let engine = self.engine.clone();
                self.debouncer.trigger(id.clone(), async move {
                    let mut engine = engine.lock().await;
                    match engine.handle_actuator_report(&id, setpoint, Utc::now()).await {
                        Ok(true) => info!("{}: manual setpoint {:.1}°C taken over", id, setpoint),
                        Ok(false) => {}
                        Err(e) => warn!("{}: could not persist manual override: {}", id, e),
                    }
                });
            }
        }
        Ok(())
    }
}
