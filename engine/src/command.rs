use crate::error::CommandError;
use crate::interfaces::ActuatorBus;
use crate::zone::HvacMode;
use log::debug;
use std::fmt;
use std::time::Duration;

/// One write to the actuator bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ThermostatTemperature { id: String, celsius: f64 },
    HvacMode { id: String, mode: HvacMode },
    Switch { id: String, on: bool },
    ValvePosition { id: String, percent: u8 },
    BoilerModulation(u8),
    BoilerFlowTemperature(f64),
}

impl Command {
    /// Actuator this command addresses; boiler-level commands have none.
    pub fn actuator_id(&self) -> Option<&str> {
        match self {
            Command::ThermostatTemperature { id, .. }
            | Command::HvacMode { id, .. }
            | Command::Switch { id, .. }
            | Command::ValvePosition { id, .. } => Some(id),
            Command::BoilerModulation(_) | Command::BoilerFlowTemperature(_) => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ThermostatTemperature { id, celsius } => {
                write!(f, "{} -> {:.1}°C", id, celsius)
            }
            Command::HvacMode { id, mode } => write!(f, "{} -> {:?}", id, mode),
            Command::Switch { id, on } => write!(f, "{} -> {}", id, if *on { "ON" } else { "OFF" }),
            Command::ValvePosition { id, percent } => write!(f, "{} -> {}%", id, percent),
            Command::BoilerModulation(pct) => write!(f, "boiler modulation -> {}%", pct),
            Command::BoilerFlowTemperature(t) => write!(f, "boiler flow -> {:.1}°C", t),
        }
    }
}

/// Timeout and bounded retry applied to every bus call.
#[derive(Debug, Clone, Copy)]
pub struct CommandPolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        CommandPolicy {
            timeout: Duration::from_secs(5),
            retries: 1,
        }
    }
}

impl CommandPolicy {
    pub async fn send(&self, bus: &dyn ActuatorBus, command: &Command) -> Result<(), CommandError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, send_once(bus, command)).await {
                Ok(r) => r,
                Err(_) => Err(CommandError::Timeout),
            };
            match result {
                Ok(()) => return Ok(()),
                // Retrying cannot make an unsupported command work.
                Err(e @ CommandError::Unsupported(_)) => return Err(e),
                Err(e) if attempt >= self.retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    debug!("retrying {} after {} (attempt {})", command, e, attempt);
                }
            }
        }
    }
}

async fn send_once(bus: &dyn ActuatorBus, command: &Command) -> Result<(), CommandError> {
    match command {
        Command::ThermostatTemperature { id, celsius } => {
            bus.set_thermostat_temperature(id, *celsius).await
        }
        Command::HvacMode { id, mode } => bus.set_hvac_mode(id, *mode).await,
        Command::Switch { id, on } => bus.set_switch(id, *on).await,
        Command::ValvePosition { id, percent } => bus.set_valve_position(id, *percent).await,
        Command::BoilerModulation(pct) => bus.set_boiler_modulation(*pct).await,
        Command::BoilerFlowTemperature(t) => bus.set_boiler_flow_temperature(*t).await,
    }
}
