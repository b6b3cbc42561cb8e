use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Failure of a single actuator command on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    /// The bus did not confirm the command within the configured timeout.
    Timeout,
    /// The device (or its gateway) could not be reached.
    Unreachable(String),
    /// The device answered but refused the command.
    Rejected(String),
    /// The bus has no way to express this command for the device.
    Unsupported(&'static str),
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Timeout => write!(f, "command timed out"),
            CommandError::Unreachable(s) => write!(f, "device unreachable: {}", s),
            CommandError::Rejected(s) => write!(f, "command rejected: {}", s),
            CommandError::Unsupported(what) => write!(f, "unsupported command: {}", what),
        }
    }
}

impl Error for CommandError {}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Json(serde_json::Error),
    NotFound(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "io error: {}", e),
            StoreError::Json(e) => write!(f, "json error: {}", e),
            StoreError::NotFound(what) => write!(f, "{} not found", what),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Json(e) => Some(e),
            StoreError::NotFound(_) => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        StoreError::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Json(value)
    }
}

/// Rejection of a configuration value at the configuration boundary.
#[derive(Debug)]
pub enum ConfigError {
    InvalidHysteresis(f64),
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
    },
    /// Requested zone target outside the supported setpoint range.
    InvalidTarget(f64),
    DuplicateZone(String),
    UnknownZone(String),
    Store(StoreError),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidHysteresis(h) => {
                write!(f, "hysteresis {:.2} outside 0.0..=2.0", h)
            }
            ConfigError::InvalidRange { field, min, max } => {
                write!(f, "{}: min {} exceeds max {}", field, min, max)
            }
            ConfigError::InvalidTarget(t) => write!(f, "target {:.1}°C out of range", t),
            ConfigError::DuplicateZone(id) => write!(f, "zone {} defined more than once", id),
            ConfigError::UnknownZone(id) => write!(f, "zone {} not found", id),
            ConfigError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for ConfigError {
    fn from(value: StoreError) -> Self {
        ConfigError::Store(value)
    }
}
