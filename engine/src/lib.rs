//! Zoned heating and cooling control.
//!
//! [`HeatingCycleEngine`] owns the zones and runs one control cycle per
//! tick. Sensors, actuators and persistence are reached through the traits
//! in [`interfaces`]; [`registry`] and [`store`] carry the implementations
//! the server uses.

pub mod boiler;
pub mod calibration;
pub mod command;
pub mod config;
pub mod curve;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod learning;
pub mod manual_override;
pub mod proactive;
pub mod pwm;
pub mod registry;
pub mod setpoint;
pub mod state;
pub mod store;
pub mod tracker;
pub mod zone;

pub use boiler::{BoilerDemand, BoilerStatus, ModulationGate};
pub use calibration::{CalibrationOutcome, OvershootProtectionCalibrator};
pub use command::{Command, CommandPolicy};
pub use config::GlobalConfig;
pub use debounce::Debouncer;
pub use engine::{
    Collaborators, CycleReport, EngineStatus, HeatingCycleEngine, ZoneOutcome, ZoneSnapshot,
};
pub use error::{CommandError, ConfigError, StoreError};
pub use interfaces::{
    ActuatorBus, ActuatorState, ConfigStore, EventStore, SensorRegistry, WeatherAccessor,
};
pub use learning::{HeatingEvent, LearningEngine, LearningStats};
pub use registry::CachedRegistry;
pub use state::{Action, HeatingState};
pub use store::{JsonFileStore, JsonLinesEventStore};
pub use zone::{HeatingType, HvacMode, Zone};
