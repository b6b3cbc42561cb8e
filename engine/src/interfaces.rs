//! Seams to the embedding system: sensors, actuators, persistence, weather.

use crate::config::GlobalConfig;
use crate::error::{CommandError, StoreError};
use crate::learning::HeatingEvent;
use crate::zone::{HvacMode, Zone};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Last reported state of an actuator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActuatorState {
    pub on: Option<bool>,
    pub setpoint: Option<f64>,
}

/// Read-only view of sensors and actuators. Unavailable values are `None`,
/// never an error. Values are already in °C.
pub trait SensorRegistry: Send + Sync {
    fn read_temperature(&self, id: &str) -> Option<f64>;
    fn read_actuator_state(&self, id: &str) -> Option<ActuatorState>;
}

#[async_trait]
pub trait ActuatorBus: Send + Sync {
    async fn set_thermostat_temperature(&self, id: &str, celsius: f64) -> Result<(), CommandError>;
    async fn set_hvac_mode(&self, id: &str, mode: HvacMode) -> Result<(), CommandError>;
    async fn set_switch(&self, id: &str, on: bool) -> Result<(), CommandError>;
    async fn set_valve_position(&self, id: &str, percent: u8) -> Result<(), CommandError>;
    async fn set_boiler_modulation(&self, percent: u8) -> Result<(), CommandError>;
    async fn set_boiler_flow_temperature(&self, celsius: f64) -> Result<(), CommandError>;
}

/// Whole-document persistence of zone and global settings.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_zones(&self) -> Result<Vec<Zone>, StoreError>;
    async fn save_zones(&self, zones: &[Zone]) -> Result<(), StoreError>;
    async fn load_global(&self) -> Result<GlobalConfig, StoreError>;
    async fn save_global(&self, config: &GlobalConfig) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn record_event(&self, zone_id: &str, event: &HeatingEvent) -> Result<(), StoreError>;
    /// Events ordered by start time; `since == None` returns all of them.
    async fn query_events(
        &self,
        zone_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HeatingEvent>, StoreError>;
}

pub trait WeatherAccessor: Send + Sync {
    fn current_outdoor_temperature(&self) -> Option<f64>;
}

/// Weather accessor for installations without an outdoor sensor.
pub struct NoWeather;

impl WeatherAccessor for NoWeather {
    fn current_outdoor_temperature(&self) -> Option<f64> {
        None
    }
}

/// Resolves the target the hysteresis runs against: effective target plus
/// whatever the embedding system layers on top (frost floor, vacation).
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, zone: &Zone, now: DateTime<Utc>) -> f64;
}

pub struct FrostFloorResolver {
    pub frost_floor: Option<f64>,
}

impl TargetResolver for FrostFloorResolver {
    fn resolve(&self, zone: &Zone, _now: DateTime<Utc>) -> f64 {
        let target = zone.effective_target();
        match self.frost_floor {
            Some(floor) => target.max(floor),
            None => target,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
