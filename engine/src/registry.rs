//! Timestamped cache of the latest sensor and actuator reports.
//!
//! Readings older than `max_age` count as unavailable, the same way a
//! silent sensor would. The clock is injected so staleness is testable.

use crate::interfaces::{ActuatorState, Clock, SensorRegistry, WeatherAccessor};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const DEFAULT_MAX_AGE_SECS: i64 = 180;

#[derive(Debug, Clone, Copy)]
struct Timestamped<T> {
    value: T,
    received_at: DateTime<Utc>,
}

pub struct CachedRegistry {
    clock: Arc<dyn Clock>,
    max_age: Duration,
    outdoor_sensor: Option<String>,
    temperatures: RwLock<HashMap<String, Timestamped<f64>>>,
    actuators: RwLock<HashMap<String, Timestamped<ActuatorState>>>,
}

impl CachedRegistry {
    pub fn new(clock: Arc<dyn Clock>, max_age: Duration, outdoor_sensor: Option<String>) -> Self {
        CachedRegistry {
            clock,
            max_age,
            outdoor_sensor,
            temperatures: RwLock::new(HashMap::new()),
            actuators: RwLock::new(HashMap::new()),
        }
    }

    fn fresh(&self, received_at: DateTime<Utc>) -> bool {
        self.clock.now() - received_at <= self.max_age
    }

    pub fn report_temperature(&self, id: &str, celsius: f64) {
        let entry = Timestamped {
            value: celsius,
            received_at: self.clock.now(),
        };
        if let Ok(mut map) = self.temperatures.write() {
            map.insert(id.to_string(), entry);
        }
    }

    /// Merges a partial actuator report into the cached state.
    pub fn report_actuator(&self, id: &str, report: ActuatorState) {
        let now = self.clock.now();
        if let Ok(mut map) = self.actuators.write() {
            let merged = match map.get(id) {
                Some(prev) if self.fresh(prev.received_at) => ActuatorState {
                    on: report.on.or(prev.value.on),
                    setpoint: report.setpoint.or(prev.value.setpoint),
                },
                _ => report,
            };
            map.insert(
                id.to_string(),
                Timestamped {
                    value: merged,
                    received_at: now,
                },
            );
        }
    }

    pub fn invalidate(&self, id: &str) {
        if let Ok(mut map) = self.temperatures.write() {
            map.remove(id);
        }
        if let Ok(mut map) = self.actuators.write() {
            map.remove(id);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut map) = self.temperatures.write() {
            map.clear();
        }
        if let Ok(mut map) = self.actuators.write() {
            map.clear();
        }
    }

    /// Ids with a fresh temperature reading.
    pub fn known_sensors(&self) -> Vec<String> {
        self.temperatures
            .read()
            .map(|map| {
                map.iter()
                    .filter(|(_, t)| self.fresh(t.received_at))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl SensorRegistry for CachedRegistry {
    fn read_temperature(&self, id: &str) -> Option<f64> {
        let map = self.temperatures.read().ok()?;
        let t = map.get(id)?;
        self.fresh(t.received_at).then_some(t.value)
    }

    fn read_actuator_state(&self, id: &str) -> Option<ActuatorState> {
        let map = self.actuators.read().ok()?;
        let a = map.get(id)?;
        self.fresh(a.received_at).then_some(a.value)
    }
}

impl WeatherAccessor for CachedRegistry {
    fn current_outdoor_temperature(&self) -> Option<f64> {
        self.outdoor_sensor
            .as_deref()
            .and_then(|id| self.read_temperature(id))
    }
}
