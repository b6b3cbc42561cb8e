//! Tells user setpoint changes at a thermostat apart from the controller's own writes.

use crate::zone::Zone;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

/// Readings within this distance of the expected value are automated writes.
pub const OVERRIDE_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Startup snapshots are not trusted yet.
    GracePeriod,
    /// Matches what the controller expects or last wrote.
    Automated,
    /// Below the expected target: an older preset/idle value arriving late.
    Stale,
    Manual,
}

pub struct ManualOverrideDetector {
    started_at: DateTime<Utc>,
    grace: Duration,
}

impl ManualOverrideDetector {
    pub fn new(started_at: DateTime<Utc>, grace: Duration) -> Self {
        ManualOverrideDetector { started_at, grace }
    }

    pub fn in_grace_period(&self, now: DateTime<Utc>) -> bool {
        now < self.started_at + self.grace
    }

    pub fn classify(
        &self,
        zone: &Zone,
        actuator_id: &str,
        observed: f64,
        now: DateTime<Utc>,
    ) -> Classification {
        if self.in_grace_period(now) {
            return Classification::GracePeriod;
        }
        let expected = zone.effective_target();
        if (observed - expected).abs() < OVERRIDE_TOLERANCE {
            return Classification::Automated;
        }
        if let Some(written) = zone.last_commanded(actuator_id) {
            if (observed - written).abs() < OVERRIDE_TOLERANCE {
                return Classification::Automated;
            }
        }
        if observed < expected - OVERRIDE_TOLERANCE {
            return Classification::Stale;
        }
        Classification::Manual
    }

    /// Applies a manual change to `zone`. Returns true when the zone changed
    /// and has to be persisted.
    pub fn detect(
        &self,
        zone: &mut Zone,
        actuator_id: &str,
        observed: f64,
        now: DateTime<Utc>,
    ) -> bool {
        match self.classify(zone, actuator_id, observed, now) {
            Classification::Manual => {
                info!(
                    "{}: manual setpoint {:.1}°C on {} (expected {:.1}°C)",
                    zone.id,
                    observed,
                    actuator_id,
                    zone.effective_target()
                );
                zone.target_temperature = observed;
                zone.manual_override = true;
                true
            }
            Classification::Stale => {
                debug!(
                    "{}: ignoring stale {:.1}°C from {} (expected {:.1}°C)",
                    zone.id,
                    observed,
                    actuator_id,
                    zone.effective_target()
                );
                false
            }
            Classification::GracePeriod | Classification::Automated => false,
        }
    }
}
