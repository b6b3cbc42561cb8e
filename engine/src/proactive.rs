//! Proactive maintenance: start heating before the hysteresis threshold is
//! crossed when the zone is cooling fast enough that reactive heating would
//! arrive late.

use crate::config::ProactiveConfig;
use crate::learning::LearningEngine;
use crate::tracker::TemperatureTracker;
use crate::zone::Zone;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProactiveOutcome {
    Disabled,
    NoReading,
    /// Proactive heating started earlier and the target is not reached yet.
    Continue,
    /// Target reached; cooldown starts now.
    Completed,
    Cooldown,
    NoTrend,
    /// Trend is flat, rising, or falling too slowly to matter.
    Stable { trend: f64 },
    /// Already at or below the hysteresis threshold; reactive control handles it.
    Reactive,
    Insufficient,
    Wait { time_to_threshold: f64, predicted: f64 },
    Triggered { time_to_threshold: f64, predicted: f64 },
}

impl ProactiveOutcome {
    pub fn wants_heat(&self) -> bool {
        matches!(self, ProactiveOutcome::Continue | ProactiveOutcome::Triggered { .. })
    }
}

pub fn should_preheat(
    predicted_minutes: f64,
    time_to_threshold: f64,
    sensitivity: f64,
    margin_minutes: f64,
) -> bool {
    predicted_minutes * sensitivity + margin_minutes >= time_to_threshold
}

/// Heating time estimate used until enough heating episodes are recorded.
///
/// Heating is assumed to run at twice `loss_rate` (°C/min, positive). The
/// caller passes the learned cooling rate when there is one and the live
/// falling trend otherwise.
pub fn fallback_heating_minutes(current: f64, target: f64, loss_rate: f64) -> f64 {
    ((target - current) / (2.0 * loss_rate)).ceil()
}

pub struct ProactiveMaintenanceHandler {
    config: ProactiveConfig,
    tracker: Arc<TemperatureTracker>,
    learning: Arc<LearningEngine>,
    active: HashMap<String, DateTime<Utc>>,
    cooldown_until: HashMap<String, DateTime<Utc>>,
}

impl ProactiveMaintenanceHandler {
    pub fn new(
        config: ProactiveConfig,
        tracker: Arc<TemperatureTracker>,
        learning: Arc<LearningEngine>,
    ) -> Self {
        ProactiveMaintenanceHandler {
            config,
            tracker,
            learning,
            active: HashMap::new(),
            cooldown_until: HashMap::new(),
        }
    }

    pub fn is_active(&self, zone_id: &str) -> bool {
        self.active.contains_key(zone_id)
    }

    /// Forgets a running proactive episode, e.g. when the zone left automatic control.
    pub fn cancel(&mut self, zone_id: &str) {
        if self.active.remove(zone_id).is_some() {
            debug!("{}: proactive heating cancelled", zone_id);
        }
    }

    pub async fn check(
        &mut self,
        zone: &Zone,
        target: f64,
        hysteresis: f64,
        now: DateTime<Utc>,
    ) -> ProactiveOutcome {
        if !self.config.enabled {
            return ProactiveOutcome::Disabled;
        }
        let Some(current) = zone.current_temperature else {
            return ProactiveOutcome::NoReading;
        };

        if let Some(started) = self.active.get(&zone.id).copied() {
            if current < target {
                return ProactiveOutcome::Continue;
            }
            self.active.remove(&zone.id);
            self.cooldown_until
                .insert(zone.id.clone(), now + Duration::minutes(self.config.cooldown_minutes));
            info!(
                "{}: proactive heating reached {:.1}°C after {} min",
                zone.id,
                target,
                (now - started).num_minutes()
            );
            return ProactiveOutcome::Completed;
        }

        match self.cooldown_until.get(&zone.id) {
            Some(until) if *until > now => return ProactiveOutcome::Cooldown,
            Some(_) => {
                self.cooldown_until.remove(&zone.id);
            }
            None => {}
        }

        let Some(trend) = self.tracker.trend(&zone.id, now) else {
            return ProactiveOutcome::NoTrend;
        };
        if trend >= 0.0 || trend > self.config.min_trend {
            return ProactiveOutcome::Stable { trend };
        }

        let threshold = target - hysteresis;
        if current <= threshold {
            return ProactiveOutcome::Reactive;
        }
        let time_to_threshold = self.tracker.predict_time_to_temperature(&zone.id, threshold, now);
        let Some(time_to_threshold) = time_to_threshold else {
            return ProactiveOutcome::Insufficient;
        };

        let predicted = match self
            .learning
            .predict_heating_time(&zone.id, current, target, now)
            .await
        {
            Some(minutes) => minutes as f64,
            None => {
                let loss = match self.learning.average_cooling_rate(&zone.id, now).await {
                    Some(rate) => rate,
                    None => -trend / 60.0,
                };
                fallback_heating_minutes(current, target, loss)
            }
        };

        let margin = self.config.margin_minutes(zone.heating_type);
        if should_preheat(predicted, time_to_threshold, self.config.sensitivity, margin) {
            info!(
                "{}: proactive heating, threshold in {:.0} min, heating needs {:.0} min \
                 (trend {:+.2}°C/h)",
                zone.id, time_to_threshold, predicted, trend
            );
            self.active.insert(zone.id.clone(), now);
            ProactiveOutcome::Triggered {
                time_to_threshold,
                predicted,
            }
        } else {
            ProactiveOutcome::Wait {
                time_to_threshold,
                predicted,
            }
        }
    }
}
