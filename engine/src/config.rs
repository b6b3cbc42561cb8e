//! Global controller settings.
//!
//! Every field carries a serde default so a partial `global.json` loads into
//! a complete record. Values are checked once by [`GlobalConfig::validate`]
//! before they can reach the control loop.

use crate::error::ConfigError;
use crate::zone::{HeatingType, Zone};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_HYSTERESIS: f64 = 0.5;
pub const MAX_HYSTERESIS: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub hysteresis: f64,
    pub frost_protection_temperature: Option<f64>,
    pub tick_interval_secs: u64,
    pub command_timeout_ms: u64,
    pub command_retries: u32,
    /// Manual-override detection stays quiet this long after startup.
    pub override_grace_secs: u64,
    pub debounce_ms: u64,
    pub outdoor_sensor: Option<String>,
    pub overshoot_protection_value: Option<f64>,
    pub pwm: PwmConfig,
    pub boiler: BoilerConfig,
    pub proactive: ProactiveConfig,
    pub tracker: TrackerConfig,
    pub curve: CurveConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            hysteresis: DEFAULT_HYSTERESIS,
            frost_protection_temperature: None,
            tick_interval_secs: 60,
            command_timeout_ms: 5_000,
            command_retries: 1,
            override_grace_secs: 120,
            debounce_ms: 2_000,
            outdoor_sensor: None,
            overshoot_protection_value: None,
            pwm: PwmConfig::default(),
            boiler: BoilerConfig::default(),
            proactive: ProactiveConfig::default(),
            tracker: TrackerConfig::default(),
            curve: CurveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PwmConfig {
    pub enabled: bool,
    pub min_on_seconds: u32,
    pub max_on_seconds: u32,
    pub min_off_seconds: u32,
    pub max_off_seconds: u32,
}

impl Default for PwmConfig {
    fn default() -> Self {
        PwmConfig {
            enabled: true,
            min_on_seconds: 60,
            max_on_seconds: 600,
            min_off_seconds: 60,
            max_off_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoilerConfig {
    /// Installation has a central boiler fed by the zones' aggregate demand.
    pub enabled: bool,
    /// Boiler accepts a continuous modulation level / flow setpoint.
    pub modulating: bool,
    /// Boiler accepts the 0% modulation command the calibration needs.
    pub supports_modulation_command: bool,
    /// Optional on/off switch that follows "any zone heating".
    pub switch: Option<String>,
    /// Sensor reporting the boiler flow temperature.
    pub flow_sensor: Option<String>,
    pub minimum_setpoint: f64,
    pub maximum_setpoint: f64,
    /// Bias added on top of the flow temperature during a PWM ON phase.
    pub setpoint_bias: f64,
    pub calibration_samples: u32,
    pub calibration_interval_secs: u64,
}

impl Default for BoilerConfig {
    fn default() -> Self {
        BoilerConfig {
            enabled: true,
            modulating: false,
            supports_modulation_command: true,
            switch: None,
            flow_sensor: None,
            minimum_setpoint: 10.0,
            maximum_setpoint: 75.0,
            setpoint_bias: 2.0,
            calibration_samples: 20,
            calibration_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProactiveConfig {
    pub enabled: bool,
    /// Trend (°C/hour) at or above which nothing is triggered. Negative.
    pub min_trend: f64,
    pub sensitivity: f64,
    pub radiator_margin_minutes: f64,
    pub floor_heating_margin_minutes: f64,
    pub airco_margin_minutes: f64,
    pub cooldown_minutes: i64,
}

impl ProactiveConfig {
    pub fn margin_minutes(&self, heating_type: HeatingType) -> f64 {
        match heating_type {
            HeatingType::Radiator => self.radiator_margin_minutes,
            HeatingType::FloorHeating => self.floor_heating_margin_minutes,
            HeatingType::Airco => self.airco_margin_minutes,
        }
    }
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        ProactiveConfig {
            enabled: true,
            min_trend: -0.1,
            sensitivity: 1.0,
            radiator_margin_minutes: 5.0,
            floor_heating_margin_minutes: 15.0,
            airco_margin_minutes: 2.0,
            cooldown_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_samples: usize,
    pub trend_window_minutes: i64,
    /// Sample count at which count-based confidence saturates.
    pub full_confidence_samples: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            max_samples: 100,
            trend_window_minutes: 30,
            full_confidence_samples: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveConfig {
    pub base_offset: f64,
    pub coefficient: f64,
}

impl Default for CurveConfig {
    fn default() -> Self {
        CurveConfig {
            base_offset: 20.0,
            coefficient: 1.5,
        }
    }
}

impl GlobalConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_hysteresis(self.hysteresis)?;
        check_range(
            "pwm on seconds",
            self.pwm.min_on_seconds as f64,
            self.pwm.max_on_seconds as f64,
        )?;
        check_range(
            "pwm off seconds",
            self.pwm.min_off_seconds as f64,
            self.pwm.max_off_seconds as f64,
        )?;
        check_range(
            "boiler setpoint",
            self.boiler.minimum_setpoint,
            self.boiler.maximum_setpoint,
        )?;
        if self.boiler.calibration_samples == 0 {
            return Err(ConfigError::InvalidRange {
                field: "calibration samples",
                min: 1.0,
                max: 0.0,
            });
        }
        if self.tracker.max_samples < 2 {
            return Err(ConfigError::InvalidRange {
                field: "tracker samples",
                min: 2.0,
                max: self.tracker.max_samples as f64,
            });
        }
        Ok(())
    }
}

/// Rejects invalid per-zone overrides and duplicate ids.
pub fn validate_zones(zones: &[Zone]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for zone in zones {
        if !seen.insert(zone.id.as_str()) {
            return Err(ConfigError::DuplicateZone(zone.id.clone()));
        }
        if let Some(h) = zone.hysteresis {
            check_hysteresis(h)?;
        }
    }
    Ok(())
}

fn check_hysteresis(h: f64) -> Result<(), ConfigError> {
    if !h.is_finite() || !(0.0..=MAX_HYSTERESIS).contains(&h) {
        return Err(ConfigError::InvalidHysteresis(h));
    }
    Ok(())
}

fn check_range(field: &'static str, min: f64, max: f64) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::InvalidRange { field, min, max });
    }
    Ok(())
}
