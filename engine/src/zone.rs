use crate::state::ZoneState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_TARGET_TEMPERATURE: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Off,
    #[default]
    Heat,
    Cool,
    Auto,
    HeatCool,
}

impl HvacMode {
    pub fn allows_heat(self) -> bool {
        matches!(self, HvacMode::Heat | HvacMode::Auto | HvacMode::HeatCool)
    }

    pub fn allows_cool(self) -> bool {
        matches!(self, HvacMode::Cool | HvacMode::Auto | HvacMode::HeatCool)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatingType {
    #[default]
    Radiator,
    FloorHeating,
    Airco,
}

/// A controllable thermal area.
///
/// Everything above `current_temperature` is configuration and round-trips
/// through the config store. The remaining fields are runtime state owned by
/// the cycle engine and start from their defaults after every load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_target")]
    pub target_temperature: f64,
    #[serde(default)]
    pub hvac_mode: HvacMode,
    /// Per-zone hysteresis; the global default applies when unset.
    #[serde(default)]
    pub hysteresis: Option<f64>,
    #[serde(default)]
    pub heating_type: HeatingType,
    #[serde(default)]
    pub manual_override: bool,
    #[serde(default)]
    pub preset_temperature: Option<f64>,
    #[serde(default)]
    pub boost_temperature: Option<f64>,
    #[serde(default)]
    pub thermostats: Vec<String>,
    #[serde(default)]
    pub trvs: Vec<String>,
    #[serde(default)]
    pub switches: Vec<String>,
    #[serde(default)]
    pub valves: Vec<String>,
    #[serde(default)]
    pub sensors: Vec<String>,

    #[serde(skip)]
    pub current_temperature: Option<f64>,
    #[serde(skip)]
    pub state: ZoneState,
    /// Last temperature written to each thermostat/TRV, keyed by actuator id.
    #[serde(skip)]
    pub(crate) last_commanded: HashMap<String, f64>,
}

fn default_enabled() -> bool {
    true
}

fn default_target() -> f64 {
    DEFAULT_TARGET_TEMPERATURE
}

impl Zone {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Zone {
            id: id.into(),
            name: name.into(),
            enabled: true,
            target_temperature: DEFAULT_TARGET_TEMPERATURE,
            hvac_mode: HvacMode::default(),
            hysteresis: None,
            heating_type: HeatingType::default(),
            manual_override: false,
            preset_temperature: None,
            boost_temperature: None,
            thermostats: Vec::new(),
            trvs: Vec::new(),
            switches: Vec::new(),
            valves: Vec::new(),
            sensors: Vec::new(),
            current_temperature: None,
            state: ZoneState::default(),
            last_commanded: HashMap::new(),
        }
    }

    /// Target after boost and preset. A manual override pins the explicit target.
    pub fn effective_target(&self) -> f64 {
        if self.manual_override {
            return self.target_temperature;
        }
        self.boost_temperature
            .or(self.preset_temperature)
            .unwrap_or(self.target_temperature)
    }

    pub fn hysteresis_or(&self, global: f64) -> f64 {
        self.hysteresis.unwrap_or(global)
    }

    pub fn is_trv(&self, actuator_id: &str) -> bool {
        self.trvs.iter().any(|id| id == actuator_id)
    }

    /// Whether `actuator_id` is a setpoint-carrying device of this zone.
    pub fn owns_actuator(&self, actuator_id: &str) -> bool {
        self.thermostats
            .iter()
            .chain(self.trvs.iter())
            .any(|id| id == actuator_id)
    }

    pub fn last_commanded(&self, actuator_id: &str) -> Option<f64> {
        self.last_commanded.get(actuator_id).copied()
    }

    /// Drops every cached write so the next cycle re-sends unconditionally.
    pub fn forget_commands(&mut self) {
        self.last_commanded.clear();
    }
}
