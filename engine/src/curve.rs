use crate::config::CurveConfig;
use serde::Serialize;

/// Outdoor temperature assumed when no weather data is available.
pub const DEFAULT_OUTDOOR_TEMPERATURE: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurveValue {
    pub base_offset: f64,
    pub value: f64,
}

/// Weather compensation: (requested setpoint, outdoor) -> flow temperature.
pub trait HeatingCurve: Send + Sync {
    fn compute(&self, setpoint: f64, outdoor: Option<f64>) -> CurveValue;
}

pub struct LinearCurve {
    pub base_offset: f64,
    pub coefficient: f64,
}

impl From<&CurveConfig> for LinearCurve {
    fn from(c: &CurveConfig) -> Self {
        LinearCurve {
            base_offset: c.base_offset,
            coefficient: c.coefficient,
        }
    }
}

impl HeatingCurve for LinearCurve {
    fn compute(&self, setpoint: f64, outdoor: Option<f64>) -> CurveValue {
        let outdoor = outdoor.unwrap_or(DEFAULT_OUTDOOR_TEMPERATURE);
        CurveValue {
            base_offset: self.base_offset,
            value: self.base_offset + self.coefficient * (setpoint - outdoor).max(0.0),
        }
    }
}
