/// Holds the flow setpoint steady through a PWM ON phase.
///
/// The commanded setpoint follows the measured flow temperature plus a small
/// bias, but never drops while the phase lasts, so the boiler does not
/// throttle back halfway through a burn.
#[derive(Debug, Clone)]
pub struct SetpointAdjuster {
    bias: f64,
    current: Option<f64>,
}

impl SetpointAdjuster {
    pub fn new(bias: f64) -> Self {
        SetpointAdjuster { bias, current: None }
    }

    pub fn adjust(&mut self, flow_temperature: f64, ceiling: f64) -> f64 {
        let next = (flow_temperature + self.bias).min(ceiling);
        let value = match self.current {
            Some(c) => c.max(next).min(ceiling),
            None => next,
        };
        self.current = Some(value);
        value
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_drops_within_a_phase() {
        let mut adj = SetpointAdjuster::new(2.0);
        assert_eq!(adj.adjust(40.0, 60.0), 42.0);
        assert_eq!(adj.adjust(38.0, 60.0), 42.0);
        assert_eq!(adj.adjust(45.0, 60.0), 47.0);
        adj.reset();
        assert_eq!(adj.adjust(38.0, 60.0), 40.0);
    }

    #[test]
    fn respects_ceiling() {
        let mut adj = SetpointAdjuster::new(2.0);
        assert_eq!(adj.adjust(59.0, 60.0), 60.0);
        assert_eq!(adj.adjust(59.0, 55.0), 55.0);
    }
}
