use crate::config::PwmConfig;
use crate::curve::CurveValue;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DutyCycle {
    pub on_seconds: u32,
    pub off_seconds: u32,
    pub duty: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PwmPhase {
    On,
    Off,
}

/// Fraction of the curve span the requested setpoint asks for.
pub fn duty_fraction(requested_setpoint: f64, boiler_temperature: f64, base_offset: f64) -> f64 {
    let span = (boiler_temperature - base_offset).max(1.0);
    ((requested_setpoint - base_offset) / span).clamp(0.0, 1.0)
}

/// Approximates continuous modulation on an on/off boiler.
#[derive(Debug, Clone)]
pub struct PwmController {
    config: PwmConfig,
    enabled: bool,
    duty: Option<f64>,
    on_seconds: u32,
    off_seconds: u32,
    curve: Option<CurveValue>,
    is_on: bool,
    is_on_time: Option<DateTime<Utc>>,
}

impl PwmController {
    pub fn new(config: PwmConfig) -> Self {
        let enabled = config.enabled;
        PwmController {
            on_seconds: config.min_on_seconds,
            off_seconds: config.min_off_seconds,
            config,
            enabled,
            duty: None,
            curve: None,
            is_on: false,
            is_on_time: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.reset();
        }
    }

    pub fn update(
        &mut self,
        requested_setpoint: f64,
        boiler_temperature: f64,
        curve: CurveValue,
    ) -> Option<DutyCycle> {
        let duty = duty_fraction(requested_setpoint, boiler_temperature, curve.base_offset);
        let c = &self.config;
        let on = c.min_on_seconds as f64 + duty * (c.max_on_seconds - c.min_on_seconds) as f64;
        let off_span = (c.max_off_seconds - c.min_off_seconds) as f64;
        let off = c.min_off_seconds as f64 + (1.0 - duty) * off_span;
        self.on_seconds = (on.round() as u32).clamp(c.min_on_seconds, c.max_on_seconds);
        self.off_seconds = (off.round() as u32).clamp(c.min_off_seconds, c.max_off_seconds);
        self.duty = Some(duty);
        self.curve = Some(curve);
        self.duty_cycle()
    }

    /// `None` when disabled or nothing has been computed since the last reset.
    pub fn duty_cycle(&self) -> Option<DutyCycle> {
        if !self.enabled {
            return None;
        }
        self.duty.map(|duty| DutyCycle {
            on_seconds: self.on_seconds,
            off_seconds: self.off_seconds,
            duty,
        })
    }

    /// Continuous setpoint equivalent to the current duty; display only.
    pub fn setpoint(&self) -> Option<f64> {
        let duty = self.duty?;
        let curve = self.curve?;
        Some(curve.base_offset + duty * (curve.value - curve.base_offset))
    }

    pub fn reset(&mut self) {
        self.duty = None;
        self.curve = None;
        self.on_seconds = self.config.min_on_seconds;
        self.off_seconds = self.config.min_off_seconds;
        self.is_on = false;
        self.is_on_time = None;
    }

    /// Phase the boiler should be in at `now`, advancing the on/off timeline.
    pub fn phase(&mut self, now: DateTime<Utc>) -> PwmPhase {
        match self.duty {
            None => return PwmPhase::Off,
            Some(d) if d <= 0.0 => {
                self.is_on = false;
                self.is_on_time = Some(now);
                return PwmPhase::Off;
            }
            Some(_) => {}
        }

        let started = match self.is_on_time {
            Some(t) => t,
            None => {
                self.is_on = true;
                self.is_on_time = Some(now);
                return PwmPhase::On;
            }
        };

        let pulse_width = if self.is_on { self.on_seconds } else { self.off_seconds };
        if (now - started).num_seconds() >= pulse_width as i64 {
            self.is_on = !self.is_on;
            self.is_on_time = Some(now);
        }
        if self.is_on {
            PwmPhase::On
        } else {
            PwmPhase::Off
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn curve() -> CurveValue {
        CurveValue {
            base_offset: 20.0,
            value: 70.0,
        }
    }

    #[test]
    fn half_duty_lands_inside_bounds() {
        let mut pwm = PwmController::new(PwmConfig::default());
        let dc = pwm.update(35.0, 50.0, curve()).unwrap();
        assert!((dc.duty - 0.5).abs() < 1e-9);
        assert!((60..=600).contains(&dc.on_seconds));
        assert!((60..=600).contains(&dc.off_seconds));
        assert_eq!(dc.on_seconds, 330);
        assert_eq!(dc.off_seconds, 330);
        assert_eq!(pwm.setpoint(), Some(45.0));
    }

    #[test]
    fn request_above_boiler_saturates() {
        let mut pwm = PwmController::new(PwmConfig::default());
        let dc = pwm.update(55.0, 50.0, curve()).unwrap();
        assert_eq!(dc.duty, 1.0);
        assert_eq!(dc.on_seconds, 600);
        assert_eq!(dc.off_seconds, 60);
    }

    #[test]
    fn request_below_base_is_zero_duty() {
        let mut pwm = PwmController::new(PwmConfig::default());
        let dc = pwm.update(15.0, 50.0, curve()).unwrap();
        assert_eq!(dc.duty, 0.0);
        assert_eq!(dc.on_seconds, 60);
        assert_eq!(dc.off_seconds, 600);
    }

    #[test]
    fn cold_boiler_does_not_divide_by_zero() {
        assert_eq!(duty_fraction(20.5, 20.0, 20.0), 0.5);
    }

    #[test]
    fn disabled_reports_no_duty_cycle() {
        let mut pwm = PwmController::new(PwmConfig {
            enabled: false,
            ..PwmConfig::default()
        });
        pwm.update(15.0, 50.0, curve());
        assert_eq!(pwm.duty_cycle(), None);
        pwm.set_enabled(true);
        assert_eq!(pwm.duty_cycle(), None);
        assert_eq!(pwm.update(15.0, 50.0, curve()).map(|d| d.duty), Some(0.0));
    }

    #[test]
    fn reset_restores_minimums() {
        let mut pwm = PwmController::new(PwmConfig::default());
        pwm.update(45.0, 50.0, curve());
        pwm.reset();
        assert_eq!(pwm.duty_cycle(), None);
        assert_eq!(pwm.setpoint(), None);
        pwm.update(20.0, 50.0, curve());
        assert_eq!(pwm.duty_cycle().map(|d| d.on_seconds), Some(60));
    }

    #[test]
    fn timeline_follows_duty() {
        let mut pwm = PwmController::new(PwmConfig::default());
        pwm.update(35.0, 50.0, curve());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut on_ticks = 0;
        let ticks = 4 * 60 * 2;
        for i in 0..ticks {
            if pwm.phase(start + Duration::seconds(15 * i)) == PwmPhase::On {
                on_ticks += 1;
            }
        }
        let fraction = on_ticks as f64 / ticks as f64;
        assert!((fraction - 0.5).abs() < 0.05, "on fraction {fraction}");
    }

    #[test]
    fn zero_duty_stays_off() {
        let mut pwm = PwmController::new(PwmConfig::default());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(pwm.phase(start), PwmPhase::Off);
        pwm.update(10.0, 50.0, curve());
        for i in 0..50 {
            assert_eq!(pwm.phase(start + Duration::minutes(i)), PwmPhase::Off);
        }
    }
}
