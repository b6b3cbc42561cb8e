//! Central boiler demand.
//!
//! The cycle engine hands over one aggregate per tick. This module turns it
//! into flow-setpoint and switch commands, running the PWM timeline for
//! boilers that cannot modulate on their own.

use crate::command::Command;
use crate::config::BoilerConfig;
use crate::curve::{CurveValue, HeatingCurve};
use crate::pwm::{DutyCycle, PwmController, PwmPhase};
use crate::setpoint::SetpointAdjuster;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Flow setpoint changes smaller than this are not re-sent.
const FLOW_DEAD_BAND: f64 = 0.1;

/// Exclusive right to write boiler modulation.
///
/// Calibration holds it for its whole sampling window; the cycle engine only
/// ever tries to take it and skips boiler writes while it is held.
#[derive(Clone, Default)]
pub struct ModulationGate(Arc<Mutex<()>>);

impl ModulationGate {
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.0.clone().lock_owned().await
    }

    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.0.clone().try_lock_owned().ok()
    }

    pub fn is_held(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BoilerDemand {
    pub any_heating: bool,
    pub max_target: Option<f64>,
}

impl BoilerDemand {
    pub fn add(&mut self, target: f64) {
        self.any_heating = true;
        self.max_target = Some(self.max_target.map_or(target, |m| m.max(target)));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoilerStatus {
    pub demand: BoilerDemand,
    pub flow_setpoint: Option<f64>,
    pub switch_on: Option<bool>,
    pub curve: Option<CurveValue>,
    pub duty_cycle: Option<DutyCycle>,
    pub pwm_setpoint: Option<f64>,
    pub overshoot_protection_value: Option<f64>,
    pub calibrating: bool,
}

pub struct BoilerController {
    config: BoilerConfig,
    pwm: PwmController,
    adjuster: SetpointAdjuster,
    curve: Arc<dyn HeatingCurve>,
    gate: ModulationGate,
    opv: Option<f64>,
    demand: BoilerDemand,
    last_curve: Option<CurveValue>,
    last_flow: Option<f64>,
    last_switch: Option<bool>,
}

impl BoilerController {
    pub fn new(
        config: BoilerConfig,
        pwm: PwmController,
        curve: Arc<dyn HeatingCurve>,
        gate: ModulationGate,
        opv: Option<f64>,
    ) -> Self {
        BoilerController {
            adjuster: SetpointAdjuster::new(config.setpoint_bias),
            config,
            pwm,
            curve,
            gate,
            opv,
            demand: BoilerDemand::default(),
            last_curve: None,
            last_flow: None,
            last_switch: None,
        }
    }

    pub fn gate(&self) -> ModulationGate {
        self.gate.clone()
    }

    pub fn config(&self) -> &BoilerConfig {
        &self.config
    }

    pub fn set_overshoot_protection(&mut self, opv: Option<f64>) {
        info!("boiler overshoot protection value: {:?}", opv);
        self.opv = opv;
        self.forget();
    }

    /// Highest flow setpoint the boiler may be given.
    pub fn ceiling(&self) -> f64 {
        match self.opv {
            Some(opv) => opv.min(self.config.maximum_setpoint),
            None => self.config.maximum_setpoint,
        }
    }

    /// Drops cached writes; the next plan re-sends everything.
    pub fn forget(&mut self) {
        self.last_flow = None;
        self.last_switch = None;
    }

    /// Commands for this tick's aggregate demand. Only changed values are emitted.
    pub fn plan(
        &mut self,
        demand: BoilerDemand,
        flow_temperature: Option<f64>,
        outdoor: Option<f64>,
        now: DateTime<Utc>,
    ) -> Vec<Command> {
        self.demand = demand;
        let (flow, switch_on) = match demand.max_target {
            Some(target) if demand.any_heating => {
                let curve = self.curve.compute(target, outdoor);
                self.last_curve = Some(curve);
                let ceiling = self.ceiling();
                let requested = curve.value.clamp(self.config.minimum_setpoint, ceiling);
                (self.flow_for(requested, flow_temperature, curve, now), true)
            }
            _ => {
                self.pwm.reset();
                self.adjuster.reset();
                self.last_curve = None;
                (self.config.minimum_setpoint, false)
            }
        };
        let flow = (flow * 10.0).round() / 10.0;

        let mut commands = Vec::new();
        if let Some(id) = &self.config.switch {
            if self.last_switch != Some(switch_on) {
                commands.push(Command::Switch {
                    id: id.clone(),
                    on: switch_on,
                });
                self.last_switch = Some(switch_on);
            }
        }
        let changed = self
            .last_flow
            .map_or(true, |last| (last - flow).abs() >= FLOW_DEAD_BAND);
        if changed {
            debug!("boiler flow setpoint {:.1}°C", flow);
            commands.push(Command::BoilerFlowTemperature(flow));
            self.last_flow = Some(flow);
        }
        commands
    }

    fn flow_for(
        &mut self,
        requested: f64,
        flow_temperature: Option<f64>,
        curve: CurveValue,
        now: DateTime<Utc>,
    ) -> f64 {
        if self.config.modulating || !self.pwm.enabled() {
            return requested;
        }
        let Some(measured) = flow_temperature else {
            // Without a flow reading there is no duty to compute.
            return requested;
        };
        self.pwm.update(requested, measured, curve);
        match self.pwm.phase(now) {
            PwmPhase::On => self.adjuster.adjust(measured, self.ceiling()),
            PwmPhase::Off => {
                self.adjuster.reset();
                self.config.minimum_setpoint
            }
        }
    }

    pub fn status(&self) -> BoilerStatus {
        BoilerStatus {
            demand: self.demand,
            flow_setpoint: self.last_flow,
            switch_on: self.last_switch,
            curve: self.last_curve,
            duty_cycle: self.pwm.duty_cycle(),
            pwm_setpoint: self.pwm.setpoint(),
            overshoot_protection_value: self.opv,
            calibrating: self.gate.is_held(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PwmConfig;
    use crate::curve::LinearCurve;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, 5, 0, 0).unwrap()
    }

    fn controller(config: BoilerConfig) -> BoilerController {
        BoilerController::new(
            config,
            PwmController::new(PwmConfig::default()),
            Arc::new(LinearCurve {
                base_offset: 20.0,
                coefficient: 2.0,
            }),
            ModulationGate::default(),
            None,
        )
    }

    fn heating(target: f64) -> BoilerDemand {
        let mut d = BoilerDemand::default();
        d.add(target);
        d
    }

    #[test]
    fn demand_keeps_the_maximum() {
        let mut d = BoilerDemand::default();
        d.add(19.0);
        d.add(21.5);
        d.add(20.0);
        assert_eq!(d.max_target, Some(21.5));
        assert!(d.any_heating);
    }

    #[test]
    fn modulating_boiler_follows_curve() {
        let mut b = controller(BoilerConfig {
            modulating: true,
            switch: Some("switch.boiler".into()),
            ..BoilerConfig::default()
        });
        let cmds = b.plan(heating(21.0), None, Some(1.0), now());
        // 20 + 2 * (21 - 1)
        assert_eq!(
            cmds,
            vec![
                Command::Switch {
                    id: "switch.boiler".into(),
                    on: true
                },
                Command::BoilerFlowTemperature(60.0),
            ]
        );
        assert!(b.plan(heating(21.0), None, Some(1.0), now()).is_empty());
    }

    #[test]
    fn opv_caps_flow() {
        let mut b = controller(BoilerConfig {
            modulating: true,
            ..BoilerConfig::default()
        });
        b.set_overshoot_protection(Some(45.0));
        let cmds = b.plan(heating(21.0), None, Some(1.0), now());
        assert_eq!(cmds, vec![Command::BoilerFlowTemperature(45.0)]);
    }

    #[test]
    fn no_demand_idles_boiler() {
        let mut b = controller(BoilerConfig {
            switch: Some("switch.boiler".into()),
            ..BoilerConfig::default()
        });
        b.plan(heating(21.0), Some(40.0), Some(5.0), now());
        let cmds = b.plan(BoilerDemand::default(), Some(40.0), Some(5.0), now());
        assert_eq!(
            cmds,
            vec![
                Command::Switch {
                    id: "switch.boiler".into(),
                    on: false
                },
                Command::BoilerFlowTemperature(10.0),
            ]
        );
        assert_eq!(b.status().duty_cycle, None);
    }

    #[test]
    fn pwm_boiler_alternates_setpoint() {
        let mut b = controller(BoilerConfig::default());
        let demand = heating(21.0);
        // curve 20 + 2 * 16 = 52, boiler at 60 -> duty 0.8
        let first = b.plan(demand, Some(60.0), Some(5.0), now());
        assert_eq!(first, vec![Command::BoilerFlowTemperature(62.0)]);
        let dc = b.status().duty_cycle.unwrap();
        assert!((dc.duty - 0.8).abs() < 1e-9);

        let mut saw_minimum = false;
        for minute in 1..=20 {
            for cmd in b.plan(demand, Some(60.0), Some(5.0), now() + Duration::minutes(minute)) {
                if cmd == Command::BoilerFlowTemperature(10.0) {
                    saw_minimum = true;
                }
            }
        }
        assert!(saw_minimum);
    }

    #[tokio::test]
    async fn gate_reports_holder() {
        let gate = ModulationGate::default();
        assert!(!gate.is_held());
        let guard = gate.acquire().await;
        assert!(gate.is_held());
        assert!(gate.try_acquire().is_none());
        drop(guard);
        assert!(gate.try_acquire().is_some());
    }
}
