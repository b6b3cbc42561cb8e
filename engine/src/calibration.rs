//! Overshoot-protection calibration.
//!
//! Forces the boiler to 0% modulation, watches where the flow temperature
//! settles and reports the mean as the overshoot protection value (OPV).

use crate::boiler::ModulationGate;
use crate::command::{Command, CommandPolicy};
use crate::config::BoilerConfig;
use crate::error::CommandError;
use crate::interfaces::{ActuatorBus, SensorRegistry};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CalibrationOutcome {
    /// The boiler cannot take a modulation command, or has no flow sensor.
    Unsupported { reason: String },
    CommandFailed { error: String },
    NoData,
    Completed { value: f64, samples: usize },
}

impl CalibrationOutcome {
    pub fn value(&self) -> Option<f64> {
        match self {
            CalibrationOutcome::Completed { value, .. } => Some(*value),
            _ => None,
        }
    }
}

pub struct OvershootProtectionCalibrator {
    config: BoilerConfig,
    bus: Arc<dyn ActuatorBus>,
    registry: Arc<dyn SensorRegistry>,
    gate: ModulationGate,
    policy: CommandPolicy,
}

impl OvershootProtectionCalibrator {
    pub fn new(
        config: BoilerConfig,
        bus: Arc<dyn ActuatorBus>,
        registry: Arc<dyn SensorRegistry>,
        gate: ModulationGate,
        policy: CommandPolicy,
    ) -> Self {
        OvershootProtectionCalibrator {
            config,
            bus,
            registry,
            gate,
            policy,
        }
    }

    pub async fn calibrate(&self) -> CalibrationOutcome {
        if !self.config.supports_modulation_command {
            return CalibrationOutcome::Unsupported {
                reason: "boiler does not accept modulation commands".into(),
            };
        }
        let Some(sensor) = self.config.flow_sensor.as_deref() else {
            return CalibrationOutcome::Unsupported {
                reason: "no boiler flow sensor configured".into(),
            };
        };

        let _guard = self.gate.acquire().await;
        info!(
            "calibrating overshoot protection: {} samples every {}s",
            self.config.calibration_samples, self.config.calibration_interval_secs
        );
        if let Err(e) = self.policy.send(self.bus.as_ref(), &Command::BoilerModulation(0)).await {
            warn!("calibration aborted, 0% modulation refused: {}", e);
            return CalibrationOutcome::CommandFailed { error: e.to_string() };
        }

        let samples = self.sample(sensor).await;
        self.restore_modulation().await;

        if samples.is_empty() {
            warn!("calibration collected no flow temperature samples");
            return CalibrationOutcome::NoData;
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let value = (mean * 10.0).round() / 10.0;
        info!("overshoot protection value {:.1}°C from {} samples", value, samples.len());
        CalibrationOutcome::Completed {
            value,
            samples: samples.len(),
        }
    }

    async fn sample(&self, sensor: &str) -> Vec<f64> {
        let period = Duration::from_secs(self.config.calibration_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        let mut samples = Vec::with_capacity(self.config.calibration_samples as usize);
        for _ in 0..self.config.calibration_samples {
            ticker.tick().await;
            if let Some(t) = self.registry.read_temperature(sensor) {
                samples.push(t);
            }
        }
        samples
    }

    async fn restore_modulation(&self) {
        let result: Result<(), CommandError> = self
            .policy
            .send(self.bus.as_ref(), &Command::BoilerModulation(100))
            .await;
        if let Err(e) = result {
            warn!("failed to restore boiler modulation after calibration: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingBus;
    use crate::interfaces::ActuatorState;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct SequenceRegistry(Mutex<VecDeque<Option<f64>>>);

    impl SequenceRegistry {
        fn new(values: &[Option<f64>]) -> Self {
            SequenceRegistry(Mutex::new(values.iter().copied().collect()))
        }
    }

    impl SensorRegistry for SequenceRegistry {
        fn read_temperature(&self, _id: &str) -> Option<f64> {
            self.0.lock().unwrap().pop_front().flatten()
        }
        fn read_actuator_state(&self, _id: &str) -> Option<ActuatorState> {
            None
        }
    }

    fn config(samples: u32) -> BoilerConfig {
        BoilerConfig {
            flow_sensor: Some("sensor.flow".into()),
            calibration_samples: samples,
            ..BoilerConfig::default()
        }
    }

    fn calibrator(
        config: BoilerConfig,
        bus: Arc<RecordingBus>,
        values: &[Option<f64>],
        gate: ModulationGate,
    ) -> OvershootProtectionCalibrator {
        OvershootProtectionCalibrator::new(
            config,
            bus,
            Arc::new(SequenceRegistry::new(values)),
            gate,
            CommandPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn averages_available_samples() {
        let bus = Arc::new(RecordingBus::default());
        let values = [Some(48.0), None, Some(50.0), Some(51.0), None];
        let cal = calibrator(config(5), bus.clone(), &values, ModulationGate::default());
        let outcome = cal.calibrate().await;
        // (48 + 50 + 51) / 3 = 49.666..
        assert_eq!(outcome, CalibrationOutcome::Completed { value: 49.7, samples: 3 });
        assert_eq!(
            bus.take(),
            vec![Command::BoilerModulation(0), Command::BoilerModulation(100)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn takes_about_a_hundred_seconds() {
        let bus = Arc::new(RecordingBus::default());
        let values = vec![Some(45.0); 20];
        let cal = calibrator(config(20), bus, &values, ModulationGate::default());
        let started = tokio::time::Instant::now();
        assert_eq!(cal.calibrate().await.value(), Some(45.0));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(95) && elapsed <= Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn no_samples_is_no_data() {
        let bus = Arc::new(RecordingBus::default());
        let cal = calibrator(config(4), bus, &[None, None], ModulationGate::default());
        assert_eq!(cal.calibrate().await, CalibrationOutcome::NoData);
    }

    #[tokio::test]
    async fn unsupported_boiler_aborts_immediately() {
        let bus = Arc::new(RecordingBus::default());
        let cfg = BoilerConfig {
            supports_modulation_command: false,
            ..config(4)
        };
        let cal = calibrator(cfg, bus.clone(), &[Some(50.0)], ModulationGate::default());
        assert!(matches!(cal.calibrate().await, CalibrationOutcome::Unsupported { .. }));
        assert!(bus.take().is_empty());
    }

    #[tokio::test]
    async fn refused_modulation_is_terminal() {
        let bus = Arc::new(RecordingBus::default());
        bus.fail("boiler");
        let cal = calibrator(config(4), bus, &[Some(50.0)], ModulationGate::default());
        assert!(matches!(cal.calibrate().await, CalibrationOutcome::CommandFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn holds_gate_while_sampling() {
        let bus = Arc::new(RecordingBus::default());
        let gate = ModulationGate::default();
        let cal = calibrator(config(3), bus, &[Some(50.0); 3], gate.clone());
        let task = tokio::spawn(async move { cal.calibrate().await });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(gate.is_held());
        assert_eq!(task.await.unwrap().value(), Some(50.0));
        assert!(!gate.is_held());
    }
}
