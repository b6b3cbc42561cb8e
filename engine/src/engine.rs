//! The per-tick control loop.
//!
//! [`HeatingCycleEngine::run_cycle`] walks every zone once: it reads the
//! zone's sensors, runs the state machine and plans the actuator commands
//! for any state change. The plans are then dispatched, concurrently across
//! zones but in order within a zone. Finally the boiler gets the aggregate
//! demand once.
//!
//! A cycle takes `&mut self`; the embedding scheduler owns the engine behind
//! a lock, which keeps cycles from overlapping.

use crate::boiler::{BoilerController, BoilerDemand, BoilerStatus, ModulationGate};
use crate::calibration::OvershootProtectionCalibrator;
use crate::command::{Command, CommandPolicy};
use crate::config::{validate_zones, GlobalConfig};
use crate::curve::LinearCurve;
use crate::error::{CommandError, ConfigError, StoreError};
use crate::interfaces::{
    ActuatorBus, ConfigStore, EventStore, FrostFloorResolver, SensorRegistry, TargetResolver,
    WeatherAccessor,
};
use crate::learning::{LearningEngine, LearningStats};
use crate::manual_override::ManualOverrideDetector;
use crate::proactive::{ProactiveMaintenanceHandler, ProactiveOutcome};
use crate::pwm::PwmController;
use crate::state::{shutdown, transition, Action, HeatingState, Inputs};
use crate::tracker::TemperatureTracker;
use crate::zone::{HeatingType, HvacMode, Zone};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;

/// Non-TRV thermostat setpoint changes smaller than this are not re-sent.
const THERMOSTAT_DEAD_BAND: f64 = 0.1;
pub const MIN_TARGET_TEMPERATURE: f64 = 5.0;
pub const MAX_TARGET_TEMPERATURE: f64 = 35.0;

/// Everything the engine talks to.
pub struct Collaborators {
    pub registry: Arc<dyn SensorRegistry>,
    pub bus: Arc<dyn ActuatorBus>,
    pub config_store: Arc<dyn ConfigStore>,
    pub event_store: Arc<dyn EventStore>,
    pub weather: Arc<dyn WeatherAccessor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ManualOverride,
    NoReading,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneOutcome {
    pub zone_id: String,
    pub state: HeatingState,
    pub action: Action,
    pub skipped: Option<SkipReason>,
    pub current: Option<f64>,
    pub target: Option<f64>,
    pub proactive: Option<ProactiveOutcome>,
}

fn as_display<T: Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandFailure {
    /// `None` for boiler-level commands.
    pub zone_id: Option<String>,
    #[serde(serialize_with = "as_display")]
    pub command: Command,
    #[serde(serialize_with = "as_display")]
    pub error: CommandError,
}

/// What one `run_cycle` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub at: DateTime<Utc>,
    pub zones: Vec<ZoneOutcome>,
    pub commands_sent: usize,
    pub failures: Vec<CommandFailure>,
    pub boiler_demand: BoilerDemand,
    /// Boiler writes were held back because calibration owns the modulation gate.
    pub boiler_skipped: bool,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn zone(&self, zone_id: &str) -> Option<&ZoneOutcome> {
        self.zones.iter().find(|z| z.zone_id == zone_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneSnapshot {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub hvac_mode: HvacMode,
    pub heating_type: HeatingType,
    pub state: HeatingState,
    pub previous_state: HeatingState,
    pub current_temperature: Option<f64>,
    pub target_temperature: f64,
    pub effective_target: f64,
    pub hysteresis: f64,
    pub manual_override: bool,
    /// °C/hour over the tracker window.
    pub trend: Option<f64>,
    pub trend_confidence: f64,
    pub proactive_heating: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub zones: Vec<ZoneSnapshot>,
    pub boiler: BoilerStatus,
    pub last_cycle: Option<DateTime<Utc>>,
    pub last_cycle_failures: usize,
}

pub struct HeatingCycleEngine {
    zones: Vec<Zone>,
    config: GlobalConfig,
    registry: Arc<dyn SensorRegistry>,
    bus: Arc<dyn ActuatorBus>,
    store: Arc<dyn ConfigStore>,
    weather: Arc<dyn WeatherAccessor>,
    resolver: Arc<dyn TargetResolver>,
    tracker: Arc<TemperatureTracker>,
    learning: Arc<LearningEngine>,
    proactive: ProactiveMaintenanceHandler,
    detector: ManualOverrideDetector,
    boiler: BoilerController,
    policy: CommandPolicy,
    /// Zones whose commands are re-sent on the next cycle regardless of state changes.
    reassert: HashSet<String>,
    last_cycle: Option<DateTime<Utc>>,
    last_cycle_failures: usize,
}

fn average_temperature(registry: &dyn SensorRegistry, sensors: &[String]) -> Option<f64> {
    let readings: Vec<f64> = sensors
        .iter()
        .filter_map(|id| registry.read_temperature(id))
        .collect();
    if readings.is_empty() {
        return None;
    }
    Some(readings.iter().sum::<f64>() / readings.len() as f64)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Queues a setpoint write unless the actuator already has it.
///
/// TRVs are compared exactly; plain thermostats get a dead band.
fn push_setpoint(zone: &Zone, id: &str, celsius: f64, exact: bool, commands: &mut Vec<Command>) {
    if let Some(last) = zone.last_commanded(id) {
        let unchanged = if exact {
            last == celsius
        } else {
            (last - celsius).abs() < THERMOSTAT_DEAD_BAND
        };
        if unchanged {
            debug!("{}: {} already at {:.1}°C", zone.id, id, last);
            return;
        }
    }
    commands.push(Command::ThermostatTemperature {
        id: id.to_string(),
        celsius,
    });
}

/// Commands that put the zone's actuators into its current state.
///
/// Ordered thermostats, then switches, then valves.
fn plan_commands(
    zone: &Zone,
    action: Action,
    target: Option<f64>,
    hysteresis: f64,
) -> Vec<Command> {
    let mut commands = Vec::new();
    if action == Action::None {
        return commands;
    }
    let mode = |id: &String, mode| Command::HvacMode { id: id.clone(), mode };
    let switches = |on| zone.switches.iter().map(move |id| Command::Switch { id: id.clone(), on });
    let valves = |percent| {
        zone.valves
            .iter()
            .map(move |id| Command::ValvePosition { id: id.clone(), percent })
    };

    match zone.state.current {
        HeatingState::Heating => {
            let Some(target) = target else { return commands };
            for id in &zone.thermostats {
                commands.push(mode(id, HvacMode::Heat));
                push_setpoint(zone, id, target, false, &mut commands);
            }
            for id in &zone.trvs {
                commands.push(mode(id, HvacMode::Heat));
                push_setpoint(zone, id, target, true, &mut commands);
            }
            commands.extend(switches(true));
            commands.extend(valves(100));
        }
        HeatingState::Cooling => {
            let Some(target) = target else { return commands };
            for id in &zone.thermostats {
                commands.push(mode(id, HvacMode::Cool));
                push_setpoint(zone, id, target, false, &mut commands);
            }
            commands.extend(switches(false));
            commands.extend(valves(0));
        }
        HeatingState::Idle => {
            let Some(target) = target else { return commands };
            // Inside the band a thermostat is parked at the room temperature
            // so its own loop does not start heating on noise.
            let idle = match zone.current_temperature {
                Some(current) if current >= target - hysteresis => round1(current),
                _ => target,
            };
            for id in &zone.thermostats {
                push_setpoint(zone, id, idle, false, &mut commands);
            }
            for id in &zone.trvs {
                push_setpoint(zone, id, target, true, &mut commands);
            }
            commands.extend(switches(false));
            commands.extend(valves(0));
        }
        HeatingState::Off => {
            for id in zone.thermostats.iter().chain(zone.trvs.iter()) {
                commands.push(mode(id, HvacMode::Off));
            }
            commands.extend(switches(false));
            commands.extend(valves(0));
        }
        HeatingState::Unset => {}
    }
    commands
}

impl HeatingCycleEngine {
    pub fn new(
        zones: Vec<Zone>,
        config: GlobalConfig,
        c: Collaborators,
        started_at: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        validate_zones(&zones)?;

        let tracker = Arc::new(TemperatureTracker::new(config.tracker.clone()));
        let learning = Arc::new(LearningEngine::new(c.event_store, c.weather.clone()));
        let proactive = ProactiveMaintenanceHandler::new(
            config.proactive.clone(),
            tracker.clone(),
            learning.clone(),
        );
        let grace = Duration::seconds(config.override_grace_secs as i64);
        let detector = ManualOverrideDetector::new(started_at, grace);
        let boiler = BoilerController::new(
            config.boiler.clone(),
            PwmController::new(config.pwm.clone()),
            Arc::new(LinearCurve::from(&config.curve)),
            ModulationGate::default(),
            config.overshoot_protection_value,
        );
        let policy = CommandPolicy {
            timeout: config.command_timeout(),
            retries: config.command_retries,
        };
        let resolver = Arc::new(FrostFloorResolver {
            frost_floor: config.frost_protection_temperature,
        });
        info!(
            "heating engine: {} zones, hysteresis {:.2}°C, boiler {}",
            zones.len(),
            config.hysteresis,
            if config.boiler.enabled { "enabled" } else { "disabled" }
        );

        Ok(HeatingCycleEngine {
            zones,
            config,
            registry: c.registry,
            bus: c.bus,
            store: c.config_store,
            weather: c.weather,
            resolver,
            tracker,
            learning,
            proactive,
            detector,
            boiler,
            policy,
            reassert: HashSet::new(),
            last_cycle: None,
            last_cycle_failures: 0,
        })
    }

    /// Builds the engine from whatever the config store holds.
    pub async fn load(c: Collaborators, started_at: DateTime<Utc>) -> Result<Self, ConfigError> {
        let zones = c.config_store.load_zones().await?;
        let config = c.config_store.load_global().await?;
        Self::new(zones, config, c, started_at)
    }

    /// Replaces the default frost-floor target resolution.
    pub fn with_resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone(&self, zone_id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == zone_id)
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn tracker(&self) -> Arc<TemperatureTracker> {
        self.tracker.clone()
    }

    pub fn learning(&self) -> Arc<LearningEngine> {
        self.learning.clone()
    }

    pub fn boiler_gate(&self) -> ModulationGate {
        self.boiler.gate()
    }

    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let mut zones = std::mem::take(&mut self.zones);
        let mut outcomes = Vec::with_capacity(zones.len());
        let mut plans = Vec::new();
        for (idx, zone) in zones.iter_mut().enumerate() {
            let force = self.reassert.remove(&zone.id);
            let (outcome, commands) = self.evaluate(zone, force, now).await;
            if !commands.is_empty() {
                plans.push((idx, commands));
            }
            outcomes.push(outcome);
        }
        self.zones = zones;

        let bus = self.bus.clone();
        let policy = self.policy;
        let results = join_all(plans.into_iter().map(|(idx, commands)| {
            let bus = bus.clone();
            async move {
                let mut results = Vec::with_capacity(commands.len());
                for command in commands {
                    let result = policy.send(bus.as_ref(), &command).await;
                    results.push((command, result));
                }
                (idx, results)
            }
        }))
        .await;

        let mut sent = 0;
        let mut failures = Vec::new();
        for (idx, results) in results {
            let zone = &mut self.zones[idx];
            for (command, result) in results {
                match result {
                    Ok(()) => {
                        sent += 1;
                        if let Command::ThermostatTemperature { id, celsius } = &command {
                            zone.last_commanded.insert(id.clone(), *celsius);
                        }
                    }
                    Err(error) => {
                        warn!("{}: {} failed: {}", zone.id, command, error);
                        if let Command::ThermostatTemperature { id, .. } = &command {
                            zone.last_commanded.remove(id);
                        }
                        self.reassert.insert(zone.id.clone());
                        failures.push(CommandFailure {
                            zone_id: Some(zone.id.clone()),
                            command,
                            error,
                        });
                    }
                }
            }
        }

        let mut demand = BoilerDemand::default();
        for outcome in &outcomes {
            if outcome.skipped.is_none() && outcome.state == HeatingState::Heating {
                if let Some(target) = outcome.target {
                    demand.add(target);
                }
            }
        }
        let boiler_skipped = if self.config.boiler.enabled {
            self.drive_boiler(demand, now, &mut sent, &mut failures).await
        } else {
            false
        };

        debug!(
            "cycle done: {} commands, {} failures, demand {:?}",
            sent,
            failures.len(),
            demand.max_target
        );
        self.last_cycle = Some(now);
        self.last_cycle_failures = failures.len();
        CycleReport {
            at: now,
            zones: outcomes,
            commands_sent: sent,
            failures,
            boiler_demand: demand,
            boiler_skipped,
        }
    }

    async fn evaluate(
        &mut self,
        zone: &mut Zone,
        force: bool,
        now: DateTime<Utc>,
    ) -> (ZoneOutcome, Vec<Command>) {
        zone.current_temperature = average_temperature(self.registry.as_ref(), &zone.sensors);
        let hysteresis = zone.hysteresis_or(self.config.hysteresis);
        let mut outcome = ZoneOutcome {
            zone_id: zone.id.clone(),
            state: zone.state.current,
            action: Action::None,
            skipped: None,
            current: zone.current_temperature,
            target: None,
            proactive: None,
        };

        let (next, action) = if !zone.enabled {
            self.proactive.cancel(&zone.id);
            shutdown(zone.state.current, force)
        } else if zone.manual_override {
            self.proactive.cancel(&zone.id);
            outcome.skipped = Some(SkipReason::ManualOverride);
            return (outcome, Vec::new());
        } else if zone.hvac_mode == HvacMode::Off {
            self.proactive.cancel(&zone.id);
            shutdown(zone.state.current, force)
        } else {
            let target = self.resolver.resolve(zone, now);
            outcome.target = Some(target);
            let Some(current) = zone.current_temperature else {
                outcome.skipped = Some(SkipReason::NoReading);
                return self.without_reading(zone, outcome, force, hysteresis).await;
            };
            self.tracker.record_sample(&zone.id, current, Some(target), now);
            let preheat = if zone.hvac_mode.allows_heat() {
                let proactive = self.proactive.check(zone, target, hysteresis, now).await;
                let wants_heat = proactive.wants_heat();
                outcome.proactive = Some(proactive);
                wants_heat
            } else {
                self.proactive.cancel(&zone.id);
                false
            };
            let inputs = Inputs {
                current,
                target,
                hysteresis,
                mode: zone.hvac_mode,
                preheat,
                force,
            };
            transition(zone.state.current, &inputs)
        };

        if zone.state.enter(next) {
            match (zone.current_temperature, outcome.target) {
                (Some(current), Some(target)) => info!(
                    "{}: {} -> {} at {:.1}°C (target {:.1}°C)",
                    zone.id, zone.state.previous, next, current, target
                ),
                _ => info!("{}: {} -> {}", zone.id, zone.state.previous, next),
            }
        }
        self.track_episode(zone, action, now).await;

        outcome.state = next;
        outcome.action = action;
        let commands = plan_commands(zone, action, outcome.target, hysteresis);
        (outcome, commands)
    }

    /// A zone that lost its reading gets no new decision. An active heating
    /// or cooling run falls back to idle so no heater keeps running blind.
    async fn without_reading(
        &mut self,
        zone: &mut Zone,
        mut outcome: ZoneOutcome,
        force: bool,
        hysteresis: f64,
    ) -> (ZoneOutcome, Vec<Command>) {
        let action = match zone.state.current {
            HeatingState::Heating => Action::StopHeating,
            HeatingState::Cooling => Action::StopCooling,
            _ => {
                debug!("{}: no temperature reading", zone.id);
                if force {
                    self.reassert.insert(zone.id.clone());
                }
                return (outcome, Vec::new());
            }
        };
        warn!("{}: lost temperature reading while {}, going idle", zone.id, zone.state.current);
        self.proactive.cancel(&zone.id);
        if let Some(last) = self.tracker.latest(&zone.id) {
            self.learning.end_episode(&zone.id, last.temperature, last.timestamp).await;
        }
        zone.state.enter(HeatingState::Idle);
        outcome.state = HeatingState::Idle;
        outcome.action = action;
        let commands = plan_commands(zone, action, outcome.target, hysteresis);
        (outcome, commands)
    }

    /// Opens and closes learning episodes on heating/cooling edges.
    async fn track_episode(&self, zone: &Zone, action: Action, now: DateTime<Utc>) {
        let Some(current) = zone.current_temperature else {
            return;
        };
        match action {
            Action::StartHeating | Action::StartCooling => {
                if self.learning.has_episode(&zone.id) {
                    self.learning.end_episode(&zone.id, current, now).await;
                }
                self.learning.start_episode(&zone.id, current, now);
            }
            Action::StopHeating | Action::StopCooling | Action::TurnOff => {
                self.learning.end_episode(&zone.id, current, now).await;
            }
            Action::None | Action::EnterIdle | Action::Reassert => {}
        }
    }

    /// Returns true when the writes were held back by a running calibration.
    async fn drive_boiler(
        &mut self,
        demand: BoilerDemand,
        now: DateTime<Utc>,
        sent: &mut usize,
        failures: &mut Vec<CommandFailure>,
    ) -> bool {
        let Some(_guard) = self.boiler.gate().try_acquire() else {
            debug!("boiler writes held back while calibrating");
            return true;
        };
        let flow = self
            .config
            .boiler
            .flow_sensor
            .as_deref()
            .and_then(|id| self.registry.read_temperature(id));
        let outdoor = self.weather.current_outdoor_temperature();
        for command in self.boiler.plan(demand, flow, outdoor, now) {
            match self.policy.send(self.bus.as_ref(), &command).await {
                Ok(()) => *sent += 1,
                Err(error) => {
                    warn!("boiler: {} failed: {}", command, error);
                    self.boiler.forget();
                    failures.push(CommandFailure {
                        zone_id: None,
                        command,
                        error,
                    });
                }
            }
        }
        false
    }

    /// Feeds a setpoint reported by a thermostat or TRV to the manual-override
    /// detector. Returns whether a manual override was recorded.
    pub async fn handle_actuator_report(
        &mut self,
        actuator_id: &str,
        observed: f64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(zone) = self.zones.iter_mut().find(|z| z.owns_actuator(actuator_id)) else {
            debug!("report from unknown actuator {}", actuator_id);
            return Ok(false);
        };
        if !self.detector.detect(zone, actuator_id, observed, now) {
            return Ok(false);
        }
        self.proactive.cancel(&zone.id);
        self.store.save_zones(&self.zones).await?;
        Ok(true)
    }

    fn zone_mut(&mut self, zone_id: &str) -> Result<&mut Zone, ConfigError> {
        self.zones
            .iter_mut()
            .find(|z| z.id == zone_id)
            .ok_or_else(|| ConfigError::UnknownZone(zone_id.to_string()))
    }

    /// Sets a zone's target and re-asserts its commands on the next cycle.
    /// Returns the resulting effective target; an active preset or boost
    /// still takes precedence.
    pub async fn set_zone_target(
        &mut self,
        zone_id: &str,
        target: f64,
    ) -> Result<f64, ConfigError> {
        let allowed = MIN_TARGET_TEMPERATURE..=MAX_TARGET_TEMPERATURE;
        if !target.is_finite() || !allowed.contains(&target) {
            return Err(ConfigError::InvalidTarget(target));
        }
        let zone = self.zone_mut(zone_id)?;
        zone.target_temperature = target;
        let effective = zone.effective_target();
        info!("{}: target set to {:.1}°C (effective {:.1}°C)", zone_id, target, effective);
        self.reassert.insert(zone_id.to_string());
        self.store.save_zones(&self.zones).await?;
        Ok(effective)
    }

    /// Hands a zone back to automatic control.
    pub async fn clear_manual_override(&mut self, zone_id: &str) -> Result<(), ConfigError> {
        let zone = self.zone_mut(zone_id)?;
        if !zone.manual_override {
            return Ok(());
        }
        zone.manual_override = false;
        zone.forget_commands();
        info!("{}: manual override cleared", zone_id);
        self.reassert.insert(zone_id.to_string());
        self.store.save_zones(&self.zones).await?;
        Ok(())
    }

    pub async fn set_hvac_mode(
        &mut self,
        zone_id: &str,
        mode: HvacMode,
    ) -> Result<(), ConfigError> {
        let zone = self.zone_mut(zone_id)?;
        zone.hvac_mode = mode;
        info!("{}: hvac mode {:?}", zone_id, mode);
        self.reassert.insert(zone_id.to_string());
        self.store.save_zones(&self.zones).await?;
        Ok(())
    }

    /// Calibrator bound to this engine's boiler, bus and modulation gate.
    /// Run it without holding the engine lock; cycles keep going and skip
    /// boiler writes until it finishes.
    pub fn calibrator(&self) -> OvershootProtectionCalibrator {
        OvershootProtectionCalibrator::new(
            self.config.boiler.clone(),
            self.bus.clone(),
            self.registry.clone(),
            self.boiler.gate(),
            self.policy,
        )
    }

    /// Installs a new overshoot protection value and persists it.
    pub async fn set_overshoot_protection(&mut self, opv: Option<f64>) -> Result<(), StoreError> {
        self.boiler.set_overshoot_protection(opv);
        self.config.overshoot_protection_value = opv;
        self.store.save_global(&self.config).await
    }

    /// `Ok(None)` for an unknown zone.
    pub async fn learning_stats(&self, zone_id: &str) -> Result<Option<LearningStats>, StoreError> {
        if self.zone(zone_id).is_none() {
            return Ok(None);
        }
        self.learning.statistics(zone_id).await.map(Some)
    }

    pub fn status(&self, now: DateTime<Utc>) -> EngineStatus {
        let zones = self
            .zones
            .iter()
            .map(|z| ZoneSnapshot {
                id: z.id.clone(),
                name: z.name.clone(),
                enabled: z.enabled,
                hvac_mode: z.hvac_mode,
                heating_type: z.heating_type,
                state: z.state.current,
                previous_state: z.state.previous,
                current_temperature: z.current_temperature,
                target_temperature: z.target_temperature,
                effective_target: self.resolver.resolve(z, now),
                hysteresis: z.hysteresis_or(self.config.hysteresis),
                manual_override: z.manual_override,
                trend: self.tracker.trend(&z.id, now),
                trend_confidence: self.tracker.confidence(&z.id, now),
                proactive_heating: self.proactive.is_active(&z.id),
            })
            .collect();
        EngineStatus {
            zones,
            boiler: self.boiler.status(),
            last_cycle: self.last_cycle,
            last_cycle_failures: self.last_cycle_failures,
        }
    }
}
