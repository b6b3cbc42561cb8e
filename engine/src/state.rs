//! Per-zone heat/cool/idle state machine.
//!
//! Transitions are a pure function of the previous state and the current
//! readings; the cycle engine turns the returned [`Action`] into actuator
//! commands. Keeping the previous state here is what debounces the side
//! effects: an action other than [`Action::None`] only comes out when the
//! state changes or a re-assertion was forced.

use crate::zone::HvacMode;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatingState {
    /// No decision has been emitted since startup.
    #[default]
    Unset,
    Idle,
    Heating,
    Cooling,
    Off,
}

impl fmt::Display for HeatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeatingState::Unset => "unset",
            HeatingState::Idle => "idle",
            HeatingState::Heating => "heating",
            HeatingState::Cooling => "cooling",
            HeatingState::Off => "off",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ZoneState {
    pub current: HeatingState,
    pub previous: HeatingState,
}

impl ZoneState {
    /// Moves to `next`, remembering the state it left. Returns whether it changed.
    pub fn enter(&mut self, next: HeatingState) -> bool {
        if next == self.current {
            return false;
        }
        self.previous = self.current;
        self.current = next;
        true
    }
}

/// Raw hysteresis evaluation for one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub heating: bool,
    pub cooling: bool,
    pub stop_heat: bool,
    pub stop_cool: bool,
}

pub fn decide(current: f64, target: f64, hysteresis: f64, mode: HvacMode) -> Decision {
    let should_heat = current < target - hysteresis;
    let should_cool = current > target + hysteresis;
    Decision {
        heating: mode.allows_heat() && should_heat,
        cooling: mode.allows_cool() && should_cool,
        stop_heat: current >= target,
        stop_cool: current <= target,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inputs {
    pub current: f64,
    pub target: f64,
    pub hysteresis: f64,
    pub mode: HvacMode,
    /// Proactive maintenance asked to heat before the band is crossed.
    pub preheat: bool,
    /// Re-send the commands of the current state even without a change.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    StartHeating,
    StartCooling,
    StopHeating,
    StopCooling,
    EnterIdle,
    TurnOff,
    /// Re-issue the commands that belong to the (unchanged) current state.
    Reassert,
}

pub fn transition(state: HeatingState, inputs: &Inputs) -> (HeatingState, Action) {
    if inputs.mode == HvacMode::Off {
        return shutdown(state, inputs.force);
    }

    let d = decide(inputs.current, inputs.target, inputs.hysteresis, inputs.mode);
    let heat = d.heating || (inputs.preheat && inputs.mode.allows_heat() && !d.stop_heat);
    let hold = |s: HeatingState| {
        if inputs.force {
            (s, Action::Reassert)
        } else {
            (s, Action::None)
        }
    };

    if heat {
        return match state {
            HeatingState::Heating => hold(state),
            _ => (HeatingState::Heating, Action::StartHeating),
        };
    }
    if d.cooling {
        return match state {
            HeatingState::Cooling => hold(state),
            _ => (HeatingState::Cooling, Action::StartCooling),
        };
    }

    match state {
        HeatingState::Heating if d.stop_heat || !inputs.mode.allows_heat() => {
            (HeatingState::Idle, Action::StopHeating)
        }
        HeatingState::Cooling if d.stop_cool || !inputs.mode.allows_cool() => {
            (HeatingState::Idle, Action::StopCooling)
        }
        HeatingState::Heating | HeatingState::Cooling | HeatingState::Idle => hold(state),
        HeatingState::Unset | HeatingState::Off => (HeatingState::Idle, Action::EnterIdle),
    }
}

/// Transition used for `hvac_mode == off` and for disabled zones.
pub fn shutdown(state: HeatingState, force: bool) -> (HeatingState, Action) {
    if state != HeatingState::Off || force {
        (HeatingState::Off, Action::TurnOff)
    } else {
        (HeatingState::Off, Action::None)
    }
}
