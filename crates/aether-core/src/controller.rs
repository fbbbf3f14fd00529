//! Strategic controller: picks Racer or Fortress from the confirmed channel
//! state, with a minimum dwell time between voluntary switches.
//!
//! Two paths bypass the dwell time:
//! - a Racer safety abort forces Fortress immediately ([`StrategicController::force`])
//! - an exhausted key lets the next evaluation switch regardless of dwell
//!   ([`StrategicController::note_key_exhausted`])

use serde::{Deserialize, Serialize};

use crate::classifier::ChannelState;

/// Key-generation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// High-throughput entanglement-based protocol.
    #[default]
    Racer,
    /// Block protocol with leakage locking.
    Fortress,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Racer => write!(f, "racer"),
            Self::Fortress => write!(f, "fortress"),
        }
    }
}

/// Single source of truth for which engine runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    pub active_protocol: Protocol,
    pub rounds_in_state: u64,
    pub last_switch_round: u64,
}

/// Outcome of one controller evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Stay,
    Switched { from: Protocol, to: Protocol },
    /// The target differs from the active protocol but dwell time has not
    /// elapsed; the target is queued and re-evaluated next interval.
    Deferred { target: Protocol, remaining_dwell: u64 },
}

#[derive(Debug, Clone)]
pub struct StrategicController {
    state: ControllerState,
    min_dwell_rounds: u64,
    queued: Option<Protocol>,
    dwell_override: bool,
    switches: u64,
}

impl StrategicController {
    /// Start on `initial` with no switches recorded.
    pub fn new(initial: Protocol, min_dwell_rounds: usize) -> Self {
        Self {
            state: ControllerState {
                active_protocol: initial,
                rounds_in_state: 0,
                last_switch_round: 0,
            },
            min_dwell_rounds: min_dwell_rounds as u64,
            queued: None,
            dwell_override: false,
            switches: 0,
        }
    }

    /// Active protocol and dwell bookkeeping.
    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Protocol the next unit runs under.
    pub fn active(&self) -> Protocol {
        self.state.active_protocol
    }

    /// Target held back by the dwell time, if any.
    pub fn queued(&self) -> Option<Protocol> {
        self.queued
    }

    /// Switches so far, forced ones included.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Account for rounds run under the active protocol.
    pub fn advance(&mut self, rounds: u64) {
        self.state.rounds_in_state += rounds;
    }

    /// Let the next evaluation switch regardless of dwell time.
    pub fn note_key_exhausted(&mut self) {
        self.dwell_override = true;
    }

    /// Evaluate the transition rule at a diagnostic interval.
    pub fn evaluate(&mut self, channel: ChannelState, current_round: u64) -> Decision {
        let override_dwell = std::mem::take(&mut self.dwell_override);
        let target = match channel {
            ChannelState::Clean => Protocol::Racer,
            ChannelState::Hostile => Protocol::Fortress,
            ChannelState::Degraded => {
                self.queued = None;
                return Decision::Stay;
            }
        };

        if target == self.state.active_protocol {
            self.queued = None;
            return Decision::Stay;
        }

        if override_dwell || self.state.rounds_in_state >= self.min_dwell_rounds {
            let from = self.state.active_protocol;
            self.switch_to(target, current_round);
            log::info!(
                "round {current_round}: switching {from} -> {target} (channel {channel}{})",
                if override_dwell { ", dwell bypassed after key exhaustion" } else { "" }
            );
            Decision::Switched { from, to: target }
        } else {
            self.queued = Some(target);
            let remaining_dwell = self.min_dwell_rounds - self.state.rounds_in_state;
            log::debug!(
                "round {current_round}: {target} queued, {remaining_dwell} dwell rounds left"
            );
            Decision::Deferred {
                target,
                remaining_dwell,
            }
        }
    }

    /// Switch immediately, ignoring dwell time. Reserved for safety overrides.
    pub fn force(&mut self, target: Protocol, current_round: u64) -> Decision {
        if target == self.state.active_protocol {
            return Decision::Stay;
        }
        let from = self.state.active_protocol;
        self.switch_to(target, current_round);
        log::warn!("round {current_round}: forced switch {from} -> {target}");
        Decision::Switched { from, to: target }
    }

    fn switch_to(&mut self, target: Protocol, current_round: u64) {
        self.state = ControllerState {
            active_protocol: target,
            rounds_in_state: 0,
            last_switch_round: current_round,
        };
        self.queued = None;
        self.switches += 1;
    }
}
