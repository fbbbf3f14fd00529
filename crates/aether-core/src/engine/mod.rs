//! Protocol engines.
//!
//! Both engines turn a window of channel rounds into [`RawKeyMaterial`]
//! through the same [`ProtocolEngine`] interface, so the session dispatches
//! on [`Engine`] without looking at engine internals.
//!
//! | Engine   | Unit                     | Leakage handling                  |
//! |----------|--------------------------|-----------------------------------|
//! | Racer    | one round                | none; refuses hostile channels    |
//! | Fortress | `fortress_block_size` rounds | locking transform per block  |

pub mod fortress;
pub mod racer;

use rand::Rng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::channel::ChannelSample;
use crate::classifier::ChannelState;
use crate::config::SessionConfig;
use crate::controller::Protocol;
use crate::diagnostics::DiagnosticReport;
use crate::error::Result;

pub use fortress::{FortressEngine, LockingUnitaryParams};
pub use racer::RacerEngine;

/// Measurement basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Basis {
    /// Computational (Z) basis.
    Rectilinear,
    /// Hadamard (X) basis.
    Diagonal,
}

impl Basis {
    /// Uniform basis choice.
    pub fn random(rng: &mut impl Rng) -> Self {
        if rng.random_bool(0.5) {
            Self::Diagonal
        } else {
            Self::Rectilinear
        }
    }
}

/// Per-position sifting metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BasisTag {
    pub sender: Basis,
    pub receiver: Basis,
    /// False when the position belongs to a Fortress block whose locking
    /// consistency check failed. Always true for Racer.
    pub lock_consistent: bool,
}

impl BasisTag {
    /// Bases agree and the lock held.
    pub fn is_sifted(&self) -> bool {
        self.sender == self.receiver && self.lock_consistent
    }
}

/// Unsifted output of one engine unit. Handed to the distillation pipeline
/// and consumed by sifting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawKeyMaterial {
    /// First channel round of the unit.
    pub round_id: u64,
    /// Channel rounds consumed.
    pub rounds: u64,
    pub protocol: Protocol,
    /// Sender outcomes.
    pub bits: Vec<bool>,
    /// Receiver outcomes, position-aligned with `bits`.
    pub peer_bits: Vec<bool>,
    pub basis_tags: Vec<BasisTag>,
    /// Fraction of signals whose value the adversary may hold after any
    /// locking. Charged by privacy amplification.
    pub leakage_fraction: f64,
    pub locking: Option<LockingUnitaryParams>,
}

impl RawKeyMaterial {
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// Inputs an engine reads besides the channel window.
pub struct EngineContext<'a> {
    /// Most recent diagnostic report.
    pub report: &'a DiagnosticReport,
    /// Threshold reading of that report, before hysteresis.
    pub observed_state: ChannelState,
    pub rng: &'a mut StdRng,
}

/// Capability shared by both protocol engines.
pub trait ProtocolEngine {
    fn protocol(&self) -> Protocol;

    /// Channel rounds consumed per call to [`ProtocolEngine::run`].
    fn rounds_per_unit(&self) -> usize;

    /// Checks that must pass before any channel round is spent.
    fn preflight(&self, _ctx: &EngineContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Run one round (Racer) or one block (Fortress).
    fn run(&self, window: &[ChannelSample], ctx: &mut EngineContext<'_>) -> Result<RawKeyMaterial>;
}

/// Tagged engine variant selected by the controller.
#[derive(Debug, Clone)]
pub enum Engine {
    Racer(RacerEngine),
    Fortress(FortressEngine),
}

impl Engine {
    /// Engine for `protocol`, sized from `config`.
    pub fn for_protocol(protocol: Protocol, config: &SessionConfig) -> Self {
        match protocol {
            Protocol::Racer => Self::Racer(RacerEngine::new(
                config.signals_per_round,
                config.racer_qber_ceiling,
            )),
            Protocol::Fortress => Self::Fortress(FortressEngine::new(
                config.fortress_block_size,
                config.signals_per_round,
                config.locking,
            )),
        }
    }
}

impl ProtocolEngine for Engine {
    fn protocol(&self) -> Protocol {
        match self {
            Self::Racer(e) => e.protocol(),
            Self::Fortress(e) => e.protocol(),
        }
    }

    fn rounds_per_unit(&self) -> usize {
        match self {
            Self::Racer(e) => e.rounds_per_unit(),
            Self::Fortress(e) => e.rounds_per_unit(),
        }
    }

    fn preflight(&self, ctx: &EngineContext<'_>) -> Result<()> {
        match self {
            Self::Racer(e) => e.preflight(ctx),
            Self::Fortress(e) => e.preflight(ctx),
        }
    }

    fn run(&self, window: &[ChannelSample], ctx: &mut EngineContext<'_>) -> Result<RawKeyMaterial> {
        match self {
            Self::Racer(e) => e.run(window, ctx),
            Self::Fortress(e) => e.run(window, ctx),
        }
    }
}

/// Simulate `n` correlated signal pairs at the given error probability,
/// appending them to the material buffers.
pub(crate) fn exchange_signals(
    n: usize,
    error_probability: f64,
    lock_consistent: bool,
    rng: &mut StdRng,
    bits: &mut Vec<bool>,
    peer_bits: &mut Vec<bool>,
    tags: &mut Vec<BasisTag>,
) {
    let p = error_probability.clamp(0.0, 1.0);
    for _ in 0..n {
        let sender = Basis::random(rng);
        let receiver = Basis::random(rng);
        let bit = rng.random_bool(0.5);
        let peer = if sender == receiver {
            bit ^ rng.random_bool(p)
        } else {
            // Mismatched bases give uncorrelated outcomes.
            rng.random_bool(0.5)
        };
        bits.push(bit);
        peer_bits.push(peer);
        tags.push(BasisTag {
            sender,
            receiver,
            lock_consistent,
        });
    }
}
