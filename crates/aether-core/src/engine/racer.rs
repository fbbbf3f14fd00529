//! Racer: entanglement-based exchange tuned for raw key rate.
//!
//! Every signal is a pair measured in independently chosen bases; matching
//! bases (probability 1/2) yield correlated bits, flipped at the round's
//! QBER. There is no locking step, so the sifted error rate follows the
//! channel directly and all observed leakage is charged downstream.

use crate::channel::ChannelSample;
use crate::classifier::ChannelState;
use crate::controller::Protocol;
use crate::error::{AetherError, Result};

use super::{EngineContext, ProtocolEngine, RawKeyMaterial, exchange_signals};

#[derive(Debug, Clone)]
pub struct RacerEngine {
    signals_per_round: usize,
    qber_ceiling: f64,
}

impl RacerEngine {
    /// Racer emitting `signals_per_round` pairs per round.
    pub fn new(signals_per_round: usize, qber_ceiling: f64) -> Self {
        Self {
            signals_per_round,
            qber_ceiling,
        }
    }

    pub fn qber_ceiling(&self) -> f64 {
        self.qber_ceiling
    }
}

impl ProtocolEngine for RacerEngine {
    fn protocol(&self) -> Protocol {
        Protocol::Racer
    }

    fn rounds_per_unit(&self) -> usize {
        1
    }

    /// Racer never runs on a channel the latest window read as hostile, or
    /// whose mean QBER is above the ceiling, whatever the controller decided.
    fn preflight(&self, ctx: &EngineContext<'_>) -> Result<()> {
        let mean_qber = ctx.report.mean_qber;
        if mean_qber > self.qber_ceiling || ctx.observed_state == ChannelState::Hostile {
            return Err(AetherError::RacerSafetyAbort {
                mean_qber,
                ceiling: self.qber_ceiling,
                state: ctx.observed_state,
            });
        }
        Ok(())
    }

    fn run(&self, window: &[ChannelSample], ctx: &mut EngineContext<'_>) -> Result<RawKeyMaterial> {
        self.preflight(ctx)?;

        let capacity = window.len() * self.signals_per_round;
        let mut bits = Vec::with_capacity(capacity);
        let mut peer_bits = Vec::with_capacity(capacity);
        let mut basis_tags = Vec::with_capacity(capacity);
        let mut leakage = 0.0;

        for sample in window {
            exchange_signals(
                self.signals_per_round,
                sample.qber,
                true,
                ctx.rng,
                &mut bits,
                &mut peer_bits,
                &mut basis_tags,
            );
            leakage += (sample.leakage_indicator + sample.psplit_rate).min(1.0);
        }

        Ok(RawKeyMaterial {
            round_id: window.first().map(|s| s.round_id).unwrap_or_default(),
            rounds: window.len() as u64,
            protocol: Protocol::Racer,
            bits,
            peer_bits,
            basis_tags,
            leakage_fraction: if window.is_empty() {
                0.0
            } else {
                leakage / window.len() as f64
            },
            locking: None,
        })
    }
}
