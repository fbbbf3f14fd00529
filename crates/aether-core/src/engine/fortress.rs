//! Fortress: block protocol with an adaptive braid locking transform.
//!
//! Per block:
//! 1. derive [`LockingUnitaryParams`] from the latest diagnostic report
//! 2. apply the locking transform before measurement, modeled as scaling the
//!    block's leakage by [`residual_fraction`]
//! 3. exchange signals at the baseline error rate plus the disturbance of the
//!    leakage that survives locking
//! 4. emit the block's raw material
//!
//! Locking costs throughput: every braid layer reserves signals per round, and
//! each layer may break the block's consistency check, in which case the
//! whole block is discarded at sifting. Fortress has no abort ceiling.

use rand::Rng;
use serde::Serialize;

use crate::channel::{ChannelSample, INTERCEPT_DISTURBANCE};
use crate::config::LockingConfig;
use crate::controller::Protocol;
use crate::diagnostics::DiagnosticReport;
use crate::error::Result;

use super::{EngineContext, ProtocolEngine, RawKeyMaterial, exchange_signals};

/// Locking transform parameters, recomputed for every block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LockingUnitaryParams {
    /// Compensating rotation in radians, in `[0, max_rotation]`.
    pub rotation_angle: f64,
    /// Number of sequential locking layers.
    pub braid_depth: u32,
    pub target_leakage_estimate: f64,
}

impl LockingUnitaryParams {
    /// Higher leakage estimates give a stronger rotation; higher photon-splitting
    /// rates give a deeper braid.
    pub fn from_report(report: &DiagnosticReport, locking: &LockingConfig) -> Self {
        let target = (report.mean_leakage + report.mean_psplit).clamp(0.0, 1.0);
        let rotation_angle =
            locking.max_rotation * (target / locking.rotation_saturation).min(1.0);
        let extra = (report.mean_psplit.clamp(0.0, 1.0) * locking.depth_per_psplit).ceil() as u32;
        let braid_depth = locking
            .base_depth
            .saturating_add(extra)
            .min(locking.max_depth);
        Self {
            rotation_angle,
            braid_depth,
            target_leakage_estimate: target,
        }
    }

    /// Share of leakage left after locking.
    pub fn residual(&self, locking: &LockingConfig) -> f64 {
        residual_fraction(
            self.braid_depth,
            self.rotation_angle,
            locking.layer_efficiency,
            locking.residual_floor,
        )
    }
}

/// Share of leakage that survives `depth` locking layers.
///
/// Each layer cancels `efficiency * sin²(angle)` of what remains above
/// `floor`, so every extra layer removes less than the one before and the
/// curve never drops below `floor`.
pub fn residual_fraction(depth: u32, angle: f64, efficiency: f64, floor: f64) -> f64 {
    let per_layer = (efficiency * angle.sin().powi(2)).clamp(0.0, 1.0);
    floor + (1.0 - floor) * (1.0 - per_layer).powi(depth as i32)
}

#[derive(Debug, Clone)]
pub struct FortressEngine {
    block_size: usize,
    signals_per_round: usize,
    locking: LockingConfig,
}

impl FortressEngine {
    /// One block spans `block_size` channel rounds.
    pub fn new(block_size: usize, signals_per_round: usize, locking: LockingConfig) -> Self {
        Self {
            block_size,
            signals_per_round,
            locking,
        }
    }

    pub fn locking(&self) -> &LockingConfig {
        &self.locking
    }

    /// Signals per round left after the braid layers take their share.
    pub fn usable_signals(&self, braid_depth: u32) -> usize {
        let reserved = self.locking.overhead_signals_per_layer * braid_depth as usize;
        self.signals_per_round.saturating_sub(reserved).max(1)
    }
}

impl ProtocolEngine for FortressEngine {
    fn protocol(&self) -> Protocol {
        Protocol::Fortress
    }

    fn rounds_per_unit(&self) -> usize {
        self.block_size
    }

    fn run(&self, window: &[ChannelSample], ctx: &mut EngineContext<'_>) -> Result<RawKeyMaterial> {
        let params = LockingUnitaryParams::from_report(ctx.report, &self.locking);
        let residual = params.residual(&self.locking);
        let signals = self.usable_signals(params.braid_depth);

        let survive = (1.0 - self.locking.gate_infidelity).powi(params.braid_depth as i32);
        let lock_consistent = ctx.rng.random_bool(survive.clamp(0.0, 1.0));

        let capacity = window.len() * signals;
        let mut bits = Vec::with_capacity(capacity);
        let mut peer_bits = Vec::with_capacity(capacity);
        let mut basis_tags = Vec::with_capacity(capacity);
        let mut leakage = 0.0;

        for sample in window {
            let disturbance = INTERCEPT_DISTURBANCE * sample.leakage_indicator;
            let baseline = (sample.qber - disturbance).max(0.0);
            let error = (baseline + disturbance * residual).min(0.5);
            exchange_signals(
                signals,
                error,
                lock_consistent,
                ctx.rng,
                &mut bits,
                &mut peer_bits,
                &mut basis_tags,
            );
            leakage += (sample.leakage_indicator + sample.psplit_rate).min(1.0) * residual;
        }

        log::debug!(
            "fortress block @{}: depth {}, rotation {:.3}, residual {:.3}, consistent {}",
            window.first().map(|s| s.round_id).unwrap_or_default(),
            params.braid_depth,
            params.rotation_angle,
            residual,
            lock_consistent
        );

        Ok(RawKeyMaterial {
            round_id: window.first().map(|s| s.round_id).unwrap_or_default(),
            rounds: window.len() as u64,
            protocol: Protocol::Fortress,
            bits,
            peer_bits,
            basis_tags,
            leakage_fraction: if window.is_empty() {
                0.0
            } else {
                leakage / window.len() as f64
            },
            locking: Some(params),
        })
    }
}
