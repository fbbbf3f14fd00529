//! Session configuration and validation.
//!
//! Loading parameter files is left to callers; [`SessionConfig`] derives
//! serde so any loader can fill it, and [`SessionConfig::validate`] is run
//! before a single round is spent.

use serde::{Deserialize, Serialize};

use crate::controller::Protocol;
use crate::diagnostics::MIN_WINDOW_SIZE;
use crate::error::{AetherError, Result};

// ---------------------------------------------------------------------------
// Classifier thresholds
// ---------------------------------------------------------------------------

/// Threshold quadruple for the threat classifier.
///
/// Each clean threshold must be strictly below its hostile counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub qber_clean_threshold: f64,
    pub qber_hostile_threshold: f64,
    pub leakage_clean_threshold: f64,
    pub leakage_hostile_threshold: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            qber_clean_threshold: 0.05,
            qber_hostile_threshold: 0.15,
            leakage_clean_threshold: 0.02,
            leakage_hostile_threshold: 0.10,
        }
    }
}

impl Thresholds {
    /// Each band must lie in [0, 1] with its clean edge below its hostile edge.
    pub fn validate(&self) -> Result<()> {
        let all = [
            ("qber_clean_threshold", self.qber_clean_threshold),
            ("qber_hostile_threshold", self.qber_hostile_threshold),
            ("leakage_clean_threshold", self.leakage_clean_threshold),
            ("leakage_hostile_threshold", self.leakage_hostile_threshold),
        ];
        for (name, value) in all {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{name} must lie in [0, 1], got {value}")));
            }
        }
        if self.qber_clean_threshold >= self.qber_hostile_threshold {
            return Err(invalid(format!(
                "qber_clean_threshold ({}) must be below qber_hostile_threshold ({})",
                self.qber_clean_threshold, self.qber_hostile_threshold
            )));
        }
        if self.leakage_clean_threshold >= self.leakage_hostile_threshold {
            return Err(invalid(format!(
                "leakage_clean_threshold ({}) must be below leakage_hostile_threshold ({})",
                self.leakage_clean_threshold, self.leakage_hostile_threshold
            )));
        }
        Ok(())
    }
}

/// Which statistic the classifier compares against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationBasis {
    /// Window sample means.
    #[default]
    Mean,
    /// Upper confidence bounds (mean + z * stderr). More conservative.
    UpperBound,
}

// ---------------------------------------------------------------------------
// Fortress locking curve
// ---------------------------------------------------------------------------

/// Tunable parameters of the Fortress locking model.
///
/// `braid_depth = base_depth + ceil(psplit_rate * depth_per_psplit)`, capped
/// at `max_depth`. Each layer cancels `layer_efficiency * sin²(rotation)` of
/// the residual leakage that remains above `residual_floor`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub base_depth: u32,
    pub depth_per_psplit: f64,
    pub max_depth: u32,
    pub layer_efficiency: f64,
    pub residual_floor: f64,
    /// Rotation (radians) applied when the leakage estimate saturates.
    pub max_rotation: f64,
    /// Leakage estimate at which the rotation saturates.
    pub rotation_saturation: f64,
    /// Signals per round reserved by each braid layer.
    pub overhead_signals_per_layer: usize,
    /// Probability that a single braid layer breaks the block's consistency check.
    pub gate_infidelity: f64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            base_depth: 2,
            depth_per_psplit: 40.0,
            max_depth: 16,
            layer_efficiency: 0.45,
            residual_floor: 0.05,
            max_rotation: std::f64::consts::FRAC_PI_2,
            rotation_saturation: 0.2,
            overhead_signals_per_layer: 8,
            gate_infidelity: 0.002,
        }
    }
}

impl LockingConfig {
    /// Depth bounds must be ordered and the curve constants in range.
    pub fn validate(&self) -> Result<()> {
        if self.max_depth < self.base_depth {
            return Err(invalid(format!(
                "locking.max_depth ({}) must be at least locking.base_depth ({})",
                self.max_depth, self.base_depth
            )));
        }
        if !(self.depth_per_psplit >= 0.0 && self.depth_per_psplit.is_finite()) {
            return Err(invalid("locking.depth_per_psplit must be a non-negative number"));
        }
        if !(self.layer_efficiency > 0.0 && self.layer_efficiency <= 1.0) {
            return Err(invalid("locking.layer_efficiency must lie in (0, 1]"));
        }
        if !(0.0..1.0).contains(&self.residual_floor) {
            return Err(invalid("locking.residual_floor must lie in [0, 1)"));
        }
        if !(self.max_rotation > 0.0 && self.max_rotation <= std::f64::consts::FRAC_PI_2) {
            return Err(invalid("locking.max_rotation must lie in (0, pi/2]"));
        }
        if !(self.rotation_saturation > 0.0 && self.rotation_saturation <= 1.0) {
            return Err(invalid("locking.rotation_saturation must lie in (0, 1]"));
        }
        if !(0.0..1.0).contains(&self.gate_infidelity) {
            return Err(invalid("locking.gate_infidelity must lie in [0, 1)"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session config
// ---------------------------------------------------------------------------

/// Configuration for one adaptive key-distribution session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Channel rounds drawn per diagnostic window.
    pub window_size: usize,
    /// Key-generation rounds between diagnostic windows.
    pub diagnostic_interval: usize,
    /// Rounds a protocol must stay active before a voluntary switch.
    pub min_dwell_rounds: usize,
    pub thresholds: Thresholds,
    /// Rounds per Fortress block.
    pub fortress_block_size: usize,
    /// Bits withheld by privacy amplification on top of the leakage estimate.
    pub security_margin: usize,
    pub reconciliation_abort_threshold: f64,
    pub initial_protocol: Protocol,
    /// Total channel rounds available to the session (diagnostics included).
    pub session_rounds: usize,
    /// Signals exchanged per channel round by the engines. A channel that
    /// reports its own signal count overrides this at session start.
    pub signals_per_round: usize,
    /// Fraction of sifted bits disclosed to estimate the error rate.
    pub subsample_fraction: f64,
    /// Smallest disclosed subsample per unit.
    pub min_check_bits: usize,
    pub confidence_level: f64,
    pub classification_basis: ClassificationBasis,
    pub racer_qber_ceiling: f64,
    pub reconciliation_efficiency: f64,
    pub locking: LockingConfig,
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: 40,
            diagnostic_interval: 20,
            min_dwell_rounds: 40,
            thresholds: Thresholds::default(),
            fortress_block_size: 4,
            security_margin: 20,
            reconciliation_abort_threshold: 0.15,
            initial_protocol: Protocol::Racer,
            session_rounds: 2_000,
            signals_per_round: 256,
            subsample_fraction: 0.1,
            min_check_bits: 40,
            confidence_level: 0.95,
            classification_basis: ClassificationBasis::Mean,
            racer_qber_ceiling: 0.11,
            reconciliation_efficiency: 1.1,
            locking: LockingConfig::default(),
            seed: None,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| invalid(format!("could not parse session config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option. Violations are fatal and surface before any round runs.
    pub fn validate(&self) -> Result<()> {
        if self.window_size < MIN_WINDOW_SIZE {
            return Err(invalid(format!(
                "window_size must be at least {MIN_WINDOW_SIZE}, got {}",
                self.window_size
            )));
        }
        if self.diagnostic_interval == 0 {
            return Err(invalid("diagnostic_interval must be at least 1 round"));
        }
        if self.min_dwell_rounds == 0 {
            return Err(invalid("min_dwell_rounds must be at least 1 round"));
        }
        if self.fortress_block_size == 0 {
            return Err(invalid("fortress_block_size must be at least 1 round"));
        }
        if self.signals_per_round == 0 {
            return Err(invalid("signals_per_round must be at least 1"));
        }
        if self.min_check_bits == 0 {
            return Err(invalid("min_check_bits must be at least 1"));
        }
        if self.session_rounds < self.window_size {
            return Err(invalid(format!(
                "session_rounds ({}) cannot be shorter than one diagnostic window ({})",
                self.session_rounds, self.window_size
            )));
        }
        open_unit("reconciliation_abort_threshold", self.reconciliation_abort_threshold)?;
        open_unit("subsample_fraction", self.subsample_fraction)?;
        open_unit("confidence_level", self.confidence_level)?;
        if !(self.racer_qber_ceiling > 0.0 && self.racer_qber_ceiling <= 1.0) {
            return Err(invalid("racer_qber_ceiling must lie in (0, 1]"));
        }
        if !(self.reconciliation_efficiency >= 1.0 && self.reconciliation_efficiency.is_finite()) {
            return Err(invalid("reconciliation_efficiency must be at least 1.0"));
        }
        self.thresholds.validate()?;
        self.locking.validate()?;
        Ok(())
    }
}

fn open_unit(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must lie in (0, 1), got {value}")))
    }
}

fn invalid(msg: impl Into<String>) -> AetherError {
    AetherError::Configuration(msg.into())
}
