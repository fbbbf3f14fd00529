//! Diagnostic sampling: short calibration windows with confidence bounds.
//!
//! Every round drawn here is spent. It never carries key material, so the
//! session charges diagnostic windows against its round budget.

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::channel::{ChannelSample, ChannelSource};
use crate::config::ClassificationBasis;
use crate::error::{AetherError, Result};

/// Smallest window for which the standard error is meaningful.
pub const MIN_WINDOW_SIZE: usize = 20;

/// The (qber, leakage) pair the classifier compares against its thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassificationInput {
    pub qber: f64,
    pub leakage: f64,
}

/// Aggregate of one diagnostic window. Consumed by the classifier and then
/// dropped; the session never carries a report across windows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    pub mean_qber: f64,
    pub qber_stderr: f64,
    pub mean_leakage: f64,
    pub leakage_stderr: f64,
    pub mean_psplit: f64,
    pub qber_upper_bound: f64,
    pub leakage_upper_bound: f64,
    pub sample_count: usize,
    pub first_round: u64,
    pub last_round: u64,
    pub classification_input: ClassificationInput,
}

impl DiagnosticReport {
    /// Reduce a window of samples. `z` scales the standard errors into upper bounds.
    pub fn from_samples(
        samples: &[ChannelSample],
        z: f64,
        basis: ClassificationBasis,
    ) -> Result<Self> {
        if samples.len() < MIN_WINDOW_SIZE {
            return Err(AetherError::InsufficientSample {
                requested: samples.len(),
                minimum: MIN_WINDOW_SIZE,
            });
        }

        let qber = Moments::of(samples.iter().map(|s| s.qber));
        let leakage = Moments::of(samples.iter().map(|s| s.leakage_indicator));
        let psplit = Moments::of(samples.iter().map(|s| s.psplit_rate));

        let qber_upper_bound = (qber.mean + z * qber.stderr).clamp(0.0, 1.0);
        let leakage_upper_bound = (leakage.mean + z * leakage.stderr).clamp(0.0, 1.0);
        let classification_input = match basis {
            ClassificationBasis::Mean => ClassificationInput {
                qber: qber.mean,
                leakage: leakage.mean,
            },
            ClassificationBasis::UpperBound => ClassificationInput {
                qber: qber_upper_bound,
                leakage: leakage_upper_bound,
            },
        };

        Ok(Self {
            mean_qber: qber.mean,
            qber_stderr: qber.stderr,
            mean_leakage: leakage.mean,
            leakage_stderr: leakage.stderr,
            mean_psplit: psplit.mean,
            qber_upper_bound,
            leakage_upper_bound,
            sample_count: samples.len(),
            first_round: samples.iter().map(|s| s.round_id).min().unwrap_or(0),
            last_round: samples.iter().map(|s| s.round_id).max().unwrap_or(0),
            classification_input,
        })
    }

    /// A report with the given means and no spread. Handy for driving the
    /// classifier and controller from scripted readings.
    pub fn from_means(mean_qber: f64, mean_leakage: f64, sample_count: usize) -> Self {
        Self {
            mean_qber,
            qber_stderr: 0.0,
            mean_leakage,
            leakage_stderr: 0.0,
            mean_psplit: 0.0,
            qber_upper_bound: mean_qber,
            leakage_upper_bound: mean_leakage,
            sample_count,
            first_round: 0,
            last_round: sample_count.saturating_sub(1) as u64,
            classification_input: ClassificationInput {
                qber: mean_qber,
                leakage: mean_leakage,
            },
        }
    }

    /// Set the mean photon-number-splitting exposure.
    pub fn with_psplit(mut self, mean_psplit: f64) -> Self {
        self.mean_psplit = mean_psplit;
        self
    }
}

/// Draws diagnostic windows from a channel.
#[derive(Debug, Clone)]
pub struct DiagnosticSampler {
    z: f64,
    basis: ClassificationBasis,
}

impl DiagnosticSampler {
    /// `confidence_level` is two-sided, e.g. 0.95 gives z ≈ 1.96.
    pub fn new(confidence_level: f64, basis: ClassificationBasis) -> Result<Self> {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(AetherError::Configuration(format!(
                "confidence_level must lie in (0, 1), got {confidence_level}"
            )));
        }
        let z = Normal::standard().inverse_cdf(0.5 + confidence_level / 2.0);
        Ok(Self { z, basis })
    }

    pub fn z_score(&self) -> f64 {
        self.z
    }

    /// Spend `window_size` channel rounds and summarize them.
    ///
    /// Windows below [`MIN_WINDOW_SIZE`] fail before any round is drawn.
    pub fn sample(
        &self,
        channel: &mut dyn ChannelSource,
        window_size: usize,
    ) -> Result<DiagnosticReport> {
        if window_size < MIN_WINDOW_SIZE {
            return Err(AetherError::InsufficientSample {
                requested: window_size,
                minimum: MIN_WINDOW_SIZE,
            });
        }
        let samples = channel.next_window(window_size);
        let report = DiagnosticReport::from_samples(&samples, self.z, self.basis)?;
        log::debug!(
            "diagnostic rounds {}..={}: qber {:.4} ± {:.4}, leakage {:.4} ± {:.4}, psplit {:.4}",
            report.first_round,
            report.last_round,
            report.mean_qber,
            report.qber_stderr,
            report.mean_leakage,
            report.leakage_stderr,
            report.mean_psplit
        );
        Ok(report)
    }
}

/// Sample mean and standard error of the mean.
struct Moments {
    mean: f64,
    stderr: f64,
}

impl Moments {
    fn of(values: impl Iterator<Item = f64> + Clone) -> Self {
        let n = values.clone().count();
        if n == 0 {
            return Self {
                mean: 0.0,
                stderr: 0.0,
            };
        }
        let nf = n as f64;
        let mean = values.clone().sum::<f64>() / nf;
        if n < 2 {
            return Self { mean, stderr: 0.0 };
        }
        let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / (nf - 1.0);
        Self {
            mean,
            stderr: (var / nf).sqrt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelProfile, SimulatedChannel};

    fn sample(round_id: u64, qber: f64, leakage: f64) -> ChannelSample {
        ChannelSample {
            qber,
            leakage_indicator: leakage,
            psplit_rate: 0.0,
            round_id,
        }
    }

    #[test]
    fn test_window_below_minimum_fails_without_spending_rounds() {
        let sampler = DiagnosticSampler::new(0.95, ClassificationBasis::Mean).unwrap();
        let mut ch = SimulatedChannel::new(ChannelProfile::clean(), 1).unwrap();
        let err = sampler.sample(&mut ch, 19).unwrap_err();
        assert_eq!(
            err,
            AetherError::InsufficientSample {
                requested: 19,
                minimum: 20
            }
        );
        assert_eq!(ch.rounds_drawn(), 0);
    }

    #[test]
    fn test_sampling_spends_window_rounds() {
        let sampler = DiagnosticSampler::new(0.95, ClassificationBasis::Mean).unwrap();
        let mut ch = SimulatedChannel::new(ChannelProfile::clean(), 1).unwrap();
        let report = sampler.sample(&mut ch, 30).unwrap();
        assert_eq!(report.sample_count, 30);
        assert_eq!(ch.rounds_drawn(), 30);
        assert_eq!((report.first_round, report.last_round), (0, 29));
    }

    #[test]
    fn test_z_score_for_95_percent() {
        let sampler = DiagnosticSampler::new(0.95, ClassificationBasis::Mean).unwrap();
        assert!((sampler.z_score() - 1.959964).abs() < 1e-4);
        assert!(DiagnosticSampler::new(1.0, ClassificationBasis::Mean).is_err());
    }

    #[test]
    fn test_mean_and_stderr_of_known_window() {
        // Alternating 0.0 / 0.2 qber: mean 0.1, sample sd ~0.1026.
        let samples: Vec<_> = (0..20)
            .map(|i| sample(i, if i % 2 == 0 { 0.0 } else { 0.2 }, 0.05))
            .collect();
        let report =
            DiagnosticReport::from_samples(&samples, 2.0, ClassificationBasis::Mean).unwrap();
        assert!((report.mean_qber - 0.1).abs() < 1e-12);
        let expected_sd = (20.0 * 0.01 / 19.0f64).sqrt();
        assert!((report.qber_stderr - expected_sd / 20f64.sqrt()).abs() < 1e-12);
        assert_eq!(report.leakage_stderr, 0.0);
        assert!((report.qber_upper_bound - (0.1 + 2.0 * report.qber_stderr)).abs() < 1e-12);
        assert_eq!(report.classification_input.qber, report.mean_qber);
    }

    #[test]
    fn test_reduction_is_order_independent() {
        let mut samples: Vec<_> = (0..40)
            .map(|i| sample(i, (i % 7) as f64 / 100.0, (i % 3) as f64 / 50.0))
            .collect();
        let forward =
            DiagnosticReport::from_samples(&samples, 1.96, ClassificationBasis::Mean).unwrap();
        samples.reverse();
        let backward =
            DiagnosticReport::from_samples(&samples, 1.96, ClassificationBasis::Mean).unwrap();
        assert!((forward.mean_qber - backward.mean_qber).abs() < 1e-12);
        assert!((forward.leakage_stderr - backward.leakage_stderr).abs() < 1e-12);
        assert_eq!(forward.first_round, backward.first_round);
        assert_eq!(forward.last_round, backward.last_round);
    }

    #[test]
    fn test_upper_bound_basis_feeds_bounds_to_classifier() {
        let samples: Vec<_> = (0..25)
            .map(|i| sample(i, if i % 2 == 0 { 0.03 } else { 0.05 }, 0.01))
            .collect();
        let report = DiagnosticReport::from_samples(&samples, 1.96, ClassificationBasis::UpperBound)
            .unwrap();
        assert_eq!(report.classification_input.qber, report.qber_upper_bound);
        assert!(report.classification_input.qber > report.mean_qber);
    }
}
