//! Error kinds raised by the adaptive controller and the distillation pipeline.
//!
//! Only [`AetherError::Configuration`] is fatal. Every other kind is local to a
//! single round or block: the session records it, recovers at the next
//! scheduling point, and tallies it in the run summary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::ChannelState;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AetherError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AetherError {
    #[error("Diagnostic window of {requested} samples is below the minimum of {minimum}")]
    InsufficientSample { requested: usize, minimum: usize },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Racer aborted: mean QBER {mean_qber:.4} (ceiling {ceiling:.4}), channel {state}")]
    RacerSafetyAbort {
        mean_qber: f64,
        ceiling: f64,
        state: ChannelState,
    },

    #[error("Reconciliation aborted: error rate {error_rate:.4} exceeds threshold {threshold:.4}")]
    ReconciliationFailure { error_rate: f64, threshold: f64 },

    #[error("Key exhausted: {available} bits available, {required} required")]
    KeyExhausted { available: usize, required: usize },
}

/// Stable tag for each error kind, used for the summary tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientSample,
    Configuration,
    RacerSafetyAbort,
    ReconciliationFailure,
    KeyExhausted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientSample => write!(f, "insufficient_sample"),
            Self::Configuration => write!(f, "configuration"),
            Self::RacerSafetyAbort => write!(f, "racer_safety_abort"),
            Self::ReconciliationFailure => write!(f, "reconciliation_failure"),
            Self::KeyExhausted => write!(f, "key_exhausted"),
        }
    }
}

impl AetherError {
    /// Stable tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientSample { .. } => ErrorKind::InsufficientSample,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::RacerSafetyAbort { .. } => ErrorKind::RacerSafetyAbort,
            Self::ReconciliationFailure { .. } => ErrorKind::ReconciliationFailure,
            Self::KeyExhausted { .. } => ErrorKind::KeyExhausted,
        }
    }

    /// Whether the session must halt. Everything else recovers next unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(AetherError::Configuration("bad".into()).is_fatal());
        assert!(
            !AetherError::ReconciliationFailure {
                error_rate: 0.5,
                threshold: 0.3
            }
            .is_fatal()
        );
        assert!(
            !AetherError::KeyExhausted {
                available: 0,
                required: 30
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_kinds_display_snake_case() {
        let err = AetherError::InsufficientSample {
            requested: 5,
            minimum: 20,
        };
        assert_eq!(err.kind(), ErrorKind::InsufficientSample);
        assert_eq!(err.kind().to_string(), "insufficient_sample");
        assert!(err.to_string().contains("below the minimum of 20"));
    }
}
