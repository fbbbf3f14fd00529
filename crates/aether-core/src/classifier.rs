//! Threat classification with two-window hysteresis.

use serde::{Deserialize, Serialize};

use crate::config::Thresholds;
use crate::diagnostics::DiagnosticReport;

/// Discrete channel-quality label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Clean,
    Degraded,
    Hostile,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Degraded => write!(f, "degraded"),
            Self::Hostile => write!(f, "hostile"),
        }
    }
}

/// Classifier output: the confirmed state plus a candidate that has been
/// seen for one window and needs one more to take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierState {
    pub state: ChannelState,
    pub pending: Option<ChannelState>,
}

impl ClassifierState {
    /// Confirmed `state` with no pending candidate.
    pub fn new(state: ChannelState) -> Self {
        Self {
            state,
            pending: None,
        }
    }
}

/// Maps diagnostic reports to [`ChannelState`]s. Stateless: the previous
/// classification is passed in, so identical inputs give identical outputs.
#[derive(Debug, Clone, Copy)]
pub struct ThreatClassifier {
    thresholds: Thresholds,
}

impl ThreatClassifier {
    /// Classifier over the given band edges.
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Threshold comparison for a single window, without hysteresis.
    pub fn instantaneous(&self, report: &DiagnosticReport) -> ChannelState {
        let t = &self.thresholds;
        let input = report.classification_input;
        if input.qber > t.qber_hostile_threshold || input.leakage > t.leakage_hostile_threshold {
            ChannelState::Hostile
        } else if input.qber < t.qber_clean_threshold && input.leakage < t.leakage_clean_threshold {
            ChannelState::Clean
        } else {
            ChannelState::Degraded
        }
    }

    /// A reading that differs from `prior.state` only takes over once it has
    /// been seen in two consecutive windows; a one-window excursion leaves the
    /// confirmed state unchanged.
    pub fn classify(&self, report: &DiagnosticReport, prior: ClassifierState) -> ClassifierState {
        let observed = self.instantaneous(report);
        if observed == prior.state {
            ClassifierState::new(observed)
        } else if prior.pending == Some(observed) {
            ClassifierState::new(observed)
        } else {
            ClassifierState {
                state: prior.state,
                pending: Some(observed),
            }
        }
    }
}
