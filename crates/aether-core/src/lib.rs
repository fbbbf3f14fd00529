//! # aether-core
//!
//! **Adaptive quantum key distribution, simulated.**
//!
//! `aether-core` runs a key-distribution session that watches its own channel
//! and switches between two protocols as conditions change: **Racer**, a fast
//! entanglement-based exchange for clean links, and **Fortress**, a block
//! protocol that spends throughput on a locking transform to suppress
//! side-channel leakage on hostile ones.
//!
//! ## Quick Start
//!
//! ```no_run
//! use aether_core::{ChannelProfile, Session, SessionConfig, SimulatedChannel};
//!
//! let channel = SimulatedChannel::new(ChannelProfile::clean(), 7)?;
//! let mut session = Session::new(SessionConfig::default(), channel)?;
//! session.run()?;
//!
//! let outcome = session.into_outcome();
//! println!(
//!     "{} secure bits, {} protocol switches",
//!     outcome.key.length, outcome.summary.protocol_switches
//! );
//! # Ok::<(), aether_core::AetherError>(())
//! ```
//!
//! ## Architecture
//!
//! Channel → Diagnostics → Classifier → Controller → Engine → Distillation → Key
//!
//! - [`channel`]: the [`ChannelSource`] contract and a seeded simulator with
//!   static and adaptive adversaries.
//! - [`diagnostics`]: windowed QBER/leakage statistics with confidence bounds.
//! - [`classifier`]: Clean / Degraded / Hostile with two-window hysteresis.
//! - [`controller`]: protocol selection under a minimum dwell time.
//! - [`engine`]: the Racer and Fortress engines behind one trait.
//! - [`distill`]: sifting, reconciliation and SHA-256 privacy amplification.
//! - [`session`]: the round loop, telemetry and summary.
//! - [`record`]: telemetry.csv / summary.json recordings.

pub mod channel;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod distill;
pub mod engine;
pub mod error;
pub mod record;
pub mod session;

pub use channel::{AttackMode, ChannelProfile, ChannelSample, ChannelSource, SimulatedChannel};
pub use classifier::{ChannelState, ClassifierState, ThreatClassifier};
pub use config::{ClassificationBasis, LockingConfig, SessionConfig, Thresholds};
pub use controller::{ControllerState, Decision, Protocol, StrategicController};
pub use diagnostics::{DiagnosticReport, DiagnosticSampler};
pub use distill::{Amplification, DistillationPipeline, ReconciledKey, SecureKey, SiftedKey};
pub use engine::{
    Engine, FortressEngine, LockingUnitaryParams, ProtocolEngine, RacerEngine, RawKeyMaterial,
};
pub use error::{AetherError, ErrorKind, Result};
pub use record::{RecordConfig, RecordingMeta, TelemetryWriter};
pub use session::{Session, SessionOutcome, SessionSummary, Step, TelemetryRecord};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
