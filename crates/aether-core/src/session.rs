//! Adaptive session driver.
//!
//! A [`Session`] owns the whole mutable context: controller state,
//! classifier memory, the latest diagnostic report, the RNG and the key
//! accumulated so far. Rounds run strictly in sequence: a unit's output is
//! committed before the next unit is dispatched, so a controller decision is
//! visible to the very next unit and a cancelled session never exposes a
//! partial block.
//!
//! ```text
//! diagnose (every `diagnostic_interval` key rounds)
//!   → classify → controller → Racer round | Fortress block → distill → telemetry
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelSource;
use crate::classifier::{ChannelState, ClassifierState, ThreatClassifier};
use crate::config::SessionConfig;
use crate::controller::{Decision, Protocol, StrategicController};
use crate::diagnostics::{DiagnosticReport, DiagnosticSampler};
use crate::distill::{DistillationPipeline, SecureKey};
use crate::engine::{Engine, EngineContext, ProtocolEngine};
use crate::error::{AetherError, ErrorKind, Result};

// ---------------------------------------------------------------------------
// Telemetry and summary
// ---------------------------------------------------------------------------

/// One row per Racer round or Fortress block (including aborted ones).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub round_id: u64,
    pub active_protocol: Protocol,
    pub channel_state: ChannelState,
    pub raw_bits_emitted: usize,
    pub sifted_bits: usize,
    pub secure_bits: usize,
    pub cumulative_leaked_bits: u64,
    /// Error kind raised by this unit, if any.
    pub event: Option<ErrorKind>,
}

/// End-of-session statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Channel rounds spent, diagnostics included.
    pub total_rounds: u64,
    pub diagnostic_rounds: u64,
    pub total_secure_bits: usize,
    pub protocol_switches: u64,
    /// Fraction of key-generation rounds spent in each confirmed channel state.
    pub state_distribution: BTreeMap<ChannelState, f64>,
    /// Fraction of key-generation rounds run by each protocol.
    pub protocol_distribution: BTreeMap<Protocol, f64>,
    pub errors: BTreeMap<ErrorKind, u64>,
    pub cancelled: bool,
}

/// Everything a finished (or cancelled) session hands back.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Concatenation of every unit's secure key. Possibly empty.
    pub key: SecureKey,
    /// Secure key of the last unit that produced one.
    pub last_key: SecureKey,
    pub summary: SessionSummary,
    pub telemetry: Vec<TelemetryRecord>,
}

/// Result of a single [`Session::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Ran(TelemetryRecord),
    Finished,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session<C: ChannelSource> {
    config: SessionConfig,
    channel: C,
    sampler: DiagnosticSampler,
    classifier: ThreatClassifier,
    controller: StrategicController,
    pipeline: DistillationPipeline,
    classification: ClassifierState,
    report: Option<DiagnosticReport>,
    observed: ChannelState,
    rng: StdRng,
    rounds_used: u64,
    rounds_since_diagnostic: usize,
    diagnostic_due: bool,
    finished: bool,
    cancelled: bool,
    key: SecureKey,
    last_key: SecureKey,
    telemetry: Vec<TelemetryRecord>,
    cumulative_leaked: u64,
    diagnostic_rounds: u64,
    errors: BTreeMap<ErrorKind, u64>,
    state_rounds: BTreeMap<ChannelState, u64>,
    protocol_rounds: BTreeMap<Protocol, u64>,
}

impl<C: ChannelSource> Session<C> {
    /// Validate the configuration and set up the session. Nothing is drawn
    /// from the channel until the first [`Session::step`].
    pub fn new(mut config: SessionConfig, channel: C) -> Result<Self> {
        config.validate()?;
        if let Some(signals) = channel.signals_per_round() {
            if signals != config.signals_per_round {
                log::debug!(
                    "signals_per_round {} replaced by the channel's {signals}",
                    config.signals_per_round
                );
                config.signals_per_round = signals;
            }
        }
        let sampler = DiagnosticSampler::new(config.confidence_level, config.classification_basis)?;
        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        let initial_state = match config.initial_protocol {
            Protocol::Racer => ChannelState::Clean,
            Protocol::Fortress => ChannelState::Hostile,
        };

        log::info!(
            "session start: {} rounds, initial protocol {}, window {}, interval {}, dwell {}",
            config.session_rounds,
            config.initial_protocol,
            config.window_size,
            config.diagnostic_interval,
            config.min_dwell_rounds
        );

        Ok(Self {
            sampler,
            classifier: ThreatClassifier::new(config.thresholds),
            controller: StrategicController::new(config.initial_protocol, config.min_dwell_rounds),
            pipeline: DistillationPipeline::new(
                config.subsample_fraction,
                config.min_check_bits,
                config.reconciliation_abort_threshold,
                config.reconciliation_efficiency,
                config.security_margin,
            ),
            classification: ClassifierState::new(initial_state),
            report: None,
            observed: initial_state,
            rng: StdRng::seed_from_u64(seed),
            rounds_used: 0,
            rounds_since_diagnostic: 0,
            diagnostic_due: true,
            finished: false,
            cancelled: false,
            key: SecureKey::empty(0.0),
            last_key: SecureKey::empty(0.0),
            telemetry: Vec::new(),
            cumulative_leaked: 0,
            diagnostic_rounds: 0,
            errors: BTreeMap::new(),
            state_rounds: BTreeMap::new(),
            protocol_rounds: BTreeMap::new(),
            channel,
            config,
        })
    }

    /// Validated configuration, after any channel override.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Mutable channel access between steps, e.g. to script an attack.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Protocol selection state.
    pub fn controller(&self) -> &StrategicController {
        &self.controller
    }

    /// Latest confirmed classification and any pending candidate.
    pub fn classification(&self) -> ClassifierState {
        self.classification
    }

    /// Channel rounds spent, diagnostics included.
    pub fn rounds_used(&self) -> u64 {
        self.rounds_used
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// One record per Racer round or Fortress block, in order.
    pub fn telemetry(&self) -> &[TelemetryRecord] {
        &self.telemetry
    }

    /// Key accumulated so far.
    pub fn key(&self) -> &SecureKey {
        &self.key
    }

    fn remaining(&self) -> u64 {
        (self.config.session_rounds as u64).saturating_sub(self.rounds_used)
    }

    /// Run one scheduling unit: diagnose if due, then one Racer round or one
    /// Fortress block. Only configuration errors propagate; every other error
    /// is recorded and recovered from.
    pub fn step(&mut self) -> Result<Step> {
        if self.finished {
            return Ok(Step::Finished);
        }

        if self.diagnostic_due || self.report.is_none() {
            if self.remaining() < self.config.window_size as u64 {
                if self.report.is_none() {
                    return Ok(self.finish());
                }
                // Not enough budget for another window: keep the last report.
                self.diagnostic_due = false;
            } else {
                self.diagnose()?;
            }
        }

        let Some(report) = self.report.as_ref() else {
            return Ok(self.finish());
        };

        let protocol = self.controller.active();
        let engine = Engine::for_protocol(protocol, &self.config);
        let unit = engine.rounds_per_unit();
        if self.remaining() < unit as u64 {
            return Ok(self.finish());
        }

        self.channel.observe_protocol(protocol);
        let round_id = self.rounds_used;
        let confirmed = self.classification.state;
        let mut ctx = EngineContext {
            report,
            observed_state: self.observed,
            rng: &mut self.rng,
        };

        if let Err(err) = engine.preflight(&ctx) {
            return self.recover(err, round_id, protocol, confirmed);
        }

        let window = self.channel.next_window(unit);
        let raw = match engine.run(&window, &mut ctx) {
            Ok(raw) => raw,
            Err(err) => return self.recover(err, round_id, protocol, confirmed),
        };
        let hash_seed: u64 = self.rng.random();
        let distilled = self.pipeline.distill(raw, &mut self.rng, hash_seed);

        self.rounds_used += unit as u64;
        self.rounds_since_diagnostic += unit;
        self.controller.advance(unit as u64);
        *self.state_rounds.entry(confirmed).or_insert(0) += unit as u64;
        *self.protocol_rounds.entry(protocol).or_insert(0) += unit as u64;
        if self.rounds_since_diagnostic >= self.config.diagnostic_interval {
            self.diagnostic_due = true;
        }

        let mut record = TelemetryRecord {
            round_id,
            active_protocol: protocol,
            channel_state: confirmed,
            raw_bits_emitted: 0,
            sifted_bits: 0,
            secure_bits: 0,
            cumulative_leaked_bits: self.cumulative_leaked,
            event: None,
        };

        match distilled {
            Ok(d) => {
                self.cumulative_leaked += d.leaked_bits as u64;
                record.raw_bits_emitted = d.raw_bits;
                record.sifted_bits = d.sifted_bits;
                record.cumulative_leaked_bits = self.cumulative_leaked;
                if let Some(err) = d.amplification.exhaustion() {
                    record.event = Some(err.kind());
                    self.tally(&err);
                    self.controller.note_key_exhausted();
                    self.diagnostic_due = true;
                } else {
                    let key = d.amplification.into_key();
                    record.secure_bits = key.length;
                    self.key.extend(&key);
                    self.last_key = key;
                }
                log::debug!(
                    "{protocol} unit @{round_id}: raw {}, sifted {}, e {:.4}, leaked {}, secure {}",
                    d.raw_bits,
                    d.sifted_bits,
                    d.estimated_error_rate,
                    d.leaked_bits,
                    record.secure_bits
                );
            }
            Err(err) if !err.is_fatal() => {
                record.event = Some(err.kind());
                self.tally(&err);
                // Raw material is discarded; look at the channel again.
                self.diagnostic_due = true;
            }
            Err(err) => return Err(err),
        }

        self.telemetry.push(record.clone());
        Ok(Step::Ran(record))
    }

    /// Run until the round budget is spent.
    pub fn run(&mut self) -> Result<()> {
        self.run_until(&AtomicBool::new(false))
    }

    /// Run until the budget is spent or `cancel` is set. Cancellation is
    /// honoured between units only.
    pub fn run_until(&mut self, cancel: &AtomicBool) -> Result<()> {
        loop {
            if cancel.load(Ordering::Relaxed) {
                self.cancelled = true;
                self.finished = true;
                log::info!("session cancelled after {} rounds", self.rounds_used);
                return Ok(());
            }
            if let Step::Finished = self.step()? {
                return Ok(());
            }
        }
    }

    /// Totals and time-weighted distributions over the rounds run so far.
    pub fn summary(&self) -> SessionSummary {
        let key_rounds: u64 = self.protocol_rounds.values().sum();
        let fraction = |n: u64| {
            if key_rounds == 0 {
                0.0
            } else {
                n as f64 / key_rounds as f64
            }
        };
        SessionSummary {
            total_rounds: self.rounds_used,
            diagnostic_rounds: self.diagnostic_rounds,
            total_secure_bits: self.key.length,
            protocol_switches: self.controller.switches(),
            state_distribution: self
                .state_rounds
                .iter()
                .map(|(&s, &n)| (s, fraction(n)))
                .collect(),
            protocol_distribution: self
                .protocol_rounds
                .iter()
                .map(|(&p, &n)| (p, fraction(n)))
                .collect(),
            errors: self.errors.clone(),
            cancelled: self.cancelled,
        }
    }

    /// Consume the session, returning key, telemetry and summary.
    pub fn into_outcome(self) -> SessionOutcome {
        SessionOutcome {
            summary: self.summary(),
            key: self.key,
            last_key: self.last_key,
            telemetry: self.telemetry,
        }
    }

    fn diagnose(&mut self) -> Result<()> {
        let report = match self.sampler.sample(&mut self.channel, self.config.window_size) {
            Ok(report) => report,
            Err(err) if !err.is_fatal() => {
                self.tally(&err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let spent = report.sample_count as u64;
        self.rounds_used += spent;
        self.diagnostic_rounds += spent;
        self.rounds_since_diagnostic = 0;
        self.diagnostic_due = false;

        self.observed = self.classifier.instantaneous(&report);
        self.classification = self.classifier.classify(&report, self.classification);
        let decision = self.controller.evaluate(self.classification.state, self.rounds_used);
        if let Decision::Deferred { target, .. } = decision {
            log::debug!("switch to {target} deferred by dwell time");
        }
        self.report = Some(report);
        Ok(())
    }

    /// Record a round-local error that stopped a unit before distillation.
    fn recover(
        &mut self,
        err: AetherError,
        round_id: u64,
        protocol: Protocol,
        confirmed: ChannelState,
    ) -> Result<Step> {
        if err.is_fatal() {
            return Err(err);
        }
        self.tally(&err);
        if err.kind() == ErrorKind::RacerSafetyAbort {
            self.controller.force(Protocol::Fortress, self.rounds_used);
        } else {
            self.diagnostic_due = true;
        }
        let record = TelemetryRecord {
            round_id,
            active_protocol: protocol,
            channel_state: confirmed,
            raw_bits_emitted: 0,
            sifted_bits: 0,
            secure_bits: 0,
            cumulative_leaked_bits: self.cumulative_leaked,
            event: Some(err.kind()),
        };
        self.telemetry.push(record.clone());
        Ok(Step::Ran(record))
    }

    fn tally(&mut self, err: &AetherError) {
        log::warn!("round {}: {err}", self.rounds_used);
        *self.errors.entry(err.kind()).or_insert(0) += 1;
    }

    fn finish(&mut self) -> Step {
        if !self.finished {
            self.finished = true;
            log::info!(
                "session finished: {} rounds ({} diagnostic), {} secure bits, {} switches",
                self.rounds_used,
                self.diagnostic_rounds,
                self.key.length,
                self.controller.switches()
            );
        }
        Step::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelProfile, ChannelSample, SimulatedChannel};

    /// Fails the test if the session ever draws a round.
    struct UntouchedChannel;

    impl ChannelSource for UntouchedChannel {
        fn next_sample(&mut self) -> ChannelSample {
            panic!("channel drawn before configuration was validated");
        }

        fn rounds_drawn(&self) -> u64 {
            0
        }
    }

    fn config(rounds: usize) -> SessionConfig {
        SessionConfig {
            session_rounds: rounds,
            seed: Some(11),
            ..Default::default()
        }
    }

    fn session(profile: ChannelProfile, config: SessionConfig) -> Session<SimulatedChannel> {
        let channel = SimulatedChannel::new(profile, 5).unwrap();
        Session::new(config, channel).unwrap()
    }

    #[test]
    fn test_invalid_config_fails_before_any_round() {
        let bad = SessionConfig {
            window_size: 10,
            ..Default::default()
        };
        let err = Session::new(bad, UntouchedChannel).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_clean_session_stays_on_racer() {
        let mut s = session(ChannelProfile::clean(), config(600));
        s.run().unwrap();
        let summary = s.summary();
        assert!(summary.errors.get(&ErrorKind::ReconciliationFailure).is_none());

        assert!(s.is_finished());
        assert_eq!(summary.protocol_switches, 0);
        assert_eq!(summary.protocol_distribution.get(&Protocol::Racer), Some(&1.0));
        assert!(summary.total_rounds <= 600);
        assert!(summary.diagnostic_rounds >= 40);
        assert!(summary.total_secure_bits > 0);
        assert!(!summary.cancelled);
        assert!(summary.errors.get(&ErrorKind::RacerSafetyAbort).is_none());

        let from_rows: usize = s.telemetry().iter().map(|r| r.secure_bits).sum();
        assert_eq!(from_rows, s.key().length);
        assert_eq!(s.channel().rounds_drawn(), s.rounds_used());
    }

    #[test]
    fn test_hostile_reading_aborts_racer_and_forces_fortress() {
        let mut s = session(ChannelProfile::hostile(), config(400));

        let Step::Ran(first) = s.step().unwrap() else {
            panic!("session finished before its first unit");
        };
        assert_eq!(first.active_protocol, Protocol::Racer);
        assert_eq!(first.event, Some(ErrorKind::RacerSafetyAbort));
        assert_eq!(first.raw_bits_emitted, 0);
        assert_eq!(s.controller().active(), Protocol::Fortress);
        // Only the diagnostic window has been spent.
        assert_eq!(s.rounds_used(), 40);

        s.run().unwrap();
        let summary = s.summary();
        assert_eq!(summary.errors.get(&ErrorKind::RacerSafetyAbort), Some(&1));
        assert_eq!(summary.protocol_switches, 1);
        assert_eq!(summary.protocol_distribution.get(&Protocol::Fortress), Some(&1.0));
        assert!(summary.total_secure_bits > 0);
        assert!(
            s.telemetry()
                .iter()
                .skip(1)
                .all(|r| r.active_protocol == Protocol::Fortress)
        );
    }

    #[test]
    fn test_fortress_start_moves_to_racer_on_clean_link() {
        let cfg = SessionConfig {
            initial_protocol: Protocol::Fortress,
            ..config(1_000)
        };
        let mut s = session(ChannelProfile::clean(), cfg);
        assert_eq!(s.classification().state, ChannelState::Hostile);
        s.run().unwrap();

        assert_eq!(s.controller().active(), Protocol::Racer);
        assert_eq!(s.summary().protocol_switches, 1);
        assert_eq!(s.classification().state, ChannelState::Clean);
    }

    #[test]
    fn test_cancelled_session_spends_nothing() {
        let mut s = session(ChannelProfile::clean(), config(600));
        s.run_until(&AtomicBool::new(true)).unwrap();

        let outcome = s.into_outcome();
        assert!(outcome.summary.cancelled);
        assert_eq!(outcome.summary.total_rounds, 0);
        assert!(outcome.telemetry.is_empty());
        assert!(outcome.key.is_empty());
    }

    #[test]
    fn test_cancellation_keeps_committed_units() {
        let mut s = session(ChannelProfile::clean(), config(600));
        for _ in 0..5 {
            s.step().unwrap();
        }
        let rows = s.telemetry().len();
        s.run_until(&AtomicBool::new(true)).unwrap();
        assert!(s.is_finished());
        assert_eq!(s.telemetry().len(), rows);
        assert_eq!(s.step().unwrap(), Step::Finished);
    }

    #[test]
    fn test_distributions_sum_to_one() {
        let mut s = session(ChannelProfile::hostile(), config(500));
        s.run().unwrap();
        let summary = s.summary();
        let states: f64 = summary.state_distribution.values().sum();
        let protocols: f64 = summary.protocol_distribution.values().sum();
        assert!((states - 1.0).abs() < 1e-9);
        assert!((protocols - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_budget_below_one_window_produces_nothing() {
        let cfg = SessionConfig {
            window_size: 40,
            session_rounds: 40,
            ..config(40)
        };
        let mut s = session(ChannelProfile::clean(), cfg);
        s.run().unwrap();
        // The single window is spent on diagnostics; no key round fits.
        assert_eq!(s.rounds_used(), 40);
        assert!(s.telemetry().is_empty());
        assert!(s.key().is_empty());
    }

    #[test]
    fn test_clean_link_never_fails_reconciliation() {
        for seed in [1, 2, 3] {
            let channel = SimulatedChannel::new(ChannelProfile::clean(), seed).unwrap();
            let cfg = SessionConfig {
                seed: Some(seed),
                ..config(2_000)
            };
            let mut s = Session::new(cfg, channel).unwrap();
            s.run().unwrap();
            let errors = s.summary().errors;
            assert!(
                errors.get(&ErrorKind::ReconciliationFailure).is_none(),
                "seed {seed}: {errors:?}"
            );
        }
    }

    #[test]
    fn test_engines_adopt_channel_signal_count() {
        let profile = ChannelProfile {
            signals_per_round: 128,
            ..ChannelProfile::clean()
        };
        let mut s = session(profile, config(600));
        assert_eq!(s.config().signals_per_round, 128);

        let Step::Ran(record) = s.step().unwrap() else {
            panic!("session finished before its first unit");
        };
        assert_eq!(record.raw_bits_emitted, 128);
    }

    #[test]
    fn test_key_exhaustion_rediagnoses_and_bypasses_dwell() {
        let cfg = SessionConfig {
            initial_protocol: Protocol::Fortress,
            min_dwell_rounds: 1_000,
            security_margin: 100_000,
            ..config(2_000)
        };
        let mut s = session(ChannelProfile::clean(), cfg);

        // Window 1 reads Clean once; the block cannot cover the margin.
        let Step::Ran(first) = s.step().unwrap() else {
            panic!("session finished before its first unit");
        };
        assert_eq!(first.active_protocol, Protocol::Fortress);
        assert_eq!(first.event, Some(ErrorKind::KeyExhausted));
        assert_eq!(first.secure_bits, 0);
        assert!(s.diagnostic_due);
        assert_eq!(s.rounds_since_diagnostic, 4);

        // Window 2 confirms Clean and the controller leaves Fortress after
        // only one block, far inside the dwell time.
        s.step().unwrap();
        assert_eq!(s.diagnostic_rounds, 80);
        assert_eq!(s.controller().active(), Protocol::Racer);
        assert_eq!(s.controller().switches(), 1);
        assert_eq!(s.controller().state().last_switch_round, 84);
        assert_eq!(s.rounds_since_diagnostic, 1);
        assert_eq!(s.summary().errors.get(&ErrorKind::KeyExhausted), Some(&2));
    }

    #[test]
    fn test_reconciliation_failure_discards_unit_and_rediagnoses() {
        let profile = ChannelProfile {
            baseline_qber: 0.03,
            ..ChannelProfile::clean()
        };
        let cfg = SessionConfig {
            reconciliation_abort_threshold: 0.001,
            ..config(2_000)
        };
        let mut s = session(profile, cfg);

        let mut failed = None;
        for _ in 0..20 {
            if let Step::Ran(record) = s.step().unwrap() {
                if record.event == Some(ErrorKind::ReconciliationFailure) {
                    failed = Some(record);
                    break;
                }
            }
        }
        let failed = failed.expect("no unit crossed the abort threshold");
        assert_eq!(failed.secure_bits, 0);
        assert_eq!(failed.sifted_bits, 0);
        assert!(s.diagnostic_due);

        let diagnostics_before = s.diagnostic_rounds;
        s.step().unwrap();
        assert_eq!(s.diagnostic_rounds, diagnostics_before + 40);
        assert_eq!(s.rounds_since_diagnostic, 1);
        assert!(s.summary().errors[&ErrorKind::ReconciliationFailure] >= 1);
    }
}
