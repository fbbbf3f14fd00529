//! Integration tests for aether-core.
//!
//! These tests drive the full loop through the public API:
//! channel → diagnostics → classification → controller → engines → distillation
//! → telemetry and recordings.

use std::sync::atomic::AtomicBool;

use aether_core::{
    AttackMode, ChannelProfile, ChannelSource, ChannelState, ClassifierState, DiagnosticReport,
    DiagnosticSampler, ErrorKind, Protocol, RecordConfig, RecordingMeta, Session, SessionConfig,
    SessionSummary, SimulatedChannel, Step, StrategicController, TelemetryWriter,
    ThreatClassifier, Thresholds,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn seeded(rounds: usize) -> SessionConfig {
    SessionConfig {
        session_rounds: rounds,
        seed: Some(2024),
        ..Default::default()
    }
}

fn run(profile: ChannelProfile, config: SessionConfig) -> Session<SimulatedChannel> {
    let channel = SimulatedChannel::new(profile, 99).unwrap();
    let mut session = Session::new(config, channel).unwrap();
    session.run().unwrap();
    session
}

#[test]
fn clean_channel_readings_keep_racer() {
    let classifier = ThreatClassifier::new(Thresholds::default());
    let mut controller = StrategicController::new(Protocol::Racer, 40);
    let report = DiagnosticReport::from_means(0.01, 0.0, 40);

    let mut state = ClassifierState::new(ChannelState::Clean);
    for round in [40, 80, 120] {
        controller.advance(40);
        state = classifier.classify(&report, state);
        controller.evaluate(state.state, round);
    }
    assert_eq!(state.state, ChannelState::Clean);
    assert_eq!(controller.active(), Protocol::Racer);
    assert_eq!(controller.switches(), 0);
}

#[test]
fn two_hostile_windows_switch_to_fortress() {
    let classifier = ThreatClassifier::new(Thresholds::default());
    let mut controller = StrategicController::new(Protocol::Racer, 20);
    controller.advance(100);
    let hostile = DiagnosticReport::from_means(0.03, 0.25, 40);

    let first = classifier.classify(&hostile, ClassifierState::new(ChannelState::Clean));
    controller.evaluate(first.state, 100);
    assert_eq!(first.state, ChannelState::Clean);
    assert_eq!(controller.active(), Protocol::Racer);

    let second = classifier.classify(&hostile, first);
    controller.evaluate(second.state, 140);
    assert_eq!(second.state, ChannelState::Hostile);
    assert_eq!(controller.active(), Protocol::Fortress);
    assert_eq!(controller.state().rounds_in_state, 0);
    assert_eq!(controller.state().last_switch_round, 140);
}

#[test]
fn short_window_is_rejected_without_spending_rounds() {
    let mut channel = SimulatedChannel::new(ChannelProfile::clean(), 1).unwrap();
    let sampler = DiagnosticSampler::new(0.95, Default::default()).unwrap();
    let err = sampler.sample(&mut channel, 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientSample);
    assert_eq!(channel.rounds_drawn(), 0);
}

#[test]
fn clean_session_produces_key_on_racer() {
    init_logging();
    let session = run(ChannelProfile::clean(), seeded(800));
    let outcome = session.into_outcome();

    assert!(outcome.key.length > 0);
    assert_eq!(outcome.key.bits.len(), outcome.key.length);
    assert!(outcome.key.security_parameter > 0.0);
    assert_eq!(outcome.summary.protocol_switches, 0);
    assert!(outcome.telemetry.iter().all(|r| r.active_protocol == Protocol::Racer));
    assert!(outcome.last_key.length > 0);
    assert!(outcome.last_key.length <= outcome.key.length);
}

#[test]
fn scripted_attack_moves_session_to_fortress() {
    init_logging();
    let channel = SimulatedChannel::new(ChannelProfile::clean(), 5).unwrap();
    let mut session = Session::new(seeded(1_200), channel).unwrap();

    while session.rounds_used() < 300 {
        assert!(matches!(session.step().unwrap(), Step::Ran(_)));
    }
    assert_eq!(session.controller().active(), Protocol::Racer);
    let before_attack = session.telemetry().len();

    session
        .channel_mut()
        .set_profile(ChannelProfile::hostile())
        .unwrap();
    session.run().unwrap();

    let summary = session.summary();
    assert_eq!(session.controller().active(), Protocol::Fortress);
    assert!(summary.protocol_switches >= 1);
    assert_eq!(summary.errors.get(&ErrorKind::RacerSafetyAbort), Some(&1));

    let after = &session.telemetry()[before_attack..];
    assert!(after.iter().any(|r| r.active_protocol == Protocol::Fortress && r.secure_bits > 0));
    assert!(
        after
            .iter()
            .any(|r| r.event == Some(ErrorKind::RacerSafetyAbort) && r.raw_bits_emitted == 0)
    );
}

#[test]
fn adaptive_adversary_is_held_off_by_fortress() {
    init_logging();
    let profile = ChannelProfile {
        leakage_probability: 0.06,
        attack: AttackMode::Adaptive,
        ..ChannelProfile::clean()
    };
    let session = run(profile, seeded(1_000));
    let summary = session.summary();

    // Under Racer the attack reads hostile; under Fortress it only reads
    // degraded, which never moves the controller back.
    assert_eq!(session.controller().active(), Protocol::Fortress);
    assert_eq!(summary.protocol_switches, 1);
    assert!(summary.state_distribution.contains_key(&ChannelState::Degraded));
    assert!(summary.total_secure_bits > 0);
}

#[test]
fn same_seeds_give_same_key() {
    let a = run(ChannelProfile::hostile(), seeded(400)).into_outcome();
    let b = run(ChannelProfile::hostile(), seeded(400)).into_outcome();
    assert_eq!(a.key, b.key);
    assert_eq!(a.telemetry, b.telemetry);
}

#[test]
fn every_error_is_tallied() {
    let session = run(ChannelProfile::hostile(), seeded(600));
    let summary = session.summary();
    let events = session.telemetry().iter().filter(|r| r.event.is_some()).count() as u64;
    let tallied: u64 = summary.errors.values().sum();
    assert_eq!(tallied, events);
}

#[test]
fn cancelled_session_reports_partial_work() {
    let channel = SimulatedChannel::new(ChannelProfile::clean(), 3).unwrap();
    let mut session = Session::new(seeded(2_000), channel).unwrap();
    for _ in 0..10 {
        session.step().unwrap();
    }
    session.run_until(&AtomicBool::new(true)).unwrap();

    let outcome = session.into_outcome();
    assert!(outcome.summary.cancelled);
    assert!(outcome.summary.total_rounds < 2_000);
    let secure: usize = outcome.telemetry.iter().map(|r| r.secure_bits).sum();
    assert_eq!(secure, outcome.key.length);
}

#[test]
fn summary_survives_json() {
    let summary = run(ChannelProfile::hostile(), seeded(400)).summary();
    let json = serde_json::to_string(&summary).unwrap();
    let back: SessionSummary = serde_json::from_str(&json).unwrap();

    assert_eq!(back.total_rounds, summary.total_rounds);
    assert_eq!(back.total_secure_bits, summary.total_secure_bits);
    assert_eq!(back.errors, summary.errors);
    assert_eq!(
        back.state_distribution.keys().collect::<Vec<_>>(),
        summary.state_distribution.keys().collect::<Vec<_>>()
    );
}

#[test]
fn config_loads_from_json() {
    let config = SessionConfig::from_json_str(
        r#"{"window_size": 60, "initial_protocol": "fortress", "seed": 7}"#,
    )
    .unwrap();
    assert_eq!(config.window_size, 60);
    assert_eq!(config.initial_protocol, Protocol::Fortress);
    assert_eq!(config.seed, Some(7));
    assert_eq!(config.fortress_block_size, SessionConfig::default().fortress_block_size);

    let err = SessionConfig::from_json_str(r#"{"window_size": 5}"#).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn recording_writes_every_row_and_the_summary() {
    let tmp = tempfile::tempdir().unwrap();
    let session = run(ChannelProfile::hostile(), seeded(300));

    let mut writer = TelemetryWriter::new(RecordConfig {
        output_dir: tmp.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();
    writer.write_all(session.telemetry()).unwrap();
    let dir = writer
        .finish(session.config(), &session.summary())
        .unwrap();

    let csv = std::fs::read_to_string(dir.join("telemetry.csv")).unwrap();
    assert_eq!(csv.lines().count(), session.telemetry().len() + 1);
    assert!(csv.contains("racer_safety_abort"));

    let meta: RecordingMeta =
        serde_json::from_str(&std::fs::read_to_string(dir.join("summary.json")).unwrap()).unwrap();
    assert_eq!(meta.rows as usize, session.telemetry().len());
    assert_eq!(meta.summary.total_secure_bits, session.key().length);
}
