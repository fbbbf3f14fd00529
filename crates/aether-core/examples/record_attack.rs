//! Record a session that comes under attack halfway through.
//!
//! The link starts clean, turns hostile after 1000 rounds, and the session
//! is recorded to `sessions/<unix-seconds>-<uuid>/`.
//!
//! Run: `RUST_LOG=info cargo run --example record_attack`

use aether_core::{
    ChannelProfile, RecordConfig, Session, SessionConfig, SimulatedChannel, Step,
    TelemetryWriter,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = SessionConfig {
        session_rounds: 2_000,
        seed: Some(42),
        ..Default::default()
    };
    let channel = SimulatedChannel::new(ChannelProfile::clean(), 42)?;
    let mut session = Session::new(config, channel)?;
    let mut writer = TelemetryWriter::new(RecordConfig::default())?;

    let mut attacked = false;
    while let Step::Ran(record) = session.step()? {
        writer.write_record(&record)?;
        if !attacked && session.rounds_used() >= 1_000 {
            session.channel_mut().set_profile(ChannelProfile::hostile())?;
            attacked = true;
        }
    }

    let summary = session.summary();
    let dir = writer.finish(session.config(), &summary)?;
    println!(
        "{} secure bits, {} switches, errors {:?}",
        summary.total_secure_bits, summary.protocol_switches, summary.errors
    );
    println!("Recorded to {}", dir.display());
    Ok(())
}
