//! Basic adaptive session.
//!
//! Runs a seeded session over a clean simulated link and prints the key
//! and protocol statistics.
//!
//! Run: `cargo run --example basic`

use aether_core::{ChannelProfile, Session, SessionConfig, SimulatedChannel};

fn main() -> aether_core::Result<()> {
    let config = SessionConfig {
        seed: Some(1),
        ..Default::default()
    };
    let channel = SimulatedChannel::new(ChannelProfile::clean(), 1)?;
    let mut session = Session::new(config, channel)?;
    session.run()?;

    let outcome = session.into_outcome();
    let summary = &outcome.summary;
    println!(
        "{} rounds ({} diagnostic), {} secure bits, eps {:.2e}",
        summary.total_rounds,
        summary.diagnostic_rounds,
        outcome.key.length,
        outcome.key.security_parameter
    );
    for (protocol, share) in &summary.protocol_distribution {
        println!("  {protocol:<9} {:>5.1}%", share * 100.0);
    }

    print!("First key bytes (hex): ");
    for b in outcome.key.to_bytes().iter().take(16) {
        print!("{b:02x}");
    }
    println!();
    Ok(())
}
