//! Channel model contract and the parametrized noise/leakage simulator.
//!
//! The core never looks inside a channel: it only consumes
//! [`ChannelSample`]s through the [`ChannelSource`] trait. [`SimulatedChannel`]
//! is the classical stand-in used by the session and the tests. It is not a
//! quantum simulator, just Bernoulli draws shaped like the statistics a real
//! link would report.
//!
//! Per signal:
//! - baseline noise flips the bit with probability `baseline_qber`
//! - an intercept happens with the current attack strength; a wrong-basis
//!   intercept (probability 1/2) randomizes the bit, adding ~1/4 of the
//!   intercept rate to the QBER
//! - a multi-photon pulse is split with probability `psplit_probability`;
//!   splitting leaks information without disturbing the bit

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::controller::Protocol;
use crate::error::{AetherError, Result};

/// Share of the intercept rate that shows up as bit errors (intercept-resend).
pub const INTERCEPT_DISTURBANCE: f64 = 0.25;

/// Observable statistics for one channel round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSample {
    pub qber: f64,
    pub leakage_indicator: f64,
    pub psplit_rate: f64,
    pub round_id: u64,
}

/// How the adversary reacts to the protocol in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackMode {
    /// Fixed intercept probability.
    #[default]
    Static,
    /// Doubles the intercept probability while Racer is active.
    Adaptive,
}

/// Noise and attack parameters for a [`SimulatedChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelProfile {
    pub baseline_qber: f64,
    pub leakage_probability: f64,
    pub psplit_probability: f64,
    /// Signals behind each sample. Sessions run their engines at this count.
    pub signals_per_round: usize,
    pub attack: AttackMode,
}

impl Default for ChannelProfile {
    fn default() -> Self {
        Self::clean()
    }
}

impl ChannelProfile {
    /// A quiet fiber link: low noise, no adversary.
    pub fn clean() -> Self {
        Self {
            baseline_qber: 0.01,
            leakage_probability: 0.0,
            psplit_probability: 0.002,
            signals_per_round: 256,
            attack: AttackMode::Static,
        }
    }

    /// An active intercept-resend and photon-number-splitting attack.
    pub fn hostile() -> Self {
        Self {
            baseline_qber: 0.02,
            leakage_probability: 0.3,
            psplit_probability: 0.08,
            signals_per_round: 256,
            attack: AttackMode::Static,
        }
    }

    /// Probabilities must lie in [0, 1] and the round size must be positive.
    pub fn validate(&self) -> Result<()> {
        for (name, p) in [
            ("baseline_qber", self.baseline_qber),
            ("leakage_probability", self.leakage_probability),
            ("psplit_probability", self.psplit_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(AetherError::Configuration(format!(
                    "channel {name} must lie in [0, 1], got {p}"
                )));
            }
        }
        if self.signals_per_round == 0 {
            return Err(AetherError::Configuration(
                "channel signals_per_round must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Intercept probability given the protocol the adversary observes.
    pub fn attack_strength(&self, protocol: Protocol) -> f64 {
        match (self.attack, protocol) {
            (AttackMode::Adaptive, Protocol::Racer) => (self.leakage_probability * 2.0).min(1.0),
            _ => self.leakage_probability,
        }
    }
}

/// Source of per-round channel statistics.
pub trait ChannelSource: Send {
    /// Draw the next round. Round ids increase by one per call.
    fn next_sample(&mut self) -> ChannelSample;

    /// Draw `n` consecutive rounds.
    fn next_window(&mut self, n: usize) -> Vec<ChannelSample> {
        (0..n).map(|_| self.next_sample()).collect()
    }

    /// Tell the channel which protocol is about to run. Adaptive adversaries
    /// react to it; passive channels ignore it.
    fn observe_protocol(&mut self, _protocol: Protocol) {}

    /// Number of rounds drawn so far.
    fn rounds_drawn(&self) -> u64;

    /// Signals behind each sample, when the channel knows it. Sessions adopt
    /// this count so engines exchange what the channel measured.
    fn signals_per_round(&self) -> Option<usize> {
        None
    }
}

/// Seeded classical channel simulator.
///
/// Each round is drawn from an RNG derived from `(seed, round_id)`, so the
/// sample for a given round id does not depend on draw order.
#[derive(Debug, Clone)]
pub struct SimulatedChannel {
    profile: ChannelProfile,
    seed: u64,
    next_round: u64,
    observed: Protocol,
}

impl SimulatedChannel {
    /// Validate `profile` and start at round 0.
    pub fn new(profile: ChannelProfile, seed: u64) -> Result<Self> {
        profile.validate()?;
        Ok(Self {
            profile,
            seed,
            next_round: 0,
            observed: Protocol::Racer,
        })
    }

    /// Profile currently in force.
    pub fn profile(&self) -> &ChannelProfile {
        &self.profile
    }

    /// Swap the noise/attack profile from the next round on.
    pub fn set_profile(&mut self, profile: ChannelProfile) -> Result<()> {
        profile.validate()?;
        self.profile = profile;
        Ok(())
    }

    /// Pure per-round draw.
    pub fn sample_at(&self, round_id: u64) -> ChannelSample {
        let mut rng = StdRng::seed_from_u64(mix(self.seed, round_id));
        let n = self.profile.signals_per_round;
        let intercept_p = self.profile.attack_strength(self.observed);

        let mut flips = 0usize;
        let mut intercepts = 0usize;
        let mut splits = 0usize;
        for _ in 0..n {
            let mut flipped = rng.random_bool(self.profile.baseline_qber);
            if rng.random_bool(intercept_p) {
                intercepts += 1;
                // Wrong-basis intercepts resend a random bit.
                if rng.random_bool(0.5) && rng.random_bool(0.5) {
                    flipped = !flipped;
                }
            }
            if rng.random_bool(self.profile.psplit_probability) {
                splits += 1;
            }
            if flipped {
                flips += 1;
            }
        }

        let n = n as f64;
        ChannelSample {
            qber: flips as f64 / n,
            leakage_indicator: intercepts as f64 / n,
            psplit_rate: splits as f64 / n,
            round_id,
        }
    }
}

impl ChannelSource for SimulatedChannel {
    fn next_sample(&mut self) -> ChannelSample {
        let sample = self.sample_at(self.next_round);
        self.next_round += 1;
        sample
    }

    /// Draws the window on scoped threads. Samples come back in round order.
    fn next_window(&mut self, n: usize) -> Vec<ChannelSample> {
        let first = self.next_round;
        self.next_round += n as u64;

        let workers = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
            .min(n.max(1));
        if workers <= 1 || n < 64 {
            return (first..first + n as u64).map(|r| self.sample_at(r)).collect();
        }

        let chunk = n.div_ceil(workers);
        let this = &*self;
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|w| {
                    let start = first + (w * chunk) as u64;
                    let end = (start + chunk as u64).min(first + n as u64);
                    s.spawn(move || (start..end).map(|r| this.sample_at(r)).collect::<Vec<_>>())
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| match h.join() {
                    Ok(samples) => samples,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    fn observe_protocol(&mut self, protocol: Protocol) {
        self.observed = protocol;
    }

    fn rounds_drawn(&self) -> u64 {
        self.next_round
    }

    fn signals_per_round(&self) -> Option<usize> {
        Some(self.profile.signals_per_round)
    }
}

/// SplitMix64 over the seed and round id.
fn mix(seed: u64, round_id: u64) -> u64 {
    let mut z = seed ^ round_id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
