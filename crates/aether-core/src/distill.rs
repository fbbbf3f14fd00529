//! Key distillation pipeline shared by both engines.
//!
//! ```text
//! RawKeyMaterial → sift → SiftedKey → reconcile → ReconciledKey → amplify → SecureKey
//! ```
//!
//! - **Sifting** keeps positions with matching bases (and, for Fortress, a
//!   passing lock check), then discloses a random subsample to estimate the
//!   error rate. Disclosed bits leave the key for good.
//! - **Reconciliation** charges `efficiency · h(e) · n` disclosed bits, where
//!   `e` is never below the share of positions it actually corrected, and
//!   refuses keys whose estimated error rate is above the abort threshold.
//! - **Privacy amplification** compresses to
//!   `n − leaked_bits_estimate − security_margin` bits with a SHA-256
//!   extractor. A non-positive target yields an empty key and an exhaustion
//!   signal, never a negative-length artifact.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::engine::RawKeyMaterial;
use crate::error::{AetherError, Result};

// ---------------------------------------------------------------------------
// Key types
// ---------------------------------------------------------------------------

/// Sifted key after subsample disclosure.
#[derive(Debug, Clone, PartialEq)]
pub struct SiftedKey {
    /// Sender's bits.
    pub bits: Vec<bool>,
    /// Receiver's bits, position-aligned with `bits`.
    pub peer_bits: Vec<bool>,
    pub estimated_error_rate: f64,
    /// Bits sacrificed for the estimate.
    pub disclosed_bits: usize,
    /// Adversary-held fraction reported by the engine.
    pub leakage_fraction: f64,
}

impl SiftedKey {
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// Error-corrected key with its running leakage account.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledKey {
    pub bits: Vec<bool>,
    /// Everything the adversary may know: reconciliation disclosure plus
    /// side-channel exposure.
    pub leaked_bits_estimate: usize,
    pub ec_disclosed_bits: usize,
    pub side_channel_bits: usize,
    /// Receiver positions fixed by reconciliation.
    pub corrected_errors: usize,
}

/// Final secret key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SecureKey {
    pub bits: Vec<bool>,
    pub length: usize,
    /// Distance from a perfectly uniform, independent key (ε). Composes additively.
    pub security_parameter: f64,
}

impl SecureKey {
    /// Zero-length key that still carries its ε.
    pub fn empty(security_parameter: f64) -> Self {
        Self {
            bits: Vec::new(),
            length: 0,
            security_parameter,
        }
    }

    pub fn from_bits(bits: Vec<bool>, security_parameter: f64) -> Self {
        Self {
            length: bits.len(),
            bits,
            security_parameter,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Append another key. The combined ε is the sum of both.
    pub fn extend(&mut self, other: &SecureKey) {
        self.bits.extend_from_slice(&other.bits);
        self.length = self.bits.len();
        self.security_parameter += other.security_parameter;
    }

    /// Bits packed MSB-first; the final byte is zero-padded.
    pub fn to_bytes(&self) -> Vec<u8> {
        pack_bits(&self.bits)
    }
}

/// Outcome of privacy amplification.
#[derive(Debug, Clone, PartialEq)]
pub enum Amplification {
    Secure(SecureKey),
    /// No usable bits this unit. `key` is empty.
    Exhausted {
        key: SecureKey,
        available: usize,
        required: usize,
    },
}

impl Amplification {
    /// Key produced by this unit, empty when exhausted.
    pub fn key(&self) -> &SecureKey {
        match self {
            Self::Secure(key) | Self::Exhausted { key, .. } => key,
        }
    }

    pub fn into_key(self) -> SecureKey {
        match self {
            Self::Secure(key) | Self::Exhausted { key, .. } => key,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// The exhaustion signal as an error value, for the session tally.
    pub fn exhaustion(&self) -> Option<AetherError> {
        match self {
            Self::Secure(_) => None,
            Self::Exhausted {
                available,
                required,
                ..
            } => Some(AetherError::KeyExhausted {
                available: *available,
                required: *required,
            }),
        }
    }
}

/// Per-unit pipeline result.
#[derive(Debug, Clone, PartialEq)]
pub struct Distilled {
    pub raw_bits: usize,
    pub sifted_bits: usize,
    pub estimated_error_rate: f64,
    pub leaked_bits: usize,
    pub amplification: Amplification,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DistillationPipeline {
    subsample_fraction: f64,
    min_check_bits: usize,
    abort_threshold: f64,
    efficiency: f64,
    security_margin: usize,
}

impl DistillationPipeline {
    /// `min_check_bits` is the floor on the disclosed subsample, so small
    /// units still get a usable error estimate.
    pub fn new(
        subsample_fraction: f64,
        min_check_bits: usize,
        abort_threshold: f64,
        efficiency: f64,
        security_margin: usize,
    ) -> Self {
        Self {
            subsample_fraction,
            min_check_bits,
            abort_threshold,
            efficiency,
            security_margin,
        }
    }

    /// Bits withheld by every amplification on top of the leakage estimate.
    pub fn security_margin(&self) -> usize {
        self.security_margin
    }

    /// Run all three stages. `hash_seed` is the public extractor seed.
    pub fn distill(
        &self,
        raw: RawKeyMaterial,
        rng: &mut StdRng,
        hash_seed: u64,
    ) -> Result<Distilled> {
        let raw_bits = raw.len();
        let sifted = self.sift(raw, rng);
        let sifted_bits = sifted.len();
        let estimated_error_rate = sifted.estimated_error_rate;
        let reconciled = self.reconcile(sifted)?;
        let leaked_bits = reconciled.leaked_bits_estimate;
        let amplification = self.amplify(reconciled, hash_seed);
        Ok(Distilled {
            raw_bits,
            sifted_bits,
            estimated_error_rate,
            leaked_bits,
            amplification,
        })
    }

    /// Keep agreeing positions, then disclose a random subsample to estimate
    /// the error rate. The output is never longer than the input.
    pub fn sift(&self, raw: RawKeyMaterial, rng: &mut StdRng) -> SiftedKey {
        let mut matched: Vec<usize> = raw
            .basis_tags
            .iter()
            .enumerate()
            .filter(|(_, tag)| tag.is_sifted())
            .map(|(i, _)| i)
            .collect();

        matched.shuffle(rng);
        let n_check = if matched.is_empty() {
            0
        } else {
            let share = (matched.len() as f64 * self.subsample_fraction).round() as usize;
            share.max(self.min_check_bits).clamp(1, matched.len())
        };
        let (check, keep) = matched.split_at_mut(n_check);

        let errors = check
            .iter()
            .filter(|&&i| raw.bits[i] != raw.peer_bits[i])
            .count();
        let estimated_error_rate = if n_check > 0 {
            errors as f64 / n_check as f64
        } else {
            0.0
        };

        keep.sort_unstable();
        let bits = keep.iter().map(|&i| raw.bits[i]).collect();
        let peer_bits = keep.iter().map(|&i| raw.peer_bits[i]).collect();

        SiftedKey {
            bits,
            peer_bits,
            estimated_error_rate,
            disclosed_bits: n_check,
            leakage_fraction: raw.leakage_fraction.clamp(0.0, 1.0),
        }
    }

    /// Correct the receiver's bits and account for every disclosed bit.
    /// The key length is unchanged.
    pub fn reconcile(&self, sifted: SiftedKey) -> Result<ReconciledKey> {
        if sifted.estimated_error_rate > self.abort_threshold {
            return Err(AetherError::ReconciliationFailure {
                error_rate: sifted.estimated_error_rate,
                threshold: self.abort_threshold,
            });
        }

        let n = sifted.len() as f64;
        let corrected_errors = sifted
            .bits
            .iter()
            .zip(&sifted.peer_bits)
            .filter(|(a, b)| a != b)
            .count();
        // Every corrected position costs disclosure, whatever the subsample said.
        let corrected_rate = if n > 0.0 {
            corrected_errors as f64 / n
        } else {
            0.0
        };
        let charged_rate = sifted.estimated_error_rate.max(corrected_rate).min(0.5);
        let ec_disclosed_bits =
            (self.efficiency * binary_entropy(charged_rate) * n).ceil() as usize;
        let side_channel_bits = (sifted.leakage_fraction * n).ceil() as usize;

        Ok(ReconciledKey {
            bits: sifted.bits,
            leaked_bits_estimate: ec_disclosed_bits + side_channel_bits,
            ec_disclosed_bits,
            side_channel_bits,
            corrected_errors,
        })
    }

    /// Compress to `len − leaked_bits_estimate − security_margin` bits.
    pub fn amplify(&self, key: ReconciledKey, hash_seed: u64) -> Amplification {
        let epsilon = 0.5f64.powf(self.security_margin as f64 / 2.0);
        let available = key.bits.len();
        let required = key.leaked_bits_estimate + self.security_margin;
        if available <= required {
            return Amplification::Exhausted {
                key: SecureKey::empty(epsilon),
                available,
                required,
            };
        }
        let target = available - required;
        let bits = extract(&key.bits, target, hash_seed);
        Amplification::Secure(SecureKey::from_bits(bits, epsilon))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Binary Shannon entropy h(p) in bits. Zero at p ∈ {0, 1}.
pub fn binary_entropy(p: f64) -> f64 {
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    -p * p.log2() - (1.0 - p) * (1.0 - p).log2()
}

/// SHA-256 counter-mode extractor: `target` output bits from `bits`.
///
/// The input (with its bit length and the public seed) is absorbed into one
/// digest; output block `i` is SHA-256(digest || i).
fn extract(bits: &[bool], target: usize, seed: u64) -> Vec<bool> {
    let mut h = Sha256::new();
    h.update(seed.to_le_bytes());
    h.update((bits.len() as u64).to_le_bytes());
    h.update(pack_bits(bits));
    let state: [u8; 32] = h.finalize().into();

    let n_bytes = target.div_ceil(8);
    let mut output = Vec::with_capacity(n_bytes + 32);
    let mut counter: u64 = 0;
    while output.len() < n_bytes {
        let mut h = Sha256::new();
        h.update(state);
        h.update(counter.to_le_bytes());
        let block: [u8; 32] = h.finalize().into();
        output.extend_from_slice(&block);
        counter += 1;
    }

    let mut out = unpack_bits(&output);
    out.truncate(target);
    out
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &bit)| byte | ((bit as u8) << (7 - i)))
        })
        .collect()
}

fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|&byte| (0..8).rev().map(move |shift| (byte >> shift) & 1 == 1))
        .collect()
}
