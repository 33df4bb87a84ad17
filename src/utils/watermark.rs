//! Watermark derivation and bit-stream comparison.
//!
//! The watermark is the first 256 bits of SHA-256 over the UTF-8 message
//! concatenated with the hex rendering of the secret key. Bits are indexed
//! MSB-first so that bit order matches the 64-character hex string recorded
//! in the ledger.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{LedgerMarkError, Result};

/// Number of bits in a watermark.
pub const WATERMARK_BITS: usize = 256;

/// A 256-bit secret key, generated fresh for every embedding.
///
/// The key is stored in the ledger as a hex string and never embedded in
/// pixel data.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let raw = hex::decode(hex_key).map_err(|e| LedgerMarkError::ConfigurationInvalid {
            reason: format!("secret key is not valid hex: {e}"),
        })?;
        let bytes: [u8; 32] =
            raw.try_into()
                .map_err(|raw: Vec<u8>| LedgerMarkError::ConfigurationInvalid {
                    reason: format!("secret key must be 32 bytes, got {}", raw.len()),
                })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keep key material out of log output.
        write!(f, "SecretKey(..)")
    }
}

/// A 256-bit watermark.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Watermark([u8; 32]);

impl Watermark {
    /// Derives the watermark as SHA-256(message || hex(secret_key)).
    pub fn derive(message: &str, key: &SecretKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(message.as_bytes());
        hasher.update(key.to_hex().as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn from_hex(hex_watermark: &str) -> Result<Self> {
        let raw = hex::decode(hex_watermark).map_err(|e| LedgerMarkError::WatermarkMismatch {
            reason: format!("recorded watermark is not valid hex: {e}"),
        })?;
        let bytes: [u8; 32] =
            raw.try_into()
                .map_err(|raw: Vec<u8>| LedgerMarkError::WatermarkMismatch {
                    reason: format!("recorded watermark must be 32 bytes, got {}", raw.len()),
                })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Bit at `index`, cycling past [`WATERMARK_BITS`].
    pub fn bit(&self, index: usize) -> u8 {
        let i = index % WATERMARK_BITS;
        (self.0[i / 8] >> (7 - (i % 8))) & 1
    }
}

/// Bit error rate of a recovered stream against the expected watermark,
/// comparing bit `i` with expected bit `i mod 256`.
///
/// An empty stream carries no information and reports 0.5.
pub fn ber(recovered: &[u8], expected: &Watermark) -> f64 {
    if recovered.is_empty() {
        return 0.5;
    }
    let mismatches = recovered
        .iter()
        .enumerate()
        .filter(|(i, &bit)| bit != expected.bit(*i))
        .count();
    mismatches as f64 / recovered.len() as f64
}

/// Whether every recovered bit matches the expected watermark cycled over it.
pub fn matches_cycled(recovered: &[u8], expected: &Watermark) -> bool {
    recovered
        .iter()
        .enumerate()
        .all(|(i, &bit)| bit == expected.bit(i))
}

/// Folds a recovered bit stream into a 256-bit watermark by majority vote per
/// cycle position. Positions without votes, and ties, resolve to 0; for
/// streams shorter than 256 bits the result is a partial reconstruction.
pub fn fold_majority(recovered: &[u8]) -> Watermark {
    let mut ones = [0u32; WATERMARK_BITS];
    let mut totals = [0u32; WATERMARK_BITS];
    for (i, &bit) in recovered.iter().enumerate() {
        let position = i % WATERMARK_BITS;
        totals[position] += 1;
        ones[position] += u32::from(bit);
    }
    let mut bytes = [0u8; 32];
    for position in 0..WATERMARK_BITS {
        if ones[position] * 2 > totals[position] {
            bytes[position / 8] |= 1 << (7 - (position % 8));
        }
    }
    Watermark(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(last: u8) -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[31] = last;
        SecretKey::from_bytes(bytes)
    }

    #[test]
    fn derivation_is_deterministic() {
        let key = test_key(1);
        let a = Watermark::derive("A", &key);
        let b = Watermark::derive("A", &key);
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn derivation_depends_on_message_and_key() {
        let key = test_key(1);
        assert_ne!(Watermark::derive("A", &key), Watermark::derive("B", &key));
        assert_ne!(
            Watermark::derive("A", &key),
            Watermark::derive("A", &test_key(2))
        );
    }

    #[test]
    fn hex_round_trip() {
        let watermark = Watermark::derive("round trip", &test_key(7));
        let recovered = Watermark::from_hex(&watermark.to_hex()).unwrap();
        assert_eq!(watermark, recovered);
    }

    #[test]
    fn bit_indexing_is_msb_first_and_cycles() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1000_0001;
        let watermark = Watermark(bytes);
        assert_eq!(watermark.bit(0), 1);
        assert_eq!(watermark.bit(1), 0);
        assert_eq!(watermark.bit(7), 1);
        assert_eq!(watermark.bit(WATERMARK_BITS), 1);
    }

    #[test]
    fn ber_counts_cycled_mismatches() {
        let watermark = Watermark::derive("ber", &test_key(3));
        let clean: Vec<u8> = (0..10).map(|i| watermark.bit(i)).collect();
        assert_eq!(ber(&clean, &watermark), 0.0);
        assert!(matches_cycled(&clean, &watermark));

        let mut noisy = clean;
        noisy[4] ^= 1;
        assert!((ber(&noisy, &watermark) - 0.1).abs() < 1e-12);
        assert!(!matches_cycled(&noisy, &watermark));
    }

    #[test]
    fn empty_stream_reports_half_ber() {
        let watermark = Watermark::derive("empty", &test_key(4));
        assert_eq!(ber(&[], &watermark), 0.5);
    }

    #[test]
    fn majority_fold_reconstructs_full_cycles() {
        let watermark = Watermark::derive("fold", &test_key(5));
        // Three full cycles with one corrupted bit per cycle position at most.
        let mut bits: Vec<u8> = (0..3 * WATERMARK_BITS).map(|i| watermark.bit(i)).collect();
        bits[10] ^= 1;
        assert_eq!(fold_majority(&bits), watermark);
    }

    #[test]
    fn majority_fold_leaves_unvoted_positions_zero() {
        let bits = [1u8, 1];
        let folded = fold_majority(&bits);
        assert_eq!(folded.bit(0), 1);
        assert_eq!(folded.bit(1), 1);
        assert_eq!(folded.bit(2), 0);
    }
}
