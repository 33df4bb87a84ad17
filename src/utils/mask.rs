//! Keyed selection masks over the block lattice.
//!
//! The mask decides which lattice cells may carry watermark data. It is
//! derived from the secret key alone, so embedder and extractor agree on the
//! selection without exchanging anything beyond the key, and changing the
//! message never moves the selection.
//!
//! The generator is a ChaCha8 keystream (a counter-mode stream cipher) seeded
//! with HMAC-SHA256 of a fixed domain tag under the secret key; lattice cell
//! `i` takes bit `i % 8` of keystream byte `i / 8`. Working at the byte level
//! keeps the sequence bit-identical across platforms.

use hmac::{Hmac, Mac};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::Sha256;

use crate::utils::watermark::SecretKey;

/// Identifier of the mask derivation scheme, recorded in ledger entries.
pub const MASK_SCHEME: &str = "chacha8-hmac-v1";

const SELECTION_TAG: &[u8] = b"ledgermark/selection-mask/v1";

fn keyed_seed(key: &SecretKey, tag: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(tag);
    mac.finalize().into_bytes().into()
}

/// One selection bit per lattice cell, row-major.
pub fn selection_mask(key: &SecretKey, cells: usize) -> Vec<bool> {
    let mut rng = ChaCha8Rng::from_seed(keyed_seed(key, SELECTION_TAG));
    let mut stream = vec![0u8; cells.div_ceil(8)];
    rng.fill_bytes(&mut stream);
    (0..cells)
        .map(|i| (stream[i / 8] >> (i % 8)) & 1 == 1)
        .collect()
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
    fn mask_is_deterministic_for_a_key() {
        let key = test_key(1);
        assert_eq!(selection_mask(&key, 1000), selection_mask(&key, 1000));
    }

    #[test]
    fn mask_changes_with_the_key() {
        assert_ne!(
            selection_mask(&test_key(1), 1000),
            selection_mask(&test_key(2), 1000)
        );
    }

    #[test]
    fn mask_prefix_is_stable_across_lengths() {
        // Growing the lattice must not reshuffle earlier cells.
        let key = test_key(3);
        let short = selection_mask(&key, 64);
        let long = selection_mask(&key, 256);
        assert_eq!(short[..], long[..64]);
    }

    #[test]
    fn mask_is_roughly_balanced() {
        let ones = selection_mask(&test_key(4), 10_000)
            .iter()
            .filter(|&&b| b)
            .count();
        assert!((4_000..6_000).contains(&ones), "got {ones} ones");
    }
}
