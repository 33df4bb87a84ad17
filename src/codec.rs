//! The reversible watermarking codec.
//!
//! Embedding perturbs prediction errors at key-selected lattice cells using
//! histogram shifting with a unit shift: errors equal to the threshold `t_hi`
//! absorb one watermark bit (`e' = e + b`), larger errors are shifted up by
//! one to vacate the insertion bin, and everything else is left untouched.
//! Pixels whose original value sits in the near-saturation band
//! `[2^D - 2, 2^D - 1]` would wrap or confuse the inverse, so they are
//! recorded in the overflow map and skipped.
//!
//! The inverse pass recomputes the same predictions (kernel footprints of
//! modified centers are disjoint for stride >= kernel side, and only centers
//! are ever modified), reads bits back out of the insertion bins, and undoes
//! the shift, restoring the original image byte for byte.

use std::collections::HashSet;

use crate::error::{LedgerMarkError, Result};
use crate::grid::ImageGrid;
use crate::kernel::Kernel;
use crate::utils::mask::selection_mask;
use crate::utils::watermark::{self, SecretKey, Watermark, WATERMARK_BITS};

/// Per-operation codec parameters. No process-wide state: every embed,
/// extract, and remove call receives its own record.
#[derive(Clone, Debug)]
pub struct CodecParams {
    pub kernel: Kernel,
    pub stride: usize,
    pub t_hi: u16,
    pub bit_depth: u8,
}

impl CodecParams {
    /// Default parameters for a bit depth: 4-neighbor kernel, stride 3,
    /// threshold 0.
    pub fn with_defaults(bit_depth: u8) -> Self {
        Self {
            kernel: Kernel::four_neighbor(),
            stride: 3,
            t_hi: 0,
            bit_depth,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stride == 0 {
            return Err(LedgerMarkError::ConfigurationInvalid {
                reason: "stride must be positive".into(),
            });
        }
        if self.stride < self.kernel.side() {
            // Overlapping footprints would let one modified center shift
            // another center's prediction, breaking exact reversal.
            return Err(LedgerMarkError::ConfigurationInvalid {
                reason: format!(
                    "stride {} is smaller than the kernel side {}",
                    self.stride,
                    self.kernel.side()
                ),
            });
        }
        if self.bit_depth == 0 || self.bit_depth > 16 {
            return Err(LedgerMarkError::ConfigurationInvalid {
                reason: format!("unsupported bit depth {}", self.bit_depth),
            });
        }
        if u32::from(self.t_hi) + 1 >= (1u32 << self.bit_depth) {
            return Err(LedgerMarkError::ConfigurationInvalid {
                reason: format!(
                    "threshold {} leaves no embeddable range at bit depth {}",
                    self.t_hi, self.bit_depth
                ),
            });
        }
        Ok(())
    }

    fn max_value(&self) -> u16 {
        ((1u32 << self.bit_depth) - 1) as u16
    }
}

/// Ordered, duplicate-free pixel coordinates excluded from modification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverflowMap(Vec<(usize, usize)>);

impl OverflowMap {
    /// Builds a map from recorded coordinates, rejecting duplicates.
    pub fn from_coords(coords: Vec<(usize, usize)>) -> Result<Self> {
        let unique: HashSet<_> = coords.iter().copied().collect();
        if unique.len() != coords.len() {
            return Err(LedgerMarkError::OverflowMapUnrecoverable {
                reason: "recorded overflow map contains duplicate coordinates".into(),
            });
        }
        Ok(Self(coords))
    }

    pub fn coords(&self) -> &[(usize, usize)] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn as_set(&self) -> HashSet<(usize, usize)> {
        self.0.iter().copied().collect()
    }
}

/// Statistics from one embedding.
#[derive(Clone, Copy, Debug)]
pub struct EmbedStats {
    /// Lattice cells selected by the mask.
    pub eligible_blocks: usize,
    /// Cells that absorbed a watermark bit.
    pub modified_blocks: usize,
    /// Distinct watermark bits placed, `min(256, modified_blocks)`.
    pub bits_embedded: usize,
    /// PSNR of the watermarked image against the original, in dB.
    pub psnr: f64,
}

/// Result of a successful embedding.
#[derive(Clone, Debug)]
pub struct EmbedOutcome {
    pub image: ImageGrid,
    pub watermark: Watermark,
    pub overflow: OverflowMap,
    pub stats: EmbedStats,
}

/// Result of an extraction.
#[derive(Clone, Debug)]
pub struct Extraction {
    /// Recovered bit stream in lattice order.
    pub bits: Vec<u8>,
    /// Majority-vote fold of the bit stream into 256 positions.
    pub watermark: Watermark,
    /// Restored image, present when the overflow map was known.
    pub restored: Option<ImageGrid>,
}

/// The disjoint block lattice defined by the kernel half-size and stride.
struct Lattice {
    nx: usize,
    ny: usize,
    r: usize,
    stride: usize,
}

impl Lattice {
    fn new(image: &ImageGrid, kernel: &Kernel, stride: usize) -> Self {
        let r = kernel.half();
        let span = 2 * r;
        let nx = if image.width() > span {
            (image.width() - 1 - span) / stride + 1
        } else {
            0
        };
        let ny = if image.height() > span {
            (image.height() - 1 - span) / stride + 1
        } else {
            0
        };
        Self { nx, ny, r, stride }
    }

    fn cells(&self) -> usize {
        self.nx * self.ny
    }

    fn center(&self, i: usize, j: usize) -> (usize, usize) {
        (self.r + i * self.stride, self.r + j * self.stride)
    }
}

/// Embeds the watermark derived from `message` and `key` into `image`.
///
/// Returns the watermarked image together with the watermark, the overflow
/// map, and embedding statistics. Fails with `InsufficientCapacity` when not
/// a single lattice cell could absorb a bit.
pub fn embed(
    image: &ImageGrid,
    key: &SecretKey,
    message: &str,
    params: &CodecParams,
) -> Result<EmbedOutcome> {
    let watermark = Watermark::derive(message, key);
    let (out, overflow, eligible_blocks, modified_blocks) =
        embed_pass(image, key, &watermark, params)?;
    if modified_blocks == 0 {
        return Err(LedgerMarkError::InsufficientCapacity {
            eligible: eligible_blocks,
        });
    }
    let psnr = image.psnr(&out)?;
    Ok(EmbedOutcome {
        stats: EmbedStats {
            eligible_blocks,
            modified_blocks,
            bits_embedded: modified_blocks.min(WATERMARK_BITS),
            psnr,
        },
        image: out,
        watermark,
        overflow,
    })
}

/// Extracts the embedded bit stream without the original image.
///
/// With a known overflow map the extraction is exact and the restored image
/// is returned; without one, near-saturated pixels are skipped heuristically
/// and only the (best-effort) bit stream is produced.
pub fn extract(
    image: &ImageGrid,
    key: &SecretKey,
    params: &CodecParams,
    overflow: Option<&OverflowMap>,
) -> Result<Extraction> {
    match overflow {
        Some(map) => {
            let (restored, bits) = inverse_pass(image, key, params, &map.as_set(), false)?;
            Ok(Extraction {
                watermark: watermark::fold_majority(&bits),
                bits,
                restored: Some(restored),
            })
        }
        None => {
            let (_, bits) = inverse_pass(image, key, params, &HashSet::new(), true)?;
            Ok(Extraction {
                watermark: watermark::fold_majority(&bits),
                bits,
                restored: None,
            })
        }
    }
}

/// Removes the watermark, restoring the original image exactly.
///
/// Every recovered bit is checked against `expected` (cycled); a mismatch
/// aborts with `WatermarkMismatch` before any result is produced. The caller
/// is responsible for comparing the restored image's fingerprint against the
/// recorded original hash.
pub fn remove(
    image: &ImageGrid,
    key: &SecretKey,
    params: &CodecParams,
    overflow: &OverflowMap,
    expected: &Watermark,
) -> Result<(ImageGrid, Vec<u8>)> {
    let (restored, bits) = inverse_pass(image, key, params, &overflow.as_set(), false)?;
    if !watermark::matches_cycled(&bits, expected) {
        return Err(LedgerMarkError::WatermarkMismatch {
            reason: format!(
                "recovered bit stream disagrees with the recorded watermark (BER {:.4})",
                watermark::ber(&bits, expected)
            ),
        });
    }
    Ok((restored, bits))
}

fn check_shape(image: &ImageGrid, params: &CodecParams) -> Result<()> {
    params.validate()?;
    if image.bit_depth() != params.bit_depth {
        return Err(LedgerMarkError::ImageShapeMismatch {
            reason: format!(
                "image bit depth {} does not match requested depth {}",
                image.bit_depth(),
                params.bit_depth
            ),
        });
    }
    Ok(())
}

fn embed_pass(
    image: &ImageGrid,
    key: &SecretKey,
    watermark: &Watermark,
    params: &CodecParams,
) -> Result<(ImageGrid, OverflowMap, usize, usize)> {
    check_shape(image, params)?;
    let lattice = Lattice::new(image, &params.kernel, params.stride);
    let mask = selection_mask(key, lattice.cells());
    let eligible_blocks = mask.iter().filter(|&&m| m).count();

    let max = params.max_value() as i64;
    let band_floor = max - 1; // [2^D - 2, 2^D - 1]
    let t = params.t_hi as i64;

    let mut out = image.clone();
    let mut overflow = Vec::new();
    let mut bit_cursor = 0usize;
    let mut modified_blocks = 0usize;

    for j in 0..lattice.ny {
        for i in 0..lattice.nx {
            if !mask[j * lattice.nx + i] {
                continue;
            }
            let (x, y) = lattice.center(i, j);
            let value = image.get(x, y) as i64;
            let prediction = params.kernel.predict(image, x, y);
            let error = value - prediction;
            if error < 0 {
                continue;
            }
            // The band check also covers arithmetic overflow: with a unit
            // shift the new value is at most value + 1, which stays within
            // range exactly when the original is below the band.
            if value >= band_floor {
                overflow.push((x, y));
                continue;
            }
            if error > t {
                out.set(x, y, (value + 1) as u16);
            } else if error == t {
                let bit = watermark.bit(bit_cursor) as i64;
                bit_cursor += 1;
                modified_blocks += 1;
                out.set(x, y, (prediction + t + bit) as u16);
            }
            // 0 <= error < t_hi: below the insertion bin, left untouched.
        }
    }

    Ok((
        out,
        OverflowMap(overflow),
        eligible_blocks,
        modified_blocks,
    ))
}

fn inverse_pass(
    image: &ImageGrid,
    key: &SecretKey,
    params: &CodecParams,
    skip: &HashSet<(usize, usize)>,
    skip_saturated: bool,
) -> Result<(ImageGrid, Vec<u8>)> {
    check_shape(image, params)?;
    let lattice = Lattice::new(image, &params.kernel, params.stride);
    let mask = selection_mask(key, lattice.cells());

    let max = params.max_value() as i64;
    let t = params.t_hi as i64;

    let mut restored = image.clone();
    let mut bits = Vec::new();

    for j in 0..lattice.ny {
        for i in 0..lattice.nx {
            if !mask[j * lattice.nx + i] {
                continue;
            }
            let (x, y) = lattice.center(i, j);
            if skip.contains(&(x, y)) {
                continue;
            }
            let value = image.get(x, y) as i64;
            if skip_saturated && value == max {
                // Without an overflow map a saturated center can only be an
                // untouched near-overflow pixel.
                continue;
            }
            // Neighbors are never modified (disjoint footprints), so the
            // prediction equals the one computed at embedding time.
            let prediction = params.kernel.predict(image, x, y);
            let error = value - prediction;
            if error < t {
                continue;
            }
            if error == t || error == t + 1 {
                bits.push((error - t) as u8);
                restored.set(x, y, (prediction + t) as u16);
            } else {
                restored.set(x, y, (value - 1) as u16);
            }
        }
    }

    Ok((restored, bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smallest key byte whose selection mask picks at least one of `cells`.
    fn key_selecting(cells: usize) -> SecretKey {
        (0..=255u8)
            .map(|b| {
                let mut bytes = [0u8; 32];
                bytes[31] = b;
                SecretKey::from_bytes(bytes)
            })
            .find(|k| selection_mask(k, cells).iter().any(|&m| m))
            .expect("some key selects at least one cell")
    }

    fn fixed_key() -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        SecretKey::from_bytes(bytes)
    }

    fn flat_image(side: usize, value: u16) -> ImageGrid {
        ImageGrid::from_samples(side, side, 8, vec![value; side * side]).unwrap()
    }

    fn ramp_image(side: usize, step: u16) -> ImageGrid {
        let samples: Vec<u16> = (0..side)
            .flat_map(|y| (0..side).map(move |x| step * (x + y) as u16))
            .collect();
        ImageGrid::from_samples(side, side, 8, samples).unwrap()
    }

    #[test]
    fn flat_image_round_trip() {
        // 8x8 all-100 grid: every interior prediction is 100, every eligible
        // error is 0, so a mask-1 block stays at 100 for bit 0 and moves to
        // 101 for bit 1.
        let image = flat_image(8, 100);
        let params = CodecParams::with_defaults(8);
        let key = key_selecting(4);

        let outcome = embed(&image, &key, "A", &params).unwrap();
        assert!(outcome.overflow.is_empty());
        assert_eq!(
            outcome.stats.bits_embedded,
            outcome.stats.modified_blocks.min(WATERMARK_BITS)
        );
        for (i, (&a, &b)) in image
            .samples()
            .iter()
            .zip(outcome.image.samples())
            .enumerate()
        {
            assert!(b == 100 || b == 101, "sample {i} became {b}");
            assert!(b >= a);
        }

        let (restored, bits) = remove(
            &outcome.image,
            &key,
            &params,
            &outcome.overflow,
            &outcome.watermark,
        )
        .unwrap();
        assert_eq!(restored, image);
        assert_eq!(bits.len(), outcome.stats.modified_blocks);
    }

    #[test]
    fn ramp_round_trip_with_high_psnr() {
        let image = ramp_image(8, 10);
        let params = CodecParams::with_defaults(8);
        let key = key_selecting(4);

        let outcome = embed(&image, &key, "ramp", &params).unwrap();
        assert!(outcome.stats.psnr >= 48.0);

        let (restored, _) = remove(
            &outcome.image,
            &key,
            &params,
            &outcome.overflow,
            &outcome.watermark,
        )
        .unwrap();
        assert_eq!(restored.fingerprint(), image.fingerprint());
    }

    #[test]
    fn saturated_image_has_no_capacity() {
        // All-255 pixels sit in the near-saturation band, so every selected
        // cell lands in the overflow map and no bit is embedded.
        let image = flat_image(8, 255);
        let params = CodecParams::with_defaults(8);
        let key = key_selecting(4);

        let watermark = Watermark::derive("A", &key);
        let (out, overflow, eligible, modified) =
            embed_pass(&image, &key, &watermark, &params).unwrap();
        assert_eq!(out, image);
        assert_eq!(modified, 0);
        assert_eq!(overflow.len(), eligible);

        // The selected lattice origins are exactly the overflow entries.
        let mask = selection_mask(&key, 4);
        let selected: Vec<(usize, usize)> = (0..2)
            .flat_map(|j| (0..2).map(move |i| (1 + 3 * i, 1 + 3 * j)))
            .zip(mask.iter())
            .filter(|(_, &m)| m)
            .map(|(c, _)| c)
            .collect();
        assert_eq!(overflow.coords(), &selected[..]);

        assert!(matches!(
            embed(&image, &key, "A", &params),
            Err(LedgerMarkError::InsufficientCapacity { .. })
        ));
    }

    #[test]
    fn embedding_is_deterministic() {
        let image = ramp_image(16, 5);
        let params = CodecParams::with_defaults(8);
        let key = fixed_key();

        let a = embed(&image, &key, "same", &params).unwrap();
        let b = embed(&image, &key, "same", &params).unwrap();
        assert_eq!(a.image, b.image);
        assert_eq!(a.watermark, b.watermark);
        assert_eq!(a.overflow, b.overflow);
    }

    #[test]
    fn only_selected_lattice_origins_change() {
        let image = ramp_image(16, 5);
        let params = CodecParams::with_defaults(8);
        let key = fixed_key();

        let outcome = embed(&image, &key, "noninterference", &params).unwrap();
        let mask = selection_mask(&key, 25);
        let selected: HashSet<(usize, usize)> = (0..5usize)
            .flat_map(|j| (0..5usize).map(move |i| (j * 5 + i, (1 + 3 * i, 1 + 3 * j))))
            .filter(|(cell, _)| mask[*cell])
            .map(|(_, c)| c)
            .collect();

        for y in 0..16 {
            for x in 0..16 {
                if image.get(x, y) != outcome.image.get(x, y) {
                    assert!(
                        selected.contains(&(x, y)),
                        "non-selected pixel ({x}, {y}) changed"
                    );
                }
            }
        }
    }

    #[test]
    fn extraction_without_original_matches_watermark() {
        let image = ramp_image(16, 5);
        let params = CodecParams::with_defaults(8);
        let key = fixed_key();

        let outcome = embed(&image, &key, "extract me", &params).unwrap();
        let extraction = extract(&outcome.image, &key, &params, Some(&outcome.overflow)).unwrap();
        assert_eq!(watermark::ber(&extraction.bits, &outcome.watermark), 0.0);
        assert_eq!(extraction.restored.unwrap(), image);
    }

    #[test]
    fn tampered_non_selected_pixel_keeps_bits_but_breaks_restoration() {
        let image = ramp_image(16, 5);
        let params = CodecParams::with_defaults(8);
        let key = fixed_key();

        let outcome = embed(&image, &key, "tamper", &params).unwrap();
        let mut tampered = outcome.image.clone();
        // (0, 0) is never a lattice origin and carries zero weight in the
        // 4-neighbor kernel, so predictions are unaffected.
        tampered.set(0, 0, tampered.get(0, 0) ^ 1);

        let extraction = extract(&tampered, &key, &params, Some(&outcome.overflow)).unwrap();
        assert_eq!(watermark::ber(&extraction.bits, &outcome.watermark), 0.0);

        let (restored, _) = remove(
            &tampered,
            &key,
            &params,
            &outcome.overflow,
            &outcome.watermark,
        )
        .unwrap();
        assert_ne!(restored.fingerprint(), image.fingerprint());
    }

    #[test]
    fn wrong_watermark_is_rejected() {
        let image = ramp_image(16, 5);
        let params = CodecParams::with_defaults(8);
        let key = fixed_key();

        let outcome = embed(&image, &key, "right", &params).unwrap();
        let wrong = Watermark::derive("wrong", &key);
        // Flipping at least one expected bit is overwhelmingly likely; skip
        // the astronomically unlikely collision on the embedded prefix.
        if watermark::matches_cycled(
            &(0..outcome.stats.modified_blocks)
                .map(|i| outcome.watermark.bit(i))
                .collect::<Vec<_>>(),
            &wrong,
        ) {
            return;
        }
        assert!(matches!(
            remove(&outcome.image, &key, &params, &outcome.overflow, &wrong),
            Err(LedgerMarkError::WatermarkMismatch { .. })
        ));
    }

    #[test]
    fn sixteen_bit_round_trip() {
        let samples: Vec<u16> = (0..16 * 16).map(|i| (i * 180) as u16).collect();
        let image = ImageGrid::from_samples(16, 16, 16, samples).unwrap();
        let params = CodecParams::with_defaults(16);
        let key = fixed_key();

        let outcome = embed(&image, &key, "deep", &params).unwrap();
        let (restored, _) = remove(
            &outcome.image,
            &key,
            &params,
            &outcome.overflow,
            &outcome.watermark,
        )
        .unwrap();
        assert_eq!(restored, image);
    }

    #[test]
    fn overlapping_stride_is_rejected() {
        let params = CodecParams {
            stride: 2,
            ..CodecParams::with_defaults(8)
        };
        assert!(matches!(
            params.validate(),
            Err(LedgerMarkError::ConfigurationInvalid { .. })
        ));
    }

    #[test]
    fn overflow_map_rejects_duplicates() {
        assert!(matches!(
            OverflowMap::from_coords(vec![(1, 1), (1, 1)]),
            Err(LedgerMarkError::OverflowMapUnrecoverable { .. })
        ));
    }

    #[test]
    fn depth_mismatch_is_rejected() {
        let image = flat_image(8, 100);
        let params = CodecParams::with_defaults(16);
        assert!(matches!(
            embed(&image, &fixed_key(), "depth", &params),
            Err(LedgerMarkError::ImageShapeMismatch { .. })
        ));
    }
}
