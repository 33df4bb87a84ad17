//! Integer sample grids and their fingerprints.
//!
//! [`ImageGrid`] is the in-memory pixel representation the codec operates on:
//! a row-major grid of unsigned samples with an explicit bit depth. It is the
//! only image type the core ever sees; container formats are decoded into it
//! and re-encoded from it by `image_io`.

use sha2::{Digest, Sha256};

use crate::error::{LedgerMarkError, Result};

/// A two-dimensional grid of unsigned integer samples with a bit depth.
///
/// Samples are stored row-major. Values are always within `[0, 2^D - 1]`
/// where `D` is the bit depth (8 for common raster formats, 16 for DICOM).
/// The codec never mutates its input grid; it clones and returns a new one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageGrid {
    width: usize,
    height: usize,
    bit_depth: u8,
    samples: Vec<u16>,
}

impl ImageGrid {
    /// Creates a grid filled with zeros.
    pub fn new(width: usize, height: usize, bit_depth: u8) -> Result<Self> {
        Self::from_samples(width, height, bit_depth, vec![0; width * height])
    }

    /// Creates a grid from row-major samples.
    ///
    /// Fails when the sample count does not match the dimensions, the bit
    /// depth is outside `1..=16`, or any sample exceeds `2^D - 1`.
    pub fn from_samples(
        width: usize,
        height: usize,
        bit_depth: u8,
        samples: Vec<u16>,
    ) -> Result<Self> {
        if bit_depth == 0 || bit_depth > 16 {
            return Err(LedgerMarkError::ImageShapeMismatch {
                reason: format!("unsupported bit depth {bit_depth}"),
            });
        }
        if samples.len() != width * height {
            return Err(LedgerMarkError::ImageShapeMismatch {
                reason: format!(
                    "expected {} samples for {}x{}, got {}",
                    width * height,
                    width,
                    height,
                    samples.len()
                ),
            });
        }
        let max = max_value(bit_depth);
        if let Some(bad) = samples.iter().find(|&&s| s > max) {
            return Err(LedgerMarkError::ImageShapeMismatch {
                reason: format!("sample value {bad} exceeds {max} for bit depth {bit_depth}"),
            });
        }
        Ok(Self {
            width,
            height,
            bit_depth,
            samples,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    /// Largest representable sample value, `2^D - 1`.
    pub fn max_value(&self) -> u16 {
        max_value(self.bit_depth)
    }

    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    /// Sample at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics when the coordinate is outside the grid.
    pub fn get(&self, x: usize, y: usize) -> u16 {
        assert!(x < self.width && y < self.height, "pixel ({x}, {y}) out of bounds");
        self.samples[y * self.width + x]
    }

    /// Replaces the sample at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics when the coordinate is outside the grid or the value exceeds
    /// the bit depth.
    pub fn set(&mut self, x: usize, y: usize, value: u16) {
        assert!(x < self.width && y < self.height, "pixel ({x}, {y}) out of bounds");
        assert!(
            value <= self.max_value(),
            "value {value} exceeds bit depth {}",
            self.bit_depth
        );
        self.samples[y * self.width + x] = value;
    }

    /// SHA-256 fingerprint of the pixel array, hex-encoded.
    ///
    /// Samples are serialized row-major as little-endian unsigned integers of
    /// `ceil(D / 8)` bytes, so the fingerprint is independent of the container
    /// the image came from.
    pub fn fingerprint(&self) -> String {
        let mut bytes = Vec::with_capacity(self.samples.len() * self.sample_width());
        if self.bit_depth <= 8 {
            bytes.extend(self.samples.iter().map(|&s| s as u8));
        } else {
            for &s in &self.samples {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
        }
        hex::encode(Sha256::digest(&bytes))
    }

    /// Peak signal-to-noise ratio against `other`, in dB.
    ///
    /// Returns `f64::INFINITY` for identical grids.
    pub fn psnr(&self, other: &ImageGrid) -> Result<f64> {
        if self.width != other.width
            || self.height != other.height
            || self.bit_depth != other.bit_depth
        {
            return Err(LedgerMarkError::ImageShapeMismatch {
                reason: format!(
                    "{}x{}@{} vs {}x{}@{}",
                    self.width,
                    self.height,
                    self.bit_depth,
                    other.width,
                    other.height,
                    other.bit_depth
                ),
            });
        }
        let sum_sq: f64 = self
            .samples
            .iter()
            .zip(&other.samples)
            .map(|(&a, &b)| {
                let d = a as f64 - b as f64;
                d * d
            })
            .sum();
        if sum_sq == 0.0 {
            return Ok(f64::INFINITY);
        }
        let mse = sum_sq / self.samples.len() as f64;
        let peak = self.max_value() as f64;
        Ok(10.0 * (peak * peak / mse).log10())
    }

    fn sample_width(&self) -> usize {
        usize::from(self.bit_depth).div_ceil(8)
    }
}

fn max_value(bit_depth: u8) -> u16 {
    ((1u32 << bit_depth) - 1) as u16
}
