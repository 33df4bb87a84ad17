//! Prediction kernels.
//!
//! A [`Kernel`] is an odd-side square matrix of non-negative weights that sum
//! to one with a zero center. Applied to a pixel's neighborhood it produces
//! the integer prediction whose error the codec embeds into. Floor rounding
//! is load-bearing: the inverse pass recomputes the same prediction and
//! relies on bit-exact agreement with the forward pass.

use crate::error::{LedgerMarkError, Result};
use crate::grid::ImageGrid;

/// Tolerance for the convex-combination check on kernel weights.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// An odd-side square prediction kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct Kernel {
    side: usize,
    weights: Vec<f64>,
}

impl Kernel {
    /// Validates and builds a kernel from row-major weight rows.
    pub fn new(rows: Vec<Vec<f64>>) -> Result<Self> {
        let side = rows.len();
        if side < 3 || side % 2 == 0 {
            return Err(LedgerMarkError::InvalidKernel {
                reason: format!("side must be odd and at least 3, got {side}"),
            });
        }
        let mut weights = Vec::with_capacity(side * side);
        for row in &rows {
            if row.len() != side {
                return Err(LedgerMarkError::InvalidKernel {
                    reason: format!("row of length {} in a {side}x{side} kernel", row.len()),
                });
            }
            for &w in row {
                if !w.is_finite() || w < 0.0 {
                    return Err(LedgerMarkError::InvalidKernel {
                        reason: format!("weight {w} is not a non-negative finite number"),
                    });
                }
                weights.push(w);
            }
        }
        let center = weights[(side / 2) * side + side / 2];
        if center != 0.0 {
            return Err(LedgerMarkError::InvalidKernel {
                reason: format!("center weight must be 0, got {center}"),
            });
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(LedgerMarkError::InvalidKernel {
                reason: format!("weights must sum to 1, got {sum}"),
            });
        }
        Ok(Self { side, weights })
    }

    /// The default 4-neighbor average: weight 1/4 on each cardinal neighbor.
    pub fn four_neighbor() -> Self {
        Self {
            side: 3,
            weights: vec![0.0, 0.25, 0.0, 0.25, 0.0, 0.25, 0.0, 0.25, 0.0],
        }
    }

    pub fn side(&self) -> usize {
        self.side
    }

    /// Half-size `r = (K - 1) / 2`; pixels closer than `r` to an image edge
    /// cannot serve as prediction centers.
    pub fn half(&self) -> usize {
        self.side / 2
    }

    /// Weight rows, for serialization into ledger transactions.
    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.weights
            .chunks(self.side)
            .map(|row| row.to_vec())
            .collect()
    }

    /// Integer prediction at center `(x, y)`: the floor of the weighted
    /// neighborhood sum.
    ///
    /// # Panics
    ///
    /// Panics when the kernel footprint does not lie fully inside the image.
    pub fn predict(&self, image: &ImageGrid, x: usize, y: usize) -> i64 {
        let r = self.half();
        assert!(
            x >= r && y >= r && x + r < image.width() && y + r < image.height(),
            "kernel footprint at ({x}, {y}) exceeds image bounds"
        );
        let mut acc = 0.0f64;
        for ky in 0..self.side {
            for kx in 0..self.side {
                let w = self.weights[ky * self.side + kx];
                if w == 0.0 {
                    continue;
                }
                acc += w * image.get(x + kx - r, y + ky - r) as f64;
            }
        }
        acc.floor() as i64
    }
}
