use std::path::PathBuf;

use thiserror::Error;

/// The central error type for all operations in ledgermark.
///
/// Batch drivers report failures with a machine-readable kind (see
/// [`LedgerMarkError::kind`]) next to the offending path, so every variant
/// that concerns a file carries it.
#[derive(Error, Debug)]
pub enum LedgerMarkError {
    #[error("invalid configuration: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("failed to read image {path}: {reason}")]
    ImageRead { path: PathBuf, reason: String },

    #[error("failed to write image {path}: {reason}")]
    ImageWrite { path: PathBuf, reason: String },

    #[error("invalid kernel: {reason}")]
    InvalidKernel { reason: String },

    #[error("insufficient capacity: {eligible} eligible blocks, none accepted a watermark bit")]
    InsufficientCapacity { eligible: usize },

    #[error("watermark mismatch: {reason}")]
    WatermarkMismatch { reason: String },

    #[error("overflow map unrecoverable: {reason}")]
    OverflowMapUnrecoverable { reason: String },

    #[error("image shape mismatch: {reason}")]
    ImageShapeMismatch { reason: String },

    #[error("ledger corrupt at {path}: {reason}")]
    LedgerCorrupt { path: PathBuf, reason: String },

    #[error("no ledger block found for image hash {hash}")]
    LedgerBlockNotFound { hash: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerMarkError {
    /// Stable machine-readable error kind, recorded in batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationInvalid { .. } => "configuration_invalid",
            Self::ImageRead { .. } => "image_read_failed",
            Self::ImageWrite { .. } => "image_write_failed",
            Self::InvalidKernel { .. } => "invalid_kernel",
            Self::InsufficientCapacity { .. } => "insufficient_capacity",
            Self::WatermarkMismatch { .. } => "watermark_mismatch",
            Self::OverflowMapUnrecoverable { .. } => "overflow_map_unrecoverable",
            Self::ImageShapeMismatch { .. } => "image_shape_mismatch",
            Self::LedgerCorrupt { .. } => "ledger_corrupt",
            Self::LedgerBlockNotFound { .. } => "ledger_block_not_found",
            Self::Io(_) => "io_failure",
        }
    }
}

/// A centralized result type for the library.
pub type Result<T> = std::result::Result<T, LedgerMarkError>;
