//! Batch configuration records.
//!
//! Configurations are plain JSON files handed to the CLI. They become
//! explicit per-operation values; nothing in the library reads global state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::CodecParams;
use crate::error::{LedgerMarkError, Result};
use crate::kernel::Kernel;

fn default_stride() -> usize {
    3
}

fn default_data_type() -> String {
    "png".to_string()
}

/// Configuration accepted by the batch drivers.
///
/// `data_path` is a directory for the batch commands and a single file for
/// `extract`. Omitted fields take the documented defaults: 4-neighbor
/// kernel, stride 3, threshold 0, and a bit depth of 16 for DICOM input or
/// 8 otherwise.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    pub data_path: PathBuf,
    #[serde(default)]
    pub save_path: Option<PathBuf>,
    #[serde(default)]
    pub ext_wat_path: Option<PathBuf>,
    pub blockchain_path: PathBuf,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub kernel: Option<Vec<Vec<f64>>>,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub t_hi: u16,
    #[serde(default)]
    pub bit_depth: Option<u8>,
    #[serde(default = "default_data_type")]
    pub data_type: String,
}

impl BatchConfig {
    /// Loads a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| LedgerMarkError::ConfigurationInvalid {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&raw).map_err(|e| LedgerMarkError::ConfigurationInvalid {
            reason: format!("cannot parse {}: {e}", path.display()),
        })
    }

    /// Effective bit depth: explicit value, or 16 for DICOM and 8 otherwise.
    pub fn effective_bit_depth(&self) -> u8 {
        self.bit_depth
            .unwrap_or(if self.data_type == "dcm" { 16 } else { 8 })
    }

    /// The configured kernel, or the 4-neighbor default.
    pub fn kernel(&self) -> Result<Kernel> {
        match &self.kernel {
            Some(rows) => Kernel::new(rows.clone()),
            None => Ok(Kernel::four_neighbor()),
        }
    }

    /// Validated codec parameters for this configuration.
    pub fn codec_params(&self) -> Result<CodecParams> {
        let params = CodecParams {
            kernel: self.kernel()?,
            stride: self.stride,
            t_hi: self.t_hi,
            bit_depth: self.effective_bit_depth(),
        };
        params.validate()?;
        Ok(params)
    }

    /// The save directory, required by the batch commands.
    pub fn save_path(&self) -> Result<&Path> {
        self.save_path
            .as_deref()
            .ok_or_else(|| LedgerMarkError::ConfigurationInvalid {
                reason: "save_path is required for this operation".into(),
            })
    }
}
