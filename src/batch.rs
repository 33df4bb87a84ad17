//! Batch drivers: thin orchestrators around the codec and the ledger.
//!
//! Each driver scans a directory, runs the per-image operation, collects
//! per-image failures without aborting the batch, and concludes by appending
//! exactly one block to the ledger. The codec stays pure; everything
//! stateful (file I/O, ledger appends, accumulators) lives here.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::codec::{self, CodecParams, OverflowMap};
use crate::config::BatchConfig;
use crate::error::{LedgerMarkError, Result};
use crate::grid::ImageGrid;
use crate::image_io;
use crate::kernel::Kernel;
use crate::ledger::{
    unix_timestamp, EmbedderTransaction, ImageTransaction, Ledger, RemovalEntry,
    RemovalParameters, RemoverTransaction,
};
use crate::utils::mask::MASK_SCHEME;
use crate::utils::watermark::{self, SecretKey, Watermark};

/// Identifier of the overflow-map transport scheme, recorded with every
/// removal: overflow coordinates travel inside the embedder ledger entry.
pub const OVERFLOW_SCHEME: &str = "ledger-v1";

/// BER below which a scanned embedder transaction counts as a match when the
/// image fingerprint itself is no longer found.
const SCAN_BER_THRESHOLD: f64 = 0.2;

/// Outcome of an embedding batch.
#[derive(Clone, Debug)]
pub struct BatchEmbedReport {
    pub total_images: usize,
    pub processed_images: usize,
    pub failed_images: Vec<String>,
    pub block_number: u64,
    pub processing_time: f64,
}

/// Outcome of a removal batch.
#[derive(Clone, Debug)]
pub struct BatchRemoveReport {
    pub total_images: usize,
    pub processed_images: usize,
    pub failed_images: Vec<String>,
    pub average_ber: f64,
    pub block_number: u64,
    pub processing_time: f64,
}

/// Ledger lookup result for a single image, mirroring what the extractor
/// reports: an exact fingerprint hit, a scan hit, or no registration.
#[derive(Clone, Debug, Serialize)]
pub struct ExtractionReport {
    pub ber: f64,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub timestamp: Option<f64>,
    pub info: String,
    pub image_hash: Option<String>,
}

/// Embeds watermarks into every supported image under the configured
/// directory and appends one embedder block.
pub fn embed_batch(config: &BatchConfig, ledger: &mut Ledger) -> Result<BatchEmbedReport> {
    ledger.ensure_writable()?;
    let params = config.codec_params()?;
    let save_dir = config.save_path()?.to_path_buf();
    let files = image_io::scan_directory(&config.data_path)?;
    if files.is_empty() {
        return Err(LedgerMarkError::ConfigurationInvalid {
            reason: format!(
                "no supported images found in {}",
                config.data_path.display()
            ),
        });
    }
    std::fs::create_dir_all(&save_dir)?;

    let started = Instant::now();
    info!(total = files.len(), "starting embedding batch");

    let mut transaction_dict = BTreeMap::new();
    let mut failed_images = Vec::new();
    for path in &files {
        match embed_one(path, &save_dir, config, &params) {
            Ok((hash_wat, entry)) => {
                transaction_dict.insert(hash_wat, entry);
            }
            Err(e) => {
                error!(path = %path.display(), kind = e.kind(), "embedding failed: {e}");
                failed_images.push(path.display().to_string());
            }
        }
    }

    let processing_time = started.elapsed().as_secs_f64();
    let processed_images = transaction_dict.len();
    let transaction = EmbedderTransaction {
        total_images: files.len(),
        processed_images,
        failed_images: failed_images.clone(),
        processing_time,
        transaction_dict,
    };
    let block_number = ledger.append(
        "embedder",
        serde_json::to_value(&transaction).expect("embedder transactions always serialize"),
    )?;
    info!(
        block_number,
        processed = processed_images,
        failed = failed_images.len(),
        "embedding batch recorded"
    );

    Ok(BatchEmbedReport {
        total_images: files.len(),
        processed_images,
        failed_images,
        block_number,
        processing_time,
    })
}

fn embed_one(
    path: &Path,
    save_dir: &Path,
    config: &BatchConfig,
    params: &CodecParams,
) -> Result<(String, ImageTransaction)> {
    let loaded = image_io::load_pixels(path, &config.data_type, params.bit_depth)?;
    let key = SecretKey::generate();
    let outcome = codec::embed(&loaded.grid, &key, &config.message, params)?;

    let out_path = save_dir.join(format!("watermarked_{}", file_name(path)));
    image_io::write_pixels(&loaded, &outcome.image, &out_path)?;

    info!(
        path = %path.display(),
        psnr = outcome.stats.psnr,
        bits = outcome.stats.bits_embedded,
        overflow = outcome.overflow.len(),
        "embedded watermark"
    );

    let hash_image_wat = outcome.image.fingerprint();
    let entry = ImageTransaction {
        timestamp: unix_timestamp(),
        secret_key: key.to_hex(),
        message: config.message.clone(),
        watermark: outcome.watermark.to_hex(),
        kernel: params.kernel.rows(),
        stride: params.stride,
        t_hi: params.t_hi,
        hash_image_wat: hash_image_wat.clone(),
        hash_image_orig: loaded.grid.fingerprint(),
        bit_depth: params.bit_depth,
        data_type: config.data_type.clone(),
        operation_type: "embedding".to_string(),
        overflow_map: Some(outcome.overflow.coords().to_vec()),
        mask_scheme: Some(MASK_SCHEME.to_string()),
    };
    Ok((hash_image_wat, entry))
}

/// Removes watermarks from every supported image under the configured
/// directory and appends one remover block.
pub fn remove_batch(config: &BatchConfig, ledger: &mut Ledger) -> Result<BatchRemoveReport> {
    ledger.ensure_writable()?;
    let save_dir = config.save_path()?.to_path_buf();
    let files = image_io::scan_directory(&config.data_path)?;
    if files.is_empty() {
        return Err(LedgerMarkError::ConfigurationInvalid {
            reason: format!(
                "no supported images found in {}",
                config.data_path.display()
            ),
        });
    }
    std::fs::create_dir_all(&save_dir)?;
    if let Some(wat_dir) = &config.ext_wat_path {
        std::fs::create_dir_all(wat_dir)?;
    }

    let started = Instant::now();
    info!(total = files.len(), "starting removal batch");

    let mut transaction_dict: BTreeMap<String, RemovalEntry> = BTreeMap::new();
    let mut failed_images = Vec::new();
    let mut ber_sum = 0.0;
    for path in &files {
        match remove_one(path, &save_dir, config, ledger) {
            Ok((watermarked_hash, entry)) => {
                ber_sum += entry.extraction_ber;
                transaction_dict.insert(watermarked_hash, entry);
            }
            Err(e) => {
                error!(path = %path.display(), kind = e.kind(), "removal failed: {e}");
                failed_images.push(path.display().to_string());
            }
        }
    }

    let processing_time = started.elapsed().as_secs_f64();
    let processed_images = transaction_dict.len();
    let average_ber = if processed_images > 0 {
        ber_sum / processed_images as f64
    } else {
        0.0
    };
    let transaction = RemoverTransaction {
        timestamp: unix_timestamp(),
        operation: "remove".to_string(),
        batch_size: files.len(),
        successful_extractions: processed_images,
        failed_extractions: failed_images.len(),
        average_ber,
        transaction_dict,
    };
    let block_number = ledger.append(
        "remover",
        serde_json::to_value(&transaction).expect("remover transactions always serialize"),
    )?;
    info!(
        block_number,
        processed = processed_images,
        failed = failed_images.len(),
        average_ber,
        chain_valid = ledger.verify(),
        "removal batch recorded"
    );

    Ok(BatchRemoveReport {
        total_images: files.len(),
        processed_images,
        failed_images,
        average_ber,
        block_number,
        processing_time,
    })
}

fn remove_one(
    path: &Path,
    save_dir: &Path,
    config: &BatchConfig,
    ledger: &Ledger,
) -> Result<(String, RemovalEntry)> {
    let loaded = image_io::load_pixels(path, &config.data_type, config.effective_bit_depth())?;
    let watermarked_hash = loaded.grid.fingerprint();
    let (_, entry) = ledger.find_embedder_entry(&watermarked_hash).ok_or_else(|| {
        LedgerMarkError::LedgerBlockNotFound {
            hash: watermarked_hash.clone(),
        }
    })?;

    let (restored, bits, extraction_ber) = remove_with_entry(&loaded.grid, &entry)?;

    let out_path = save_dir.join(format!("recovered_{}", file_name(path)));
    image_io::write_pixels(&loaded, &restored, &out_path)?;

    let extracted = watermark::fold_majority(&bits);
    if let Some(wat_dir) = &config.ext_wat_path {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        std::fs::write(
            wat_dir.join(format!("{stem}_watermark.txt")),
            extracted.to_hex(),
        )?;
    }

    info!(path = %path.display(), ber = extraction_ber, "removed watermark");

    let removal = RemovalEntry {
        operation_type: "removal".to_string(),
        original_image_hash: entry.hash_image_orig.clone(),
        watermarked_image_hash: watermarked_hash.clone(),
        recovered_image_hash: restored.fingerprint(),
        extraction_ber,
        original_watermark: entry.watermark.clone(),
        extracted_watermark: extracted.to_hex(),
        removal_parameters: RemovalParameters {
            kernel: entry.kernel.clone(),
            stride: entry.stride,
            t_hi: entry.t_hi,
            bit_depth: entry.bit_depth,
            overflow_scheme: OVERFLOW_SCHEME.to_string(),
        },
    };
    Ok((watermarked_hash, removal))
}

/// Restores the original image from a watermarked grid using a recorded
/// embedder entry.
///
/// Fails with `WatermarkMismatch` when the recovered bit stream disagrees
/// with the recorded watermark or the restored image's fingerprint differs
/// from the recorded original hash, and with `OverflowMapUnrecoverable` when
/// the entry carries no overflow map.
pub fn remove_with_entry(
    grid: &ImageGrid,
    entry: &ImageTransaction,
) -> Result<(ImageGrid, Vec<u8>, f64)> {
    let params = entry_params(entry)?;
    let key = SecretKey::from_hex(&entry.secret_key)?;
    let expected = Watermark::from_hex(&entry.watermark)?;
    let coords = entry.overflow_map.clone().ok_or_else(|| {
        LedgerMarkError::OverflowMapUnrecoverable {
            reason: format!(
                "embedder entry for {} records no overflow map",
                entry.hash_image_wat
            ),
        }
    })?;
    let overflow = OverflowMap::from_coords(coords)?;

    let (restored, bits) = codec::remove(grid, &key, &params, &overflow, &expected)?;
    if restored.fingerprint() != entry.hash_image_orig {
        return Err(LedgerMarkError::WatermarkMismatch {
            reason: "recovered image hash does not match the recorded original".into(),
        });
    }
    let ber = watermark::ber(&bits, &expected);
    Ok((restored, bits, ber))
}

/// Looks up a single image in the ledger, scanning embedder transactions
/// when the fingerprint itself is unknown.
pub fn extract_lookup(config: &BatchConfig, ledger: &Ledger) -> Result<ExtractionReport> {
    let loaded =
        image_io::load_pixels(&config.data_path, &config.data_type, config.effective_bit_depth())?;
    let image_hash = loaded.grid.fingerprint();

    if let Some((block_number, entry)) = ledger.find_embedder_entry(&image_hash) {
        info!(block_number, "watermarked image hash found in the ledger");
        let block = &ledger.blocks()[block_number as usize];
        return Ok(ExtractionReport {
            ber: 0.0,
            block_number: Some(block_number),
            block_hash: Some(block.canonical_hash()),
            timestamp: Some(block.header.timestamp),
            info: block.info.clone(),
            image_hash: Some(entry.hash_image_wat),
        });
    }

    warn!("image hash not found in the ledger; scanning embedder transactions");
    for block in ledger.blocks() {
        if block.info != "embedder" {
            continue;
        }
        let Some(dict) = crate::ledger::transaction_dict(block) else {
            continue;
        };
        for entry_value in dict.values() {
            let Ok(entry) = serde_json::from_value::<ImageTransaction>(entry_value.clone()) else {
                continue;
            };
            if entry.data_type != config.data_type {
                continue;
            }
            let Ok(ber) = scan_candidate(&loaded.grid, &entry) else {
                continue;
            };
            if ber < SCAN_BER_THRESHOLD {
                info!(
                    block_number = block.header.block_number,
                    ber, "recovered watermark matches a recorded transaction"
                );
                return Ok(ExtractionReport {
                    ber,
                    block_number: Some(block.header.block_number),
                    block_hash: Some(block.canonical_hash()),
                    timestamp: Some(block.header.timestamp),
                    info: block.info.clone(),
                    image_hash: Some(entry.hash_image_wat),
                });
            }
        }
    }

    Ok(ExtractionReport {
        ber: 0.5,
        block_number: None,
        block_hash: None,
        timestamp: None,
        info: "image is not registered in this ledger".to_string(),
        image_hash: None,
    })
}

fn scan_candidate(grid: &ImageGrid, entry: &ImageTransaction) -> Result<f64> {
    let params = entry_params(entry)?;
    let key = SecretKey::from_hex(&entry.secret_key)?;
    let expected = Watermark::from_hex(&entry.watermark)?;
    let overflow = entry
        .overflow_map
        .clone()
        .map(OverflowMap::from_coords)
        .transpose()?;
    let extraction = codec::extract(grid, &key, &params, overflow.as_ref())?;
    Ok(watermark::ber(&extraction.bits, &expected))
}

fn entry_params(entry: &ImageTransaction) -> Result<CodecParams> {
    let params = CodecParams {
        kernel: Kernel::new(entry.kernel.clone())?,
        stride: entry.stride,
        t_hi: entry.t_hi,
        bit_depth: entry.bit_depth,
    };
    params.validate()?;
    Ok(params)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}
