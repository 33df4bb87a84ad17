//! The hash-chained transaction ledger.
//!
//! The ledger is a JSON array of blocks persisted at a single path. Each
//! block wraps one batch operation; `previous_hash` is SHA-256 over the
//! canonical encoding of the prior block, so any edit to history breaks the
//! chain. Blocks are appended atomically (temp file, fsync, rename) under an
//! exclusive advisory lock and never mutated afterwards; a removal is a new
//! block, leaving the embedder block intact for audit.
//!
//! Canonical encoding: the block is converted to a `serde_json::Value`
//! (object keys sort lexicographically) and serialized compactly. Chain
//! equality depends on this being byte-exact, which is why hashing never
//! goes through the pretty-printed on-disk rendering.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LedgerMarkError, Result};

/// `previous_hash` of the genesis block: 64 zero hex digits.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Block header: linking and ordering fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Wall-clock seconds since the Unix epoch at block creation.
    pub timestamp: f64,
    /// Canonical hash of the previous block, hex-encoded.
    pub previous_hash: String,
    /// Position in the chain, starting at 0 for genesis.
    pub block_number: u64,
}

/// One tamper-evident ledger entry wrapping a batch operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// `"genesis"`, `"embedder"`, or `"remover"`.
    pub info: String,
    pub transaction: serde_json::Value,
}

impl Block {
    /// SHA-256 over the canonical (sorted-key, compact) encoding, hex-encoded.
    pub fn canonical_hash(&self) -> String {
        let value = serde_json::to_value(self)
            .expect("a block is always representable as a JSON value");
        let canonical = serde_json::to_string(&value)
            .expect("a JSON value always serializes");
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Per-image entry of an embedder transaction, keyed by `hash_image_wat`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageTransaction {
    pub timestamp: f64,
    pub secret_key: String,
    pub message: String,
    pub watermark: String,
    pub kernel: Vec<Vec<f64>>,
    pub stride: usize,
    pub t_hi: u16,
    pub hash_image_wat: String,
    pub hash_image_orig: String,
    pub bit_depth: u8,
    pub data_type: String,
    pub operation_type: String,
    /// Overflow coordinates under the `ledger-v1` transport scheme. Absent in
    /// entries written by other schemes.
    #[serde(default)]
    pub overflow_map: Option<Vec<(usize, usize)>>,
    #[serde(default)]
    pub mask_scheme: Option<String>,
}

/// Transaction payload of an embedder block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbedderTransaction {
    pub total_images: usize,
    pub processed_images: usize,
    pub failed_images: Vec<String>,
    pub processing_time: f64,
    pub transaction_dict: BTreeMap<String, ImageTransaction>,
}

/// Parameters recorded with each removal so the operation is auditable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemovalParameters {
    pub kernel: Vec<Vec<f64>>,
    pub stride: usize,
    pub t_hi: u16,
    pub bit_depth: u8,
    pub overflow_scheme: String,
}

/// Per-image entry of a remover transaction, keyed by the watermarked hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemovalEntry {
    pub operation_type: String,
    pub original_image_hash: String,
    pub watermarked_image_hash: String,
    pub recovered_image_hash: String,
    pub extraction_ber: f64,
    pub original_watermark: String,
    pub extracted_watermark: String,
    pub removal_parameters: RemovalParameters,
}

/// Transaction payload of a remover block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoverTransaction {
    pub timestamp: f64,
    pub operation: String,
    pub batch_size: usize,
    pub successful_extractions: usize,
    pub failed_extractions: usize,
    pub average_ber: f64,
    pub transaction_dict: BTreeMap<String, RemovalEntry>,
}

/// An append-only hash-chained block store over one JSON file.
pub struct Ledger {
    path: PathBuf,
    blocks: Vec<Block>,
    read_only: bool,
}

impl Ledger {
    /// Opens the ledger at `path`, synthesizing a genesis block on first use.
    ///
    /// A chain-hash mismatch does not fail the open: the ledger comes up
    /// read-only and every append is refused with `LedgerCorrupt` until the
    /// file is repaired. A file that cannot even be parsed fails immediately.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            let genesis = Block {
                header: BlockHeader {
                    timestamp: unix_timestamp(),
                    previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
                    block_number: 0,
                },
                info: "genesis".to_string(),
                transaction: serde_json::Value::Object(serde_json::Map::new()),
            };
            let ledger = Self {
                path,
                blocks: vec![genesis],
                read_only: false,
            };
            ledger.persist()?;
            return Ok(ledger);
        }

        let raw = fs::read_to_string(&path)?;
        let blocks: Vec<Block> =
            serde_json::from_str(&raw).map_err(|e| LedgerMarkError::LedgerCorrupt {
                path: path.clone(),
                reason: format!("unparseable ledger document: {e}"),
            })?;
        let read_only = !chain_is_valid(&blocks);
        Ok(Self {
            path,
            blocks,
            read_only,
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Whether the ledger was opened read-only due to chain corruption.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Fails with `LedgerCorrupt` when the ledger is read-only.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(LedgerMarkError::LedgerCorrupt {
                path: self.path.clone(),
                reason: "hash chain mismatch; ledger is read-only".into(),
            });
        }
        Ok(())
    }

    /// Appends a block wrapping `transaction` and returns its number.
    ///
    /// Holds an exclusive advisory lock on a sidecar lock file for the
    /// duration of the append; the document itself is replaced atomically so
    /// lockless readers always see a complete ledger.
    pub fn append(&mut self, info: &str, transaction: serde_json::Value) -> Result<u64> {
        self.ensure_writable()?;
        let _lock = LedgerLock::acquire(&self.path)?;

        let last = self
            .blocks
            .last()
            .expect("an open ledger always holds at least the genesis block");
        let block = Block {
            header: BlockHeader {
                timestamp: unix_timestamp(),
                previous_hash: last.canonical_hash(),
                block_number: last.header.block_number + 1,
            },
            info: info.to_string(),
            transaction,
        };
        let block_number = block.header.block_number;
        self.blocks.push(block);
        if let Err(e) = self.persist() {
            self.blocks.pop();
            return Err(e);
        }
        Ok(block_number)
    }

    /// Recomputes the chain and cross-checks removals against embeddings.
    ///
    /// Returns false when any `previous_hash` disagrees with the canonical
    /// hash of its predecessor, or when a remover entry references a
    /// watermarked-image hash no earlier embedder block recorded.
    pub fn verify(&self) -> bool {
        if !chain_is_valid(&self.blocks) {
            return false;
        }
        let mut embedded_hashes: std::collections::HashSet<&str> =
            std::collections::HashSet::new();
        for block in &self.blocks {
            match block.info.as_str() {
                "embedder" => {
                    if let Some(dict) = transaction_dict(block) {
                        embedded_hashes.extend(dict.keys().map(String::as_str));
                    }
                }
                "remover" => {
                    let Some(dict) = transaction_dict(block) else {
                        return false;
                    };
                    if dict.keys().any(|h| !embedded_hashes.contains(h.as_str())) {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }

    /// Most recent embedder block whose transaction dictionary has an entry
    /// for the watermarked-image hash `hash`.
    pub fn find_by_watermarked_hash(&self, hash: &str) -> Option<u64> {
        self.find_embedder_entry(hash)
            .map(|(block_number, _)| block_number)
    }

    /// Like [`Ledger::find_by_watermarked_hash`], but also decodes the entry.
    pub fn find_embedder_entry(&self, hash: &str) -> Option<(u64, ImageTransaction)> {
        for block in self.blocks.iter().rev() {
            if block.info != "embedder" {
                continue;
            }
            let Some(dict) = transaction_dict(block) else {
                continue;
            };
            if let Some(entry) = dict.get(hash) {
                if let Ok(entry) = serde_json::from_value(entry.clone()) {
                    return Some((block.header.block_number, entry));
                }
            }
        }
        None
    }

    /// Embedder blocks whose recorded watermark equals `watermark_hex`.
    pub fn find_by_extracted_watermark(&self, watermark_hex: &str) -> Vec<u64> {
        self.blocks
            .iter()
            .filter(|block| block.info == "embedder")
            .filter(|block| {
                transaction_dict(block).is_some_and(|dict| {
                    dict.values()
                        .any(|entry| entry.get("watermark").and_then(|w| w.as_str())
                            == Some(watermark_hex))
                })
            })
            .map(|block| block.header.block_number)
            .collect()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let rendered = serde_json::to_string_pretty(&self.blocks)
            .expect("blocks always serialize to JSON");
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(rendered.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Exclusive advisory lock on a sidecar file, released on drop.
struct LedgerLock {
    file: File,
}

impl LedgerLock {
    fn acquire(ledger_path: &Path) -> Result<Self> {
        let lock_path = ledger_path.with_extension("json.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn chain_is_valid(blocks: &[Block]) -> bool {
    let Some(genesis) = blocks.first() else {
        return false;
    };
    if genesis.header.block_number != 0 || genesis.header.previous_hash != GENESIS_PREVIOUS_HASH {
        return false;
    }
    blocks.windows(2).all(|pair| {
        pair[1].header.block_number == pair[0].header.block_number + 1
            && pair[1].header.previous_hash == pair[0].canonical_hash()
    })
}

pub(crate) fn transaction_dict(
    block: &Block,
) -> Option<&serde_json::Map<String, serde_json::Value>> {
    block
        .transaction
        .get("transaction_dict")
        .and_then(|d| d.as_object())
}

/// Wall-clock seconds since the Unix epoch as a float.
pub(crate) fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
