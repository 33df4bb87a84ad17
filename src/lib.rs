//! # ledgermark
//!
//! Reversible image watermarking with a hash-chained transaction ledger.
//!
//! The engine embeds a 256-bit watermark derived from a message and a fresh
//! secret key into an image by histogram shifting of prediction errors at
//! key-selected pixels. The watermarked image stays visually close to the
//! original, the embedded bits can be re-extracted with the key alone, and
//! the exact original image is reconstructible from the watermarked image
//! plus the parameters recorded in the ledger. Every batch embedding or
//! removal appends one tamper-evident block to a local JSON ledger.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use ledgermark::{codec, CodecParams, SecretKey};
//!
//! let key = SecretKey::generate();
//! let params = CodecParams::with_defaults(8);
//! let outcome = codec::embed(&image, &key, "patient 1742", &params)?;
//! let (restored, _) = codec::remove(
//!     &outcome.image, &key, &params, &outcome.overflow, &outcome.watermark,
//! )?;
//! assert_eq!(restored.fingerprint(), image.fingerprint());
//! ```

pub mod batch;
pub mod codec;
pub mod config;
pub mod error;
pub mod grid;
pub mod image_io;
pub mod kernel;
pub mod ledger;
pub mod utils;

pub use codec::{CodecParams, EmbedOutcome, EmbedStats, Extraction, OverflowMap};
pub use config::BatchConfig;
pub use error::{LedgerMarkError, Result};
pub use grid::ImageGrid;
pub use kernel::Kernel;
pub use ledger::{Block, Ledger};
pub use utils::watermark::{SecretKey, Watermark, WATERMARK_BITS};
