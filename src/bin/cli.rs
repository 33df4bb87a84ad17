//! ledgermark CLI - batch watermark embedding, extraction, and removal.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use ledgermark::{batch, BatchConfig, Ledger, LedgerMarkError};

/// Successful execution: every image processed.
const SUCCESS: u8 = 0;
/// At least one per-image failure; the remainder was still processed.
const PARTIAL_FAILURE: u8 = 1;
/// Unusable configuration.
const CONFIG_ERROR: u8 = 2;
/// Ledger corruption.
const LEDGER_CORRUPT: u8 = 3;

#[derive(Parser)]
#[command(name = "ledgermark")]
#[command(author, version, about = "Reversible watermarking with a hash-chained ledger")]
#[command(after_help = "Exit codes:
  0   Success
  1   One or more images failed
  2   Unusable configuration
  3   Ledger corruption")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed watermarks into every image in a directory
    EmbedBatch {
        /// Path to the JSON configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
    /// Look one image up in the ledger
    Extract {
        /// Path to the JSON configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
    /// Remove watermarks from every image in a directory
    RemoveBatch {
        /// Path to the JSON configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

fn setup_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    match run(&cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(classify(&e))
        }
    }
}

fn run(command: &Commands) -> ledgermark::Result<u8> {
    match command {
        Commands::EmbedBatch { config } => {
            let config = BatchConfig::load(config)?;
            let mut ledger = Ledger::open(&config.blockchain_path)?;
            let report = batch::embed_batch(&config, &mut ledger)?;
            println!(
                "Embedded {}/{} images in {:.2}s (block {})",
                report.processed_images,
                report.total_images,
                report.processing_time,
                report.block_number
            );
            Ok(if report.failed_images.is_empty() {
                SUCCESS
            } else {
                PARTIAL_FAILURE
            })
        }
        Commands::Extract { config } => {
            let config = BatchConfig::load(config)?;
            let ledger = Ledger::open(&config.blockchain_path)?;
            let report = batch::extract_lookup(&config, &ledger)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report)
                    .expect("extraction reports always serialize")
            );
            Ok(SUCCESS)
        }
        Commands::RemoveBatch { config } => {
            let config = BatchConfig::load(config)?;
            let mut ledger = Ledger::open(&config.blockchain_path)?;
            let report = batch::remove_batch(&config, &mut ledger)?;
            println!(
                "Recovered {}/{} images in {:.2}s, average BER {:.4} (block {})",
                report.processed_images,
                report.total_images,
                report.processing_time,
                report.average_ber,
                report.block_number
            );
            Ok(if report.failed_images.is_empty() {
                SUCCESS
            } else {
                PARTIAL_FAILURE
            })
        }
    }
}

fn classify(error: &LedgerMarkError) -> u8 {
    match error {
        LedgerMarkError::ConfigurationInvalid { .. } | LedgerMarkError::InvalidKernel { .. } => {
            CONFIG_ERROR
        }
        LedgerMarkError::LedgerCorrupt { .. } => LEDGER_CORRUPT,
        _ => PARTIAL_FAILURE,
    }
}
