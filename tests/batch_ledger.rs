//! End-to-end batch flows over real files and a real ledger.

use std::path::{Path, PathBuf};

use ledgermark::codec::{self, CodecParams, OverflowMap};
use ledgermark::ledger::{ImageTransaction, RemovalEntry};
use ledgermark::utils::watermark::{self, SecretKey, Watermark};
use ledgermark::{batch, BatchConfig, ImageGrid, Kernel, Ledger, LedgerMarkError};

fn gradient(side: usize, step: u16) -> ImageGrid {
    let samples: Vec<u16> = (0..side)
        .flat_map(|y| (0..side).map(move |x| step * (x + y) as u16))
        .collect();
    ImageGrid::from_samples(side, side, 8, samples).unwrap()
}

fn flat(side: usize, value: u16) -> ImageGrid {
    ImageGrid::from_samples(side, side, 8, vec![value; side * side]).unwrap()
}

fn checkerboard(side: usize) -> ImageGrid {
    let samples: Vec<u16> = (0..side)
        .flat_map(|y| (0..side).map(move |x| if (x + y) % 2 == 0 { 200 } else { 40 }))
        .collect();
    ImageGrid::from_samples(side, side, 8, samples).unwrap()
}

fn save_png(grid: &ImageGrid, path: &Path) {
    let buf: image::ImageBuffer<image::Luma<u8>, Vec<u8>> = image::ImageBuffer::from_fn(
        grid.width() as u32,
        grid.height() as u32,
        |x, y| image::Luma([grid.get(x as usize, y as usize) as u8]),
    );
    buf.save(path).unwrap();
}

fn load_png(path: &Path) -> ImageGrid {
    let luma = image::open(path).unwrap().to_luma8();
    ImageGrid::from_samples(
        luma.width() as usize,
        luma.height() as usize,
        8,
        luma.pixels().map(|p| u16::from(p.0[0])).collect(),
    )
    .unwrap()
}

fn config(
    data_path: PathBuf,
    save_path: Option<PathBuf>,
    ext_wat_path: Option<PathBuf>,
    blockchain_path: PathBuf,
) -> BatchConfig {
    BatchConfig {
        data_path,
        save_path,
        ext_wat_path,
        blockchain_path,
        message: "ledgermark batch test".to_string(),
        kernel: None,
        stride: 3,
        t_hi: 0,
        bit_depth: None,
        data_type: "png".to_string(),
    }
}

fn embedder_entries(ledger: &Ledger, block_number: u64) -> Vec<ImageTransaction> {
    let block = &ledger.blocks()[block_number as usize];
    block.transaction["transaction_dict"]
        .as_object()
        .unwrap()
        .values()
        .map(|v| serde_json::from_value(v.clone()).unwrap())
        .collect()
}

#[test]
fn embed_then_remove_round_trip_through_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let watermarked = dir.path().join("watermarked");
    let recovered = dir.path().join("recovered");
    let wat_out = dir.path().join("watermarks");
    let ledger_path = dir.path().join("ledger.json");

    std::fs::create_dir_all(&input).unwrap();
    save_png(&gradient(16, 5), &input.join("a.png"));
    save_png(&flat(16, 80), &input.join("b.png"));
    // A file with a supported extension that is not a decodable image must be
    // reported as failed without aborting the batch.
    std::fs::write(input.join("c.png"), b"not a png").unwrap();

    let mut ledger = Ledger::open(&ledger_path).unwrap();
    let embed_cfg = config(
        input.clone(),
        Some(watermarked.clone()),
        None,
        ledger_path.clone(),
    );
    let embed_report = batch::embed_batch(&embed_cfg, &mut ledger).unwrap();

    assert_eq!(embed_report.block_number, 1);
    assert_eq!(embed_report.total_images, 3);
    assert_eq!(embed_report.processed_images, 2);
    assert_eq!(embed_report.failed_images.len(), 1);
    assert!(embed_report.failed_images[0].ends_with("c.png"));
    assert!(ledger.verify());

    let block = &ledger.blocks()[1];
    assert_eq!(block.info, "embedder");
    let entries = embedder_entries(&ledger, 1);
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(entry.operation_type, "embedding");
        assert_eq!(entry.watermark.len(), 64);
        assert_eq!(entry.secret_key.len(), 64);
        assert!(entry.overflow_map.is_some());
    }

    let remove_cfg = config(
        watermarked.clone(),
        Some(recovered.clone()),
        Some(wat_out.clone()),
        ledger_path.clone(),
    );
    let remove_report = batch::remove_batch(&remove_cfg, &mut ledger).unwrap();

    assert_eq!(remove_report.block_number, 2);
    assert_eq!(remove_report.processed_images, 2);
    assert!(remove_report.failed_images.is_empty());
    assert_eq!(remove_report.average_ber, 0.0);
    assert!(ledger.verify());

    let block = &ledger.blocks()[2];
    assert_eq!(block.info, "remover");
    let removals: Vec<RemovalEntry> = block.transaction["transaction_dict"]
        .as_object()
        .unwrap()
        .values()
        .map(|v| serde_json::from_value(v.clone()).unwrap())
        .collect();
    assert_eq!(removals.len(), 2);
    for removal in &removals {
        assert_eq!(removal.operation_type, "removal");
        assert_eq!(removal.extraction_ber, 0.0);
        assert_eq!(removal.recovered_image_hash, removal.original_image_hash);
        assert_eq!(removal.removal_parameters.overflow_scheme, "ledger-v1");
    }

    // Recovered files are pixel-identical to the originals.
    assert_eq!(
        load_png(&recovered.join("recovered_watermarked_a.png")),
        gradient(16, 5)
    );
    assert_eq!(
        load_png(&recovered.join("recovered_watermarked_b.png")),
        flat(16, 80)
    );

    // The extracted watermark was written next to the recovered images.
    assert!(wat_out.join("watermarked_a_watermark.txt").exists());
}

#[test]
fn extract_reports_registered_and_unregistered_images() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let watermarked = dir.path().join("watermarked");
    let ledger_path = dir.path().join("ledger.json");

    std::fs::create_dir_all(&input).unwrap();
    save_png(&gradient(16, 5), &input.join("a.png"));

    let mut ledger = Ledger::open(&ledger_path).unwrap();
    let embed_cfg = config(
        input.clone(),
        Some(watermarked.clone()),
        None,
        ledger_path.clone(),
    );
    batch::embed_batch(&embed_cfg, &mut ledger).unwrap();

    let registered_cfg = config(
        watermarked.join("watermarked_a.png"),
        None,
        None,
        ledger_path.clone(),
    );
    let report = batch::extract_lookup(&registered_cfg, &ledger).unwrap();
    assert_eq!(report.ber, 0.0);
    assert_eq!(report.block_number, Some(1));
    assert_eq!(report.info, "embedder");
    assert!(report.image_hash.is_some());

    // A checkerboard yields no extractable bits for any key, so the scan
    // cannot claim it.
    let stranger = dir.path().join("stranger.png");
    save_png(&checkerboard(16), &stranger);
    let stranger_cfg = config(stranger, None, None, ledger_path.clone());
    let report = batch::extract_lookup(&stranger_cfg, &ledger).unwrap();
    assert_eq!(report.ber, 0.5);
    assert_eq!(report.block_number, None);
    assert_eq!(report.info, "image is not registered in this ledger");
}

#[test]
fn tampering_keeps_extraction_but_defeats_removal() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let watermarked = dir.path().join("watermarked");
    let ledger_path = dir.path().join("ledger.json");

    std::fs::create_dir_all(&input).unwrap();
    save_png(&gradient(16, 5), &input.join("a.png"));

    let mut ledger = Ledger::open(&ledger_path).unwrap();
    let embed_cfg = config(
        input.clone(),
        Some(watermarked.clone()),
        None,
        ledger_path.clone(),
    );
    batch::embed_batch(&embed_cfg, &mut ledger).unwrap();
    let entry = embedder_entries(&ledger, 1).remove(0);

    let mut tampered = load_png(&watermarked.join("watermarked_a.png"));
    // (0, 0) is never a lattice origin and has zero weight in the default
    // kernel, so predictions at every selected center are unchanged.
    tampered.set(0, 0, tampered.get(0, 0) ^ 1);

    let params = CodecParams {
        kernel: Kernel::new(entry.kernel.clone()).unwrap(),
        stride: entry.stride,
        t_hi: entry.t_hi,
        bit_depth: entry.bit_depth,
    };
    let key = SecretKey::from_hex(&entry.secret_key).unwrap();
    let expected = Watermark::from_hex(&entry.watermark).unwrap();
    let overflow = OverflowMap::from_coords(entry.overflow_map.clone().unwrap()).unwrap();

    let extraction = codec::extract(&tampered, &key, &params, Some(&overflow)).unwrap();
    assert_eq!(watermark::ber(&extraction.bits, &expected), 0.0);

    assert!(matches!(
        batch::remove_with_entry(&tampered, &entry),
        Err(LedgerMarkError::WatermarkMismatch { .. })
    ));
}

#[test]
fn corrupted_ledger_refuses_batch_appends() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let watermarked = dir.path().join("watermarked");
    let ledger_path = dir.path().join("ledger.json");

    std::fs::create_dir_all(&input).unwrap();
    save_png(&gradient(16, 5), &input.join("a.png"));

    let mut ledger = Ledger::open(&ledger_path).unwrap();
    let embed_cfg = config(
        input.clone(),
        Some(watermarked.clone()),
        None,
        ledger_path.clone(),
    );
    batch::embed_batch(&embed_cfg, &mut ledger).unwrap();

    // Flip one hex digit of block 1's previous_hash on disk.
    let raw = std::fs::read_to_string(&ledger_path).unwrap();
    let mut blocks: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
    blocks[1]["header"]["previous_hash"] = serde_json::Value::String("f".repeat(64));
    std::fs::write(&ledger_path, serde_json::to_string_pretty(&blocks).unwrap()).unwrap();

    let mut corrupted = Ledger::open(&ledger_path).unwrap();
    assert!(corrupted.is_read_only());
    assert!(!corrupted.verify());
    assert!(matches!(
        batch::embed_batch(&embed_cfg, &mut corrupted),
        Err(LedgerMarkError::LedgerCorrupt { .. })
    ));
}
