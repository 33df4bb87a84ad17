//! Container I/O: decoding pixel grids from image files and writing them
//! back.
//!
//! The core only ever sees [`ImageGrid`]s; this module is the collaborator
//! that maps container formats onto them. Two variants cover the supported
//! containers: common raster formats through the `image` crate (8-bit, or
//! 16-bit PNG/TIFF) and DICOM through the `dicom` crate. For DICOM only the
//! pixel data element is replaced on write; every other tag of the source
//! object is preserved verbatim.

use std::path::{Path, PathBuf};

use dicom::core::value::PrimitiveValue;
use dicom::core::{DataElement, VR};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject};
use image::{ImageBuffer, Luma};

use crate::error::{LedgerMarkError, Result};
use crate::grid::ImageGrid;

/// File extensions the batch drivers accept.
pub const SUPPORTED_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tiff", "dcm"];

/// Container state carried from load to save.
enum Container {
    Raster,
    Dicom(Box<DefaultDicomObject>),
}

/// A decoded image together with the container it came from.
pub struct LoadedImage {
    pub grid: ImageGrid,
    container: Container,
}

/// Lists supported image files in `dir`, sorted by path.
pub fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(LedgerMarkError::ConfigurationInvalid {
            reason: format!("data path {} is not a directory", dir.display()),
        });
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && has_supported_extension(path))
        .collect();
    files.sort();
    Ok(files)
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// Decodes the pixel grid at `path`.
///
/// `data_type` selects the container variant (`"dcm"` for DICOM, anything
/// else for raster); `bit_depth` is the sample depth the caller expects.
pub fn load_pixels(path: &Path, data_type: &str, bit_depth: u8) -> Result<LoadedImage> {
    if data_type == "dcm" {
        load_dicom(path)
    } else {
        load_raster(path, bit_depth)
    }
}

/// Writes `grid` to `out_path` using the container variant of `loaded`.
pub fn write_pixels(loaded: &LoadedImage, grid: &ImageGrid, out_path: &Path) -> Result<()> {
    match &loaded.container {
        Container::Raster => save_raster(grid, out_path),
        Container::Dicom(obj) => save_dicom(obj, grid, out_path),
    }
}

fn load_raster(path: &Path, bit_depth: u8) -> Result<LoadedImage> {
    let read_err = |reason: String| LedgerMarkError::ImageRead {
        path: path.to_path_buf(),
        reason,
    };
    let img = image::open(path).map_err(|e| read_err(e.to_string()))?;
    let grid = match bit_depth {
        8 => {
            let luma = img.to_luma8();
            ImageGrid::from_samples(
                luma.width() as usize,
                luma.height() as usize,
                8,
                luma.pixels().map(|p| u16::from(p.0[0])).collect(),
            )?
        }
        16 => {
            let luma = img.to_luma16();
            ImageGrid::from_samples(
                luma.width() as usize,
                luma.height() as usize,
                16,
                luma.pixels().map(|p| p.0[0]).collect(),
            )?
        }
        other => {
            return Err(LedgerMarkError::ConfigurationInvalid {
                reason: format!("raster bit depth must be 8 or 16, got {other}"),
            })
        }
    };
    Ok(LoadedImage {
        grid,
        container: Container::Raster,
    })
}

fn save_raster(grid: &ImageGrid, out_path: &Path) -> Result<()> {
    let write_err = |reason: String| LedgerMarkError::ImageWrite {
        path: out_path.to_path_buf(),
        reason,
    };
    let width = grid.width() as u32;
    let height = grid.height() as u32;
    match grid.bit_depth() {
        8 => {
            let buf: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
                Luma([grid.get(x as usize, y as usize) as u8])
            });
            buf.save(out_path).map_err(|e| write_err(e.to_string()))
        }
        _ => {
            let buf: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_fn(width, height, |x, y| {
                    Luma([grid.get(x as usize, y as usize)])
                });
            buf.save(out_path).map_err(|e| write_err(e.to_string()))
        }
    }
}

fn load_dicom(path: &Path) -> Result<LoadedImage> {
    let read_err = |reason: String| LedgerMarkError::ImageRead {
        path: path.to_path_buf(),
        reason,
    };
    let obj = open_file(path).map_err(|e| read_err(e.to_string()))?;

    let rows = obj
        .element(tags::ROWS)
        .map_err(|e| read_err(e.to_string()))?
        .to_int::<u16>()
        .map_err(|e| read_err(e.to_string()))? as usize;
    let columns = obj
        .element(tags::COLUMNS)
        .map_err(|e| read_err(e.to_string()))?
        .to_int::<u16>()
        .map_err(|e| read_err(e.to_string()))? as usize;
    let bits_allocated = obj
        .element(tags::BITS_ALLOCATED)
        .map_err(|e| read_err(e.to_string()))?
        .to_int::<u16>()
        .map_err(|e| read_err(e.to_string()))?;
    let data = obj
        .element(tags::PIXEL_DATA)
        .map_err(|e| read_err(e.to_string()))?
        .to_bytes()
        .map_err(|e| read_err(e.to_string()))?;

    let samples: Vec<u16> = match bits_allocated {
        8 => data.iter().map(|&b| u16::from(b)).collect(),
        16 => {
            if data.len() < columns * rows * 2 {
                return Err(read_err(format!(
                    "pixel data holds {} bytes, expected at least {}",
                    data.len(),
                    columns * rows * 2
                )));
            }
            data.chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect()
        }
        other => return Err(read_err(format!("unsupported BitsAllocated {other}"))),
    };
    let bit_depth = if bits_allocated == 8 { 8 } else { 16 };
    let grid = ImageGrid::from_samples(
        columns,
        rows,
        bit_depth,
        samples.into_iter().take(columns * rows).collect(),
    )?;
    Ok(LoadedImage {
        grid,
        container: Container::Dicom(Box::new(obj)),
    })
}

fn save_dicom(source: &DefaultDicomObject, grid: &ImageGrid, out_path: &Path) -> Result<()> {
    let write_err = |reason: String| LedgerMarkError::ImageWrite {
        path: out_path.to_path_buf(),
        reason,
    };
    let mut obj = source.clone();
    let element = if grid.bit_depth() <= 8 {
        let bytes: Vec<u8> = grid.samples().iter().map(|&s| s as u8).collect();
        DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(bytes))
    } else {
        let words: Vec<u16> = grid.samples().to_vec();
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(words.into()))
    };
    obj.put(element);
    obj.write_to_file(out_path)
        .map_err(|e| write_err(e.to_string()))
}
