//! Single z-plane decoding for the preview.
//!
//! Only 16-bit grayscale is composited; 8-bit planes are widened and float
//! planes saturate into the `u16` range.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::Path;

use common::file_utils::{has_extension, RAW_EXTENSIONS, TIFF_EXTENSIONS};
use common::Buffer2;
use tiff::decoder::{Decoder, DecodingResult, Limits};

use crate::error::{Error, Result};

/// Raw planes start with little-endian `u32` width and height.
const RAW_HEADER_LEN: usize = 8;

/// Loads one plane. Implemented for disk files by [`FilePlaneSource`]; tests
/// and front-ends with their own caches may supply another.
pub trait PlaneSource: Send + Sync {
    fn load(&self, path: &Path) -> Result<Buffer2<u16>>;

    /// Illumination profile of a flat file, see [`read_flat_profile`].
    fn load_flat_profile(&self, path: &Path) -> Result<Vec<f32>> {
        read_flat_profile(path)
    }
}

/// Reads `.raw` and `.tif`/`.tiff` planes from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilePlaneSource;

impl PlaneSource for FilePlaneSource {
    fn load(&self, path: &Path) -> Result<Buffer2<u16>> {
        read_plane(path)
    }
}

pub fn read_plane(path: &Path) -> Result<Buffer2<u16>> {
    if has_extension(path, RAW_EXTENSIONS) {
        read_raw_plane(path)
    } else if has_extension(path, TIFF_EXTENSIONS) {
        read_tiff_plane(path)
    } else {
        Err(Error::PlaneDecode {
            path: path.to_path_buf(),
            reason: "unsupported extension".to_string(),
        })
    }
}

pub fn read_raw_plane(path: &Path) -> Result<Buffer2<u16>> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    let decode_error = |reason: String| Error::PlaneDecode {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < RAW_HEADER_LEN {
        return Err(decode_error(format!(
            "file is {} bytes, shorter than the header",
            bytes.len()
        )));
    }
    let header: [u32; 2] = bytemuck::pod_read_unaligned(&bytes[..RAW_HEADER_LEN]);
    let width = u32::from_le(header[0]) as usize;
    let height = u32::from_le(header[1]) as usize;

    let body = &bytes[RAW_HEADER_LEN..];
    let Some(expected) = width.checked_mul(height).and_then(|n| n.checked_mul(2)) else {
        return Err(decode_error(format!("{width}x{height} plane is too large")));
    };
    if body.len() < expected {
        return Err(decode_error(format!(
            "{width}x{height} plane needs {expected} bytes, found {}",
            body.len()
        )));
    }

    let pixels: Vec<u16> = bytemuck::pod_collect_to_vec::<u8, u16>(&body[..expected])
        .into_iter()
        .map(u16::from_le)
        .collect();
    Ok(Buffer2::new(width, height, pixels))
}

pub fn read_tiff_plane(path: &Path) -> Result<Buffer2<u16>> {
    let tiff_error = |source: tiff::TiffError| Error::Tiff {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(tiff_error)?
        .with_limits(Limits::unlimited());

    match decoder.colortype().map_err(tiff_error)? {
        tiff::ColorType::Gray(_) => {}
        other => {
            return Err(Error::PlaneDecode {
                path: path.to_path_buf(),
                reason: format!("expected a grayscale plane, found {other:?}"),
            });
        }
    }

    let (width, height) = decoder.dimensions().map_err(tiff_error)?;
    let pixels: Vec<u16> = match decoder.read_image().map_err(tiff_error)? {
        DecodingResult::U8(buf) => buf.into_iter().map(u16::from).collect(),
        DecodingResult::U16(buf) => buf,
        DecodingResult::F32(buf) => buf
            .into_iter()
            .map(|v| v.clamp(0.0, u16::MAX as f32) as u16)
            .collect(),
        _ => {
            return Err(Error::PlaneDecode {
                path: path.to_path_buf(),
                reason: "unsupported TIFF sample format".to_string(),
            });
        }
    };

    Ok(Buffer2::new(width as usize, height as usize, pixels))
}

/// First column of a flat-field image, top to bottom, as `f32`. Flats are
/// constant along X, so one column is the whole profile.
pub fn read_flat_profile(path: &Path) -> Result<Vec<f32>> {
    let tiff_error = |source: tiff::TiffError| Error::Tiff {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(tiff_error)?
        .with_limits(Limits::unlimited());
    let (width, height) = decoder.dimensions().map_err(tiff_error)?;
    let samples: Vec<f32> = match decoder.read_image().map_err(tiff_error)? {
        DecodingResult::U8(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::F32(buf) => buf,
        DecodingResult::F64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        _ => {
            return Err(Error::PlaneDecode {
                path: path.to_path_buf(),
                reason: "unsupported flat sample format".to_string(),
            });
        }
    };

    let (width, height) = (width as usize, height as usize);
    let channels = samples.len() / (width * height).max(1);
    if width == 0 || height == 0 || channels == 0 {
        return Err(Error::PlaneDecode {
            path: path.to_path_buf(),
            reason: format!("{width}x{height} flat has no samples"),
        });
    }
    Ok((0..height).map(|y| samples[y * width * channels]).collect())
}

/// `rows` divisor values for a tile whose flat is shifted by `offset_px`
/// rows: row `r` takes `profile[r - offset_px]`, and rows shifted past either
/// end repeat the edge value.
pub fn shifted_divisor(profile: &[f32], offset_px: i64, rows: usize) -> Vec<f32> {
    let Some(last) = profile.len().checked_sub(1) else {
        return vec![1.0; rows];
    };
    (0..rows as i64)
        .map(|r| profile[(r - offset_px).clamp(0, last as i64) as usize])
        .collect()
}

/// Width and height of a plane, without decoding its pixels.
pub fn read_plane_dimensions(path: &Path) -> Result<(usize, usize)> {
    if has_extension(path, RAW_EXTENSIONS) {
        let mut header = [0u8; RAW_HEADER_LEN];
        let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
        file.read_exact(&mut header).map_err(|e| Error::io(path, e))?;
        let header: [u32; 2] = bytemuck::pod_read_unaligned(&header);
        return Ok((u32::from_le(header[0]) as usize, u32::from_le(header[1]) as usize));
    }

    let tiff_error = |source: tiff::TiffError| Error::Tiff {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(tiff_error)?;
    let (width, height) = decoder.dimensions().map_err(tiff_error)?;
    Ok((width as usize, height as usize))
}

/// Writes a 32-bit float grayscale TIFF, the format flats are stored in.
pub fn write_flat_tiff(path: &Path, flat: &Buffer2<f32>) -> Result<()> {
    let tiff_error = |source: tiff::TiffError| Error::Tiff {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut encoder =
        tiff::encoder::TiffEncoder::new(BufWriter::new(file)).map_err(tiff_error)?;
    encoder
        .write_image::<tiff::encoder::colortype::Gray32Float>(
            flat.width() as u32,
            flat.height() as u32,
            flat.pixels(),
        )
        .map_err(tiff_error)?;
    Ok(())
}

/// Writes a headered raw plane.
pub fn write_raw_plane(path: &Path, plane: &Buffer2<u16>) -> Result<()> {
    let mut bytes = Vec::with_capacity(RAW_HEADER_LEN + plane.len() * 2);
    bytes.extend_from_slice(&(plane.width() as u32).to_le_bytes());
    bytes.extend_from_slice(&(plane.height() as u32).to_le_bytes());
    for v in plane.pixels() {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    std::fs::write(path, bytes).map_err(|e| Error::io(path, e))
}

/// Writes a 16-bit grayscale TIFF plane.
pub fn write_tiff_plane(path: &Path, plane: &Buffer2<u16>) -> Result<()> {
    let tiff_error = |source: tiff::TiffError| Error::Tiff {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut encoder =
        tiff::encoder::TiffEncoder::new(BufWriter::new(file)).map_err(tiff_error)?;
    encoder
        .write_image::<tiff::encoder::colortype::Gray16>(
            plane.width() as u32,
            plane.height() as u32,
            plane.pixels(),
        )
        .map_err(tiff_error)?;
    Ok(())
}
