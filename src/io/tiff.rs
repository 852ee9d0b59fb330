//! TIFF codec, built on the `tiff` crate.
//!
//! Loading accepts uncompressed grayscale and RGB images of 8 or 16 bits
//! per sample (plus 32-bit float, which the saver also emits);
//! `WhiteIsZero` grayscale is inverted on read so that zero is black.
//! Saving writes a single chunky-layout IFD, optionally LZW- or
//! Deflate-compressed.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::debug;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, Compression, TiffEncoder};
use tiff::tags::Tag;

use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat};

const COMPRESSION_NONE: u32 = 1;
const PHOTOMETRIC_WHITE_IS_ZERO: u32 = 0;

/// Compression applied by [`save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiffCompression {
    None,
    Lzw,
    Deflate,
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    Decoder::new(BufReader::new(file))
        .map_err(|e| Error::format(format!("cannot decode TIFF: {e}")))
}

pub fn load(path: &Path) -> Result<Image> {
    let mut decoder = open_decoder(path)?;

    let compression = decoder
        .find_tag(Tag::Compression)
        .ok()
        .flatten()
        .and_then(|v| v.into_u32().ok())
        .unwrap_or(COMPRESSION_NONE);
    if compression != COMPRESSION_NONE {
        return Err(Error::format("compressed TIFF input is not supported"));
    }

    let white_is_zero = decoder
        .find_tag(Tag::PhotometricInterpretation)
        .ok()
        .flatten()
        .and_then(|v| v.into_u32().ok())
        == Some(PHOTOMETRIC_WHITE_IS_ZERO);

    let (width, height) = decoder
        .dimensions()
        .map_err(|e| Error::format(format!("cannot read TIFF dimensions: {e}")))?;

    let data = decoder
        .read_image()
        .map_err(|e| Error::format(format!("cannot read TIFF image data: {e}")))?;

    debug!("loading TIFF {}: {width}x{height}", path.display());

    // Heterogeneous per-channel bit depths are rejected by the decoder
    // itself; what reaches us is homogeneous.
    let mut img = match data {
        DecodingResult::U8(values) => {
            let format = mono_or_rgb(width, height, values.len(), PixelFormat::Mono8, PixelFormat::Rgb8)?;
            image_from_samples::<u8>(width, height, format, &values)
        }
        DecodingResult::U16(values) => {
            let format =
                mono_or_rgb(width, height, values.len(), PixelFormat::Mono16, PixelFormat::Rgb16)?;
            image_from_samples::<u16>(width, height, format, &values)
        }
        DecodingResult::F32(values) => {
            let format =
                mono_or_rgb(width, height, values.len(), PixelFormat::Mono32f, PixelFormat::Rgb32f)?;
            image_from_samples::<f32>(width, height, format, &values)
        }
        _ => return Err(Error::format("unsupported TIFF bit depth")),
    };

    if white_is_zero {
        invert_grayscale(&mut img);
    }

    Ok(img)
}

fn mono_or_rgb(
    width: u32,
    height: u32,
    num_samples: usize,
    mono: PixelFormat,
    rgb: PixelFormat,
) -> Result<PixelFormat> {
    match num_samples / (width as usize * height as usize) {
        1 => Ok(mono),
        3 => Ok(rgb),
        _ => Err(Error::format("unsupported TIFF sample count")),
    }
}

fn image_from_samples<T: bytemuck::Pod>(
    width: u32,
    height: u32,
    format: PixelFormat,
    samples: &[T],
) -> Image {
    let per_row = width as usize * format.num_channels();
    let mut img = Image::new(width, height, format);
    for y in 0..height {
        img.row_as_mut::<T>(y)
            .copy_from_slice(&samples[y as usize * per_row..(y as usize + 1) * per_row]);
    }
    img
}

fn invert_grayscale(img: &mut Image) {
    match img.pixel_format() {
        PixelFormat::Mono8 => {
            for y in 0..img.height() {
                for v in img.row_mut(y) {
                    *v = 0xFF - *v;
                }
            }
        }
        PixelFormat::Mono16 => {
            for y in 0..img.height() {
                for v in img.row_as_mut::<u16>(y) {
                    *v = 0xFFFF - *v;
                }
            }
        }
        _ => {}
    }
}

pub fn save(path: &Path, img: &Image, compression: TiffCompression) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))
        .map_err(|e| Error::format(format!("cannot create TIFF encoder: {e}")))?
        .with_compression(match compression {
            TiffCompression::None => Compression::Uncompressed,
            TiffCompression::Lzw => Compression::Lzw,
            TiffCompression::Deflate => Compression::Deflate(Default::default()),
        });

    let (w, h) = (img.width(), img.height());
    let enc_err = |e| Error::format(format!("cannot encode TIFF: {e}"));

    match img.pixel_format() {
        PixelFormat::Mono8 => encoder
            .write_image::<colortype::Gray8>(w, h, &collect_samples::<u8>(img))
            .map_err(enc_err)?,
        PixelFormat::Mono16 => encoder
            .write_image::<colortype::Gray16>(w, h, &collect_samples::<u16>(img))
            .map_err(enc_err)?,
        PixelFormat::Mono32f => encoder
            .write_image::<colortype::Gray32Float>(w, h, &collect_samples::<f32>(img))
            .map_err(enc_err)?,
        PixelFormat::Rgb8 => encoder
            .write_image::<colortype::RGB8>(w, h, &collect_samples::<u8>(img))
            .map_err(enc_err)?,
        PixelFormat::Rgb16 => encoder
            .write_image::<colortype::RGB16>(w, h, &collect_samples::<u16>(img))
            .map_err(enc_err)?,
        PixelFormat::Rgb32f => encoder
            .write_image::<colortype::RGB32Float>(w, h, &collect_samples::<f32>(img))
            .map_err(enc_err)?,
        other => return Err(Error::invalid_arg(format!("cannot save {other:?} as TIFF"))),
    }

    Ok(())
}

// Rows may be padded in the buffer; the encoder expects them contiguous.
fn collect_samples<T: bytemuck::Pod>(img: &Image) -> Vec<T> {
    let per_row = img.width() as usize * img.pixel_format().num_channels();
    let mut out = Vec::with_capacity(per_row * img.height() as usize);
    for y in 0..img.height() {
        out.extend_from_slice(&img.row_as::<T>(y)[..per_row]);
    }
    out
}

pub fn dimensions(path: &Path) -> Result<(u32, u32)> {
    let mut decoder = open_decoder(path)?;
    decoder
        .dimensions()
        .map_err(|e| Error::format(format!("cannot read TIFF dimensions: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn round_trip(img: &Image, compression: TiffCompression) -> Image {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.tif");
        save(&path, img, compression).unwrap();
        load(&path).unwrap()
    }

    #[test]
    fn mono16_round_trip() {
        let mut img = Image::new(3, 2, PixelFormat::Mono16);
        img.row_as_mut::<u16>(0).copy_from_slice(&[0, 32640, 65535]);
        img.row_as_mut::<u16>(1).copy_from_slice(&[2570, 5140, 7710]);

        let loaded = round_trip(&img, TiffCompression::None);
        assert_eq!(loaded.pixel_format(), PixelFormat::Mono16);
        assert_eq!(loaded.row_as::<u16>(0), img.row_as::<u16>(0));
        assert_eq!(loaded.row_as::<u16>(1), img.row_as::<u16>(1));
    }

    #[test]
    fn rgb8_round_trip() {
        let mut img = Image::new(2, 1, PixelFormat::Rgb8);
        img.row_mut(0).copy_from_slice(&[5, 10, 15, 200, 100, 50]);
        let loaded = round_trip(&img, TiffCompression::None);
        assert_eq!(loaded.pixel_format(), PixelFormat::Rgb8);
        assert_eq!(loaded.row(0), img.row(0));
    }

    #[test]
    fn float_round_trip_preserves_values() {
        let mut img = Image::new(2, 1, PixelFormat::Mono32f);
        img.row_as_mut::<f32>(0).copy_from_slice(&[0.125, 0.75]);
        let loaded = round_trip(&img, TiffCompression::None);
        assert_eq!(loaded.pixel_format(), PixelFormat::Mono32f);
        assert_eq!(loaded.row_as::<f32>(0), img.row_as::<f32>(0));
    }

    #[test]
    fn compressed_output_is_rejected_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.tif");
        let mut img = Image::new(8, 8, PixelFormat::Mono8);
        for y in 0..8 {
            img.row_mut(y).fill(y as u8 * 10);
        }
        save(&path, &img, TiffCompression::Lzw).unwrap();
        assert!(matches!(load(&path), Err(Error::Format(_))));
    }

    #[test]
    fn dimensions_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.tif");
        save(&path, &Image::new(7, 5, PixelFormat::Mono8), TiffCompression::None).unwrap();
        assert_eq!(dimensions(&path).unwrap(), (7, 5));
    }
}
