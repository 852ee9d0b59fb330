//! Image file I/O: format detection, loading and saving.

pub mod bmp;
#[cfg(feature = "fits")]
pub mod fits;
#[cfg(feature = "png")]
pub mod png;
pub mod tiff;

use std::path::Path;

use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat};

use self::tiff::TiffCompression;

/// Output format selector for [`save_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// 8-bit BMP (mono or RGB).
    Bmp8,
    /// 8-bit PNG (requires feature `png`).
    #[cfg(feature = "png")]
    Png8,
    /// 8-bit uncompressed TIFF.
    Tiff8,
    /// 8-bit LZW-compressed TIFF.
    Tiff8Lzw,
    /// 16-bit uncompressed TIFF.
    Tiff16,
    /// 16-bit Deflate-compressed TIFF.
    Tiff16Zip,
    /// 32-bit floating-point TIFF; float images are written unquantized.
    Tiff32f,
    /// 32-bit floating-point Deflate-compressed TIFF.
    Tiff32fZip,
    /// 8-bit FITS (requires feature `fits`).
    #[cfg(feature = "fits")]
    Fits8,
    /// 16-bit FITS.
    #[cfg(feature = "fits")]
    Fits16,
    /// 32-bit floating-point FITS.
    #[cfg(feature = "fits")]
    Fits32f,
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Loads an image, picking the codec from the file extension.
///
/// FITS float data is normalized (max scaled to 1.0) when
/// `normalize_fits` is set, clamped otherwise.
pub fn load_image(path: &Path, normalize_fits: bool) -> Result<Image> {
    let _ = normalize_fits;
    match extension_of(path).as_str() {
        "bmp" => bmp::load(path),
        "tif" | "tiff" => tiff::load(path),
        #[cfg(feature = "fits")]
        "fit" | "fits" => fits::load(path, normalize_fits),
        #[cfg(feature = "png")]
        "png" => png::load(path),
        other => Err(Error::format(format!("unrecognized image file extension: '{other}'"))),
    }
}

/// Reads image dimensions without decoding pixel data.
pub fn image_dimensions(path: &Path) -> Result<(u32, u32)> {
    match extension_of(path).as_str() {
        "bmp" => bmp::dimensions(path),
        "tif" | "tiff" => tiff::dimensions(path),
        #[cfg(feature = "fits")]
        "fit" | "fits" => fits::dimensions(path),
        #[cfg(feature = "png")]
        "png" => png::dimensions(path),
        other => Err(Error::format(format!("unrecognized image file extension: '{other}'"))),
    }
}

/// Saves `img` in the requested output format, converting the pixel
/// format when needed. 32-bit float formats keep `Mono32f`/`Rgb32f` data
/// without re-quantization.
pub fn save_image(img: &Image, path: &Path, format: OutputFormat) -> Result<()> {
    let is_mono = img.pixel_format().is_mono() || img.pixel_format() == PixelFormat::Pal8;
    let depth8 = if is_mono { PixelFormat::Mono8 } else { PixelFormat::Rgb8 };
    let depth16 = if is_mono { PixelFormat::Mono16 } else { PixelFormat::Rgb16 };
    let depth32f = if is_mono { PixelFormat::Mono32f } else { PixelFormat::Rgb32f };

    let converted_to = |target: PixelFormat| -> Result<Image> {
        if img.pixel_format() == target {
            Ok(img.clone())
        } else {
            img.convert_pixel_format(target)
        }
    };

    match format {
        OutputFormat::Bmp8 => {
            // palettized data is written as-is, with its palette
            if img.pixel_format() == PixelFormat::Pal8 {
                bmp::save(path, img)
            } else {
                bmp::save(path, &converted_to(depth8)?)
            }
        }
        #[cfg(feature = "png")]
        OutputFormat::Png8 => png::save(path, &converted_to(depth8)?),
        OutputFormat::Tiff8 => tiff::save(path, &converted_to(depth8)?, TiffCompression::None),
        OutputFormat::Tiff8Lzw => tiff::save(path, &converted_to(depth8)?, TiffCompression::Lzw),
        OutputFormat::Tiff16 => tiff::save(path, &converted_to(depth16)?, TiffCompression::None),
        OutputFormat::Tiff16Zip => {
            tiff::save(path, &converted_to(depth16)?, TiffCompression::Deflate)
        }
        OutputFormat::Tiff32f => tiff::save(path, &converted_to(depth32f)?, TiffCompression::None),
        OutputFormat::Tiff32fZip => {
            tiff::save(path, &converted_to(depth32f)?, TiffCompression::Deflate)
        }
        #[cfg(feature = "fits")]
        OutputFormat::Fits8 => fits::save(path, &converted_to(PixelFormat::Mono8)?),
        #[cfg(feature = "fits")]
        OutputFormat::Fits16 => fits::save(path, &converted_to(PixelFormat::Mono16)?),
        #[cfg(feature = "fits")]
        OutputFormat::Fits32f => fits::save(path, &converted_to(PixelFormat::Mono32f)?),
    }
}

/// Default output format matching an input file's container.
pub fn matching_output_format(path: &Path) -> OutputFormat {
    match extension_of(path).as_str() {
        "bmp" => OutputFormat::Bmp8,
        #[cfg(feature = "fits")]
        "fit" | "fits" => OutputFormat::Fits16,
        #[cfg(feature = "png")]
        "png" => OutputFormat::Png8,
        _ => OutputFormat::Tiff16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bmp_to_tiff16_scales_by_shift() {
        let dir = tempdir().unwrap();
        let bmp_path = dir.path().join("test.bmp");
        let tif_path = dir.path().join("out.tif");

        let mut img = Image::new(3, 2, PixelFormat::Mono8);
        img.row_mut(0).copy_from_slice(&[0, 127, 255]);
        img.row_mut(1).copy_from_slice(&[10, 20, 30]);
        bmp::save(&bmp_path, &img).unwrap();

        let loaded = load_image(&bmp_path, false).unwrap();
        save_image(&loaded, &tif_path, OutputFormat::Tiff16).unwrap();

        let reloaded = load_image(&tif_path, false).unwrap();
        assert_eq!(reloaded.pixel_format(), PixelFormat::Mono16);
        assert_eq!(reloaded.row_as::<u16>(0), &[0, 32639, 65535]);
        assert_eq!(reloaded.row_as::<u16>(1), &[2570, 5140, 7710]);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert!(load_image(Path::new("image.xyz"), false).is_err());
    }
}
