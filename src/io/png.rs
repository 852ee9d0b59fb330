//! PNG adapter built on the `image` crate (feature `png`).

use std::path::Path;

use image::{DynamicImage, ImageBuffer};

use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat};

pub fn load(path: &Path) -> Result<Image> {
    let dynamic = image::open(path).map_err(|e| Error::format(format!("cannot decode PNG: {e}")))?;

    let (width, height) = (dynamic.width(), dynamic.height());
    let img = match dynamic {
        DynamicImage::ImageLuma8(buf) => {
            let mut img = Image::new(width, height, PixelFormat::Mono8);
            for y in 0..height {
                let start = (y * width) as usize;
                img.row_mut(y).copy_from_slice(&buf.as_raw()[start..start + width as usize]);
            }
            img
        }
        DynamicImage::ImageLuma16(buf) => {
            let mut img = Image::new(width, height, PixelFormat::Mono16);
            for y in 0..height {
                let start = (y * width) as usize;
                img.row_as_mut::<u16>(y)
                    .copy_from_slice(&buf.as_raw()[start..start + width as usize]);
            }
            img
        }
        other => {
            // everything else funnels through 8-bit RGB
            let rgb = other.to_rgb8();
            let mut img = Image::new(width, height, PixelFormat::Rgb8);
            for y in 0..height {
                let start = (y * width * 3) as usize;
                img.row_mut(y)
                    .copy_from_slice(&rgb.as_raw()[start..start + 3 * width as usize]);
            }
            img
        }
    };
    Ok(img)
}

pub fn save(path: &Path, img: &Image) -> Result<()> {
    let enc_err = |e| Error::format(format!("cannot encode PNG: {e}"));
    match img.pixel_format() {
        PixelFormat::Mono8 => {
            let mut data = Vec::with_capacity((img.width() * img.height()) as usize);
            for y in 0..img.height() {
                data.extend_from_slice(img.row(y));
            }
            let buf: ImageBuffer<image::Luma<u8>, _> =
                ImageBuffer::from_raw(img.width(), img.height(), data)
                    .ok_or_else(|| Error::Internal("PNG buffer size mismatch".into()))?;
            buf.save(path).map_err(enc_err)
        }
        PixelFormat::Rgb8 => {
            let mut data = Vec::with_capacity((3 * img.width() * img.height()) as usize);
            for y in 0..img.height() {
                data.extend_from_slice(img.row(y));
            }
            let buf: ImageBuffer<image::Rgb<u8>, _> =
                ImageBuffer::from_raw(img.width(), img.height(), data)
                    .ok_or_else(|| Error::Internal("PNG buffer size mismatch".into()))?;
            buf.save(path).map_err(enc_err)
        }
        other => Err(Error::invalid_arg(format!("cannot save {other:?} as PNG"))),
    }
}

pub fn dimensions(path: &Path) -> Result<(u32, u32)> {
    image::image_dimensions(path).map_err(|e| Error::format(format!("cannot probe PNG: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mono8_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.png");

        let mut img = Image::new(3, 2, PixelFormat::Mono8);
        img.row_mut(0).copy_from_slice(&[0, 127, 255]);
        img.row_mut(1).copy_from_slice(&[10, 20, 30]);
        save(&path, &img).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.pixel_format(), PixelFormat::Mono8);
        assert_eq!(loaded.row(0), img.row(0));
        assert_eq!(loaded.row(1), img.row(1));
        assert_eq!(dimensions(&path).unwrap(), (3, 2));
    }
}
