//! Pixel format conversion.
//!
//! Channel values are rescaled between bit depths (`u8 ↔ u16` by an 8-bit
//! shift, integer ↔ float by normalization against the integer maximum);
//! mono replicates into RGB, RGB averages into mono, BGR(A) permutes into
//! RGB order and `Pal8` goes through the palette. Converting *into* `Pal8`
//! is rejected. Out-of-range float inputs are clamped to `[0, 1]`.

use super::buffer::{row_as, row_as_mut, PixelBuffer, SimpleBuffer};
use super::format::PixelFormat;
use super::{Image, Rect};
use crate::error::{Error, Result};

impl Image {
    /// Returns a copy of the image converted to `dest_format`.
    pub fn convert_pixel_format(&self, dest_format: PixelFormat) -> Result<Image> {
        self.convert_pixel_format_fragment(dest_format, self.rect())
    }

    /// Converts a rectangular fragment into a new image of `dest_format`.
    pub fn convert_pixel_format_fragment(
        &self,
        dest_format: PixelFormat,
        rect: Rect,
    ) -> Result<Image> {
        if dest_format == PixelFormat::Pal8 && self.pixel_format() != PixelFormat::Pal8 {
            return Err(Error::invalid_arg("cannot convert into a palettized format"));
        }
        if !self.rect().contains_rect(&rect) {
            return Err(Error::invalid_arg("conversion fragment exceeds image bounds"));
        }

        let src_fmt = self.pixel_format();
        let mut dest = SimpleBuffer::new(rect.width, rect.height, dest_format);

        if src_fmt == dest_format {
            let bpp = src_fmt.bytes_per_pixel();
            for j in 0..rect.height {
                let src_row = self.row(j + rect.y as u32);
                let x0 = rect.x as usize * bpp;
                dest.row_mut(j)
                    .copy_from_slice(&src_row[x0..x0 + rect.width as usize * bpp]);
            }
            if let (Some(dst_pal), Some(src_pal)) = (dest.palette_mut(), self.palette()) {
                *dst_pal = src_pal.clone();
            }
            return Ok(Image::from_buffer(Box::new(dest)));
        }

        for j in 0..rect.height {
            let src_row = self.row(j + rect.y as u32);
            let dest_row = dest.row_mut(j);
            convert_row(
                src_fmt,
                dest_format,
                src_row,
                rect.x as usize,
                rect.width as usize,
                dest_row,
                self.palette().map(|p| &p.0),
            )?;
        }

        Ok(Image::from_buffer(Box::new(dest)))
    }
}

// Intermediate per-pixel representation: RGB f32 in [0, 1]. All conversion
// pairs funnel through it except the exact integer shifts, which take the
// direct path below to stay lossless.
fn convert_row(
    src_fmt: PixelFormat,
    dest_fmt: PixelFormat,
    src: &[u8],
    x0: usize,
    width: usize,
    dest: &mut [u8],
    palette: Option<&[u8; 768]>,
) -> Result<()> {
    if let Some(()) = try_direct_integer_path(src_fmt, dest_fmt, src, x0, width, dest) {
        return Ok(());
    }

    for i in 0..width {
        let (r, g, b) = read_pixel_rgb(src_fmt, src, x0 + i, palette)?;
        write_pixel_rgb(dest_fmt, dest, i, r, g, b);
    }
    Ok(())
}

/// Widens an 8-bit value by replicating its byte into both halves, the
/// exact equivalent of scaling by 65535/255.
#[inline]
fn widen8(v: u8) -> u16 {
    u16::from_le_bytes([v, v])
}

/// Lossless integer-to-integer conversions bypass the float intermediate.
fn try_direct_integer_path(
    src_fmt: PixelFormat,
    dest_fmt: PixelFormat,
    src: &[u8],
    x0: usize,
    width: usize,
    dest: &mut [u8],
) -> Option<()> {
    use PixelFormat::*;
    match (src_fmt, dest_fmt) {
        (Mono8, Mono16) => {
            let d = row_as_mut::<u16>(dest);
            for i in 0..width {
                d[i] = widen8(src[x0 + i]);
            }
        }
        (Mono16, Mono8) => {
            let s = row_as::<u16>(src);
            for i in 0..width {
                dest[i] = (s[x0 + i] >> 8) as u8;
            }
        }
        (Mono8, Rgb8) => {
            for i in 0..width {
                let v = src[x0 + i];
                dest[3 * i] = v;
                dest[3 * i + 1] = v;
                dest[3 * i + 2] = v;
            }
        }
        (Mono8, Rgb16) => {
            let d = row_as_mut::<u16>(dest);
            for i in 0..width {
                let v = widen8(src[x0 + i]);
                d[3 * i] = v;
                d[3 * i + 1] = v;
                d[3 * i + 2] = v;
            }
        }
        (Mono16, Rgb16) => {
            let s = row_as::<u16>(src);
            let d = row_as_mut::<u16>(dest);
            for i in 0..width {
                let v = s[x0 + i];
                d[3 * i] = v;
                d[3 * i + 1] = v;
                d[3 * i + 2] = v;
            }
        }
        (Rgb8, Rgb16) => {
            let d = row_as_mut::<u16>(dest);
            for i in 0..3 * width {
                d[i] = widen8(src[3 * x0 + i]);
            }
        }
        (Rgb16, Rgb8) => {
            let s = row_as::<u16>(src);
            for i in 0..3 * width {
                dest[i] = (s[3 * x0 + i] >> 8) as u8;
            }
        }
        (Rgb8, Mono8) => {
            for i in 0..width {
                let s = &src[3 * (x0 + i)..];
                dest[i] = ((s[0] as u32 + s[1] as u32 + s[2] as u32) / 3) as u8;
            }
        }
        (Rgb16, Mono16) => {
            let s = row_as::<u16>(src);
            let d = row_as_mut::<u16>(dest);
            for i in 0..width {
                let p = &s[3 * (x0 + i)..];
                d[i] = ((p[0] as u32 + p[1] as u32 + p[2] as u32) / 3) as u16;
            }
        }
        (Rgb8, Bgr8) | (Bgr8, Rgb8) => {
            for i in 0..width {
                let s = &src[3 * (x0 + i)..3 * (x0 + i) + 3];
                dest[3 * i] = s[2];
                dest[3 * i + 1] = s[1];
                dest[3 * i + 2] = s[0];
            }
        }
        (Rgba8, Rgb8) => {
            for i in 0..width {
                let s = &src[4 * (x0 + i)..];
                dest[3 * i] = s[0];
                dest[3 * i + 1] = s[1];
                dest[3 * i + 2] = s[2];
            }
        }
        (Bgra8, Rgb8) => {
            for i in 0..width {
                let s = &src[4 * (x0 + i)..];
                dest[3 * i] = s[2];
                dest[3 * i + 1] = s[1];
                dest[3 * i + 2] = s[0];
            }
        }
        _ => return None,
    }
    Some(())
}

fn read_pixel_rgb(
    fmt: PixelFormat,
    src: &[u8],
    x: usize,
    palette: Option<&[u8; 768]>,
) -> Result<(f32, f32, f32)> {
    use PixelFormat::*;
    let px = match fmt {
        Pal8 => {
            let pal = palette
                .ok_or_else(|| Error::Internal("palettized buffer without palette".into()))?;
            let idx = src[x] as usize;
            (
                pal[3 * idx] as f32 / 255.0,
                pal[3 * idx + 1] as f32 / 255.0,
                pal[3 * idx + 2] as f32 / 255.0,
            )
        }
        Mono8 => {
            let v = src[x] as f32 / 255.0;
            (v, v, v)
        }
        Mono16 => {
            let v = row_as::<u16>(src)[x] as f32 / 65535.0;
            (v, v, v)
        }
        Mono32f => {
            let v = row_as::<f32>(src)[x].clamp(0.0, 1.0);
            (v, v, v)
        }
        Rgb8 => {
            let s = &src[3 * x..];
            (s[0] as f32 / 255.0, s[1] as f32 / 255.0, s[2] as f32 / 255.0)
        }
        Bgr8 => {
            let s = &src[3 * x..];
            (s[2] as f32 / 255.0, s[1] as f32 / 255.0, s[0] as f32 / 255.0)
        }
        Rgba8 => {
            let s = &src[4 * x..];
            (s[0] as f32 / 255.0, s[1] as f32 / 255.0, s[2] as f32 / 255.0)
        }
        Bgra8 => {
            let s = &src[4 * x..];
            (s[2] as f32 / 255.0, s[1] as f32 / 255.0, s[0] as f32 / 255.0)
        }
        Rgb16 => {
            let s = &row_as::<u16>(src)[3 * x..];
            (
                s[0] as f32 / 65535.0,
                s[1] as f32 / 65535.0,
                s[2] as f32 / 65535.0,
            )
        }
        Rgba16 => {
            let s = &row_as::<u16>(src)[4 * x..];
            (
                s[0] as f32 / 65535.0,
                s[1] as f32 / 65535.0,
                s[2] as f32 / 65535.0,
            )
        }
        Rgb32f => {
            let s = &row_as::<f32>(src)[3 * x..];
            (s[0].clamp(0.0, 1.0), s[1].clamp(0.0, 1.0), s[2].clamp(0.0, 1.0))
        }
        Rgba32f => {
            let s = &row_as::<f32>(src)[4 * x..];
            (s[0].clamp(0.0, 1.0), s[1].clamp(0.0, 1.0), s[2].clamp(0.0, 1.0))
        }
    };
    Ok(px)
}

fn write_pixel_rgb(fmt: PixelFormat, dest: &mut [u8], x: usize, r: f32, g: f32, b: f32) {
    use PixelFormat::*;
    // RGB collapses into mono by averaging the three channels.
    let mono = (r + g + b) / 3.0;
    match fmt {
        Pal8 => unreachable!("conversion into Pal8 is rejected earlier"),
        Mono8 => dest[x] = (mono * 255.0) as u8,
        Mono16 => row_as_mut::<u16>(dest)[x] = (mono * 65535.0) as u16,
        Mono32f => row_as_mut::<f32>(dest)[x] = mono,
        Rgb8 => {
            dest[3 * x] = (r * 255.0) as u8;
            dest[3 * x + 1] = (g * 255.0) as u8;
            dest[3 * x + 2] = (b * 255.0) as u8;
        }
        Bgr8 => {
            dest[3 * x] = (b * 255.0) as u8;
            dest[3 * x + 1] = (g * 255.0) as u8;
            dest[3 * x + 2] = (r * 255.0) as u8;
        }
        Rgba8 => {
            dest[4 * x] = (r * 255.0) as u8;
            dest[4 * x + 1] = (g * 255.0) as u8;
            dest[4 * x + 2] = (b * 255.0) as u8;
            dest[4 * x + 3] = 0xFF;
        }
        Bgra8 => {
            dest[4 * x] = (b * 255.0) as u8;
            dest[4 * x + 1] = (g * 255.0) as u8;
            dest[4 * x + 2] = (r * 255.0) as u8;
            dest[4 * x + 3] = 0xFF;
        }
        Rgb16 => {
            let d = row_as_mut::<u16>(dest);
            d[3 * x] = (r * 65535.0) as u16;
            d[3 * x + 1] = (g * 65535.0) as u16;
            d[3 * x + 2] = (b * 65535.0) as u16;
        }
        Rgba16 => {
            let d = row_as_mut::<u16>(dest);
            d[4 * x] = (r * 65535.0) as u16;
            d[4 * x + 1] = (g * 65535.0) as u16;
            d[4 * x + 2] = (b * 65535.0) as u16;
            d[4 * x + 3] = 0xFFFF;
        }
        Rgb32f => {
            let d = row_as_mut::<f32>(dest);
            d[3 * x] = r;
            d[3 * x + 1] = g;
            d[3 * x + 2] = b;
        }
        Rgba32f => {
            let d = row_as_mut::<f32>(dest);
            d[4 * x] = r;
            d[4 * x + 1] = g;
            d[4 * x + 2] = b;
            d[4 * x + 3] = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Palette;

    #[test]
    fn mono8_to_mono16_widens_exactly() {
        let mut img = Image::new(3, 1, PixelFormat::Mono8);
        img.row_mut(0).copy_from_slice(&[0, 10, 255]);
        let conv = img.convert_pixel_format(PixelFormat::Mono16).unwrap();
        assert_eq!(conv.row_as::<u16>(0), &[0, 2570, 65535]);

        // and narrows back without loss
        let back = conv.convert_pixel_format(PixelFormat::Mono8).unwrap();
        assert_eq!(back.row(0), img.row(0));
    }

    #[test]
    fn round_trip_same_bit_depth_is_identity() {
        let mut img = Image::new(2, 2, PixelFormat::Rgb8);
        for r in 0..2 {
            for v in img.row_mut(r).iter_mut().enumerate() {
                *v.1 = (37 * (v.0 + 1) + r as usize) as u8;
            }
        }
        let there = img.convert_pixel_format(PixelFormat::Bgr8).unwrap();
        let back = there.convert_pixel_format(PixelFormat::Rgb8).unwrap();
        for r in 0..2 {
            assert_eq!(img.row(r), back.row(r));
        }
    }

    #[test]
    fn mono_to_rgb_replicates() {
        let mut img = Image::new(1, 1, PixelFormat::Mono8);
        img.row_mut(0)[0] = 200;
        let rgb = img.convert_pixel_format(PixelFormat::Rgb8).unwrap();
        assert_eq!(rgb.row(0), &[200, 200, 200]);
    }

    #[test]
    fn rgb_to_mono_averages() {
        let mut img = Image::new(1, 1, PixelFormat::Rgb32f);
        img.row_as_mut::<f32>(0).copy_from_slice(&[0.3, 0.6, 0.9]);
        let mono = img.convert_pixel_format(PixelFormat::Mono32f).unwrap();
        assert!((mono.row_as::<f32>(0)[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_float_is_clamped() {
        let mut img = Image::new(2, 1, PixelFormat::Mono32f);
        img.row_as_mut::<f32>(0).copy_from_slice(&[-0.5, 1.5]);
        let m8 = img.convert_pixel_format(PixelFormat::Mono8).unwrap();
        assert_eq!(m8.row(0), &[0, 255]);
    }

    #[test]
    fn pal8_goes_through_palette() {
        let mut img = Image::new(1, 1, PixelFormat::Pal8);
        let mut pal = Palette::gray_ramp();
        pal.0[3 * 5] = 255;
        pal.0[3 * 5 + 1] = 0;
        pal.0[3 * 5 + 2] = 0;
        *img.buffer_mut().palette_mut().unwrap() = pal;
        img.row_mut(0)[0] = 5;
        let rgb = img.convert_pixel_format(PixelFormat::Rgb8).unwrap();
        assert_eq!(rgb.row(0), &[255, 0, 0]);
    }

    #[test]
    fn conversion_into_pal8_is_rejected() {
        let img = Image::new(1, 1, PixelFormat::Rgb8);
        assert!(img.convert_pixel_format(PixelFormat::Pal8).is_err());
    }

    #[test]
    fn fragment_conversion() {
        let mut img = Image::new(4, 2, PixelFormat::Mono8);
        img.row_mut(1).copy_from_slice(&[1, 2, 3, 4]);
        let frag = img
            .convert_pixel_format_fragment(PixelFormat::Mono16, Rect::new(1, 1, 2, 1))
            .unwrap();
        assert_eq!(frag.row_as::<u16>(0), &[2 << 8, 3 << 8]);
    }
}
