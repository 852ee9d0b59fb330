//! Whole-image operations: copying, sub-pixel translation, channel
//! splitting/combining, blending and normalization.

use rayon::prelude::*;

use super::buffer::{row_as, row_as_mut};
use super::format::PixelFormat;
use super::{Image, Rect};
use crate::error::{Error, Result};

impl Image {
    /// Fills the buffer with zero bytes.
    pub fn clear_to_zero(&mut self) {
        for r in 0..self.height() {
            self.row_mut(r).fill(0);
        }
    }

    /// Copies a `width x height` rectangle from `src` at `(src_x, src_y)`
    /// into `dest` at `(dest_x, dest_y)`. Formats must match.
    pub fn copy_rect(
        src: &Image,
        dest: &mut Image,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
        dest_x: u32,
        dest_y: u32,
    ) -> Result<()> {
        if src.pixel_format() != dest.pixel_format() {
            return Err(Error::invalid_arg("copy between different pixel formats"));
        }
        if src_x + width > src.width()
            || src_y + height > src.height()
            || dest_x + width > dest.width()
            || dest_y + height > dest.height()
        {
            return Err(Error::invalid_arg("copy rectangle exceeds image bounds"));
        }

        let bpp = src.pixel_format().bytes_per_pixel();
        for j in 0..height {
            let src_row = src.row(src_y + j);
            let dest_row = dest.row_mut(dest_y + j);
            dest_row[dest_x as usize * bpp..(dest_x + width) as usize * bpp]
                .copy_from_slice(&src_row[src_x as usize * bpp..(src_x + width) as usize * bpp]);
        }
        Ok(())
    }

    /// Extracts a fragment as a new image of the same format.
    pub fn fragment(&self, rect: Rect) -> Result<Image> {
        if !self.rect().contains_rect(&rect) {
            return Err(Error::invalid_arg("fragment exceeds image bounds"));
        }
        let mut out = Image::new(rect.width, rect.height, self.pixel_format());
        if let (Some(dst), Some(src)) = (out.buffer_mut().palette_mut(), self.palette()) {
            *dst = src.clone();
        }
        Image::copy_rect(
            self,
            &mut out,
            rect.x as u32,
            rect.y as u32,
            rect.width,
            rect.height,
            0,
            0,
        )?;
        Ok(out)
    }

    /// Splits an RGB image into its three mono channels (same bit depth).
    pub fn split_rgb(&self) -> Result<(Image, Image, Image)> {
        let dest_fmt = match self.pixel_format() {
            PixelFormat::Rgb8 => PixelFormat::Mono8,
            PixelFormat::Rgb16 => PixelFormat::Mono16,
            PixelFormat::Rgb32f => PixelFormat::Mono32f,
            other => {
                return Err(Error::invalid_arg(format!(
                    "split_rgb requires an RGB image, got {other:?}"
                )))
            }
        };

        let mut channels = [
            Image::new(self.width(), self.height(), dest_fmt),
            Image::new(self.width(), self.height(), dest_fmt),
            Image::new(self.width(), self.height(), dest_fmt),
        ];

        let bpc = dest_fmt.bytes_per_channel();
        for y in 0..self.height() {
            let src = self.row(y);
            for (ch, img) in channels.iter_mut().enumerate() {
                let dest = img.row_mut(y);
                for x in 0..self.width() as usize {
                    dest[x * bpc..(x + 1) * bpc]
                        .copy_from_slice(&src[(3 * x + ch) * bpc..(3 * x + ch + 1) * bpc]);
                }
            }
        }

        let [r, g, b] = channels;
        Ok((r, g, b))
    }

    /// Interleaves three mono images of identical size and format into RGB.
    pub fn combine_rgb(red: &Image, green: &Image, blue: &Image) -> Result<Image> {
        for img in [red, green, blue] {
            if img.pixel_format().num_channels() != 1 {
                return Err(Error::invalid_arg("combine_rgb requires mono channels"));
            }
        }
        if red.width() != green.width()
            || red.width() != blue.width()
            || red.height() != green.height()
            || red.height() != blue.height()
            || red.pixel_format() != green.pixel_format()
            || red.pixel_format() != blue.pixel_format()
        {
            return Err(Error::invalid_arg(
                "combine_rgb channels must have identical dimensions and format",
            ));
        }

        let dest_fmt = match red.pixel_format() {
            PixelFormat::Mono8 => PixelFormat::Rgb8,
            PixelFormat::Mono16 => PixelFormat::Rgb16,
            PixelFormat::Mono32f => PixelFormat::Rgb32f,
            other => {
                return Err(Error::invalid_arg(format!(
                    "combine_rgb does not accept {other:?} channels"
                )))
            }
        };

        let mut rgb = Image::new(red.width(), red.height(), dest_fmt);
        let bpc = red.pixel_format().bytes_per_channel();
        for y in 0..red.height() {
            let dest = rgb.row_mut(y);
            for (ch, img) in [red, green, blue].into_iter().enumerate() {
                let src = img.row(y);
                for x in 0..red.width() as usize {
                    dest[(3 * x + ch) * bpc..(3 * x + ch + 1) * bpc]
                        .copy_from_slice(&src[x * bpc..(x + 1) * bpc]);
                }
            }
        }
        Ok(rgb)
    }

    /// Weighted blend `(w1·a + w2·b) / (w1 + w2)` of two float images.
    /// Both weights zero yields a zero image.
    pub fn blend(a: &Image, weight_a: f64, b: &Image, weight_b: f64) -> Result<Image> {
        if !(0.0..=1.0).contains(&weight_a) || !(0.0..=1.0).contains(&weight_b) {
            return Err(Error::invalid_arg("blend weights must lie in [0, 1]"));
        }
        if a.width() != b.width() || a.height() != b.height() {
            return Err(Error::invalid_arg("blend inputs must have equal dimensions"));
        }
        if a.pixel_format() != b.pixel_format()
            || !matches!(a.pixel_format(), PixelFormat::Mono32f | PixelFormat::Rgb32f)
        {
            return Err(Error::invalid_arg("blend requires two MONO32F or two RGB32F images"));
        }

        let mut out = Image::new(a.width(), a.height(), a.pixel_format());
        if weight_a == 0.0 && weight_b == 0.0 {
            return Ok(out);
        }

        let wa = (weight_a / (weight_a + weight_b)) as f32;
        let wb = (weight_b / (weight_a + weight_b)) as f32;
        for y in 0..a.height() {
            let ra = row_as::<f32>(a.row(y));
            let rb = row_as::<f32>(b.row(y));
            let ro = row_as_mut::<f32>(out.row_mut(y));
            for i in 0..ro.len() {
                ro[i] = wa * ra[i] + wb * rb[i];
            }
        }
        Ok(out)
    }

    /// Element-wise multiplication by another MONO32F image of equal size.
    pub fn multiply(&mut self, other: &Image) -> Result<()> {
        if self.pixel_format() != PixelFormat::Mono32f
            || other.pixel_format() != PixelFormat::Mono32f
        {
            return Err(Error::invalid_arg("multiply requires MONO32F images"));
        }
        if self.width() != other.width() || self.height() != other.height() {
            return Err(Error::invalid_arg("multiply inputs must have equal dimensions"));
        }
        for y in 0..self.height() {
            let src: Vec<f32> = row_as::<f32>(other.row(y)).to_vec();
            let dest = row_as_mut::<f32>(self.row_mut(y));
            for (d, s) in dest.iter_mut().zip(src) {
                *d *= s;
            }
        }
        Ok(())
    }

    /// Multiplies every channel value by `factor` (float images only).
    pub fn multiply_pixel_values(&mut self, factor: f64) -> Result<()> {
        if !matches!(self.pixel_format(), PixelFormat::Mono32f | PixelFormat::Rgb32f) {
            return Err(Error::invalid_arg("multiply_pixel_values requires a float image"));
        }
        if factor < 0.0 {
            return Err(Error::invalid_arg("factor must be non-negative"));
        }
        for y in 0..self.height() {
            for v in row_as_mut::<f32>(self.row_mut(y)) {
                *v *= factor as f32;
            }
        }
        Ok(())
    }

    /// Linearly maps the image's own brightness range so that the old
    /// minimum lands at `min_level` and the old maximum at `max_level`,
    /// then clamps to `[0, 1]`. Float images only.
    pub fn normalize(&mut self, min_level: f32, max_level: f32) -> Result<()> {
        if !matches!(self.pixel_format(), PixelFormat::Mono32f | PixelFormat::Rgb32f) {
            return Err(Error::invalid_arg("normalize requires a float image"));
        }

        let mut lmin = f32::MAX;
        let mut lmax = f32::MIN;
        for y in 0..self.height() {
            for &v in row_as::<f32>(self.row(y)) {
                lmin = lmin.min(v);
                lmax = lmax.max(v);
            }
        }
        if lmax == lmin {
            return Ok(());
        }

        let a = (max_level - min_level) / (lmax - lmin);
        let b = max_level - a * lmax;
        for y in 0..self.height() {
            for v in row_as_mut::<f32>(self.row_mut(y)) {
                *v = (a * *v + b).clamp(0.0, 1.0);
            }
        }
        Ok(())
    }

    /// Gray-world automatic white balance; returns an RGB32F image.
    pub fn automatic_white_balance(&self) -> Result<Image> {
        let imgf = self.convert_pixel_format(PixelFormat::Rgb32f)?;
        let (width, height) = (imgf.width(), imgf.height());

        let mut sums = [0.0f64; 3];
        for y in 0..height {
            let row = row_as::<f32>(imgf.row(y));
            for px in row.chunks_exact(3) {
                sums[0] += px[0] as f64;
                sums[1] += px[1] as f64;
                sums[2] += px[2] as f64;
            }
        }
        let n = (width as f64) * (height as f64);
        let (avg_r, avg_g, avg_b) = (sums[0] / n, sums[1] / n, sums[2] / n);
        if avg_r == 0.0 || avg_b == 0.0 {
            return Err(Error::invalid_arg("white balance undefined for a zero channel"));
        }

        let gain_r = (avg_g / avg_r) as f32;
        let gain_b = (avg_g / avg_b) as f32;

        let mut out = Image::new(width, height, PixelFormat::Rgb32f);
        for y in 0..height {
            let src = row_as::<f32>(imgf.row(y));
            let dest = row_as_mut::<f32>(out.row_mut(y));
            for x in 0..width as usize {
                dest[3 * x] = (src[3 * x] * gain_r).min(1.0);
                dest[3 * x + 1] = src[3 * x + 1].min(1.0);
                dest[3 * x + 2] = (src[3 * x + 2] * gain_b).min(1.0);
            }
        }
        Ok(out)
    }
}

/// Cubic (Hermite) interpolation of four consecutive samples at
/// `0 <= t <= 1` between the middle two.
#[inline]
fn interpolate_cubic(t: f32, fm1: f32, f0: f32, f1: f32, f2: f32) -> f32 {
    let delta_k = f1 - f0;
    let dk = (f1 - fm1) * 0.5;
    let dk1 = (f2 - f0) * 0.5;

    let a0 = f0;
    let a1 = dk;
    let a2 = 3.0 * delta_k - 2.0 * dk - dk1;
    let a3 = dk + dk1 - 2.0 * delta_k;

    t * (t * (a3 * t + a2) + a1) + a0
}

/// Copies `src` (or the fragment `src_rect` of it) into `dest`, offset by
/// `(x_ofs, y_ofs)`, cropping/padding as needed. Fractional offsets use
/// cubic Hermite interpolation over the 4x4 neighborhood; a 2-pixel border
/// of the target area is copied at the nearest integer offset instead.
/// When `clear_to_zero` is set, uncovered areas of `dest` are zeroed.
///
/// Palettized buffers only support whole-pixel offsets.
pub fn resize_and_translate(
    src: &Image,
    dest: &mut Image,
    src_rect: Rect,
    x_ofs: f32,
    y_ofs: f32,
    clear_to_zero: bool,
) -> Result<()> {
    if src.pixel_format() != dest.pixel_format() {
        return Err(Error::invalid_arg("resize_and_translate formats must match"));
    }
    if !src.rect().contains_rect(&src_rect) {
        return Err(Error::invalid_arg("source rectangle exceeds image bounds"));
    }

    let x_frac = x_ofs.fract();
    let y_frac = y_ofs.fract();
    if src.pixel_format() == PixelFormat::Pal8 && (x_frac != 0.0 || y_frac != 0.0) {
        return Err(Error::invalid_arg(
            "fractional translation of a palettized image is not supported",
        ));
    }

    match src.pixel_format().bytes_per_channel() {
        1 => resize_and_translate_impl::<u8>(src, dest, src_rect, x_ofs, y_ofs, clear_to_zero, 255.0),
        2 => resize_and_translate_impl::<u16>(src, dest, src_rect, x_ofs, y_ofs, clear_to_zero, 65535.0),
        4 => resize_and_translate_impl::<f32>(src, dest, src_rect, x_ofs, y_ofs, clear_to_zero, 1.0),
        _ => unreachable!(),
    }
    Ok(())
}

trait Channel: bytemuck::Pod + Send + Sync {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Channel for u8 {
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> u8 {
        v as u8
    }
}

impl Channel for u16 {
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> u16 {
        v as u16
    }
}

impl Channel for f32 {
    fn to_f32(self) -> f32 {
        self
    }
    fn from_f32(v: f32) -> f32 {
        v
    }
}

fn resize_and_translate_impl<T: Channel>(
    src: &Image,
    dest: &mut Image,
    src_rect: Rect,
    x_ofs: f32,
    y_ofs: f32,
    clear_to_zero: bool,
    max_lum: f32,
) {
    let bpp = src.pixel_format().bytes_per_pixel();
    let num_channels = src.pixel_format().num_channels();

    let x_ofs_int = x_ofs.trunc() as i32;
    let y_ofs_int = y_ofs.trunc() as i32;
    let mut x_frac = x_ofs.fract();
    let mut y_frac = y_ofs.fract();

    let src_xmin = src_rect.x;
    let src_ymin = src_rect.y;
    let src_xmax = src_rect.x + src_rect.width as i32 - 1;
    let src_ymax = src_rect.y + src_rect.height as i32 - 1;

    // Target area in `dest` (inclusive bounds).
    let dest_x_start = x_ofs_int.max(0);
    let dest_y_start = y_ofs_int.max(0);
    let dest_x_end = (x_ofs_int + src_xmax - src_xmin).min(dest.width() as i32 - 1);
    let dest_y_end = (y_ofs_int + src_ymax - src_ymin).min(dest.height() as i32 - 1);

    if dest_x_end < dest_x_start || dest_y_end < dest_y_start {
        if clear_to_zero {
            dest.clear_to_zero();
        }
        return;
    }

    if clear_to_zero {
        for y in 0..dest.height() as i32 {
            if y < dest_y_start || y > dest_y_end {
                dest.row_mut(y as u32).fill(0);
            } else {
                let row = dest.row_mut(y as u32);
                row[..dest_x_start as usize * bpp].fill(0);
                row[(dest_x_end as usize + 1) * bpp..].fill(0);
            }
        }
    }

    // Maps a destination row/column back into the source image.
    let src_y_of = |dest_y: i32| (dest_y - y_ofs_int + src_ymin) as u32;
    let src_x_of = |dest_x: i32| (dest_x - x_ofs_int + src_xmin) as usize;

    if x_frac == 0.0 && y_frac == 0.0 {
        for y in dest_y_start..=dest_y_end {
            let src_row = src.row(src_y_of(y));
            let dest_row = dest.row_mut(y as u32);
            dest_row[dest_x_start as usize * bpp..(dest_x_end as usize + 1) * bpp].copy_from_slice(
                &src_row[src_x_of(dest_x_start) * bpp..(src_x_of(dest_x_end) + 1) * bpp],
            );
        }
        return;
    }

    // Subpixel translation: borders first, then the interpolated interior.

    let copy_dest_row = |dest: &mut Image, y: i32| {
        let src_row = src.row(src_y_of(y));
        let dest_row = dest.row_mut(y as u32);
        dest_row[dest_x_start as usize * bpp..(dest_x_end as usize + 1) * bpp].copy_from_slice(
            &src_row[src_x_of(dest_x_start) * bpp..(src_x_of(dest_x_end) + 1) * bpp],
        );
    };

    for i in 0..2 {
        if dest_y_start + i <= dest_y_end {
            copy_dest_row(dest, dest_y_start + i);
        }
        if dest_y_end - i >= dest_y_start {
            copy_dest_row(dest, dest_y_end - i);
        }
    }
    for y in dest_y_start..=dest_y_end {
        let src_row = src.row(src_y_of(y));
        let dest_row = dest.row_mut(y as u32);
        for i in 0..2usize.min(dest_x_end as usize - dest_x_start as usize + 1) {
            let sl = src_x_of(dest_x_start + i as i32) * bpp;
            let dl = (dest_x_start as usize + i) * bpp;
            dest_row[dl..dl + bpp].copy_from_slice(&src_row[sl..sl + bpp]);

            let sr = src_x_of(dest_x_end - i as i32) * bpp;
            let dr = (dest_x_end as usize - i) * bpp;
            dest_row[dr..dr + bpp].copy_from_slice(&src_row[sr..sr + bpp]);
        }
    }

    let idx: i32 = if x_frac < 0.0 { 1 } else { -1 };
    let idy: i32 = if y_frac < 0.0 { 1 } else { -1 };
    x_frac = x_frac.abs();
    y_frac = y_frac.abs();

    // Interior rows are independent; interpolate them in parallel.
    let interior: Vec<(i32, Vec<T>)> = ((dest_y_start + 2)..=(dest_y_end - 2))
        .collect::<Vec<_>>()
        .par_iter()
        .map(|&row| {
            let mut out = vec![T::from_f32(0.0); (dest_x_end - dest_x_start + 1) as usize * num_channels];
            for col in (dest_x_start + 2)..=(dest_x_end - 2) {
                for ch in 0..num_channels {
                    let mut yvals = [0.0f32; 4];
                    let mut y = row - idy;
                    for rel_y in 0..4 {
                        let src_y = src_y_of(y);
                        let src_row = row_as::<T>(src.row(src_y));
                        let sx = src_x_of(col) as i32;
                        let sample = |x: i32| -> f32 {
                            src_row[(x as usize) * num_channels + ch].to_f32()
                        };
                        yvals[rel_y] = interpolate_cubic(
                            x_frac,
                            sample(sx - idx),
                            sample(sx),
                            sample(sx + idx),
                            sample(sx + 2 * idx),
                        );
                        y += idy;
                    }
                    let val = interpolate_cubic(y_frac, yvals[0], yvals[1], yvals[2], yvals[3])
                        .clamp(0.0, max_lum);
                    out[(col - dest_x_start) as usize * num_channels + ch] = T::from_f32(val);
                }
            }
            (row, out)
        })
        .collect();

    if dest_x_end - dest_x_start >= 4 {
        for (row, values) in interior {
            let dest_row = row_as_mut::<T>(dest.row_mut(row as u32));
            let start = 2 * num_channels;
            let end = (dest_x_end - dest_x_start - 1) as usize * num_channels;
            dest_row[(dest_x_start as usize + 2) * num_channels
                ..(dest_x_end as usize - 1) * num_channels]
                .copy_from_slice(&values[start..end]);
        }
    }
}
