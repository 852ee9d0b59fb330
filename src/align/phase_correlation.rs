//! Translation estimation by FFT phase correlation.

use num_complex::Complex32;
use rustfft::FftPlanner;

use crate::image::{Image, PixelFormat};
use crate::error::{Error, Result};

// keeps the cross-power normalization away from division by zero
const NORM_EPSILON: f32 = 1.0e-20;

/// 2D FFT of a row-major complex buffer, in place. `inverse` selects the
/// backward transform (unscaled, as rustfft leaves it).
fn fft_2d(data: &mut [Complex32], width: usize, height: usize, inverse: bool) {
    let mut planner = FftPlanner::new();
    let row_fft = if inverse {
        planner.plan_fft_inverse(width)
    } else {
        planner.plan_fft_forward(width)
    };
    for row in data.chunks_exact_mut(width) {
        row_fft.process(row);
    }

    let col_fft = if inverse {
        planner.plan_fft_inverse(height)
    } else {
        planner.plan_fft_forward(height)
    };
    let mut column = vec![Complex32::default(); height];
    for x in 0..width {
        for y in 0..height {
            column[y] = data[y * width + x];
        }
        col_fft.process(&mut column);
        for y in 0..height {
            data[y * width + x] = column[y];
        }
    }
}

/// Estimated translation of image `b` relative to image `a`: if `b` shows
/// the same scene shifted by `(tx, ty)` pixels, the result is `(tx, ty)`.
/// With `subpixel` set, the peak position is refined by the centroid of
/// its 3x3 neighborhood.
pub fn determine_translation(
    a: &Image,
    b: &Image,
    subpixel: bool,
) -> Result<(f32, f32)> {
    if a.pixel_format() != PixelFormat::Mono32f || b.pixel_format() != PixelFormat::Mono32f {
        return Err(Error::invalid_arg("phase correlation requires MONO32F input"));
    }

    // both images go into a common power-of-two-sized transform
    let fft_w = (a.width().max(b.width()) as usize).next_power_of_two();
    let fft_h = (a.height().max(b.height()) as usize).next_power_of_two();

    let load = |img: &Image| -> Vec<Complex32> {
        let mut data = vec![Complex32::default(); fft_w * fft_h];
        for y in 0..img.height() as usize {
            let row = img.row_as::<f32>(y as u32);
            for x in 0..img.width() as usize {
                data[y * fft_w + x] = Complex32::new(row[x], 0.0);
            }
        }
        data
    };

    let mut fa = load(a);
    let mut fb = load(b);
    fft_2d(&mut fa, fft_w, fft_h, false);
    fft_2d(&mut fb, fft_w, fft_h, false);

    // normalized cross-power spectrum conj(A)·B peaks at the translation
    let mut cross: Vec<Complex32> = fa
        .iter()
        .zip(&fb)
        .map(|(va, vb)| {
            let prod = va.conj() * vb;
            prod / (prod.norm() + NORM_EPSILON)
        })
        .collect();
    fft_2d(&mut cross, fft_w, fft_h, true);

    let (mut peak_idx, mut peak_val) = (0usize, f32::MIN);
    for (i, v) in cross.iter().enumerate() {
        let magnitude = v.re;
        if magnitude > peak_val {
            peak_val = magnitude;
            peak_idx = i;
        }
    }

    let peak_x = (peak_idx % fft_w) as i64;
    let peak_y = (peak_idx / fft_w) as i64;

    let (mut tx, mut ty) = (peak_x as f32, peak_y as f32);

    if subpixel {
        // centroid of the 3x3 neighborhood (wrapping at the edges)
        let mut sum = 0.0f32;
        let mut sum_x = 0.0f32;
        let mut sum_y = 0.0f32;
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let x = (peak_x + dx).rem_euclid(fft_w as i64) as usize;
                let y = (peak_y + dy).rem_euclid(fft_h as i64) as usize;
                let v = cross[y * fft_w + x].re.max(0.0);
                sum += v;
                sum_x += dx as f32 * v;
                sum_y += dy as f32 * v;
            }
        }
        if sum > 0.0 {
            tx += sum_x / sum;
            ty += sum_y / sum;
        }
    }

    // offsets beyond the half-size wrap around to negative translations
    if tx > fft_w as f32 / 2.0 {
        tx -= fft_w as f32;
    }
    if ty > fft_h as f32 / 2.0 {
        ty -= fft_h as f32;
    }

    Ok((tx, ty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ops::resize_and_translate;

    fn test_pattern(width: u32, height: u32) -> Image {
        let mut img = Image::new(width, height, PixelFormat::Mono32f);
        for y in 0..height {
            let row = img.row_as_mut::<f32>(y);
            for x in 0..width as usize {
                // a few blobby features
                let fx = x as f32;
                let fy = y as f32;
                let blob = |cx: f32, cy: f32, s: f32| {
                    (-((fx - cx).powi(2) + (fy - cy).powi(2)) / (2.0 * s * s)).exp()
                };
                row[x] = blob(50.0, 60.0, 8.0) + 0.7 * blob(120.0, 90.0, 12.0)
                    + 0.5 * blob(80.0, 140.0, 6.0);
            }
        }
        img
    }

    #[test]
    fn integer_translation_is_recovered() {
        let a = test_pattern(200, 200);
        let mut b = Image::new(200, 200, PixelFormat::Mono32f);
        resize_and_translate(&a, &mut b, a.rect(), 3.0, -2.0, true).unwrap();

        let (tx, ty) = determine_translation(&a, &b, false).unwrap();
        assert!((tx - 3.0).abs() <= 1.0, "tx = {tx}");
        assert!((ty + 2.0).abs() <= 1.0, "ty = {ty}");
    }

    #[test]
    fn subpixel_translation_is_recovered() {
        let a = test_pattern(200, 200);
        let mut b = Image::new(200, 200, PixelFormat::Mono32f);
        resize_and_translate(&a, &mut b, a.rect(), 1.5, 0.25, true).unwrap();

        let (tx, ty) = determine_translation(&a, &b, true).unwrap();
        assert!((tx - 1.5).abs() <= 0.25, "tx = {tx}");
        assert!((ty - 0.25).abs() <= 0.25, "ty = {ty}");
    }

    #[test]
    fn identical_images_give_zero_offset() {
        let a = test_pattern(128, 128);
        let (tx, ty) = determine_translation(&a, &a, true).unwrap();
        assert!(tx.abs() < 0.01 && ty.abs() < 0.01, "({tx}, {ty})");
    }
}
