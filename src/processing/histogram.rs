//! Selection-bound brightness histogram.
//!
//! The value range is extracted first (min/max over the selection), then
//! values are bucketed into uniform bins. 8-bit data defaults to 256 bins;
//! float data takes a caller-chosen bin count.

use itertools::Itertools;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat, Rect};

pub const DEFAULT_BIN_COUNT: usize = 256;

#[derive(Debug, Clone)]
pub struct Histogram {
    /// Exact minimum value present in the selection.
    pub min_value: f32,
    /// Exact maximum value present in the selection.
    pub max_value: f32,
    /// Counts per uniform bin.
    pub values: Vec<u32>,
    /// Highest count among the bins.
    pub max_count: u32,
}

/// Computes the histogram of `selection` (clamped to the image rectangle).
/// Multi-channel images contribute every channel value.
pub fn determine_histogram(img: &Image, selection: Rect, bin_count: usize) -> Result<Histogram> {
    if bin_count == 0 {
        return Err(Error::invalid_arg("histogram needs at least one bin"));
    }
    let selection = selection.clamped(&img.rect());
    if selection.width == 0 || selection.height == 0 {
        return Err(Error::invalid_arg("histogram selection is empty"));
    }

    let values = collect_selection_values(img, selection);

    let (min_value, max_value) = match values.iter().minmax().into_option() {
        Some((&min, &max)) => (min, max),
        None => return Err(Error::invalid_arg("histogram selection is empty")),
    };

    let range = max_value - min_value;
    let chunk_size = (values.len() / rayon::current_num_threads()).max(1024);

    // per-chunk local histograms, merged at the end
    let locals: Vec<Vec<u32>> = values
        .par_chunks(chunk_size)
        .map(|chunk| {
            let mut local = vec![0u32; bin_count];
            for &v in chunk {
                let bin = if range == 0.0 {
                    0
                } else {
                    (((v - min_value) / range * (bin_count - 1) as f32) as usize).min(bin_count - 1)
                };
                local[bin] += 1;
            }
            local
        })
        .collect();

    let mut bins = vec![0u32; bin_count];
    for local in locals {
        for (total, v) in bins.iter_mut().zip(local) {
            *total += v;
        }
    }

    let max_count = bins.iter().copied().max().unwrap_or(0);
    Ok(Histogram { min_value, max_value, values: bins, max_count })
}

fn collect_selection_values(img: &Image, selection: Rect) -> Vec<f32> {
    let num_channels = img.pixel_format().num_channels();
    let mut values =
        Vec::with_capacity(selection.width as usize * selection.height as usize * num_channels);

    for y in 0..selection.height {
        let row_y = (selection.y as u32) + y;
        let x0 = selection.x as usize;
        let x1 = x0 + selection.width as usize;
        match img.pixel_format() {
            PixelFormat::Mono8 | PixelFormat::Pal8 => {
                values.extend(img.row(row_y)[x0..x1].iter().map(|&v| v as f32 / 255.0));
            }
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => {
                values.extend(img.row(row_y)[3 * x0..3 * x1].iter().map(|&v| v as f32 / 255.0));
            }
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => {
                values.extend(img.row(row_y)[4 * x0..4 * x1].iter().map(|&v| v as f32 / 255.0));
            }
            PixelFormat::Mono16 => {
                values
                    .extend(img.row_as::<u16>(row_y)[x0..x1].iter().map(|&v| v as f32 / 65535.0));
            }
            PixelFormat::Rgb16 => {
                values.extend(
                    img.row_as::<u16>(row_y)[3 * x0..3 * x1].iter().map(|&v| v as f32 / 65535.0),
                );
            }
            PixelFormat::Rgba16 => {
                values.extend(
                    img.row_as::<u16>(row_y)[4 * x0..4 * x1].iter().map(|&v| v as f32 / 65535.0),
                );
            }
            PixelFormat::Mono32f => {
                values.extend_from_slice(&img.row_as::<f32>(row_y)[x0..x1]);
            }
            PixelFormat::Rgb32f => {
                values.extend_from_slice(&img.row_as::<f32>(row_y)[3 * x0..3 * x1]);
            }
            PixelFormat::Rgba32f => {
                values.extend_from_slice(&img.row_as::<f32>(row_y)[4 * x0..4 * x1]);
            }
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_and_counts() {
        let mut img = Image::new(4, 1, PixelFormat::Mono32f);
        img.row_as_mut::<f32>(0).copy_from_slice(&[0.1, 0.5, 0.5, 0.9]);

        let hist = determine_histogram(&img, img.rect(), 4).unwrap();
        assert_eq!(hist.min_value, 0.1);
        assert_eq!(hist.max_value, 0.9);
        assert_eq!(hist.values.iter().sum::<u32>(), 4);
        assert_eq!(hist.max_count, 2);
    }

    #[test]
    fn selection_is_clamped_to_image() {
        let mut img = Image::new(4, 4, PixelFormat::Mono8);
        for y in 0..4 {
            img.row_mut(y).fill(y as u8 * 10);
        }
        let hist = determine_histogram(&img, Rect::new(2, 2, 100, 100), DEFAULT_BIN_COUNT).unwrap();
        // only rows 2..4, columns 2..4 contribute
        assert_eq!(hist.values.iter().sum::<u32>(), 4);
    }

    #[test]
    fn constant_image_collapses_to_one_bin() {
        let img = Image::new(8, 8, PixelFormat::Mono8);
        let hist = determine_histogram(&img, img.rect(), 16).unwrap();
        assert_eq!(hist.values[0], 64);
        assert_eq!(hist.max_count, 64);
    }

    #[test]
    fn empty_selection_is_rejected() {
        let img = Image::new(4, 4, PixelFormat::Mono8);
        assert!(determine_histogram(&img, Rect::new(10, 10, 5, 5), 16).is_err());
    }
}
