//! astrapost: processing engine for astronomical image post-processing.
//!
//! The crate implements the core of an astronomical stack post-processor:
//! a three-stage pipeline (Lucy–Richardson deconvolution with optional
//! deringing, multi-stage unsharp masking with an adaptive amount, tone
//! curve mapping) with incremental recomputation on CPU or GPU back ends,
//! plus multi-image alignment by phase correlation or solar-limb fitting,
//! the image model and the file codecs it consumes.
//!
//! The high-level entry points below cover the common non-interactive
//! uses; interactive hosts drive a [`backend::ProcessingBackend`]
//! directly and pump it with `step()` between UI events.
//!
//! ```no_run
//! use std::path::Path;
//! use astrapost::{load_image, load_settings, process_image, OutputFormat};
//!
//! let image = load_image(Path::new("stack.tif"), true)?;
//! let settings = load_settings(Path::new("sharpen.settings"))?;
//! let result = process_image(&image, &settings)?;
//! result.save(Path::new("stack_sharp.tif"), OutputFormat::Tiff16)?;
//! # Ok::<(), astrapost::Error>(())
//! ```

pub mod align;
pub mod backend;
pub mod error;
pub mod image;
pub mod io;
pub mod math;
pub mod processing;
pub mod progress;

use std::path::Path;

pub use crate::align::{align_images, AlignmentMethod, AlignmentParams, AlignmentSummary, CropMode};
pub use crate::error::{Error, Result};
pub use crate::image::{Image, PixelFormat, Rect};
pub use crate::io::{image_dimensions, load_image, save_image, OutputFormat};
pub use crate::processing::histogram::{determine_histogram, Histogram};
pub use crate::processing::settings_io::{load_settings, save_settings};
pub use crate::processing::{
    CompletionStatus, ProcessingRequest, ProcessingSettings, ToneCurve, UnsharpMask,
};
pub use crate::progress::{NoopProgress, ProgressSink};

use crate::backend::cpu::CpuProcessing;
use crate::backend::{run_to_completion, ProcessingBackend};

/// Runs the whole pipeline over `image` with the CPU back end and returns
/// the processed image (same pixel format family as the input: mono in,
/// mono out). Precise tone curve values are always applied.
pub fn process_image(image: &Image, settings: &ProcessingSettings) -> Result<Image> {
    let mut input = match image.pixel_format() {
        PixelFormat::Mono32f | PixelFormat::Rgb32f => image.clone(),
        f if f.is_mono() || f == PixelFormat::Pal8 => {
            image.convert_pixel_format(PixelFormat::Mono32f)?
        }
        _ => image.convert_pixel_format(PixelFormat::Rgb32f)?,
    };

    if settings.normalization.enabled {
        input.normalize(settings.normalization.min, settings.normalization.max)?;
    }

    let mut backend = CpuProcessing::new();
    backend.set_use_precise_tone_curve(true);
    backend.set_image(input)?;
    backend.set_settings(settings.clone());
    backend.start(ProcessingRequest::Sharpening)?;
    match run_to_completion(&mut backend) {
        CompletionStatus::Completed => backend.processed_output(),
        CompletionStatus::Aborted => Err(Error::Cancelled),
    }
}

/// Loads an image and a settings file, processes the image, and saves the
/// result; the library face of batch processing.
pub fn process_image_file(
    input_path: &Path,
    settings_path: &Path,
    output_path: &Path,
    format: OutputFormat,
) -> Result<()> {
    let image = load_image(input_path, true)?;
    let settings = load_settings(settings_path)?;
    let result = process_image(&image, &settings)?;
    save_image(&result, output_path, format)
}

/// Interleaves three mono images into RGB; re-exported at the crate root
/// for parity with the other free-function entry points.
pub fn combine_rgb(red: &Image, green: &Image, blue: &Image) -> Result<Image> {
    Image::combine_rgb(red, green, blue)
}

/// Weighted blend of two float images.
pub fn blend(a: &Image, weight_a: f64, b: &Image, weight_b: f64) -> Result<Image> {
    Image::blend(a, weight_a, b, weight_b)
}

impl Image {
    /// Saves the image in the given output format.
    pub fn save(&self, path: &Path, format: OutputFormat) -> Result<()> {
        save_image(self, path, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_image_with_noop_settings_is_identity() {
        let mut img = Image::new(100, 100, PixelFormat::Mono32f);
        for y in 0..100 {
            let row = img.row_as_mut::<f32>(y);
            for (x, v) in row.iter_mut().enumerate() {
                *v = ((x + y as usize) % 32) as f32 / 32.0;
            }
        }

        let settings = ProcessingSettings::new();
        let out = process_image(&img, &settings).unwrap();
        for y in 0..100 {
            let a = out.row_as::<f32>(y);
            let b = img.row_as::<f32>(y);
            for (va, vb) in a.iter().zip(b) {
                assert!((va - vb).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn process_image_applies_normalization() {
        let mut img = Image::new(8, 8, PixelFormat::Mono32f);
        for y in 0..8 {
            img.row_as_mut::<f32>(y).fill(0.25 + 0.05 * y as f32);
        }

        let mut settings = ProcessingSettings::new();
        settings.normalization.enabled = true;
        settings.normalization.min = 0.0;
        settings.normalization.max = 1.0;

        let out = process_image(&img, &settings).unwrap();
        assert!(out.row_as::<f32>(0)[0].abs() < 1e-6);
        assert!((out.row_as::<f32>(7)[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn integer_input_is_promoted_to_float() {
        let mut img = Image::new(16, 16, PixelFormat::Mono8);
        for y in 0..16 {
            img.row_mut(y).fill(128);
        }
        let out = process_image(&img, &ProcessingSettings::new()).unwrap();
        assert_eq!(out.pixel_format(), PixelFormat::Mono32f);
        assert!((out.row_as::<f32>(8)[8] - 128.0 / 255.0).abs() < 1e-6);
    }
}
