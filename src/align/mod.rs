//! Multi-image alignment: translation estimation over an image sequence,
//! output geometry (crop to intersection or pad to bounding box) and the
//! aligned-frame writer. Also drives RGB channel alignment of a single
//! image.

pub mod limb;
pub mod phase_correlation;

use std::path::{Path, PathBuf};

use glam::Vec2;
use log::{debug, info};

use crate::error::{Error, Result};
use crate::image::ops::resize_and_translate;
use crate::image::{Image, PixelFormat, Rect};
use crate::io::{load_image, matching_output_format, save_image};
use crate::progress::ProgressSink;

/// Translation estimation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentMethod {
    /// FFT phase correlation of consecutive frames; works on any detail.
    PhaseCorrelation,
    /// Solar limb fit; for frames dominated by a partially visible disc.
    Limb,
}

/// What to do about frame areas not covered by every image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropMode {
    /// Cut each frame to the intersection of all translated frames.
    Crop,
    /// Extend each frame to the common bounding box, padding with zeros.
    Pad,
}

pub struct AlignmentParams {
    pub method: AlignmentMethod,
    pub crop_mode: CropMode,
    /// Estimate and apply sub-pixel translations.
    pub subpixel: bool,
    pub output_dir: PathBuf,
    /// Appended to each output file stem; `_aligned` when absent.
    pub suffix: Option<String>,
}

/// Per-run report: the translation applied to each input frame and the
/// common output size.
#[derive(Debug)]
pub struct AlignmentSummary {
    pub translations: Vec<Vec2>,
    pub output_size: (u32, u32),
    pub output_paths: Vec<PathBuf>,
}

/// Aligns the images under `paths` and writes the aligned frames into the
/// output directory. Progress is reported as a fraction of `[0, 1]`.
pub fn align_images(
    paths: &[PathBuf],
    params: &AlignmentParams,
    progress: &dyn ProgressSink,
) -> Result<AlignmentSummary> {
    if paths.len() < 2 {
        return Err(Error::invalid_arg("alignment needs at least two images"));
    }

    // translation estimation reads the frames as mono
    let mut translations: Vec<Vec2> = vec![Vec2::ZERO];

    match params.method {
        AlignmentMethod::PhaseCorrelation => {
            let mut prev = load_mono32f(&paths[0])?;
            for (i, path) in paths.iter().enumerate().skip(1) {
                let next = load_mono32f(path)?;
                let (tx, ty) =
                    phase_correlation::determine_translation(&prev, &next, params.subpixel)?;
                // cumulative displacement relative to the first frame
                let cumulative = translations[i - 1] + Vec2::new(tx, ty);
                translations.push(cumulative);
                debug!("frame {i}: offset ({tx}, {ty}), cumulative {cumulative:?}");
                prev = next;
                progress.set(0.5 * i as f32 / (paths.len() - 1) as f32, None);
            }
        }
        AlignmentMethod::Limb => {
            let first = load_mono8(&paths[0])?;
            let mut reference_disc = limb::find_disc(&first, None)?;
            let anchor = reference_disc.center;
            for (i, path) in paths.iter().enumerate().skip(1) {
                let img = load_mono8(path)?;
                let disc = limb::find_disc(&img, Some(&reference_disc))?;
                let delta = disc.center - anchor;
                translations.push(Vec2::new(delta.x as f32, delta.y as f32));
                debug!("frame {i}: disc center {:?}", disc.center);
                reference_disc = disc;
                progress.set(0.5 * i as f32 / (paths.len() - 1) as f32, None);
            }
        }
    }

    if !params.subpixel {
        for t in translations.iter_mut() {
            *t = t.round();
        }
    }

    // output geometry: each frame i is shifted by -translations[i]
    let sizes: Vec<(u32, u32)> = paths
        .iter()
        .map(|p| crate::io::image_dimensions(p))
        .collect::<Result<_>>()?;
    let geometry = output_geometry(&sizes, &translations, params.crop_mode);
    info!(
        "aligning {} frames; output {}x{}",
        paths.len(),
        geometry.width,
        geometry.height
    );
    if geometry.width == 0 || geometry.height == 0 {
        return Err(Error::invalid_arg("aligned frames have no common area"));
    }

    let suffix = params.suffix.as_deref().unwrap_or("_aligned");
    let mut output_paths = Vec::with_capacity(paths.len());

    for (i, path) in paths.iter().enumerate() {
        let src = load_image(path, true)?;
        let mut dest = Image::new(geometry.width, geometry.height, src.pixel_format());

        let x_ofs = -translations[i].x - geometry.x as f32;
        let y_ofs = -translations[i].y - geometry.y as f32;
        resize_and_translate(&src, &mut dest, src.rect(), x_ofs, y_ofs, true)?;

        let out_path = output_path(&params.output_dir, path, suffix);
        save_image(&dest, &out_path, matching_output_format(path))?;
        output_paths.push(out_path);

        progress.set(0.5 + 0.5 * (i + 1) as f32 / paths.len() as f32, None);
    }

    progress.finish(None);
    Ok(AlignmentSummary {
        translations,
        output_size: (geometry.width, geometry.height),
        output_paths,
    })
}

// The common output rectangle in the coordinate system of frame 0 after
// each frame i is shifted by -translations[i].
fn output_geometry(sizes: &[(u32, u32)], translations: &[Vec2], crop_mode: CropMode) -> Rect {
    let mut xmin = f32::MIN;
    let mut ymin = f32::MIN;
    let mut xmax = f32::MAX;
    let mut ymax = f32::MAX;
    let mut uxmin = f32::MAX;
    let mut uymin = f32::MAX;
    let mut uxmax = f32::MIN;
    let mut uymax = f32::MIN;

    for ((w, h), t) in sizes.iter().zip(translations) {
        let x0 = -t.x;
        let y0 = -t.y;
        let x1 = x0 + *w as f32;
        let y1 = y0 + *h as f32;

        xmin = xmin.max(x0);
        ymin = ymin.max(y0);
        xmax = xmax.min(x1);
        ymax = ymax.min(y1);

        uxmin = uxmin.min(x0);
        uymin = uymin.min(y0);
        uxmax = uxmax.max(x1);
        uymax = uymax.max(y1);
    }

    match crop_mode {
        CropMode::Crop => Rect {
            x: xmin.ceil() as i32,
            y: ymin.ceil() as i32,
            width: (xmax.floor() - xmin.ceil()).max(0.0) as u32,
            height: (ymax.floor() - ymin.ceil()).max(0.0) as u32,
        },
        CropMode::Pad => Rect {
            x: uxmin.floor() as i32,
            y: uymin.floor() as i32,
            width: (uxmax.ceil() - uxmin.floor()).max(0.0) as u32,
            height: (uymax.ceil() - uymin.floor()).max(0.0) as u32,
        },
    }
}

fn output_path(dir: &Path, input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("aligned");
    let ext = input.extension().and_then(|s| s.to_str()).unwrap_or("tif");
    dir.join(format!("{stem}{suffix}.{ext}"))
}

fn load_mono32f(path: &Path) -> Result<Image> {
    load_image(path, true)?.convert_pixel_format(PixelFormat::Mono32f)
}

fn load_mono8(path: &Path) -> Result<Image> {
    load_image(path, true)?.convert_pixel_format(PixelFormat::Mono8)
}

impl Image {
    /// Aligns the three channels of an RGB image onto the red channel by
    /// phase correlation (the channels are treated as consecutive frames
    /// of a "standard" alignment run) and reassembles the image.
    pub fn align_rgb(&self) -> Result<Image> {
        let rgb = self.convert_pixel_format(PixelFormat::Rgb32f)?;
        let (r, g, b) = rgb.split_rgb()?;

        let mut aligned = Vec::with_capacity(3);
        aligned.push(r.clone());
        for channel in [&g, &b] {
            let (tx, ty) = phase_correlation::determine_translation(&r, channel, true)?;
            let mut shifted = Image::new(channel.width(), channel.height(), PixelFormat::Mono32f);
            resize_and_translate(channel, &mut shifted, channel.rect(), -tx, -ty, true)?;
            aligned.push(shifted);
        }

        Image::combine_rgb(&aligned[0], &aligned[1], &aligned[2])
    }
}
