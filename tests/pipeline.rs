//! End-to-end scenarios: file round trips through processing, pipeline
//! no-op identities, deconvolution of a synthetic point source, adaptive
//! unsharp masking behavior and stack alignment.

use astrapost::backend::cpu::CpuProcessing;
use astrapost::backend::{run_to_completion, ProcessingBackend};
use astrapost::image::ops::resize_and_translate;
use astrapost::math::convolution::{convolve_separable, ConvolutionMethod};
use astrapost::processing::settings::LucyRichardsonSettings;
use astrapost::{
    align_images, load_image, process_image, save_image, AlignmentMethod, AlignmentParams,
    CompletionStatus, CropMode, Image, NoopProgress, OutputFormat, PixelFormat,
    ProcessingRequest, ProcessingSettings, UnsharpMask,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn mono32f_from(values: &[f32], width: u32, height: u32) -> Image {
    let mut img = Image::new(width, height, PixelFormat::Mono32f);
    for y in 0..height {
        img.row_as_mut::<f32>(y)
            .copy_from_slice(&values[(y * width) as usize..((y + 1) * width) as usize]);
    }
    img
}

fn assert_images_close(a: &Image, b: &Image, tolerance: f32) {
    assert_eq!(a.width(), b.width());
    assert_eq!(a.height(), b.height());
    for y in 0..a.height() {
        let ra = a.row_as::<f32>(y);
        let rb = b.row_as::<f32>(y);
        for (va, vb) in ra.iter().zip(rb) {
            assert!((va - vb).abs() <= tolerance, "row {y}: {va} vs {vb}");
        }
    }
}

// Scenario 1: BMP mono -> TIFF 16-bit with exact byte-replication scaling.
#[test]
fn bmp_to_tiff16_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let bmp = dir.path().join("test.bmp");
    let tif = dir.path().join("out.tif");

    let mut img = Image::new(3, 2, PixelFormat::Mono8);
    img.row_mut(0).copy_from_slice(&[0, 127, 255]);
    img.row_mut(1).copy_from_slice(&[10, 20, 30]);
    save_image(&img, &bmp, OutputFormat::Bmp8).unwrap();

    let loaded = load_image(&bmp, false).unwrap();
    assert_eq!(loaded.pixel_format(), PixelFormat::Mono8);
    save_image(&loaded, &tif, OutputFormat::Tiff16).unwrap();

    let reloaded = load_image(&tif, false).unwrap();
    assert_eq!(reloaded.pixel_format(), PixelFormat::Mono16);
    assert_eq!(reloaded.row_as::<u16>(0), &[0, 32639, 65535]);
    assert_eq!(reloaded.row_as::<u16>(1), &[2570, 5140, 7710]);
}

// Scenario 2: a settings snapshot where every stage is a no-op.
#[test]
fn all_noop_stages_reproduce_the_input() {
    let values: Vec<f32> = (0..100 * 100).map(|i| (i % 97) as f32 / 97.0).collect();
    let img = mono32f_from(&values, 100, 100);

    let mut settings = ProcessingSettings::new();
    settings.lucy_richardson.iterations = 0;
    settings.unsharp_masks = vec![UnsharpMask {
        adaptive: false,
        amount_max: 1.0,
        ..Default::default()
    }];
    // tone curve stays the identity

    let out = process_image(&img, &settings).unwrap();
    assert_images_close(&out, &img, 1e-6);
}

// Scenario 3: L-R deconvolution of a Gaussian-blurred point source.
#[test]
fn deconvolution_restores_a_point_source() {
    init_logging();
    let width = 100usize;
    let height = 100usize;
    let sigma = 1.5f32;

    let mut truth = vec![0.0f32; width * height];
    truth[50 * width + 50] = 1.0;
    let mut observed = vec![0.0f32; width * height];
    convolve_separable(&truth, &mut observed, width, height, sigma, ConvolutionMethod::Standard);
    let img = mono32f_from(&observed, width as u32, height as u32);

    let mut settings = ProcessingSettings::new();
    settings.lucy_richardson =
        LucyRichardsonSettings { sigma, iterations: 30, deringing: false };

    let out = process_image(&img, &settings).unwrap();

    let mut argmax = (0u32, 0u32);
    let mut max_val = f32::MIN;
    let mut total = 0.0f32;
    for y in 0..out.height() {
        for (x, &v) in out.row_as::<f32>(y).iter().enumerate() {
            total += v;
            if v > max_val {
                max_val = v;
                argmax = (x as u32, y);
            }
        }
    }
    assert_eq!(argmax, (50, 50));

    let mut boxed = 0.0f32;
    for y in 49..=51u32 {
        for x in 49..=51usize {
            boxed += out.row_as::<f32>(y)[x];
        }
    }
    assert!(boxed / total >= 0.95, "mass ratio {}", boxed / total);
}

// Scenario 4: the adaptive amount switches between min and max with the
// steering brightness.
#[test]
fn adaptive_unsharp_masking_follows_brightness() {
    let mask = UnsharpMask {
        adaptive: true,
        sigma: 1.3,
        amount_min: 1.0,
        amount_max: 2.0,
        threshold: 0.5,
        width: 0.1,
    };

    // constant 0.4 image: steering below threshold - width, amount_min = 1
    // applies, which is an identity
    let dark = mono32f_from(&vec![0.4f32; 64 * 64], 64, 64);
    let mut settings = ProcessingSettings::new();
    settings.unsharp_masks = vec![mask];
    let out = process_image(&dark, &settings).unwrap();
    assert_images_close(&out, &dark, 1e-5);

    // bright image with an edge: amount_max applies, matching the plain
    // mask with the same amount
    let mut bright_values = vec![0.65f32; 64 * 64];
    for y in 0..64usize {
        for x in 32..64usize {
            bright_values[y * 64 + x] = 0.75;
        }
    }
    let bright = mono32f_from(&bright_values, 64, 64);
    let out_adaptive = process_image(&bright, &settings).unwrap();

    settings.unsharp_masks =
        vec![UnsharpMask { adaptive: false, ..mask }];
    let out_plain = process_image(&bright, &settings).unwrap();
    assert_images_close(&out_adaptive, &out_plain, 1e-5);
}

// Scenario 5: aligning a shifted pair in crop mode.
#[test]
fn alignment_of_shifted_pair_crops_to_intersection() {
    let dir = tempfile::tempdir().unwrap();

    let mut base = Image::new(200, 200, PixelFormat::Mono8);
    for y in 0..200u32 {
        let row = base.row_mut(y);
        for x in 0..200usize {
            let fx = x as f32;
            let fy = y as f32;
            let blob = |cx: f32, cy: f32, s: f32| {
                (-((fx - cx).powi(2) + (fy - cy).powi(2)) / (2.0 * s * s)).exp()
            };
            let v = blob(60.0, 110.0, 9.0) + 0.8 * blob(140.0, 70.0, 13.0);
            row[x] = (v.min(1.0) * 255.0) as u8;
        }
    }

    let base_f = base.convert_pixel_format(PixelFormat::Mono32f).unwrap();
    let mut shifted_f = Image::new(200, 200, PixelFormat::Mono32f);
    resize_and_translate(&base_f, &mut shifted_f, base_f.rect(), 3.0, -2.0, true).unwrap();
    let shifted = shifted_f.convert_pixel_format(PixelFormat::Mono8).unwrap();

    let path_a = dir.path().join("a.bmp");
    let path_b = dir.path().join("b.bmp");
    save_image(&base, &path_a, OutputFormat::Bmp8).unwrap();
    save_image(&shifted, &path_b, OutputFormat::Bmp8).unwrap();

    let params = AlignmentParams {
        method: AlignmentMethod::PhaseCorrelation,
        crop_mode: CropMode::Crop,
        subpixel: false,
        output_dir: dir.path().to_path_buf(),
        suffix: Some("_reg".into()),
    };
    let summary = align_images(&[path_a, path_b], &params, &NoopProgress).unwrap();

    let t = summary.translations[1];
    assert_eq!((t.x as i32, t.y as i32), (3, -2));
    assert_eq!(summary.output_size, (197, 198));
}

// Scenario 6: RGB channel alignment re-registers shifted channels.
#[test]
fn rgb_alignment_restores_registration() {
    let mut mono = Image::new(160, 160, PixelFormat::Mono32f);
    for y in 0..160u32 {
        let row = mono.row_as_mut::<f32>(y);
        for x in 0..160usize {
            let fx = x as f32;
            let fy = y as f32;
            let blob = |cx: f32, cy: f32, s: f32| {
                (-((fx - cx).powi(2) + (fy - cy).powi(2)) / (2.0 * s * s)).exp()
            };
            row[x] = blob(60.0, 80.0, 8.0) + 0.5 * blob(110.0, 50.0, 11.0);
        }
    }

    let mut g = Image::new(160, 160, PixelFormat::Mono32f);
    resize_and_translate(&mono, &mut g, mono.rect(), 2.0, -1.0, true).unwrap();
    let mut b = Image::new(160, 160, PixelFormat::Mono32f);
    resize_and_translate(&mono, &mut b, mono.rect(), -1.0, 3.0, true).unwrap();

    let rgb = Image::combine_rgb(&mono, &g, &b).unwrap();
    let aligned = rgb.align_rgb().unwrap();

    let (ar, ag, ab) = aligned.split_rgb().unwrap();
    for channel in [&ag, &ab] {
        let (tx, ty) = astrapost::align::phase_correlation::determine_translation(
            &ar, channel, false,
        )
        .unwrap();
        assert_eq!((tx as i32, ty as i32), (0, 0));
    }
}

// Incremental scheduling: only the stages downstream of a change re-run,
// and the tone curve output picks up precise values before export.
#[test]
fn incremental_rerun_after_tone_curve_change() {
    init_logging();
    let values: Vec<f32> = (0..64 * 64).map(|i| (i % 61) as f32 / 61.0).collect();
    let img = mono32f_from(&values, 64, 64);

    let mut backend = CpuProcessing::new();
    backend.set_image(img.clone()).unwrap();

    let mut settings = ProcessingSettings::new();
    settings.lucy_richardson =
        LucyRichardsonSettings { sigma: 1.3, iterations: 5, deringing: false };
    backend.set_settings(settings.clone());

    backend.start(ProcessingRequest::Sharpening).unwrap();
    assert_eq!(run_to_completion(&mut backend), CompletionStatus::Completed);
    let first = backend.processed_output().unwrap();

    // change only the tone curve; re-run just that stage
    settings.tone_curve.set_gamma_mode(true);
    settings.tone_curve.set_gamma(2.0);
    backend.set_settings(settings);
    backend.start(ProcessingRequest::ToneCurve).unwrap();
    assert_eq!(run_to_completion(&mut backend), CompletionStatus::Completed);
    let second = backend.processed_output().unwrap();

    // gamma brightens midtones relative to the first pass
    let mut brightened = 0usize;
    let mut compared = 0usize;
    for y in 0..64 {
        let a = first.row_as::<f32>(y);
        let b = second.row_as::<f32>(y);
        for (va, vb) in a.iter().zip(b) {
            if *va > 0.05 && *va < 0.95 {
                compared += 1;
                if vb > va {
                    brightened += 1;
                }
            }
        }
    }
    assert!(compared > 0);
    assert!(brightened as f32 / compared as f32 > 0.9);
}
