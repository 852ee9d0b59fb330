//! Lucy–Richardson deconvolution with a Gaussian PSF, and the deringing
//! preprocessing that suppresses oscillations around overexposed areas.

use rayon::prelude::*;

use crate::math::convolution::{
    convolve_gaussian_recursive_transpose, convolve_separable, convolve_separable_transpose,
    ConvolutionMethod, YOUNG_VAN_VLIET_MIN_KERNEL_RADIUS,
};
use crate::math::gauss::{gaussian_kernel_projection, kernel_radius};

// epsilon added to the divisor to prevent division by zero and NaN
// propagation across output pixels
const DIV_EPSILON: f32 = 1.0e-8;

/// Deconvolves `input` (a `width x height` float plane) assuming it is the
/// original image convolved with a Gaussian of the given sigma. The seed
/// estimate is the input itself; with `iterations == 0` the output equals
/// the input. The caller clamps the final result.
///
/// `on_iteration(done, total)` runs after every iteration; `check_abort`
/// is polled between iterations and stops the loop early when it returns
/// true (the output then holds the most recent estimate).
pub fn lucy_richardson_gaussian(
    input: &[f32],
    output: &mut [f32],
    width: usize,
    height: usize,
    iterations: u32,
    sigma: f32,
    method: ConvolutionMethod,
    mut on_iteration: impl FnMut(u32, u32),
    mut check_abort: impl FnMut() -> bool,
) {
    assert_eq!(input.len(), width * height);
    assert_eq!(output.len(), width * height);

    if iterations == 0 {
        output.copy_from_slice(input);
        return;
    }

    let n = width * height;
    let radius = kernel_radius(sigma).max(1);
    let use_standard = match method {
        ConvolutionMethod::Standard => true,
        ConvolutionMethod::YoungVanVliet => false,
        ConvolutionMethod::Auto => radius < YOUNG_VAN_VLIET_MIN_KERNEL_RADIUS,
    };
    let kernel = gaussian_kernel_projection(radius, sigma, true);

    let mut prev = input.to_vec();
    let mut next = vec![0.0f32; n];

    // the inner arrays are kept transposed between the two convolutions
    let mut input_t = vec![0.0f32; n];
    crate::math::convolution::transpose(input, &mut input_t, width, height);

    let mut estimate_convolved_t = vec![0.0f32; n];
    let mut input_convolved_div_t = vec![0.0f32; n];
    let mut conv2 = vec![0.0f32; n];
    let mut temp = vec![0.0f32; n];

    let convolve_t =
        |src: &[f32], dest: &mut [f32], w: usize, h: usize, temp: &mut [f32]| {
            if use_standard {
                convolve_separable_transpose(src, dest, w, h, &kernel, radius, temp);
            } else {
                convolve_gaussian_recursive_transpose(src, dest, w, h, sigma, temp);
            }
        };

    for iter in 0..iterations {
        // estimate (*) PSF, transposed
        convolve_t(&prev, &mut estimate_convolved_t, width, height, &mut temp);

        input_convolved_div_t
            .par_iter_mut()
            .zip(input_t.par_iter())
            .zip(estimate_convolved_t.par_iter())
            .for_each(|((out, &inp), &est)| {
                *out = inp / (est + DIV_EPSILON);
            });

        // back through the PSF; width and height swap because the source
        // is transposed
        convolve_t(&input_convolved_div_t, &mut conv2, height, width, &mut temp);

        next.par_iter_mut()
            .zip(prev.par_iter())
            .zip(conv2.par_iter())
            .for_each(|((n, &p), &c)| {
                *n = p * c;
            });

        std::mem::swap(&mut prev, &mut next);

        on_iteration(iter + 1, iterations);
        if check_abort() {
            break;
        }
    }

    output.copy_from_slice(&prev);
}

/// Clamps a float plane to `[0, 1]`.
pub fn clamp_unit(values: &mut [f32]) {
    for v in values.iter_mut() {
        *v = v.clamp(0.0, 1.0);
    }
}

/// Marks pixels lying within `ceil(2*sigma)` of any "border pixel": a
/// pixel at or above `threshold` adjacent to one below it.
pub fn fill_threshold_vicinity_mask(
    input: &[f32],
    mask: &mut [u8],
    width: usize,
    height: usize,
    threshold: f32,
    sigma: f32,
) {
    assert_eq!(input.len(), width * height);
    assert_eq!(mask.len(), width * height);
    mask.fill(0);

    let mut border_pixels: Vec<(usize, usize)> = Vec::new();

    for y in 0..height {
        for x in 0..width {
            if input[y * width + x] >= threshold {
                continue;
            }
            for j in -1i64..=1 {
                for i in -1i64..=1 {
                    if i == 0 && j == 0 {
                        continue;
                    }
                    let nx = x as i64 + i;
                    let ny = y as i64 + j;
                    if nx >= 0
                        && nx < width as i64
                        && ny >= 0
                        && ny < height as i64
                        && input[ny as usize * width + nx as usize] >= threshold
                    {
                        border_pixels.push((nx as usize, ny as usize));
                    }
                }
            }
        }
    }

    let influence_dist = (sigma * 2.0).ceil() as i64;
    for (x, y) in border_pixels {
        for j in -(influence_dist - 1)..=(influence_dist - 1) {
            for i in -(influence_dist - 1)..=(influence_dist - 1) {
                let nx = x as i64 + i;
                let ny = y as i64 + j;
                if nx >= 0 && nx < width as i64 && ny >= 0 && ny < height as i64 {
                    mask[ny as usize * width + nx as usize] = 1;
                }
            }
        }
    }
}

/// Deringing preprocessing: blurs the whole plane with a Gaussian of the
/// L-R sigma and keeps the blurred values only where the vicinity mask is
/// set, the originals elsewhere. The result is what actually enters L-R.
pub fn blur_threshold_vicinity(
    input: &[f32],
    output: &mut [f32],
    work_mask: &mut [u8],
    width: usize,
    height: usize,
    threshold: f32,
    sigma: f32,
) {
    assert_eq!(input.len(), output.len());
    assert_eq!(input.len(), work_mask.len());

    fill_threshold_vicinity_mask(input, work_mask, width, height, threshold, sigma);

    convolve_separable(input, output, width, height, sigma, ConvolutionMethod::Auto);

    for ((out, &inp), &m) in output.iter_mut().zip(input).zip(work_mask.iter()) {
        if m == 0 {
            *out = inp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_iterations_is_identity() {
        let input: Vec<f32> = (0..64).map(|v| v as f32 / 64.0).collect();
        let mut output = vec![0.0f32; 64];
        lucy_richardson_gaussian(
            &input,
            &mut output,
            8,
            8,
            0,
            1.5,
            ConvolutionMethod::Auto,
            |_, _| {},
            || false,
        );
        assert_eq!(input, output);
    }

    #[test]
    fn deconvolution_concentrates_a_blurred_point() {
        let width = 100;
        let height = 100;
        let sigma = 1.5f32;

        // ground truth: single white pixel at (50, 50)
        let mut truth = vec![0.0f32; width * height];
        truth[50 * width + 50] = 1.0;

        // observed image: truth convolved with the PSF
        let mut observed = vec![0.0f32; width * height];
        convolve_separable(&truth, &mut observed, width, height, sigma, ConvolutionMethod::Standard);

        let mut restored = vec![0.0f32; width * height];
        lucy_richardson_gaussian(
            &observed,
            &mut restored,
            width,
            height,
            30,
            sigma,
            ConvolutionMethod::Standard,
            |_, _| {},
            || false,
        );
        clamp_unit(&mut restored);

        // argmax back at the point source
        let (argmax, _) = restored
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert_eq!((argmax % width, argmax / width), (50, 50));

        // at least 95% of the mass concentrated in the 3x3 box around it
        let total: f32 = restored.iter().sum();
        let mut boxed = 0.0f32;
        for y in 49..=51 {
            for x in 49..=51 {
                boxed += restored[y * width + x];
            }
        }
        assert!(boxed / total >= 0.95, "mass ratio {}", boxed / total);
    }

    #[test]
    fn iteration_callback_and_abort() {
        let input = vec![0.5f32; 16 * 16];
        let mut output = vec![0.0f32; 16 * 16];
        let iterations_seen = std::cell::Cell::new(0);
        lucy_richardson_gaussian(
            &input,
            &mut output,
            16,
            16,
            10,
            1.0,
            ConvolutionMethod::Standard,
            |_done, _total| iterations_seen.set(iterations_seen.get() + 1),
            || iterations_seen.get() >= 3,
        );
        assert_eq!(iterations_seen.get(), 3);
    }

    #[test]
    fn vicinity_mask_marks_bright_borders() {
        let width = 16;
        let height = 16;
        let mut input = vec![0.0f32; width * height];
        // bright block with a border at x = 8
        for y in 0..height {
            for x in 8..width {
                input[y * width + x] = 1.0;
            }
        }

        let mut mask = vec![0u8; width * height];
        fill_threshold_vicinity_mask(&input, &mut mask, width, height, 254.0 / 255.0, 2.0);

        // pixels near the border are marked, far-away dark pixels are not
        assert_eq!(mask[8 * width + 8], 1);
        assert_eq!(mask[8 * width + 7], 1);
        assert_eq!(mask[8 * width + 0], 0);
    }

    #[test]
    fn deringing_keeps_unmasked_pixels_intact() {
        let width = 32;
        let height = 32;
        let mut input = vec![0.1f32; width * height];
        for y in 12..20 {
            for x in 12..20 {
                input[y * width + x] = 1.0;
            }
        }

        let mut output = vec![0.0f32; width * height];
        let mut mask = vec![0u8; width * height];
        blur_threshold_vicinity(
            &input,
            &mut output,
            &mut mask,
            width,
            height,
            254.0 / 255.0,
            1.5,
        );

        for i in 0..width * height {
            if mask[i] == 0 {
                assert_eq!(output[i], input[i]);
            }
        }
        // something was actually blurred
        assert!(mask.iter().any(|&m| m == 1));
        assert!(output.iter().zip(&input).any(|(a, b)| a != b));
    }
}
