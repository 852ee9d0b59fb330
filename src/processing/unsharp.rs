//! Unsharp masking, plain and adaptive.

use rayon::prelude::*;

use super::settings::{UnsharpMask, RAW_IMAGE_BLUR_SIGMA};
use crate::math::convolution::{convolve_separable, ConvolutionMethod};

/// Coefficients of the cubic transition `a·l³ + b·l² + c·l + d` that takes
/// the amount from `amount_min` to `amount_max` across
/// `[threshold - width, threshold + width]`, with zero derivative at both
/// ends and an inflection at `threshold`.
pub fn transition_curve(mask: &UnsharpMask) -> [f32; 4] {
    let UnsharpMask { amount_min, amount_max, threshold, width, .. } = *mask;
    let divisor = 4.0 * width * width * width;

    let a = (amount_min - amount_max) / divisor;
    let b = 3.0 * (amount_max - amount_min) * threshold / divisor;
    let c = 3.0 * (amount_max - amount_min) * (width - threshold) * (width + threshold) / divisor;
    let d = (2.0 * width * width * width * (amount_min + amount_max)
        + 3.0 * threshold * width * width * (amount_min - amount_max)
        + threshold * threshold * threshold * (amount_max - amount_min))
        / divisor;

    [a, b, c, d]
}

/// The spatially varying amount for a steering brightness `l`.
#[inline]
pub fn adaptive_amount(mask: &UnsharpMask, curve: &[f32; 4], l: f32) -> f32 {
    if l < mask.threshold - mask.width {
        mask.amount_min
    } else if l > mask.threshold + mask.width {
        mask.amount_max
    } else {
        l * (l * (curve[0] * l + curve[1]) + curve[2]) + curve[3]
    }
}

/// Computes the steering signal for adaptive masking: the raw mono image
/// blurred with a fixed small sigma to alleviate noise.
pub fn steering_signal(raw_mono: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut blurred = vec![0.0f32; raw_mono.len()];
    convolve_separable(
        raw_mono,
        &mut blurred,
        width,
        height,
        RAW_IMAGE_BLUR_SIGMA,
        ConvolutionMethod::Auto,
    );
    blurred
}

/// Applies one unsharp mask to `input`, writing to `output` (clamped to
/// `[0, 1]`). For the adaptive variant `steering` must hold the blurred
/// raw-image brightness of the same selection.
pub fn apply_unsharp_mask(
    mask: &UnsharpMask,
    input: &[f32],
    output: &mut [f32],
    width: usize,
    height: usize,
    steering: Option<&[f32]>,
) {
    assert_eq!(input.len(), width * height);
    assert_eq!(output.len(), width * height);

    let mut gaussian = vec![0.0f32; input.len()];
    convolve_separable(input, &mut gaussian, width, height, mask.sigma, ConvolutionMethod::Auto);

    if !mask.adaptive {
        // constant amount over the whole image
        let amount = mask.amount_max;
        output
            .par_iter_mut()
            .zip(input.par_iter())
            .zip(gaussian.par_iter())
            .for_each(|((out, &inp), &g)| {
                *out = (amount * inp + (1.0 - amount) * g).clamp(0.0, 1.0);
            });
    } else {
        let steering = steering.expect("adaptive unsharp masking requires the steering signal");
        assert_eq!(steering.len(), input.len());
        let curve = transition_curve(mask);

        output
            .par_iter_mut()
            .zip(input.par_iter())
            .zip(gaussian.par_iter())
            .zip(steering.par_iter())
            .for_each(|(((out, &inp), &g), &l)| {
                let amount = adaptive_amount(mask, &curve, l);
                *out = (amount * inp + (1.0 - amount) * g).clamp(0.0, 1.0);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(amount_min: f32, amount_max: f32, threshold: f32, width: f32) -> UnsharpMask {
        UnsharpMask { adaptive: true, sigma: 1.3, amount_min, amount_max, threshold, width }
    }

    #[test]
    fn amount_one_non_adaptive_is_identity() {
        let m = UnsharpMask { adaptive: false, amount_max: 1.0, ..Default::default() };
        let input: Vec<f32> = (0..32 * 32).map(|i| (i % 7) as f32 / 7.0).collect();
        let mut output = vec![0.0f32; input.len()];
        apply_unsharp_mask(&m, &input, &mut output, 32, 32, None);
        for (o, i) in output.iter().zip(&input) {
            assert!((o - i).abs() < 1e-6);
        }
    }

    #[test]
    fn transition_curve_hits_amounts_at_interval_ends() {
        let m = mask(1.0, 2.0, 0.5, 0.1);
        let c = transition_curve(&m);

        let at = |l: f32| l * (l * (c[0] * l + c[1]) + c[2]) + c[3];
        assert!((at(0.4) - 1.0).abs() < 1e-4, "{}", at(0.4));
        assert!((at(0.6) - 2.0).abs() < 1e-4, "{}", at(0.6));
        // inflection at the threshold maps to the mid amount
        assert!((at(0.5) - 1.5).abs() < 1e-4, "{}", at(0.5));

        // derivative roughly zero at the ends
        let eps = 1e-3;
        assert!(((at(0.4 + eps) - at(0.4)) / eps).abs() < 0.05);
        assert!(((at(0.6) - at(0.6 - eps)) / eps).abs() < 0.05);
    }

    #[test]
    fn adaptive_amount_clamps_outside_transition() {
        let m = mask(1.0, 2.0, 0.5, 0.1);
        let c = transition_curve(&m);
        assert_eq!(adaptive_amount(&m, &c, 0.1), 1.0);
        assert_eq!(adaptive_amount(&m, &c, 0.9), 2.0);
    }

    #[test]
    fn adaptive_on_constant_dark_image_is_identity() {
        // steering 0.4 sits below threshold - width -> amount_min = 1.0
        let m = mask(1.0, 2.0, 0.5, 0.05);
        let input = vec![0.4f32; 24 * 24];
        let steering = steering_signal(&input, 24, 24);
        let mut output = vec![0.0f32; input.len()];
        apply_unsharp_mask(&m, &input, &mut output, 24, 24, Some(&steering));
        for (o, i) in output.iter().zip(&input) {
            assert!((o - i).abs() < 1e-5);
        }
    }

    #[test]
    fn adaptive_on_bright_image_uses_amount_max() {
        // a bright image with an edge; steering ~0.7 > threshold + width
        let width = 32;
        let height = 32;
        let m = mask(1.0, 2.0, 0.5, 0.1);
        let mut input = vec![0.6f32; width * height];
        for y in 0..height {
            for x in 16..width {
                input[y * width + x] = 0.8;
            }
        }
        let steering = vec![0.9f32; width * height];
        let mut adaptive_out = vec![0.0f32; input.len()];
        apply_unsharp_mask(&m, &input, &mut adaptive_out, width, height, Some(&steering));

        let plain = UnsharpMask { adaptive: false, ..m };
        let mut plain_out = vec![0.0f32; input.len()];
        apply_unsharp_mask(&plain, &input, &mut plain_out, width, height, None);

        for (a, p) in adaptive_out.iter().zip(&plain_out) {
            assert!((a - p).abs() < 1e-6);
        }
    }
}
