//! 2D Gaussian convolution on float planes.
//!
//! Two interchangeable implementations: direct separable convolution with
//! the sampled kernel (exact, fast for small kernels) and the Young & van
//! Vliet recursive approximation (constant cost per pixel regardless of
//! sigma). [`ConvolutionMethod::Auto`] switches between them on kernel
//! radius. Borders are clamp-to-edge in both. Intermediate results are
//! kept transposed so both passes run along rows; transposition itself is
//! done in square blocks for cache friendliness.

use rayon::prelude::*;

use super::gauss::{gaussian_kernel_projection, kernel_radius};

/// Matrices are transposed in square blocks of this length to a side.
const TRANSPOSITION_BLOCK_SIZE: usize = 16;

/// Minimum kernel radius for which the recursive convolution is used in
/// `Auto` mode; below it the standard implementation is faster.
pub const YOUNG_VAN_VLIET_MIN_KERNEL_RADIUS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolutionMethod {
    Standard,
    YoungVanVliet,
    Auto,
}

/// Transposes `input` (`width` columns, `height` rows) into `output`.
pub fn transpose(input: &[f32], output: &mut [f32], width: usize, height: usize) {
    assert_eq!(input.len(), width * height);
    assert_eq!(output.len(), width * height);

    let bs = TRANSPOSITION_BLOCK_SIZE;

    for bj in 0..height / bs {
        for bi in 0..width / bs {
            for y in 0..bs {
                for x in 0..bs {
                    output[(bi * bs + x) * height + bj * bs + y] =
                        input[(bj * bs + y) * width + bi * bs + x];
                }
            }
        }
    }

    // remaining elements right of and below the whole blocks
    let rem_x = width - width % bs;
    let rem_y = height - height % bs;
    for j in 0..height {
        for i in rem_x..width {
            output[i * height + j] = input[j * width + i];
        }
    }
    for j in rem_y..height {
        for i in 0..width {
            output[i * height + j] = input[j * width + i];
        }
    }
}

// Convolves every row of `input` with `kernel` (clamp-to-edge) into the
// matching row of `output`.
fn convolve_rows(input: &[f32], output: &mut [f32], width: usize, kernel: &[f32], radius: usize) {
    output
        .par_chunks_mut(width)
        .zip(input.par_chunks(width))
        .for_each(|(out_row, in_row)| {
            for x in 0..width {
                let mut acc = 0.0f32;
                for (j, k) in kernel.iter().enumerate() {
                    let ofs = j as i64 - (radius as i64 - 1);
                    let src = (x as i64 + ofs).clamp(0, width as i64 - 1) as usize;
                    acc += in_row[src] * k;
                }
                out_row[x] = acc;
            }
        });
}

/// Separable convolution with the sampled Gaussian kernel; the result is
/// written to `output` in transposed form (`height` columns).
pub fn convolve_separable_transpose(
    input: &[f32],
    output: &mut [f32],
    width: usize,
    height: usize,
    kernel: &[f32],
    radius: usize,
    temp: &mut [f32],
) {
    assert_eq!(kernel.len(), 2 * radius - 1);
    assert_eq!(temp.len(), width * height);

    convolve_rows(input, temp, width, kernel, radius);

    let mut transposed = vec![0.0f32; width * height];
    transpose(temp, &mut transposed, width, height);

    // the former columns are rows now
    convolve_rows(&transposed, output, height, kernel, radius);
}

/// Young & van Vliet coefficients for a given sigma.
/// Returns `(b0_inv, b1, b2, b3, big_b)`.
pub fn yvv_coefficients(sigma: f32) -> (f32, f32, f32, f32, f32) {
    let q = if (0.5..=2.5).contains(&sigma) {
        3.97156 - 4.14554 * (1.0 - 0.26891 * sigma).sqrt()
    } else {
        0.98711 * sigma - 0.9633
    };

    let b0 = 1.57825 + 2.44413 * q + 1.4281 * q * q + 0.422205 * q * q * q;
    let b1 = 2.44413 * q + 2.85619 * q * q + 1.26661 * q * q * q;
    let b2 = -1.4281 * q * q - 1.26661 * q * q * q;
    let b3 = 0.422205 * q * q * q;
    let big_b = 1.0 - (b1 + b2 + b3) / b0;

    (1.0 / b0, b1, b2, b3, big_b)
}

// One directional pass of the recursive filter over a contiguous row.
// `forward == false` starts at the last element. Border values are assumed
// to extend beyond the array.
fn yvv_filter_row(row: &mut [f32], forward: bool, coef: (f32, f32, f32, f32, f32)) {
    let (b0_inv, b1, b2, b3, big_b) = coef;
    let len = row.len();
    if len == 0 {
        return;
    }

    let first = if forward { row[0] } else { row[len - 1] };
    let (mut prev1, mut prev2, mut prev3) = (first, first, first);

    let mut step = |v: &mut f32| {
        let next = big_b * *v + (b1 * prev1 + b2 * prev2 + b3 * prev3) * b0_inv;
        prev3 = prev2;
        prev2 = prev1;
        prev1 = next;
        *v = next;
    };

    if forward {
        row.iter_mut().for_each(&mut step);
    } else {
        row.iter_mut().rev().for_each(&mut step);
    }
}

/// Recursive Gaussian approximation; the result is written to `output` in
/// transposed form. Requires `sigma >= 0.5`.
pub fn convolve_gaussian_recursive_transpose(
    input: &[f32],
    output: &mut [f32],
    width: usize,
    height: usize,
    sigma: f32,
    temp: &mut [f32],
) {
    assert!(sigma >= 0.5);
    assert_eq!(temp.len(), width * height);

    let coef = yvv_coefficients(sigma);

    temp.copy_from_slice(input);
    temp.par_chunks_mut(width).for_each(|row| {
        yvv_filter_row(row, true, coef);
        yvv_filter_row(row, false, coef);
    });

    transpose(temp, output, width, height);

    output.par_chunks_mut(height).for_each(|row| {
        yvv_filter_row(row, true, coef);
        yvv_filter_row(row, false, coef);
    });
}

/// Convolves `input` with a Gaussian of the given sigma into `output`
/// (same orientation as the input).
pub fn convolve_separable(
    input: &[f32],
    output: &mut [f32],
    width: usize,
    height: usize,
    sigma: f32,
    method: ConvolutionMethod,
) {
    assert_eq!(input.len(), width * height);
    assert_eq!(output.len(), width * height);

    let radius = kernel_radius(sigma).max(1);
    let mut output_t = vec![0.0f32; width * height];
    let mut temp = vec![0.0f32; width * height];

    let use_standard = match method {
        ConvolutionMethod::Standard => true,
        ConvolutionMethod::YoungVanVliet => false,
        ConvolutionMethod::Auto => radius < YOUNG_VAN_VLIET_MIN_KERNEL_RADIUS,
    };

    if use_standard {
        let kernel = gaussian_kernel_projection(radius, sigma, true);
        convolve_separable_transpose(input, &mut output_t, width, height, &kernel, radius, &mut temp);
    } else {
        convolve_gaussian_recursive_transpose(input, &mut output_t, width, height, sigma, &mut temp);
    }

    transpose(&output_t, output, height, width);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_round_trip() {
        let width = 37;
        let height = 23;
        let input: Vec<f32> = (0..width * height).map(|v| v as f32).collect();
        let mut t = vec![0.0f32; width * height];
        let mut back = vec![0.0f32; width * height];

        transpose(&input, &mut t, width, height);
        transpose(&t, &mut back, height, width);
        assert_eq!(input, back);

        // spot-check one element
        assert_eq!(t[5 * height + 3], input[3 * width + 5]);
    }

    #[test]
    fn convolution_preserves_total_mass() {
        let width = 64;
        let height = 64;
        let mut input = vec![0.0f32; width * height];
        input[32 * width + 32] = 1.0;
        let mut output = vec![0.0f32; width * height];

        convolve_separable(&input, &mut output, width, height, 2.0, ConvolutionMethod::Standard);

        let total: f32 = output.iter().sum();
        assert!((total - 1.0).abs() < 1e-4, "mass {total}");
        // peak stays in place
        let (argmax, _) = output
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert_eq!(argmax, 32 * width + 32);
    }

    #[test]
    fn convolution_is_constant_on_flat_input() {
        let width = 48;
        let height = 32;
        let input = vec![0.5f32; width * height];
        let mut output = vec![0.0f32; width * height];

        for method in [ConvolutionMethod::Standard, ConvolutionMethod::YoungVanVliet] {
            convolve_separable(&input, &mut output, width, height, 3.0, method);
            for &v in &output {
                assert!((v - 0.5).abs() < 1e-3, "{method:?}: {v}");
            }
        }
    }

    #[test]
    fn recursive_approximates_standard() {
        let width = 96;
        let height = 96;
        let mut input = vec![0.0f32; width * height];
        // a few structured features
        for y in 40..56 {
            for x in 30..70 {
                input[y * width + x] = 1.0;
            }
        }

        let sigma = 3.0;
        let mut standard = vec![0.0f32; width * height];
        let mut recursive = vec![0.0f32; width * height];
        convolve_separable(&input, &mut standard, width, height, sigma, ConvolutionMethod::Standard);
        convolve_separable(
            &input,
            &mut recursive,
            width,
            height,
            sigma,
            ConvolutionMethod::YoungVanVliet,
        );

        let max_diff = standard
            .iter()
            .zip(&recursive)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff < 0.02, "max diff {max_diff}");
    }

    #[test]
    fn channel_independence_on_interleaved_planes() {
        // convolving two planes separately must not mix them
        let width = 32;
        let height = 32;
        let mut plane_a = vec![0.0f32; width * height];
        let plane_b = vec![0.25f32; width * height];
        plane_a[16 * width + 16] = 1.0;

        let mut out_a = vec![0.0f32; width * height];
        let mut out_b = vec![0.0f32; width * height];
        convolve_separable(&plane_a, &mut out_a, width, height, 1.5, ConvolutionMethod::Auto);
        convolve_separable(&plane_b, &mut out_b, width, height, 1.5, ConvolutionMethod::Auto);

        for &v in &out_b {
            assert!((v - 0.25).abs() < 1e-4);
        }
        assert!(out_a[16 * width + 16] > 0.0);
    }
}
