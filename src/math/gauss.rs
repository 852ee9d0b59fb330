//! Gaussian kernel calculations.

/// Kernel radius used for a Gaussian of the given sigma.
pub fn kernel_radius(sigma: f32) -> usize {
    (sigma * 3.0).ceil() as usize
}

/// 1D projection of a 2D Gaussian kernel with `2*radius - 1` elements;
/// element `[radius - 1]` is the middle (peak).
pub fn gaussian_kernel_projection(radius: usize, sigma: f32, normalized: bool) -> Vec<f32> {
    assert!(radius >= 1);
    let len = 2 * radius - 1;
    let mut kernel: Vec<f32> = (0..len)
        .map(|i| {
            let d = (radius as i64 - 1 - i as i64) as f32;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();

    if normalized {
        let sum: f32 = kernel.iter().sum();
        for v in kernel.iter_mut() {
            *v /= sum;
        }
    }
    kernel
}

/// Half of a normalized 1D Gaussian kernel: element `[0]` is the peak.
/// This is the layout the GPU convolution shaders consume.
pub fn half_gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = kernel_radius(sigma).max(1);
    let full = gaussian_kernel_projection(radius, sigma, true);
    full[radius - 1..].to_vec()
}

/// In-place Gaussian blur of a 1D vector, borders replicated.
pub fn gaussian_blur_1d(values: &mut [f32], sigma: f32) {
    let radius = kernel_radius(sigma).max(1);
    let kernel = gaussian_kernel_projection(radius, sigma, true);
    let n = values.len() as i64;
    if n == 0 {
        return;
    }

    let mut result = vec![0.0f32; values.len()];
    for (i, out) in result.iter_mut().enumerate() {
        for (j, k) in kernel.iter().enumerate() {
            let src = (i as i64 - (radius as i64 - 1) + j as i64).clamp(0, n - 1);
            *out += values[src as usize] * k;
        }
    }
    values.copy_from_slice(&result);
}
