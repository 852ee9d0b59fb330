//! Solar limb detection: locates the disc in a `Mono8` frame and fits a
//! circle to the detected limb points, giving a translation anchor that
//! works even when the disc is partially outside the frame.

use glam::{DMat2, DMat3, DVec2, DVec3};
use log::debug;

use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat};

/// Rays fired from the centroid towards the limb.
const NUM_RAYS: usize = 64;
/// Pixels averaged at each end of a ray to flatten sharpening halos.
const NUM_BORDER_AVG: usize = 16;
/// Ray pixels ignored at the image border.
const SKIP_BORDER: usize = 6;
/// Length of the two sliding sums whose difference locates the limb.
const DIFF_SIZE: usize = 8;
/// Distance to back off towards the disc interior before scanning.
const BACK_OFFSET: usize = 20;
/// Gauss-Newton iterations of the circle fit.
const FIT_ITERATIONS: usize = 8;

/// Fitted disc: center (and radius when it was not fixed).
#[derive(Debug, Clone, Copy)]
pub struct Disc {
    pub center: DVec2,
    pub radius: f64,
}

/// Intensity centroid of a `Mono8` image.
pub fn centroid(img: &Image) -> Result<(u32, u32)> {
    if img.pixel_format() != PixelFormat::Mono8 {
        return Err(Error::invalid_arg("centroid requires a MONO8 image"));
    }

    let mut sum_x = 0u64;
    let mut sum_y = 0u64;
    let mut sum_vals = 0u64;
    for y in 0..img.height() {
        for (x, &v) in img.row(y).iter().enumerate() {
            sum_vals += v as u64;
            sum_x += x as u64 * v as u64;
            sum_y += y as u64 * v as u64;
        }
    }

    if sum_vals > 0 {
        Ok(((sum_x / sum_vals) as u32, (sum_y / sum_vals) as u32))
    } else {
        Ok((0, 0))
    }
}

fn sum_sqr_diffs(histogram: &[u32; 256], i_min: usize, i_max: usize) -> f32 {
    let mut avg = 0.0f32;
    let mut num_pix = 0u32;
    for i in i_min..=i_max {
        avg += (histogram[i] * i as u32) as f32;
        num_pix += histogram[i];
    }
    if num_pix == 0 {
        return 0.0;
    }
    avg /= num_pix as f32;

    let mut sum = 0.0f32;
    for i in i_min..=i_max {
        let d = i as f32 - avg;
        sum += histogram[i] as f32 * d * d;
    }
    sum
}

/// Brightness threshold separating the disc from the background: the
/// histogram position minimizing the total within-class squared deviation,
/// found by bisection.
pub fn disc_background_threshold(img: &Image) -> Result<u8> {
    if img.pixel_format() != PixelFormat::Mono8 {
        return Err(Error::invalid_arg("threshold detection requires a MONO8 image"));
    }

    let mut histogram = [0u32; 256];
    for y in 0..img.height() {
        for &v in img.row(y) {
            histogram[v as usize] += 1;
        }
    }

    let mut i_low = 0usize;
    let mut i_high = 255usize;
    let mut curr_div = (i_high - i_low) / 2;

    while i_high - i_low > 1 {
        let div_left = (i_low + curr_div) / 2;
        let div_right = (i_high + curr_div) / 2;

        let var_left =
            sum_sqr_diffs(&histogram, 0, div_left) + sum_sqr_diffs(&histogram, div_left, 255);
        let var_right =
            sum_sqr_diffs(&histogram, 0, div_right) + sum_sqr_diffs(&histogram, div_right, 255);

        if var_left < var_right {
            i_high = curr_div;
            curr_div = div_left;
        } else {
            i_low = curr_div;
            curr_div = div_right;
        }
    }

    Ok(curr_div as u8)
}

// Pixel positions and values along a ray from `origin` in direction `dir`
// up to the image border.
fn ray_points(img: &Image, origin: (u32, u32), dir: DVec2) -> Vec<(i64, i64, u8)> {
    let dir = dir.normalize();
    let mut points = Vec::new();
    let mut pos = DVec2::new(origin.0 as f64, origin.1 as f64);

    loop {
        let x = pos.x.round() as i64;
        let y = pos.y.round() as i64;
        if x < 0 || x >= img.width() as i64 || y < 0 || y >= img.height() as i64 {
            break;
        }
        let value = img.row(y as u32)[x as usize];
        if points.last().map(|&(px, py, _)| px != x || py != y).unwrap_or(true) {
            points.push((x, y, value));
        }
        pos += dir;
    }
    points
}

/// The limb crossing along a ray: the position of the largest absolute
/// difference between two adjacent sliding sums. Returns the transition
/// steepness alongside the point; zero-steepness results carry no signal.
fn find_limb_crossing(ray: &mut [(i64, i64, u8)], threshold: u8) -> Option<((i64, i64), i32)> {
    if ray.len() <= SKIP_BORDER {
        return None;
    }

    // flatten both ray ends to their average to counter halo artifacts
    let n = ray.len();
    let avg_start = (ray.iter().take(NUM_BORDER_AVG).map(|p| p.2 as u32).sum::<u32>()
        / NUM_BORDER_AVG.min(n) as u32) as u8;
    let avg_end = (ray.iter().rev().take(NUM_BORDER_AVG).map(|p| p.2 as u32).sum::<u32>()
        / NUM_BORDER_AVG.min(n) as u32) as u8;
    for i in 0..NUM_BORDER_AVG {
        if i < n {
            ray[i].2 = avg_start;
        }
        if n > i {
            ray[n - 1 - i].2 = avg_end;
        }
    }

    // scan inwards from the outer end for the first pixel at or above the
    // threshold, then back off towards the disc interior
    let mut curr = n - SKIP_BORDER;
    loop {
        if ray[curr].2 >= threshold {
            break;
        }
        if curr == 0 {
            break;
        }
        curr -= 1;
    }
    curr = curr.saturating_sub(BACK_OFFSET.max(curr / 10));

    // the largest absolute difference of DIFF_SIZE-pixel sums marks the
    // disc-background transition
    let mut max_diff = 0i32;
    let mut i_max_diff = curr;
    for i in curr..n {
        let mut sum_lo = 0i32;
        for j in 0..=DIFF_SIZE {
            let idx = i.saturating_sub(j);
            sum_lo += ray[idx].2 as i32;
        }
        let mut sum_hi = 0i32;
        for j in 0..DIFF_SIZE {
            let idx = (i + j).min(n - 1);
            sum_hi += ray[idx].2 as i32;
        }
        let diff = (sum_hi - sum_lo).abs();
        if diff > max_diff {
            max_diff = diff;
            i_max_diff = i;
        }
    }

    if max_diff == 0 {
        return None;
    }
    Some(((ray[i_max_diff].0, ray[i_max_diff].1), max_diff))
}

/// Reduces a point set to its 2D convex hull (gift wrapping; the point
/// counts here are tiny).
pub fn cull_to_convex_hull(points: &mut Vec<DVec2>) {
    if points.len() <= 3 {
        return;
    }

    let start = points
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.x.partial_cmp(&b.1.x).unwrap())
        .map(|(i, _)| i)
        .unwrap();

    let mut hull: Vec<usize> = vec![start];
    let mut current = start;
    loop {
        let mut candidate = (current + 1) % points.len();
        for i in 0..points.len() {
            if i == current {
                continue;
            }
            let cross = (points[candidate] - points[current])
                .perp_dot(points[i] - points[current]);
            if candidate == current || cross < 0.0 {
                candidate = i;
            }
        }
        if candidate == start {
            break;
        }
        hull.push(candidate);
        current = candidate;
        if hull.len() > points.len() {
            break; // degenerate input
        }
    }

    let culled: Vec<DVec2> = hull.into_iter().map(|i| points[i]).collect();
    *points = culled;
}

/// Gauss-Newton circle fit minimizing the radial residuals
/// `r_i = sqrt((x_i - cx)^2 + (y_i - cy)^2) - r`.
///
/// With `force_radius` set, only the center is fitted (2-parameter
/// problem); `initial_center`, when given, seeds the iteration (the
/// centroid of the points otherwise).
pub fn fit_circle(
    points: &[DVec2],
    force_radius: Option<f64>,
    initial_center: Option<DVec2>,
) -> Result<Disc> {
    if points.len() < 3 {
        return Err(Error::invalid_arg("circle fit needs at least three points"));
    }

    let mut center = match initial_center {
        Some(c) => c,
        None => points.iter().copied().sum::<DVec2>() / points.len() as f64,
    };

    let (mut min, mut max) = (points[0], points[0]);
    for p in points {
        min = min.min(*p);
        max = max.max(*p);
    }
    let mut radius = match force_radius {
        Some(r) => r,
        None => ((max.x - min.x) / 2.0 + (max.y - min.y) / 2.0) / 2.0,
    };

    for _ in 0..FIT_ITERATIONS {
        if force_radius.is_none() {
            // normal equations of the 3-parameter problem
            let mut jtj = DMat3::ZERO;
            let mut jtr = DVec3::ZERO;
            for p in points {
                let dist = (center - *p).length();
                if dist == 0.0 {
                    continue;
                }
                let j = DVec3::new((center.x - p.x) / dist, (center.y - p.y) / dist, -1.0);
                let r = dist - radius;
                jtj += DMat3::from_cols(j * j.x, j * j.y, j * j.z);
                jtr += j * r;
            }
            let delta = jtj.inverse() * jtr;
            center.x -= delta.x;
            center.y -= delta.y;
            radius -= delta.z;
        } else {
            let mut jtj = DMat2::ZERO;
            let mut jtr = DVec2::ZERO;
            for p in points {
                let dist = (center - *p).length();
                if dist == 0.0 {
                    continue;
                }
                let j = DVec2::new((center.x - p.x) / dist, (center.y - p.y) / dist);
                let r = dist - radius;
                jtj += DMat2::from_cols(j * j.x, j * j.y);
                jtr += j * r;
            }
            let delta = jtj.inverse() * jtr;
            center -= delta;
        }
    }

    if !center.x.is_finite()
        || !center.y.is_finite()
        || (force_radius.is_none() && (!radius.is_finite() || radius <= 0.0))
    {
        return Err(Error::invalid_arg("circle fit diverged"));
    }

    Ok(Disc { center, radius })
}

/// Finds the disc in a `Mono8` frame: centroid → threshold → limb points
/// along evenly distributed rays → convex hull → circle fit. Subsequent
/// frames can pass the previous result to seed the fit (and fix the
/// radius, making it a 2-parameter problem).
pub fn find_disc(img: &Image, previous: Option<&Disc>) -> Result<Disc> {
    let origin = centroid(img)?;
    let threshold = disc_background_threshold(img)?;
    debug!("disc detection: centroid {origin:?}, threshold {threshold}");

    let mut limb_points: Vec<DVec2> = Vec::with_capacity(NUM_RAYS);
    for i in 0..NUM_RAYS {
        let angle = i as f64 / NUM_RAYS as f64 * std::f64::consts::TAU;
        let dir = DVec2::new(angle.cos(), angle.sin());
        let mut ray = ray_points(img, origin, dir);
        if let Some(((x, y), _steepness)) = find_limb_crossing(&mut ray, threshold) {
            limb_points.push(DVec2::new(x as f64, y as f64));
        }
    }

    if limb_points.len() < 3 {
        return Err(Error::invalid_arg("too few limb points detected"));
    }

    cull_to_convex_hull(&mut limb_points);

    let (force_radius, seed) = match previous {
        Some(disc) => (Some(disc.radius), Some(disc.center)),
        None => (None, None),
    };
    fit_circle(&limb_points, force_radius, seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disc_image(width: u32, height: u32, cx: f64, cy: f64, r: f64) -> Image {
        let mut img = Image::new(width, height, PixelFormat::Mono8);
        for y in 0..height {
            let row = img.row_mut(y);
            for x in 0..width as usize {
                let d = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt();
                row[x] = if d <= r { 220 } else { 5 };
            }
        }
        img
    }

    #[test]
    fn centroid_of_a_disc_is_its_center() {
        let img = disc_image(200, 200, 100.0, 90.0, 50.0);
        let (cx, cy) = centroid(&img).unwrap();
        assert!((cx as i64 - 100).abs() <= 2);
        assert!((cy as i64 - 90).abs() <= 2);
    }

    #[test]
    fn threshold_separates_disc_from_background() {
        let img = disc_image(200, 200, 100.0, 100.0, 60.0);
        let threshold = disc_background_threshold(&img).unwrap();
        assert!(threshold > 5 && threshold <= 220, "threshold {threshold}");
    }

    #[test]
    fn convex_hull_drops_interior_points() {
        let mut points = vec![
            DVec2::new(0.0, 0.0),
            DVec2::new(10.0, 0.0),
            DVec2::new(10.0, 10.0),
            DVec2::new(0.0, 10.0),
            DVec2::new(5.0, 5.0), // interior
        ];
        cull_to_convex_hull(&mut points);
        assert_eq!(points.len(), 4);
        assert!(!points.contains(&DVec2::new(5.0, 5.0)));
    }

    #[test]
    fn circle_fit_recovers_synthetic_circle() {
        let points: Vec<DVec2> = (0..32)
            .map(|i| {
                let a = i as f64 / 32.0 * std::f64::consts::TAU;
                DVec2::new(70.0 + 41.5 * a.cos(), 55.0 + 41.5 * a.sin())
            })
            .collect();
        let disc = fit_circle(&points, None, None).unwrap();
        assert!((disc.center.x - 70.0).abs() < 1e-6);
        assert!((disc.center.y - 55.0).abs() < 1e-6);
        assert!((disc.radius - 41.5).abs() < 1e-6);
    }

    #[test]
    fn find_disc_locates_synthetic_disc_within_half_pixel() {
        let img = disc_image(240, 240, 121.0, 117.0, 70.0);
        let disc = find_disc(&img, None).unwrap();
        assert!(
            (disc.center.x - 121.0).abs() <= 0.5,
            "cx = {}",
            disc.center.x
        );
        assert!(
            (disc.center.y - 117.0).abs() <= 0.5,
            "cy = {}",
            disc.center.y
        );
        assert!((disc.radius - 70.0).abs() <= 2.0, "r = {}", disc.radius);
    }

    #[test]
    fn fixed_radius_fit_only_moves_the_center() {
        let img = disc_image(240, 240, 100.0, 100.0, 70.0);
        let first = find_disc(&img, None).unwrap();

        let shifted = disc_image(240, 240, 104.0, 97.0, 70.0);
        let second = find_disc(&shifted, Some(&first)).unwrap();
        assert!((second.radius - first.radius).abs() < 1e-9);
        assert!((second.center.x - 104.0).abs() <= 1.0);
        assert!((second.center.y - 97.0).abs() <= 1.0);
    }
}
