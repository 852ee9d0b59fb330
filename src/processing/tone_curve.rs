//! Tone curve: an editable mapping `[0,1] → [0,1]` applied as the last
//! pipeline stage.
//!
//! The curve is defined by control points with strictly increasing `x`.
//! Between points it is either piecewise linear or a cubic spline whose
//! first and last segments are reduced to quadratics to avoid inflection
//! points. A gamma mode replaces the interior with `x^(1/gamma)` anchored
//! at the first and last points. A 65536-entry LUT provides the fast
//! approximated evaluation used during interactive edits; the precise
//! evaluator is applied once before output is considered final.

const DEFAULT_LUT_SIZE: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    pub x: f32,
    pub y: f32,
}

/// Cubic coefficients of one spline segment, evaluated as
/// `t*(t*(t*a + b) + c) + d` with `t` in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplineSegment {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
}

#[derive(Clone)]
pub struct ToneCurve {
    points: Vec<CurvePoint>,
    spline: Vec<SplineSegment>,
    smooth: bool,
    is_gamma: bool,
    gamma: f32,
    lut: Option<Vec<f32>>,
}

impl Default for ToneCurve {
    fn default() -> Self {
        ToneCurve::identity()
    }
}

impl ToneCurve {
    /// The identity map: two points `(0,0)`, `(1,1)`.
    pub fn identity() -> ToneCurve {
        let mut curve = ToneCurve {
            points: vec![CurvePoint { x: 0.0, y: 0.0 }, CurvePoint { x: 1.0, y: 1.0 }],
            spline: Vec::new(),
            smooth: true,
            is_gamma: false,
            gamma: 1.0,
            lut: None,
        };
        curve.calculate_spline();
        curve
    }

    pub fn from_points(points: impl IntoIterator<Item = (f32, f32)>) -> ToneCurve {
        let mut curve = ToneCurve {
            points: Vec::new(),
            spline: Vec::new(),
            smooth: true,
            is_gamma: false,
            gamma: 1.0,
            lut: None,
        };
        for (x, y) in points {
            curve.add_point(x, y);
        }
        assert!(curve.points.len() >= 2);
        curve.calculate_spline();
        curve
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    pub fn spline_segments(&self) -> &[SplineSegment] {
        &self.spline
    }

    pub fn is_smooth(&self) -> bool {
        self.smooth
    }

    pub fn is_gamma_mode(&self) -> bool {
        self.is_gamma
    }

    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    pub fn is_identity(&self) -> bool {
        let from_0_to_1 = self.points.len() == 2
            && self.points[0].x == 0.0
            && self.points[0].y == 0.0
            && self.points[1].x == 1.0
            && self.points[1].y == 1.0;

        from_0_to_1 && (!self.is_gamma || self.gamma == 1.0)
    }

    /// Adds a point, keeping the list sorted by `x`; returns its index.
    pub fn add_point(&mut self, x: f32, y: f32) -> usize {
        let idx = self.points.partition_point(|p| p.x < x);
        self.points.insert(idx, CurvePoint { x, y });

        debug_assert!(idx == 0 || self.points[idx - 1].x < x);
        debug_assert!(idx == self.points.len() - 1 || self.points[idx].x < self.points[idx + 1].x);

        if self.smooth {
            self.calculate_spline();
        }
        idx
    }

    /// Removes a point; does nothing while only two remain.
    pub fn remove_point(&mut self, idx: usize) {
        if self.points.len() > 2 {
            self.points.remove(idx);
            self.calculate_spline();
        }
    }

    /// Moves a point; its new `x` must stay strictly between its neighbors.
    pub fn update_point(&mut self, idx: usize, x: f32, y: f32) {
        assert!(idx < self.points.len());
        if idx > 0 {
            assert!(self.points[idx - 1].x < x);
        }
        if idx < self.points.len() - 1 {
            assert!(x < self.points[idx + 1].x);
        }

        self.points[idx] = CurvePoint { x, y };
        if self.smooth {
            self.calculate_spline();
        }
    }

    /// Removes all points; at least two have to be re-added before use.
    pub fn clear(&mut self) {
        self.points.clear();
        self.spline.clear();
        self.lut = None;
    }

    /// Resets to the identity map.
    pub fn reset(&mut self) {
        self.points.clear();
        self.points.push(CurvePoint { x: 0.0, y: 0.0 });
        self.points.push(CurvePoint { x: 1.0, y: 1.0 });
        self.is_gamma = false;
        self.gamma = 1.0;
        self.smooth = true;
        self.calculate_spline();
        self.lut = None;
    }

    /// Reflects all points horizontally (negative image).
    pub fn invert(&mut self) {
        let xmin = self.points.last().map(|p| p.x).unwrap_or(1.0);
        let xmax = self.points.first().map(|p| p.x).unwrap_or(0.0);

        let mut new_points: Vec<CurvePoint> = self
            .points
            .iter()
            .rev()
            .map(|p| CurvePoint { x: xmin + xmax - p.x, y: p.y })
            .collect();
        std::mem::swap(&mut self.points, &mut new_points);
        self.calculate_spline();
    }

    /// Stretches the points' `x` range onto `[min, max]`.
    pub fn stretch(&mut self, min: f32, max: f32) {
        let current_min = self.points.first().map(|p| p.x).unwrap_or(0.0);
        let current_max = self.points.last().map(|p| p.x).unwrap_or(1.0);
        if current_max == current_min {
            return;
        }
        for p in self.points.iter_mut() {
            p.x = min + (p.x - current_min) * (max - min) / (current_max - current_min);
        }
        self.calculate_spline();
    }

    pub fn set_smooth(&mut self, smooth: bool) {
        if !self.smooth && smooth {
            self.calculate_spline();
        }
        self.smooth = smooth;
    }

    /// In gamma mode the curve is `output = input^(1/gamma)` between the
    /// first and last points. Enabling it with more than two points
    /// reduces the set to just the endpoints.
    pub fn set_gamma_mode(&mut self, is_gamma: bool) {
        self.is_gamma = is_gamma;
        if is_gamma && self.points.len() > 2 {
            let first = self.points[0];
            let last = *self.points.last().unwrap();
            self.points.clear();
            self.points.push(first);
            self.points.push(last);
        }
        self.calculate_spline();
    }

    pub fn set_gamma(&mut self, gamma: f32) {
        self.gamma = gamma;
    }

    /// Index of the point closest to `(x, y)`.
    pub fn closest_point_idx(&self, x: f32, y: f32) -> usize {
        let mut min_dist_sq = f32::MAX;
        let mut min_idx = 0;
        for (i, p) in self.points.iter().enumerate() {
            let dist_sq = (p.x - x) * (p.x - x) + (p.y - y) * (p.y - y);
            if dist_sq < min_dist_sq {
                min_dist_sq = dist_sq;
                min_idx = i;
            }
        }
        min_idx
    }

    // Spline coefficients per segment. The first and last segments of a
    // curve with more than two points use quadratics (zero cubic
    // coefficient) to avoid inflections; interior segments are cubic with
    // Catmull-Rom style tangents scaled by the segment width.
    fn calculate_spline(&mut self) {
        self.spline.clear();
        let pts = &self.points;
        if pts.len() < 2 {
            return;
        }

        for i in 0..pts.len() - 1 {
            let (dx_start, dy_start) = if i == 0 {
                (pts[i + 1].x - pts[i].x, pts[i + 1].y - pts[i].y)
            } else {
                (pts[i + 1].x - pts[i - 1].x, pts[i + 1].y - pts[i - 1].y)
            };

            let (dx_end, dy_end) = if i == pts.len() - 2 {
                (pts[i + 1].x - pts[i].x, pts[i + 1].y - pts[i].y)
            } else {
                (pts[i + 2].x - pts[i].x, pts[i + 2].y - pts[i].y)
            };

            let dx = pts[i + 1].x - pts[i].x;
            let tan1 = dy_start / dx_start * dx;
            let tan2 = dy_end / dx_end * dx;

            let seg = if pts.len() > 2 && i == 0 {
                let (p0, p1, p2) = (pts[0], pts[1], pts[2]);
                // tangent at the right end of the first segment
                let tanr = (p2.y - p0.y) / (p2.x - p0.x) * (p1.x - p0.x);
                let d = p0.y;
                let b = tanr - p1.y + d;
                let c = p1.y - b - d;
                SplineSegment { a: 0.0, b, c, d }
            } else if pts.len() > 2 && i == pts.len() - 2 {
                let p0 = pts[pts.len() - 1];
                let p1 = pts[pts.len() - 2];
                let p2 = pts[pts.len() - 3];
                // tangent at the left end of the last segment
                let tanl = (p0.y - p2.y) / (p0.x - p2.x) * (p0.x - p1.x);
                let d = p1.y;
                let c = tanl;
                let b = p0.y - c - d;
                SplineSegment { a: 0.0, b, c, d }
            } else {
                let d = pts[i].y;
                let c = tan1;
                let a = tan2 - 2.0 * pts[i + 1].y + c + 2.0 * d;
                let b = pts[i + 1].y - a - c - d;
                SplineSegment { a, b, c, d }
            };

            self.spline.push(seg);
        }
    }

    /// Evaluates the curve precisely at `input` (from `[0, 1]`).
    pub fn precise_value(&self, input: f32) -> f32 {
        let pts = &self.points;

        let result = if self.is_gamma {
            let first = pts[0];
            let last = pts[1];
            if input <= first.x {
                return first.y;
            }
            if input >= last.x {
                return last.y;
            }
            first.y + ((input - first.x) / (last.x - first.x)).powf(1.0 / self.gamma) * (last.y - first.y)
        } else {
            // index of the first point with x >= input
            let next_idx = pts.partition_point(|p| p.x < input);

            if next_idx == pts.len() {
                return pts.last().unwrap().y;
            }
            if next_idx == 0 {
                return pts[0].y;
            }

            let delta_x = pts[next_idx].x - pts[next_idx - 1].x;
            if !self.smooth {
                let delta_y = pts[next_idx].y - pts[next_idx - 1].y;
                pts[next_idx - 1].y + delta_y * (input - pts[next_idx - 1].x) / delta_x
            } else {
                let t = (input - pts[next_idx - 1].x) / delta_x;
                let sp = &self.spline[next_idx - 1];
                t * (t * (t * sp.a + sp.b) + sp.c) + sp.d
            }
        };

        result.clamp(0.0, 1.0)
    }

    /// Rebuilds the LUT used by [`approximated_value`](Self::approximated_value).
    pub fn refresh_lut(&mut self) {
        let lut: Vec<f32> = (0..DEFAULT_LUT_SIZE)
            .map(|i| self.precise_value(i as f32 / (DEFAULT_LUT_SIZE - 1) as f32))
            .collect();
        self.lut = Some(lut);
    }

    pub fn has_lut(&self) -> bool {
        self.lut.is_some()
    }

    /// Fast LUT-based evaluation; falls back to the precise value when the
    /// LUT has not been built.
    pub fn approximated_value(&self, input: f32) -> f32 {
        match &self.lut {
            Some(lut) => {
                let idx = (input.clamp(0.0, 1.0) * (DEFAULT_LUT_SIZE - 1) as f32) as usize;
                lut[idx.min(DEFAULT_LUT_SIZE - 1)]
            }
            None => self.precise_value(input),
        }
    }

    /// Applies the curve to a row of values.
    pub fn apply(&self, input: &[f32], output: &mut [f32], precise: bool) {
        if precise {
            for (o, &v) in output.iter_mut().zip(input) {
                *o = self.precise_value(v);
            }
        } else {
            for (o, &v) in output.iter_mut().zip(input) {
                *o = self.approximated_value(v);
            }
        }
    }
}

impl std::fmt::Debug for ToneCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToneCurve")
            .field("points", &self.points.len())
            .field("smooth", &self.smooth)
            .field("is_gamma", &self.is_gamma)
            .field("gamma", &self.gamma)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_evaluates_to_input() {
        let curve = ToneCurve::identity();
        assert!(curve.is_identity());
        for v in [0.0, 0.25, 0.5, 0.99, 1.0] {
            assert!((curve.precise_value(v) - v).abs() < 1e-6, "at {v}");
        }
    }

    #[test]
    fn add_point_keeps_order_and_returns_index() {
        let mut curve = ToneCurve::identity();
        let idx = curve.add_point(0.5, 0.8);
        assert_eq!(idx, 1);
        assert_eq!(curve.points().len(), 3);
        assert!(curve.points().windows(2).all(|w| w[0].x < w[1].x));
    }

    #[test]
    fn remove_point_is_noop_at_two_points() {
        let mut curve = ToneCurve::identity();
        curve.remove_point(0);
        assert_eq!(curve.points().len(), 2);

        curve.add_point(0.5, 0.5);
        curve.remove_point(1);
        assert_eq!(curve.points().len(), 2);
    }

    #[test]
    fn curve_interpolates_through_points() {
        let mut curve = ToneCurve::identity();
        curve.add_point(0.5, 0.8);
        // exact at control points, both smooth and linear
        for smooth in [true, false] {
            curve.set_smooth(smooth);
            assert!((curve.precise_value(0.0) - 0.0).abs() < 1e-6);
            assert!((curve.precise_value(0.5) - 0.8).abs() < 1e-6);
            assert!((curve.precise_value(1.0) - 1.0).abs() < 1e-6);
        }
        // linear interpolation between points
        curve.set_smooth(false);
        assert!((curve.precise_value(0.25) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn gamma_mode_applies_power() {
        let mut curve = ToneCurve::identity();
        curve.set_gamma_mode(true);
        curve.set_gamma(2.0);
        assert!(!curve.is_identity());
        assert!((curve.precise_value(0.25) - 0.25f32.powf(0.5)).abs() < 1e-6);
        assert!((curve.precise_value(0.0) - 0.0).abs() < 1e-6);
        assert!((curve.precise_value(1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gamma_mode_collapses_extra_points() {
        let mut curve = ToneCurve::identity();
        curve.add_point(0.3, 0.5);
        curve.add_point(0.7, 0.9);
        curve.set_gamma_mode(true);
        assert_eq!(curve.points().len(), 2);
        assert_eq!(curve.points()[0], CurvePoint { x: 0.0, y: 0.0 });
        assert_eq!(curve.points()[1], CurvePoint { x: 1.0, y: 1.0 });
    }

    #[test]
    fn invert_reflects_points() {
        let mut curve = ToneCurve::identity();
        curve.add_point(0.25, 0.9);
        curve.invert();
        let xs: Vec<f32> = curve.points().iter().map(|p| p.x).collect();
        assert!(xs.windows(2).all(|w| w[0] < w[1]));
        assert!((curve.points()[1].x - 0.75).abs() < 1e-6);
        assert!((curve.points()[1].y - 0.9).abs() < 1e-6);
    }

    #[test]
    fn stretch_rescales_x_range() {
        let mut curve = ToneCurve::identity();
        curve.stretch(0.2, 0.6);
        assert!((curve.points()[0].x - 0.2).abs() < 1e-6);
        assert!((curve.points()[1].x - 0.6).abs() < 1e-6);
        // outside the range the curve clamps to endpoint ordinates
        assert!((curve.precise_value(0.1) - 0.0).abs() < 1e-6);
        assert!((curve.precise_value(0.9) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn lut_approximates_precise_values() {
        let mut curve = ToneCurve::identity();
        curve.add_point(0.4, 0.7);
        curve.refresh_lut();
        for i in 0..=100 {
            let v = i as f32 / 100.0;
            let diff = (curve.approximated_value(v) - curve.precise_value(v)).abs();
            assert!(diff < 1e-3, "at {v}: {diff}");
        }
    }

    #[test]
    fn smooth_curve_monotone_sections_have_no_overshoot_at_ends() {
        // quadratic end segments keep the curve from inflecting at the ends
        let mut curve = ToneCurve::identity();
        curve.add_point(0.5, 0.5);
        curve.set_smooth(true);
        let v = curve.precise_value(0.01);
        assert!(v >= 0.0 && v <= 0.05);
    }
}
