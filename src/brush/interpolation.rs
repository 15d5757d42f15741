//! Curve smoothing for recorded strokes
//!
//! Two independent stages, normally applied as simplify → smooth:
//! Douglas-Peucker point reduction removes pointer jitter, then a cardinal
//! spline (Catmull-Rom at zero tension) re-adds density along a smooth path.

use serde::{Deserialize, Serialize};

use crate::input::{clamp_pressure, Sample};

/// Spline parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SplineConfig {
    /// 0.0 = Catmull-Rom, 1.0 = straight segments
    pub tension: f64,
    /// Points inserted strictly inside each span
    pub segments_per_span: usize,
}

impl Default for SplineConfig {
    fn default() -> Self {
        Self {
            tension: 0.0,
            segments_per_span: 4,
        }
    }
}

/// Which smoothing stages run before outline generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SmoothingConfig {
    /// Douglas-Peucker tolerance; `None` disables simplification
    pub simplify_tolerance: Option<f64>,
    /// Spline settings; `None` disables spline smoothing
    pub spline: Option<SplineConfig>,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            simplify_tolerance: Some(0.5),
            spline: Some(SplineConfig::default()),
        }
    }
}

impl SmoothingConfig {
    /// No smoothing at all; samples reach the outline stage untouched.
    pub fn disabled() -> Self {
        Self {
            simplify_tolerance: None,
            spline: None,
        }
    }

    /// Run the enabled stages in order.
    pub fn apply(&self, samples: &[Sample]) -> Vec<Sample> {
        let reduced = match self.simplify_tolerance {
            Some(tolerance) => simplify(samples, tolerance),
            None => samples.to_vec(),
        };
        match self.spline {
            Some(spline) => smooth(&reduced, spline.tension, spline.segments_per_span),
            None => reduced,
        }
    }
}

/// Douglas-Peucker reduction on (x, y).
///
/// Endpoints always survive and every surviving point is an original sample,
/// so pressure and tilt stay inside the observed range.
pub fn simplify(samples: &[Sample], tolerance: f64) -> Vec<Sample> {
    if samples.len() <= 2 || tolerance.is_nan() || tolerance <= 0.0 {
        return samples.to_vec();
    }

    let last = samples.len() - 1;
    let mut keep = vec![false; samples.len()];
    keep[0] = true;
    keep[last] = true;

    // Explicit stack instead of recursion: strokes can hold many thousands of points
    let mut ranges = vec![(0usize, last)];
    while let Some((start, end)) = ranges.pop() {
        if end <= start + 1 {
            continue;
        }

        let mut max_distance = 0.0;
        let mut max_index = start;
        for (index, sample) in samples.iter().enumerate().take(end).skip(start + 1) {
            let distance = distance_to_segment(sample, &samples[start], &samples[end]);
            if distance > max_distance {
                max_distance = distance;
                max_index = index;
            }
        }

        if max_distance > tolerance {
            keep[max_index] = true;
            ranges.push((start, max_index));
            ranges.push((max_index, end));
        }
    }

    samples
        .iter()
        .zip(keep)
        .filter_map(|(sample, kept)| kept.then_some(*sample))
        .collect()
}

/// Cardinal spline interpolation through every sample.
///
/// Emits `segments_per_span` points inside each consecutive pair; the path
/// ends are clamped by repeating the first/last control point. Pressure,
/// tilt, twist and time are interpolated linearly along each span.
pub fn smooth(samples: &[Sample], tension: f64, segments_per_span: usize) -> Vec<Sample> {
    if samples.len() < 2 || segments_per_span == 0 {
        return samples.to_vec();
    }

    let n = samples.len();
    let mut result = Vec::with_capacity(n + (n - 1) * segments_per_span);
    let scale = (1.0 - tension.clamp(0.0, 1.0)) * 0.5;

    for i in 0..n - 1 {
        let p0 = if i == 0 { &samples[0] } else { &samples[i - 1] };
        let p1 = &samples[i];
        let p2 = &samples[i + 1];
        let p3 = if i + 2 < n { &samples[i + 2] } else { &samples[n - 1] };

        result.push(*p1);
        for step in 1..=segments_per_span {
            let t = step as f64 / (segments_per_span + 1) as f64;
            result.push(cardinal_point(p0, p1, p2, p3, t, scale));
        }
    }

    if let Some(last) = samples.last() {
        result.push(*last);
    }

    result
}

/// Calculate a single point on a cardinal spline segment between p1 and p2
fn cardinal_point(
    p0: &Sample,
    p1: &Sample,
    p2: &Sample,
    p3: &Sample,
    t: f64,
    scale: f64,
) -> Sample {
    let t2 = t * t;
    let t3 = t2 * t;

    // Hermite basis functions
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;

    let m1x = scale * (p2.x - p0.x);
    let m1y = scale * (p2.y - p0.y);
    let m2x = scale * (p3.x - p1.x);
    let m2y = scale * (p3.y - p1.y);

    let linear = p1.lerp(p2, t);
    Sample {
        x: h00 * p1.x + h10 * m1x + h01 * p2.x + h11 * m2x,
        y: h00 * p1.y + h10 * m1y + h01 * p2.y + h11 * m2y,
        pressure: clamp_pressure(linear.pressure),
        ..linear
    }
}

fn distance_to_segment(p: &Sample, a: &Sample, b: &Sample) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let length_sq = dx * dx + dy * dy;
    if length_sq <= f64::EPSILON {
        return p.distance_to(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / length_sq).clamp(0.0, 1.0);
    let cx = a.x + dx * t;
    let cy = a.y + dy * t;
    ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt()
}

/// Calculate the length of a path through samples
pub fn path_length(samples: &[Sample]) -> f64 {
    samples.windows(2).map(|w| w[0].distance_to(&w[1])).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_line_points() -> Vec<Sample> {
        vec![
            Sample::new(0.0, 0.0, 0.5),
            Sample::new(10.0, 0.0, 0.5),
            Sample::new(20.0, 0.0, 0.5),
            Sample::new(30.0, 0.0, 0.5),
        ]
    }

    #[test]
    fn test_smooth_inserts_points_and_keeps_endpoints() {
        let points = make_line_points();
        let result = smooth(&points, 0.0, 3);

        assert_eq!(result.len(), 4 + 3 * 3);
        assert_eq!(result.first().map(|p| p.x), Some(0.0));
        assert_eq!(result.last().map(|p| p.x), Some(30.0));
        // Control points are interpolated, not approximated
        assert_eq!(result[4].x, 10.0);
        assert_eq!(result[8].x, 20.0);
    }

    #[test]
    fn test_smooth_collinear_input_stays_on_line() {
        let result = smooth(&make_line_points(), 0.0, 5);
        for pair in result.windows(2) {
            assert!(pair[1].x > pair[0].x);
            assert!(pair[0].y.abs() < 1e-12);
        }
    }

    #[test]
    fn test_smooth_interpolates_pressure_linearly() {
        let points = vec![Sample::new(0.0, 0.0, 0.2), Sample::new(10.0, 0.0, 0.6)];
        let result = smooth(&points, 0.0, 1);
        assert_eq!(result.len(), 3);
        assert!((result[1].pressure - 0.4).abs() < 1e-12);
        assert!((result[1].x - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_smooth_passes_short_input_through() {
        assert!(smooth(&[], 0.0, 4).is_empty());
        let single = vec![Sample::new(1.0, 2.0, 0.3)];
        assert_eq!(smooth(&single, 0.0, 4), single);
    }

    #[test]
    fn test_smooth_is_deterministic() {
        let points = vec![
            Sample::new(0.0, 0.0, 0.1),
            Sample::new(5.0, 8.0, 0.4),
            Sample::new(12.0, 3.0, 0.9),
            Sample::new(20.0, 10.0, 0.6),
        ];
        assert_eq!(smooth(&points, 0.3, 6), smooth(&points, 0.3, 6));
    }

    #[test]
    fn test_simplify_removes_collinear_points() {
        let points = make_line_points();
        let result = simplify(&points, 0.1);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], points[0]);
        assert_eq!(result[1], points[3]);
    }

    #[test]
    fn test_simplify_keeps_corners_with_original_pressure() {
        let points = vec![
            Sample::new(0.0, 0.0, 0.1),
            Sample::new(5.0, 0.05, 0.2),
            Sample::new(10.0, 0.0, 0.9),
            Sample::new(10.0, 10.0, 0.4),
        ];
        let result = simplify(&points, 0.5);
        assert_eq!(result.len(), 3);
        assert_eq!(result[1], points[2]);
        assert!(result.iter().all(|s| points.contains(s)));
    }

    #[test]
    fn test_simplify_then_smooth() {
        let mut points = Vec::new();
        for i in 0..50 {
            let jitter = if i % 2 == 0 { 0.05 } else { -0.05 };
            points.push(Sample::new(i as f64, jitter, 0.5));
        }
        let config = SmoothingConfig::default();
        let result = config.apply(&points);
        assert!(result.len() < points.len());
        assert_eq!(result.first().map(|p| p.x), Some(0.0));
        assert_eq!(result.last().map(|p| p.x), Some(49.0));
    }

    #[test]
    fn test_path_length() {
        let length = path_length(&make_line_points());
        assert!((length - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_path_length_empty() {
        assert_eq!(path_length(&[]), 0.0);
    }
}
