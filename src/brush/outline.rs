//! Variable-width outline generation
//!
//! Converts a pressure-tagged centerline into one closed polygon: a left and
//! a right offset chain, each point pushed out along the local normal by half
//! the pressure-dependent width, joined by caps at both ends.

use std::f64::consts::{PI, TAU};

use kurbo::{Point, Rect, Vec2};
use serde::{Deserialize, Serialize};

use super::PressureCurve;
use crate::input::Sample;

/// Consecutive centerline points closer than this are merged
const DUPLICATE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapStyle {
    #[default]
    Round,
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutlineConfig {
    pub pressure_curve: PressureCurve,
    /// Fraction of the base size reached at zero pressure
    pub min_ratio: f64,
    /// Absolute width floor in layer units (one device pixel)
    pub min_width: f64,
    /// Segments used for dots
    pub circle_segments: usize,
    pub cap: CapStyle,
    /// Segments per round cap
    pub cap_segments: usize,
}

impl Default for OutlineConfig {
    fn default() -> Self {
        Self {
            pressure_curve: PressureCurve::Linear,
            min_ratio: 0.1,
            min_width: 1.0,
            circle_segments: 20,
            cap: CapStyle::Round,
            cap_segments: 8,
        }
    }
}

/// Closed polygon boundary of a stroke
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outline {
    points: Vec<Point>,
}

impl Outline {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// At least a triangle, and no NaN/inf coordinates
    pub fn is_valid(&self) -> bool {
        self.points.len() >= 3 && self.points.iter().all(|p| p.x.is_finite() && p.y.is_finite())
    }

    pub fn bounds(&self) -> Option<Rect> {
        let first = self.points.first()?;
        let rect = self
            .points
            .iter()
            .fold(Rect::from_points(*first, *first), |acc, p| acc.union_pt(*p));
        Some(rect)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutlineGenerator {
    config: OutlineConfig,
}

impl OutlineGenerator {
    pub fn new(config: OutlineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OutlineConfig {
        &self.config
    }

    /// Full stroke width at the given pressure.
    ///
    /// Non-decreasing in pressure and never below `min_width`.
    pub fn width_at(&self, pressure: f64, base_size: f64) -> f64 {
        let ratio = self.config.min_ratio.clamp(0.0, 1.0);
        let curve = self.config.pressure_curve.apply(pressure);
        let base = if base_size.is_finite() { base_size.max(0.0) } else { 0.0 };
        let width = base * (ratio + (1.0 - ratio) * curve);
        width.max(self.config.min_width.max(0.0))
    }

    pub fn generate(&self, samples: &[Sample], base_size: f64) -> Outline {
        self.generate_with_caps(samples, base_size, self.config.cap, self.config.cap)
    }

    /// Like [`generate`](Self::generate) with explicit caps per end.
    ///
    /// Used for the inner joints of a split stroke, which must stay round.
    pub fn generate_with_caps(
        &self,
        samples: &[Sample],
        base_size: f64,
        start: CapStyle,
        end: CapStyle,
    ) -> Outline {
        match samples {
            [] => Outline::default(),
            [single] => {
                let radius = (base_size * 0.5).max(self.config.min_width * 0.5);
                self.circle(single.position(), radius)
            }
            _ => self.variable_width(samples, base_size, start, end),
        }
    }

    fn circle(&self, center: Point, radius: f64) -> Outline {
        let segments = self.config.circle_segments.max(3);
        let points = (0..segments)
            .map(|i| {
                let angle = TAU * i as f64 / segments as f64;
                center + Vec2::from_angle(angle) * radius
            })
            .collect();
        Outline::new(points)
    }

    fn variable_width(
        &self,
        samples: &[Sample],
        base_size: f64,
        start_cap: CapStyle,
        end_cap: CapStyle,
    ) -> Outline {
        let mut centerline: Vec<(Point, f64)> = Vec::with_capacity(samples.len());
        for sample in samples {
            if !(sample.x.is_finite() && sample.y.is_finite()) {
                continue;
            }
            let point = sample.position();
            let half_width = self.width_at(sample.pressure, base_size) * 0.5;
            match centerline.last_mut() {
                // Zero-length segments have no direction; keep the wider point
                Some((last, last_half)) if (point - *last).hypot() < DUPLICATE_EPSILON => {
                    *last_half = last_half.max(half_width);
                }
                _ => centerline.push((point, half_width)),
            }
        }

        match centerline.as_slice() {
            [] => return Outline::default(),
            [(center, half_width)] => return self.circle(*center, *half_width),
            _ => {}
        }

        let last = centerline.len() - 1;
        let normals: Vec<Vec2> = (0..centerline.len())
            .map(|i| {
                let direction = if i == 0 {
                    centerline[1].0 - centerline[0].0
                } else if i == last {
                    centerline[last].0 - centerline[last - 1].0
                } else {
                    let incoming = (centerline[i].0 - centerline[i - 1].0).normalize();
                    let outgoing = (centerline[i + 1].0 - centerline[i].0).normalize();
                    let bisector = incoming + outgoing;
                    // Hairpin turn: the chords cancel out
                    if bisector.hypot() < 1e-6 {
                        incoming
                    } else {
                        bisector
                    }
                };
                let direction = direction.normalize();
                Vec2::new(-direction.y, direction.x)
            })
            .collect();

        let cap_segments = self.config.cap_segments.max(1);
        let mut points = Vec::with_capacity(centerline.len() * 2 + cap_segments * 2);

        for ((center, half_width), normal) in centerline.iter().zip(&normals) {
            points.push(*center + *normal * *half_width);
        }

        let (end_center, end_half) = centerline[last];
        push_cap(&mut points, end_cap, end_center, end_half, normals[last], cap_segments);

        for ((center, half_width), normal) in centerline.iter().zip(&normals).rev() {
            points.push(*center - *normal * *half_width);
        }

        let (start_center, start_half) = centerline[0];
        push_cap(&mut points, start_cap, start_center, start_half, -normals[0], cap_segments);

        Outline::new(points)
    }
}

/// Sweep half a turn clockwise from `+normal` to `-normal` around `center`.
fn push_cap(
    points: &mut Vec<Point>,
    cap: CapStyle,
    center: Point,
    radius: f64,
    normal: Vec2,
    segments: usize,
) {
    if cap == CapStyle::Flat {
        return;
    }
    let start_angle = normal.atan2();
    for k in 1..segments {
        let angle = start_angle - PI * k as f64 / segments as f64;
        points.push(center + Vec2::from_angle(angle) * radius);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> OutlineGenerator {
        OutlineGenerator::default()
    }

    /// Half-height of the outline at a given x, measured across the polygon
    fn half_height_at(outline: &Outline, x: f64) -> f64 {
        outline
            .points()
            .iter()
            .filter(|p| (p.x - x).abs() < 1e-6)
            .map(|p| p.y.abs())
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_single_sample_is_circle() {
        let outline = generator().generate(&[Sample::new(5.0, 5.0, 0.3)], 10.0);
        assert_eq!(outline.len(), 20);
        assert!(outline.is_valid());
        for p in outline.points() {
            let r = (*p - Point::new(5.0, 5.0)).hypot();
            assert!((r - 5.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_zero_pressure_keeps_minimum_width() {
        let gen = generator();
        for i in 0..=10 {
            let pressure = i as f64 / 10.0;
            assert!(gen.width_at(pressure, 10.0) * 0.5 >= 0.5);
            assert!(gen.width_at(pressure, 0.0) >= 1.0);
        }

        let samples = [Sample::new(0.0, 0.0, 0.0), Sample::new(10.0, 0.0, 0.0)];
        let outline = OutlineGenerator::new(OutlineConfig {
            cap: CapStyle::Flat,
            ..Default::default()
        })
        .generate(&samples, 10.0);
        assert!(half_height_at(&outline, 0.0) >= 0.5 - 1e-9);
        assert!(half_height_at(&outline, 10.0) >= 0.5 - 1e-9);
    }

    #[test]
    fn test_width_is_monotonic_in_pressure() {
        let gen = generator();
        let mut previous = gen.width_at(0.0, 20.0);
        for i in 1..=100 {
            let width = gen.width_at(i as f64 / 100.0, 20.0);
            assert!(width >= previous);
            previous = width;
        }
        assert!((gen.width_at(1.0, 20.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_pressure_widens_outline() {
        let samples = [
            Sample::new(0.0, 0.0, 0.2),
            Sample::new(10.0, 0.0, 0.6),
            Sample::new(20.0, 0.0, 0.9),
        ];
        let outline = OutlineGenerator::new(OutlineConfig {
            cap: CapStyle::Flat,
            ..Default::default()
        })
        .generate(&samples, 10.0);

        assert_eq!(outline.len(), 6);
        let start = half_height_at(&outline, 0.0);
        let end = half_height_at(&outline, 20.0);
        assert!(end > start);
        assert!((start - 1.4).abs() < 1e-9);
        assert!((end - 4.55).abs() < 1e-9);
    }

    #[test]
    fn test_round_caps_add_vertices() {
        let samples = [Sample::new(0.0, 0.0, 1.0), Sample::new(10.0, 0.0, 1.0)];
        let outline = generator().generate(&samples, 4.0);
        // 2 per chain point + 7 per cap
        assert_eq!(outline.len(), 4 + 14);
        let Some(bounds) = outline.bounds() else {
            panic!("outline should have bounds");
        };
        assert!((bounds.x0 + 2.0).abs() < 1e-9);
        assert!((bounds.x1 - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_caps_override_config() {
        let samples = [Sample::new(0.0, 0.0, 1.0), Sample::new(10.0, 0.0, 1.0)];
        let outline =
            generator().generate_with_caps(&samples, 4.0, CapStyle::Flat, CapStyle::Round);
        assert_eq!(outline.len(), 4 + 7);
    }

    #[test]
    fn test_duplicate_samples_are_skipped() {
        let samples = [
            Sample::new(0.0, 0.0, 0.5),
            Sample::new(0.0, 0.0, 0.5),
            Sample::new(10.0, 0.0, 0.5),
            Sample::new(10.0, 0.0, 0.5),
        ];
        let outline = generator().generate(&samples, 10.0);
        assert!(outline.is_valid());
    }

    #[test]
    fn test_all_duplicates_collapse_to_circle() {
        let samples = [Sample::new(3.0, 3.0, 1.0); 4];
        let outline = generator().generate(&samples, 8.0);
        assert_eq!(outline.len(), 20);
        assert!(outline.is_valid());
    }

    #[test]
    fn test_hairpin_does_not_produce_nan() {
        let samples = [
            Sample::new(0.0, 0.0, 0.5),
            Sample::new(10.0, 0.0, 0.5),
            Sample::new(0.0, 0.0, 0.5),
        ];
        let outline = generator().generate(&samples, 6.0);
        assert!(outline.is_valid());
    }

    #[test]
    fn test_empty_input_is_invalid() {
        let outline = generator().generate(&[], 10.0);
        assert!(!outline.is_valid());
    }
}
