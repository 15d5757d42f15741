//! Outline triangulation
//!
//! Outlines are filled with lyon's tessellator under the non-zero rule, which
//! accepts non-convex and self-intersecting polygons (sharp turns in a
//! stroke fold the offset chains over each other). When that fails the
//! caller can fall back to [`stamp_circles`], which never fails for
//! non-empty input.

use lyon::lyon_tessellation::{
    BuffersBuilder, FillOptions, FillRule, FillTessellator, FillVertex, VertexBuffers,
};
use lyon::math::point;
use lyon::path::PathEvent;
use thiserror::Error;

use super::Outline;
use crate::input::Sample;

/// Triangles with less total area than this are considered degenerate
const MIN_TOTAL_AREA: f64 = 1e-6;
const MIN_EXTENT: f64 = 1e-9;
/// Bound on extra stamps between two consecutive samples
const MAX_STAMPS_PER_SEGMENT: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriangulationError {
    #[error("Outline has {0} usable vertices, need at least 3")]
    TooFewVertices(usize),

    #[error("Outline has zero extent")]
    ZeroExtent,

    #[error("Tessellator failed: {0}")]
    Tessellator(String),

    #[error("Tessellation produced no triangles")]
    Empty,

    #[error("Triangles are degenerate (total area {0})")]
    Degenerate(f64),
}

/// Indexed triangle mesh in layer space.
///
/// Every triangle is wound counter-clockwise (positive signed area).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Geometry {
    pub vertices: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl Geometry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.len() < 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Iterate triangles as vertex triples, skipping out-of-range indices
    pub fn triangles(&self) -> impl Iterator<Item = [[f32; 2]; 3]> + '_ {
        self.indices.chunks_exact(3).filter_map(|tri| {
            let a = *self.vertices.get(tri[0] as usize)?;
            let b = *self.vertices.get(tri[1] as usize)?;
            let c = *self.vertices.get(tri[2] as usize)?;
            Some([a, b, c])
        })
    }

    /// Sum of signed triangle areas
    pub fn signed_area(&self) -> f64 {
        self.triangles().map(|[a, b, c]| triangle_area(a, b, c)).sum()
    }

    pub fn bounds(&self) -> Option<kurbo::Rect> {
        let first = self.vertices.first()?;
        let start = kurbo::Rect::new(
            first[0] as f64,
            first[1] as f64,
            first[0] as f64,
            first[1] as f64,
        );
        Some(
            self.vertices
                .iter()
                .fold(start, |acc, v| acc.union_pt(kurbo::Point::new(v[0] as f64, v[1] as f64))),
        )
    }

    /// Append another mesh, rebasing its indices
    pub fn append(&mut self, other: &Geometry) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.indices.extend(other.indices.iter().map(|i| i + base));
    }

    fn push_circle(&mut self, cx: f64, cy: f64, radius: f64, segments: usize) {
        let base = self.vertices.len() as u32;
        self.vertices.push([cx as f32, cy as f32]);
        for i in 0..segments {
            let angle = std::f64::consts::TAU * i as f64 / segments as f64;
            self.vertices.push([
                (cx + radius * angle.cos()) as f32,
                (cy + radius * angle.sin()) as f32,
            ]);
        }
        let segments = segments as u32;
        for i in 0..segments {
            let next = (i + 1) % segments;
            self.indices.extend_from_slice(&[base, base + 1 + i, base + 1 + next]);
        }
    }
}

/// Signed area of a triangle; positive when counter-clockwise
fn triangle_area(a: [f32; 2], b: [f32; 2], c: [f32; 2]) -> f64 {
    let (ax, ay) = (a[0] as f64, a[1] as f64);
    let (bx, by) = (b[0] as f64, b[1] as f64);
    let (cx, cy) = (c[0] as f64, c[1] as f64);
    ((bx - ax) * (cy - ay) - (cx - ax) * (by - ay)) * 0.5
}

/// Fill an outline polygon with triangles.
pub fn triangulate(outline: &Outline) -> Result<Geometry, TriangulationError> {
    let points: Vec<kurbo::Point> = outline
        .points()
        .iter()
        .copied()
        .filter(|p| p.x.is_finite() && p.y.is_finite())
        .collect();

    let mut distinct = points.clone();
    distinct.dedup_by(|a, b| (*a - *b).hypot() < MIN_EXTENT);
    if distinct.len() < 3 {
        return Err(TriangulationError::TooFewVertices(distinct.len()));
    }

    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in &points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    if max_x - min_x < MIN_EXTENT || max_y - min_y < MIN_EXTENT {
        return Err(TriangulationError::ZeroExtent);
    }

    let events = outline_events(&points);
    let mut buffers: VertexBuffers<[f32; 2], u32> = VertexBuffers::new();
    let mut tessellator = FillTessellator::new();
    let options = FillOptions::default()
        .with_fill_rule(FillRule::NonZero)
        .with_tolerance(0.1);

    tessellator
        .tessellate(
            events.iter().cloned(),
            &options,
            &mut BuffersBuilder::new(&mut buffers, |vertex: FillVertex| {
                vertex.position().to_array()
            }),
        )
        .map_err(|e| TriangulationError::Tessellator(format!("{e:?}")))?;

    let mut geometry = Geometry {
        vertices: buffers.vertices,
        indices: buffers.indices,
    };
    if geometry.is_empty() {
        return Err(TriangulationError::Empty);
    }

    normalize_winding(&mut geometry);
    let area = geometry.signed_area();
    if area < MIN_TOTAL_AREA {
        return Err(TriangulationError::Degenerate(area));
    }

    Ok(geometry)
}

fn outline_events(points: &[kurbo::Point]) -> Vec<PathEvent> {
    let mut events = Vec::with_capacity(points.len() + 1);
    let first = point(points[0].x as f32, points[0].y as f32);
    events.push(PathEvent::Begin { at: first });
    let mut last = first;
    for p in &points[1..] {
        let to = point(p.x as f32, p.y as f32);
        events.push(PathEvent::Line { from: last, to });
        last = to;
    }
    events.push(PathEvent::End {
        last,
        first,
        close: true,
    });
    events
}

/// Flip clockwise triangles so every triangle has positive area
fn normalize_winding(geometry: &mut Geometry) {
    let vertices = &geometry.vertices;
    for tri in geometry.indices.chunks_exact_mut(3) {
        let (Some(a), Some(b), Some(c)) = (
            vertices.get(tri[0] as usize),
            vertices.get(tri[1] as usize),
            vertices.get(tri[2] as usize),
        ) else {
            continue;
        };
        if triangle_area(*a, *b, *c) < 0.0 {
            tri.swap(1, 2);
        }
    }
}

/// Circle-stamp fallback: one disc per sample plus extra discs along each
/// segment, spaced at most half the local radius apart.
///
/// `widths[i]` is the full stroke width at `samples[i]`; missing or invalid
/// widths fall back to one unit.
pub fn stamp_circles(samples: &[Sample], widths: &[f64], segments: usize) -> Geometry {
    let segments = segments.max(3);
    let mut geometry = Geometry::new();

    let radius_at = |i: usize| -> f64 {
        widths
            .get(i)
            .copied()
            .filter(|w| w.is_finite() && *w > 0.0)
            .map_or(0.5, |w| (w * 0.5).max(0.5))
    };

    let mut previous: Option<(f64, f64, f64)> = None;
    for (i, sample) in samples.iter().enumerate() {
        if !(sample.x.is_finite() && sample.y.is_finite()) {
            continue;
        }
        let radius = radius_at(i);

        if let Some((px, py, pr)) = previous {
            let distance = ((sample.x - px).powi(2) + (sample.y - py).powi(2)).sqrt();
            let spacing = pr.min(radius) * 0.5;
            let steps = ((distance / spacing).ceil() as usize).min(MAX_STAMPS_PER_SEGMENT);
            for step in 1..steps {
                let t = step as f64 / steps as f64;
                geometry.push_circle(
                    px + (sample.x - px) * t,
                    py + (sample.y - py) * t,
                    pr + (radius - pr) * t,
                    segments,
                );
            }
        }

        geometry.push_circle(sample.x, sample.y, radius, segments);
        previous = Some((sample.x, sample.y, radius));
    }

    geometry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::OutlineGenerator;
    use kurbo::Point;

    fn square() -> Outline {
        Outline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ])
    }

    #[test]
    fn test_triangulate_square() {
        let Ok(geometry) = triangulate(&square()) else {
            panic!("square should triangulate");
        };
        assert_eq!(geometry.triangle_count(), 2);
        assert!((geometry.signed_area() - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_clockwise_input_is_normalized() {
        let mut points = square().points().to_vec();
        points.reverse();
        let Ok(geometry) = triangulate(&Outline::new(points)) else {
            panic!("reversed square should triangulate");
        };
        for [a, b, c] in geometry.triangles() {
            assert!(triangle_area(a, b, c) >= 0.0);
        }
    }

    #[test]
    fn test_concave_outline() {
        // An "L" shape
        let outline = Outline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 3.0),
            Point::new(3.0, 3.0),
            Point::new(3.0, 10.0),
            Point::new(0.0, 10.0),
        ]);
        let Ok(geometry) = triangulate(&outline) else {
            panic!("concave outline should triangulate");
        };
        assert!((geometry.signed_area() - 51.0).abs() < 1e-3);
    }

    #[test]
    fn test_self_intersecting_outline_does_not_fail() {
        // Bow tie
        let outline = Outline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(10.0, 0.0),
            Point::new(0.0, 10.0),
        ]);
        let Ok(geometry) = triangulate(&outline) else {
            panic!("bow tie should triangulate under non-zero");
        };
        assert!(geometry.signed_area() > 0.0);
    }

    #[test]
    fn test_stroke_outline_triangulates() {
        let samples = [
            Sample::new(0.0, 0.0, 0.2),
            Sample::new(10.0, 0.0, 0.6),
            Sample::new(20.0, 0.0, 0.9),
        ];
        let outline = OutlineGenerator::default().generate(&samples, 10.0);
        let Ok(geometry) = triangulate(&outline) else {
            panic!("stroke outline should triangulate");
        };
        assert!(geometry.triangle_count() >= 3);
    }

    #[test]
    fn test_collinear_outline_fails() {
        let outline = Outline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(5.0, 0.0),
            Point::new(10.0, 0.0),
        ]);
        assert_eq!(triangulate(&outline), Err(TriangulationError::ZeroExtent));

        let diagonal = Outline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(5.0, 5.0),
            Point::new(10.0, 10.0),
        ]);
        assert!(triangulate(&diagonal).is_err());
    }

    #[test]
    fn test_too_few_vertices() {
        let outline = Outline::new(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]);
        assert_eq!(triangulate(&outline), Err(TriangulationError::TooFewVertices(2)));

        let with_nan = Outline::new(vec![
            Point::new(0.0, 0.0),
            Point::new(f64::NAN, 1.0),
            Point::new(1.0, 1.0),
        ]);
        assert!(matches!(
            triangulate(&with_nan),
            Err(TriangulationError::TooFewVertices(2))
        ));
    }

    #[test]
    fn test_stamp_fallback_covers_collinear_samples() {
        let samples = [
            Sample::new(0.0, 0.0, 0.5),
            Sample::new(5.0, 0.0, 0.5),
            Sample::new(10.0, 0.0, 0.5),
        ];
        let geometry = stamp_circles(&samples, &[4.0, 4.0, 4.0], 12);
        assert!(!geometry.is_empty());
        // 3 sample stamps + 2 gaps of 5 units at spacing 1 => 4 extra each
        assert_eq!(geometry.triangle_count(), (3 + 8) * 12);
        for [a, b, c] in geometry.triangles() {
            assert!(triangle_area(a, b, c) > 0.0);
        }
        let Some(bounds) = geometry.bounds() else {
            panic!("stamps should have bounds");
        };
        assert!((bounds.x0 + 2.0).abs() < 1e-4);
        assert!((bounds.x1 - 12.0).abs() < 1e-4);
    }

    #[test]
    fn test_stamp_single_sample_with_missing_width() {
        let geometry = stamp_circles(&[Sample::new(1.0, 1.0, 0.5)], &[], 8);
        assert_eq!(geometry.triangle_count(), 8);
    }

    #[test]
    fn test_append_rebases_indices() {
        let mut a = stamp_circles(&[Sample::new(0.0, 0.0, 0.5)], &[2.0], 4);
        let b = stamp_circles(&[Sample::new(5.0, 0.0, 0.5)], &[2.0], 4);
        a.append(&b);
        assert_eq!(a.vertices.len(), 10);
        assert!(a.indices.iter().all(|&i| (i as usize) < a.vertices.len()));
        assert_eq!(a.triangles().count(), 8);
    }
}
