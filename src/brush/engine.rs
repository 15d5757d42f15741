//! Brush engine - turns a finished stroke record into triangle meshes
//!
//! Pipeline: smoothing → outline → triangulation, with the circle-stamp
//! fallback whenever an outline cannot be triangulated. Long strokes are cut
//! into overlapping parts so no single mesh grows without bound.

use kurbo::Rect;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::interpolation::SmoothingConfig;
use super::outline::{CapStyle, OutlineConfig, OutlineGenerator};
use super::recorder::StrokeRecord;
use super::tessellate::{stamp_circles, triangulate, Geometry, TriangulationError};
use crate::input::Sample;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Samples per mesh part; consecutive parts share one sample
    pub max_samples_per_part: usize,
    /// Circle segments used by the stamp fallback
    pub fallback_segments: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_samples_per_part: 512,
            fallback_segments: 16,
        }
    }
}

/// Renderable meshes of one stroke.
///
/// All parts belong to the same mark and are rasterized as a single
/// coverage union, so overlaps between parts never double up.
#[derive(Debug, Clone, Default)]
pub struct StrokeGeometry {
    pub parts: Vec<Geometry>,
    /// Layer-space bounds of every vertex
    pub bounds: Rect,
    /// True when any part came from the stamp fallback
    pub fallback: bool,
}

impl StrokeGeometry {
    pub fn from_parts(parts: Vec<Geometry>, fallback: bool) -> Self {
        let bounds = parts
            .iter()
            .filter_map(Geometry::bounds)
            .reduce(|a, b| a.union(b))
            .unwrap_or(Rect::ZERO);
        Self {
            parts,
            bounds,
            fallback,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(Geometry::is_empty)
    }

    pub fn triangle_count(&self) -> usize {
        self.parts.iter().map(Geometry::triangle_count).sum()
    }

    pub fn vertex_count(&self) -> usize {
        self.parts.iter().map(|part| part.vertices.len()).sum()
    }

    /// Iterate every triangle of every part
    pub fn triangles(&self) -> impl Iterator<Item = [[f32; 2]; 3]> + '_ {
        self.parts.iter().flat_map(Geometry::triangles)
    }
}

/// Stateless stroke processor
#[derive(Debug, Clone, Default)]
pub struct BrushEngine {
    smoothing: SmoothingConfig,
    outline: OutlineGenerator,
    pipeline: PipelineConfig,
}

impl BrushEngine {
    pub fn new(
        smoothing: SmoothingConfig,
        outline: OutlineConfig,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            smoothing,
            outline: OutlineGenerator::new(outline),
            pipeline,
        }
    }

    pub fn outline_generator(&self) -> &OutlineGenerator {
        &self.outline
    }

    pub fn smoothing(&self) -> &SmoothingConfig {
        &self.smoothing
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// Produce geometry for a finished stroke.
    pub fn process(&self, record: &StrokeRecord) -> StrokeGeometry {
        let Some(first) = record.samples.first() else {
            return StrokeGeometry::default();
        };

        if record.is_single_dot {
            let (geometry, fallback) = self.mesh_part(
                std::slice::from_ref(first),
                record.base_size,
                CapStyle::Round,
                CapStyle::Round,
            );
            return StrokeGeometry::from_parts(vec![geometry], fallback);
        }

        let smoothed = self.smoothing.apply(&record.samples);
        self.process_samples(&smoothed, record.base_size)
    }

    /// Geometry for an unfinished stroke (live preview); no smoothing.
    pub fn preview(&self, samples: &[Sample], base_size: f64) -> StrokeGeometry {
        self.process_samples(samples, base_size)
    }

    fn process_samples(&self, samples: &[Sample], base_size: f64) -> StrokeGeometry {
        let ranges = split_ranges(samples.len(), self.pipeline.max_samples_per_part);
        let part_count = ranges.len();
        let cap = self.outline.config().cap;

        let meshes: Vec<(Geometry, bool)> = ranges
            .into_par_iter()
            .enumerate()
            .map(|(index, (start, end))| {
                // Inner joints always get round caps so parts meet without notches
                let start_cap = if index == 0 { cap } else { CapStyle::Round };
                let end_cap = if index + 1 == part_count { cap } else { CapStyle::Round };
                self.mesh_part(&samples[start..end], base_size, start_cap, end_cap)
            })
            .collect();

        let fallback = meshes.iter().any(|(_, fallback)| *fallback);
        let parts: Vec<Geometry> = meshes.into_iter().map(|(geometry, _)| geometry).collect();
        let geometry = StrokeGeometry::from_parts(parts, fallback);

        tracing::debug!(
            "Stroke meshed: {} samples, {} parts, {} triangles, fallback={}",
            samples.len(),
            part_count,
            geometry.triangle_count(),
            fallback
        );
        geometry
    }

    fn mesh_part(
        &self,
        samples: &[Sample],
        base_size: f64,
        start: CapStyle,
        end: CapStyle,
    ) -> (Geometry, bool) {
        let outline = self.outline.generate_with_caps(samples, base_size, start, end);
        let result = if outline.is_valid() {
            triangulate(&outline)
        } else {
            Err(TriangulationError::TooFewVertices(outline.len()))
        };

        match result {
            Ok(geometry) => (geometry, false),
            Err(e) => {
                tracing::warn!("Triangulation failed ({}), stamping {} samples", e, samples.len());
                let widths: Vec<f64> = samples
                    .iter()
                    .map(|s| self.outline.width_at(s.pressure, base_size))
                    .collect();
                (stamp_circles(samples, &widths, self.pipeline.fallback_segments), true)
            }
        }
    }
}

/// Split `len` samples into ranges of at most `max` that overlap by one.
fn split_ranges(len: usize, max: usize) -> Vec<(usize, usize)> {
    if len == 0 {
        return Vec::new();
    }
    let max = max.max(2);
    if len <= max {
        return vec![(0, len)];
    }
    let mut ranges = Vec::with_capacity(len / (max - 1) + 1);
    let mut start = 0;
    while start + 1 < len {
        let end = (start + max).min(len);
        ranges.push((start, end));
        start = end - 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::{BrushSettings, StrokeRecorder};

    fn record_of(samples: &[Sample]) -> StrokeRecord {
        let mut recorder = StrokeRecorder::default();
        recorder.start_stroke(samples[0], &BrushSettings::default());
        for sample in &samples[1..] {
            recorder.add_sample(*sample);
        }
        let Some(record) = recorder.end_stroke() else {
            panic!("recording should produce a record");
        };
        record
    }

    #[test]
    fn test_dot_produces_circle() {
        let record = record_of(&[Sample::new(50.0, 50.0, 0.5)]);
        let geometry = BrushEngine::default().process(&record);

        assert_eq!(geometry.parts.len(), 1);
        assert!(!geometry.fallback);
        assert!((geometry.bounds.width() - 10.0).abs() < 1e-3);
        assert!((geometry.bounds.center().x - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_three_point_stroke() {
        let record = record_of(&[
            Sample::new(0.0, 0.0, 0.2),
            Sample::new(10.0, 0.0, 0.6),
            Sample::new(20.0, 0.0, 0.9),
        ]);
        assert!(!record.is_single_dot);

        let geometry = BrushEngine::default().process(&record);
        assert!(!geometry.is_empty());
        assert!(!geometry.fallback);
        assert!(geometry.triangle_count() >= 3);
        for [a, b, c] in geometry.triangles() {
            let area = (b[0] - a[0]) * (c[1] - a[1]) - (c[0] - a[0]) * (b[1] - a[1]);
            assert!(area >= 0.0);
        }
        // Round caps reach past the endpoints
        assert!(geometry.bounds.x0 < 0.0);
        assert!(geometry.bounds.x1 > 20.0);
    }

    #[test]
    fn test_long_stroke_is_split_into_parts() {
        let engine = BrushEngine::new(
            SmoothingConfig::disabled(),
            OutlineConfig::default(),
            PipelineConfig {
                max_samples_per_part: 16,
                ..Default::default()
            },
        );
        let samples: Vec<Sample> = (0..100)
            .map(|i| Sample::new(i as f64 * 2.0, (i as f64 * 0.2).sin() * 20.0, 0.5))
            .collect();
        let geometry = engine.preview(&samples, 8.0);

        // 100 samples, 15 new per part after the first
        assert_eq!(geometry.parts.len(), 7);
        assert!(geometry.parts.iter().all(|part| !part.is_empty()));
        assert!(geometry.bounds.x1 >= 198.0);
    }

    #[test]
    fn test_split_ranges_overlap_by_one() {
        assert_eq!(split_ranges(0, 4), Vec::<(usize, usize)>::new());
        assert_eq!(split_ranges(3, 4), vec![(0, 3)]);
        assert_eq!(split_ranges(10, 4), vec![(0, 4), (3, 7), (6, 10)]);
        assert_eq!(split_ranges(5, 1), vec![(0, 2), (1, 3), (2, 4), (3, 5)]);
    }

    #[test]
    fn test_empty_record_yields_empty_geometry() {
        let record = StrokeRecord {
            samples: Vec::new(),
            is_single_dot: false,
            mode: Default::default(),
            color: Default::default(),
            base_size: 10.0,
            opacity: 1.0,
            total_path_length: 0.0,
        };
        let geometry = BrushEngine::default().process(&record);
        assert!(geometry.is_empty());
        assert_eq!(geometry.bounds, Rect::ZERO);
    }
}
