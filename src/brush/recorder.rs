//! Stroke recorder - accumulates samples for a single stroke
//!
//! The recorder only guarantees sample density: gaps wider than the
//! configured spacing are filled with interpolated samples so sparse pointer
//! events do not produce faceted strokes. Curve aesthetics (simplification,
//! spline smoothing) are applied later by the brush engine.

use serde::{Deserialize, Serialize};

use super::{BrushSettings, StrokeMode};
use crate::input::Sample;
use crate::render::Color;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Maximum distance between consecutive recorded samples
    pub max_spacing: f64,
    /// Strokes with at most this many samples may classify as a dot
    pub dot_max_samples: usize,
    /// Strokes shorter than this path length may classify as a dot
    pub dot_max_length: f64,
    /// Upper bound of synthesized samples for a single gap
    pub max_interpolated_per_gap: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_spacing: 5.0,
            dot_max_samples: 3,
            dot_max_length: 2.0,
            max_interpolated_per_gap: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Cancelled,
}

/// A finished stroke
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeRecord {
    pub samples: Vec<Sample>,
    pub is_single_dot: bool,
    pub mode: StrokeMode,
    pub color: Color,
    pub base_size: f64,
    pub opacity: f64,
    pub total_path_length: f64,
}

#[derive(Debug, Clone)]
struct ActiveStroke {
    samples: Vec<Sample>,
    settings: BrushSettings,
    path_length: f64,
}

#[derive(Debug, Clone)]
pub struct StrokeRecorder {
    config: RecorderConfig,
    state: RecorderState,
    active: Option<ActiveStroke>,
}

impl StrokeRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            state: RecorderState::Idle,
            active: None,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    /// Samples recorded so far (empty when not recording)
    pub fn samples(&self) -> &[Sample] {
        self.active
            .as_ref()
            .map(|stroke| stroke.samples.as_slice())
            .unwrap_or(&[])
    }

    /// Settings of the stroke in progress
    pub fn settings(&self) -> Option<&BrushSettings> {
        self.active.as_ref().map(|stroke| &stroke.settings)
    }

    /// Begin a new stroke, discarding anything recorded before.
    pub fn start_stroke(&mut self, initial: Sample, settings: &BrushSettings) {
        if self.is_recording() {
            tracing::warn!("start_stroke while recording; previous stroke discarded");
        }
        self.active = Some(ActiveStroke {
            samples: vec![initial],
            settings: settings.clone(),
            path_length: 0.0,
        });
        self.state = RecorderState::Recording;
    }

    /// Append a sample, filling wide gaps with interpolated samples.
    pub fn add_sample(&mut self, sample: Sample) {
        if self.state != RecorderState::Recording {
            return;
        }
        let Some(stroke) = self.active.as_mut() else {
            return;
        };
        let Some(last) = stroke.samples.last().copied() else {
            stroke.samples.push(sample);
            return;
        };

        let distance = last.distance_to(&sample);
        let spacing = self.config.max_spacing;
        if spacing > 0.0 && distance > spacing {
            let steps = (distance / spacing).ceil() as usize;
            let wanted = steps.saturating_sub(1);
            let inserted = wanted.min(self.config.max_interpolated_per_gap);
            if inserted < wanted {
                tracing::warn!(
                    "Gap of {:.1} units needs {} samples, capped at {}",
                    distance,
                    wanted,
                    inserted
                );
            }
            let divisions = inserted + 1;
            for step in 1..divisions {
                let t = step as f64 / divisions as f64;
                stroke.samples.push(last.lerp(&sample, t));
            }
        }

        stroke.path_length += distance;
        stroke.samples.push(sample);
    }

    /// Finish the stroke. Returns `None` when no stroke was being recorded.
    pub fn end_stroke(&mut self) -> Option<StrokeRecord> {
        if self.state != RecorderState::Recording {
            return None;
        }
        self.state = RecorderState::Idle;
        let stroke = self.active.take()?;

        let is_single_dot = stroke.samples.len() <= self.config.dot_max_samples
            && stroke.path_length < self.config.dot_max_length;

        tracing::debug!(
            "Stroke ended: {} samples, length {:.1}, dot={}",
            stroke.samples.len(),
            stroke.path_length,
            is_single_dot
        );

        Some(StrokeRecord {
            samples: stroke.samples,
            is_single_dot,
            mode: stroke.settings.mode,
            color: stroke.settings.color,
            base_size: stroke.settings.size,
            opacity: stroke.settings.opacity.clamp(0.0, 1.0),
            total_path_length: stroke.path_length,
        })
    }

    /// Discard the stroke in progress.
    pub fn cancel_stroke(&mut self) {
        if self.active.take().is_some() {
            tracing::debug!("Stroke cancelled");
        }
        self.state = RecorderState::Cancelled;
    }
}

impl Default for StrokeRecorder {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}
