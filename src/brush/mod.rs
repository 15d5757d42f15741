//! Brush module - turns recorded strokes into renderable geometry

mod engine;
mod interpolation;
mod outline;
mod recorder;
mod tessellate;

pub use engine::{BrushEngine, PipelineConfig, StrokeGeometry};
pub use interpolation::{path_length, simplify, smooth, SmoothingConfig, SplineConfig};
pub use outline::{CapStyle, Outline, OutlineConfig, OutlineGenerator};
pub use recorder::{RecorderConfig, RecorderState, StrokeRecord, StrokeRecorder};
pub use tessellate::{stamp_circles, triangulate, Geometry, TriangulationError};

use serde::{Deserialize, Serialize};

use crate::render::Color;

/// Whether a stroke paints or removes coverage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrokeMode {
    #[default]
    Draw,
    Erase,
}

/// Tool settings captured at stroke start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrushSettings {
    /// Stroke color; alpha is ignored, use `opacity`
    pub color: Color,
    /// Base brush size in layer units
    pub size: f64,
    /// Base opacity (0.0 - 1.0)
    pub opacity: f64,
    pub mode: StrokeMode,
}

impl Default for BrushSettings {
    fn default() -> Self {
        Self {
            color: Color::BLACK,
            size: 10.0,
            opacity: 1.0,
            mode: StrokeMode::Draw,
        }
    }
}

impl BrushSettings {
    pub fn eraser(size: f64) -> Self {
        Self {
            size,
            mode: StrokeMode::Erase,
            ..Self::default()
        }
    }
}

/// Blend modes for layer compositing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
}

impl BlendMode {
    /// Stable index shared with the GPU compositing shader
    pub fn shader_index(self) -> u32 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Multiply => 1,
            BlendMode::Screen => 2,
            BlendMode::Overlay => 3,
            BlendMode::Darken => 4,
            BlendMode::Lighten => 5,
            BlendMode::ColorDodge => 6,
            BlendMode::ColorBurn => 7,
            BlendMode::HardLight => 8,
            BlendMode::SoftLight => 9,
            BlendMode::Difference => 10,
            BlendMode::Exclusion => 11,
        }
    }
}

/// Pressure curve types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PressureCurve {
    /// Linear mapping (1:1)
    #[default]
    Linear,
    /// Soft curve (more sensitive at low pressure)
    Soft,
    /// Hard curve (less sensitive at low pressure)
    Hard,
}

impl PressureCurve {
    /// Apply the pressure curve to a raw pressure value
    pub fn apply(&self, pressure: f64) -> f64 {
        let p = if pressure.is_finite() {
            pressure.clamp(0.0, 1.0)
        } else {
            0.0
        };

        match self {
            PressureCurve::Linear => p,
            // Ease-out: more sensitive at low pressure
            PressureCurve::Soft => 1.0 - (1.0 - p).powi(2),
            // Ease-in: less sensitive at low pressure
            PressureCurve::Hard => p.powi(2),
        }
    }
}
