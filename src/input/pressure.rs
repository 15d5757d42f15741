//! Pressure sampler - turns pointer events into canonical samples
//!
//! Devices without usable pressure get an estimate derived from pointer
//! velocity: slow movement reads as firm pressure, fast movement as light.
//! The estimate is confined to a conservative mid-range so a mouse stroke
//! never jumps to hairline or full-width marks.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::{
    clamp_pressure, clamp_tilt_deg, normalize_twist_deg, PointerInput, PointerKind, Sample,
};

/// Configuration for pressure estimation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplerConfig {
    /// Number of recent movements averaged for velocity (clamped to 1..=5)
    pub velocity_window: usize,
    /// Lower bound of the estimated pressure
    pub estimated_min: f64,
    /// Upper bound of the estimated pressure
    pub estimated_max: f64,
    /// Velocity (layer units per ms) at which the estimate sits halfway
    pub reference_velocity: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            velocity_window: 5,
            estimated_min: 0.3,
            estimated_max: 0.7,
            reference_velocity: 1.0,
        }
    }
}

const MAX_VELOCITY_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy)]
struct Movement {
    distance: f64,
    dt_ms: f64,
}

/// Normalizes raw pointer input into [`Sample`]s.
#[derive(Debug, Clone)]
pub struct PressureSampler {
    config: SamplerConfig,
    window: VecDeque<Movement>,
    last_position: Option<(f64, f64)>,
    last_timestamp: Option<u64>,
}

impl PressureSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let capacity = config.velocity_window.clamp(1, MAX_VELOCITY_WINDOW);
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
            last_position: None,
            last_timestamp: None,
        }
    }

    fn window_capacity(&self) -> usize {
        self.config.velocity_window.clamp(1, MAX_VELOCITY_WINDOW)
    }

    /// Convert one pointer event into a sample. Never fails: missing or
    /// malformed fields fall back to defaults or estimates.
    pub fn sample(&mut self, input: &PointerInput) -> Sample {
        let (x, y) = self.resolve_position(input.x, input.y);
        self.track_movement(x, y, input.timestamp_ms);

        let pressure = match usable_pressure(input) {
            Some(p) => clamp_pressure(p),
            None => self.estimate_pressure(),
        };

        Sample {
            x,
            y,
            pressure,
            tilt_x: input.tilt_x.map(clamp_tilt_deg).unwrap_or(0.0),
            tilt_y: input.tilt_y.map(clamp_tilt_deg).unwrap_or(0.0),
            twist: input.twist.map(normalize_twist_deg).unwrap_or(0.0),
            timestamp_ms: input.timestamp_ms,
        }
    }

    /// Forget velocity history (call at stroke boundaries)
    pub fn reset(&mut self) {
        self.window.clear();
        self.last_position = None;
        self.last_timestamp = None;
    }

    /// Current velocity-based estimate, without consuming an event.
    pub fn estimate_pressure(&self) -> f64 {
        let min = self.config.estimated_min.min(self.config.estimated_max);
        let max = self.config.estimated_max.max(self.config.estimated_min);

        if self.window.is_empty() {
            return (min + max) * 0.5;
        }

        let distance: f64 = self.window.iter().map(|m| m.distance).sum();
        let elapsed: f64 = self.window.iter().map(|m| m.dt_ms).sum();
        let velocity = distance / elapsed.max(f64::EPSILON);
        let reference = self.config.reference_velocity.max(f64::EPSILON);

        let estimate = min + (max - min) / (1.0 + velocity / reference);
        estimate.clamp(min, max)
    }

    fn resolve_position(&self, x: f64, y: f64) -> (f64, f64) {
        let (last_x, last_y) = self.last_position.unwrap_or((0.0, 0.0));
        let x = if x.is_finite() { x } else { last_x };
        let y = if y.is_finite() { y } else { last_y };
        (x, y)
    }

    fn track_movement(&mut self, x: f64, y: f64, timestamp_ms: u64) {
        if let (Some((last_x, last_y)), Some(last_t)) = (self.last_position, self.last_timestamp) {
            let dx = x - last_x;
            let dy = y - last_y;
            // Out-of-order or duplicate timestamps count as one millisecond
            let dt_ms = if timestamp_ms > last_t {
                (timestamp_ms - last_t) as f64
            } else {
                1.0
            };

            self.window.push_back(Movement {
                distance: (dx * dx + dy * dy).sqrt(),
                dt_ms,
            });
            while self.window.len() > self.window_capacity() {
                self.window.pop_front();
            }
        }

        self.last_position = Some((x, y));
        self.last_timestamp = Some(timestamp_ms);
    }
}

impl Default for PressureSampler {
    fn default() -> Self {
        Self::new(SamplerConfig::default())
    }
}

/// Hardware pressure, if the event carries a trustworthy value.
///
/// Browsers report 0.5 (buttons down) or 0.0 for devices without a pressure
/// sensor, so those placeholders are ignored for touch input.
fn usable_pressure(input: &PointerInput) -> Option<f64> {
    let pressure = input.pressure.filter(|p| p.is_finite())?;
    match input.kind {
        PointerKind::Pen => Some(pressure),
        PointerKind::Touch if pressure != 0.0 && pressure != 0.5 => Some(pressure),
        PointerKind::Touch | PointerKind::Mouse => None,
    }
}
