//! Input module - normalizes pointer events into stroke samples

pub mod coords;
mod phase;
mod pressure;

pub use phase::{GateAction, PointerPhase, StrokeGate};
pub use pressure::{PressureSampler, SamplerConfig};

use serde::{Deserialize, Serialize};

/// Kind of device that produced a pointer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PointerKind {
    #[default]
    Mouse,
    Pen,
    Touch,
}

/// A pointer event as delivered by the input source.
///
/// Coordinates must already be in the active layer's local space
/// (see [`coords::screen_to_layer_local`]). Optional fields are absent when
/// the device does not report them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerInput {
    #[serde(default)]
    pub pointer_id: u32,
    #[serde(default)]
    pub kind: PointerKind,
    #[serde(default)]
    pub phase: PointerPhase,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub tilt_x: Option<f64>,
    #[serde(default)]
    pub tilt_y: Option<f64>,
    #[serde(default)]
    pub twist: Option<f64>,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl PointerInput {
    /// Pen event with hardware pressure
    pub fn pen(x: f64, y: f64, pressure: f64, timestamp_ms: u64) -> Self {
        Self {
            pointer_id: 1,
            kind: PointerKind::Pen,
            phase: PointerPhase::Move,
            x,
            y,
            pressure: Some(pressure),
            tilt_x: None,
            tilt_y: None,
            twist: None,
            timestamp_ms,
        }
    }

    /// Mouse event (no usable pressure)
    pub fn mouse(x: f64, y: f64, timestamp_ms: u64) -> Self {
        Self {
            pointer_id: 0,
            kind: PointerKind::Mouse,
            phase: PointerPhase::Move,
            x,
            y,
            pressure: None,
            tilt_x: None,
            tilt_y: None,
            twist: None,
            timestamp_ms,
        }
    }

    pub fn with_phase(mut self, phase: PointerPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_tilt(mut self, tilt_x: f64, tilt_y: f64) -> Self {
        self.tilt_x = Some(tilt_x);
        self.tilt_y = Some(tilt_y);
        self
    }

    pub fn with_pointer_id(mut self, pointer_id: u32) -> Self {
        self.pointer_id = pointer_id;
        self
    }
}

/// Canonical stroke sample in layer-local coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    /// Pressure value (0.0 - 1.0)
    pub pressure: f64,
    /// Tilt X angle in degrees (-90 to 90)
    pub tilt_x: f64,
    /// Tilt Y angle in degrees (-90 to 90)
    pub tilt_y: f64,
    /// Barrel rotation in degrees (0 to 360)
    pub twist: f64,
    pub timestamp_ms: u64,
}

impl Sample {
    /// Create a sample with no tilt or twist
    pub fn new(x: f64, y: f64, pressure: f64) -> Self {
        Self {
            x,
            y,
            pressure: clamp_pressure(pressure),
            tilt_x: 0.0,
            tilt_y: 0.0,
            twist: 0.0,
            timestamp_ms: 0,
        }
    }

    pub fn at_time(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn position(&self) -> kurbo::Point {
        kurbo::Point::new(self.x, self.y)
    }

    pub fn distance_to(&self, other: &Sample) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Linear blend towards `other`; twist follows the shortest arc.
    pub fn lerp(&self, other: &Sample, t: f64) -> Sample {
        let time_delta = other.timestamp_ms as f64 - self.timestamp_ms as f64;
        Sample {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
            pressure: clamp_pressure(self.pressure + (other.pressure - self.pressure) * t),
            tilt_x: self.tilt_x + (other.tilt_x - self.tilt_x) * t,
            tilt_y: self.tilt_y + (other.tilt_y - self.tilt_y) * t,
            twist: lerp_angle_deg(self.twist, other.twist, t),
            timestamp_ms: (self.timestamp_ms as f64 + time_delta * t).round().max(0.0) as u64,
        }
    }
}

pub fn clamp_pressure(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

pub fn clamp_tilt_deg(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(-90.0, 90.0)
}

pub fn normalize_twist_deg(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let wrapped = value.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

fn lerp_angle_deg(from: f64, to: f64, t: f64) -> f64 {
    let mut delta = (to - from).rem_euclid(360.0);
    if delta > 180.0 {
        delta -= 360.0;
    }
    normalize_twist_deg(from + delta * t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_creation_clamps_pressure() {
        let sample = Sample::new(100.0, 200.0, 1.5);
        assert_eq!(sample.x, 100.0);
        assert_eq!(sample.y, 200.0);
        assert_eq!(sample.pressure, 1.0);

        let sample = Sample::new(0.0, 0.0, f64::NAN);
        assert_eq!(sample.pressure, 0.0);
    }

    #[test]
    fn test_twist_normalization() {
        assert_eq!(normalize_twist_deg(370.0), 10.0);
        assert_eq!(normalize_twist_deg(-90.0), 270.0);
        assert_eq!(normalize_twist_deg(f64::INFINITY), 0.0);
    }

    #[test]
    fn test_lerp_twist_takes_shortest_arc() {
        let mut a = Sample::new(0.0, 0.0, 0.5);
        let mut b = Sample::new(10.0, 0.0, 0.5);
        a.twist = 350.0;
        b.twist = 10.0;
        let mid = a.lerp(&b, 0.5);
        assert!(mid.twist.abs() < 1e-9 || (mid.twist - 360.0).abs() < 1e-9);
        assert_eq!(mid.x, 5.0);
    }

    #[test]
    fn test_pointer_input_deserializes_without_optional_fields() {
        let json = r#"{"x": 4.0, "y": 2.0, "kind": "pen", "pressure": 0.25}"#;
        let Ok(input) = serde_json::from_str::<PointerInput>(json) else {
            panic!("pointer input should parse");
        };
        assert_eq!(input.kind, PointerKind::Pen);
        assert_eq!(input.pressure, Some(0.25));
        assert!(input.tilt_x.is_none());
        assert_eq!(input.phase, PointerPhase::Move);
    }
}
