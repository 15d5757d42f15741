//! Engine configuration
//!
//! One serde document (camelCase, every field optional) that groups the
//! settings of each pipeline stage.

use serde::{Deserialize, Serialize};

use crate::brush::{OutlineConfig, PipelineConfig, RecorderConfig, SmoothingConfig};
use crate::core::errors::{EngineError, EngineResult};
use crate::engine::CoordinatorConfig;
use crate::input::SamplerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub sampler: SamplerConfig,
    pub recorder: RecorderConfig,
    pub smoothing: SmoothingConfig,
    pub outline: OutlineConfig,
    pub pipeline: PipelineConfig,
    pub coordinator: CoordinatorConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values that would stall or break a pipeline stage
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(msg.to_string()));

        let sampler = &self.sampler;
        if !(0.0..=1.0).contains(&sampler.estimated_min)
            || !(0.0..=1.0).contains(&sampler.estimated_max)
            || sampler.estimated_min > sampler.estimated_max
        {
            return invalid("sampler estimate range must satisfy 0 <= min <= max <= 1");
        }
        if sampler.reference_velocity <= 0.0 || !sampler.reference_velocity.is_finite() {
            return invalid("sampler.referenceVelocity must be positive");
        }

        if self.recorder.max_spacing < 0.0 || !self.recorder.max_spacing.is_finite() {
            return invalid("recorder.maxSpacing must be a non-negative number");
        }

        let outline = &self.outline;
        if !(0.0..=1.0).contains(&outline.min_ratio) {
            return invalid("outline.minRatio must be within 0..=1");
        }
        if outline.min_width < 0.0 || !outline.min_width.is_finite() {
            return invalid("outline.minWidth must be a non-negative number");
        }
        if outline.circle_segments < 3 {
            return invalid("outline.circleSegments must be at least 3");
        }

        if self.pipeline.max_samples_per_part < 2 {
            return invalid("pipeline.maxSamplesPerPart must be at least 2");
        }
        if self.pipeline.fallback_segments < 3 {
            return invalid("pipeline.fallbackSegments must be at least 3");
        }

        if self.coordinator.probe_timeout_ms == 0 {
            return invalid("coordinator.probeTimeoutMs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "recorder": { "maxSpacing": 2.5 },
            "coordinator": { "probeTimeoutMs": 250 }
        }"#;
        let Ok(config) = EngineConfig::from_json_str(json) else {
            panic!("partial config should parse");
        };
        assert_eq!(config.recorder.max_spacing, 2.5);
        assert_eq!(config.recorder.dot_max_samples, 3);
        assert_eq!(config.coordinator.probe_timeout_ms, 250);
        assert_eq!(config.pipeline.max_samples_per_part, 512);
    }

    #[test]
    fn test_round_trip_through_json() {
        let mut config = EngineConfig::default();
        config.outline.min_width = 2.0;
        let Ok(json) = config.to_json_string() else {
            panic!("config should serialize");
        };
        assert!(json.contains("\"minWidth\": 2.0"));
        let Ok(parsed) = EngineConfig::from_json_str(&json) else {
            panic!("serialized config should parse");
        };
        assert_eq!(parsed.outline.min_width, 2.0);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let json = r#"{ "pipeline": { "maxSamplesPerPart": 1 } }"#;
        assert!(matches!(
            EngineConfig::from_json_str(json),
            Err(EngineError::InvalidConfig(_))
        ));
        assert!(matches!(EngineConfig::from_json_str("{ nope"), Err(EngineError::Json(_))));

        let mut config = EngineConfig::default();
        config.sampler.estimated_min = 0.9;
        config.sampler.estimated_max = 0.2;
        assert!(config.validate().is_err());
    }
}
