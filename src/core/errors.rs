use thiserror::Error;

use crate::layer::LayerId;
use crate::render::BackendKind;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Backend {kind} unavailable: {reason}")]
    BackendUnavailable { kind: BackendKind, reason: String },

    #[error("Backend {kind} did not initialize within {after_ms} ms")]
    BackendTimeout { kind: BackendKind, after_ms: u64 },

    #[error("Backend {0} was demoted after repeated device loss")]
    BackendDemoted(BackendKind),

    #[error("No rendering backend could be initialized")]
    NoBackendAvailable,

    #[error("Rendering backend is not ready")]
    BackendNotReady,

    #[error("GPU device lost on backend {0}")]
    DeviceLost(BackendKind),

    #[error("Layer {0} not found")]
    LayerNotFound(LayerId),

    #[error("Layer {0} is locked")]
    LayerLocked(LayerId),

    #[error("No active layer selected")]
    NoActiveLayer,

    #[error("Layer {layer} surface is not owned by backend {backend}")]
    SurfaceMismatch { layer: LayerId, backend: BackendKind },

    #[error("Layer {0} pixels are held by a device texture")]
    HostPixelsRequired(LayerId),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for String {
    fn from(err: EngineError) -> Self {
        err.to_string()
    }
}
