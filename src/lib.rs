//! Inkflow - stroke capture, tessellation and multi-backend layer rendering
//!
//! Pointer input flows through [`input`] into the stroke recorder, the
//! [`brush`] pipeline turns finished strokes into triangle meshes, and the
//! [`engine`] draws them into [`layer`]s on whichever [`render`] backend the
//! coordinator selected.

pub mod brush;
pub mod config;
pub mod core;
pub mod engine;
pub mod input;
pub mod layer;
pub mod render;

pub use crate::config::EngineConfig;
pub use crate::core::errors::{EngineError, EngineResult};
pub use crate::engine::{DrawingEngine, StrokeCommand};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber (`RUST_LOG` overrides the filter)
pub fn init_logging() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Inkflow logging initialized");
    }
}
