//! Drawing engine - ties input, brush pipeline, layers and backends together
//!
//! Pointer events become samples, samples become a stroke record, the record
//! becomes geometry, and the active backend rasterizes it into the target
//! layer. Compositing is deferred to [`DrawingEngine::tick`], which runs once
//! per frame from the single render loop.

mod coordinator;
mod frame;

pub use coordinator::{
    select_kind, BackendEvent, BackendObserver, BackendProvider, CoordinatorConfig,
    CoordinatorState, DeviceLossSignal, EngineCoordinator,
};
pub use frame::{
    FrameInfo, FrameStage, FrameSurface, ManualTickSource, RenderLoop, SurfaceId, TickSource,
};

use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::brush::{BrushEngine, BrushSettings, StrokeMode, StrokeRecord, StrokeRecorder};
use crate::config::EngineConfig;
use crate::core::errors::{EngineError, EngineResult};
use crate::input::{GateAction, PointerInput, PressureSampler, StrokeGate};
use crate::layer::{Layer, LayerCompositor, LayerId, LayerStack};
use crate::render::{
    BackendCapability, BackendKind, Color, DirtyRect, PixelBuffer, PresentTarget, StrokeStyle,
};

/// Id of the transient preview layer; never part of the stack
const PREVIEW_LAYER_ID: LayerId = LayerId(u32::MAX);

/// A committed stroke, enough to redraw it later (undo/redo by replay)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeCommand {
    pub layer_id: LayerId,
    pub record: StrokeRecord,
    /// Pixels the stroke touched when it was first drawn
    pub bounds: Option<DirtyRect>,
}

/// Receives every committed stroke
pub trait HistorySink {
    fn record(&mut self, command: StrokeCommand);
}

impl<F: FnMut(StrokeCommand)> HistorySink for F {
    fn record(&mut self, command: StrokeCommand) {
        self(command)
    }
}

pub struct DrawingEngine {
    coordinator: EngineCoordinator,
    layers: LayerStack,
    compositor: LayerCompositor,
    sampler: PressureSampler,
    recorder: StrokeRecorder,
    brush: BrushEngine,
    gate: StrokeGate,
    stroke_layer: Option<LayerId>,
    preview: Option<Layer>,
    preview_damage: Option<DirtyRect>,
    /// Strokes committed while the device was lost, drawn after recovery
    deferred: Vec<StrokeCommand>,
    pending: Option<DirtyRect>,
    full_recomposite: bool,
    render_loop: RenderLoop,
    history: Option<Box<dyn HistorySink>>,
    present_target: Option<Box<dyn PresentTarget>>,
}

impl DrawingEngine {
    /// Validate the config, probe backends and move `layers` onto the
    /// selected one.
    pub async fn start(
        config: EngineConfig,
        mut layers: LayerStack,
        providers: Vec<Box<dyn BackendProvider>>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let EngineConfig {
            sampler,
            recorder,
            smoothing,
            outline,
            pipeline,
            coordinator,
        } = config;

        let mut coordinator = EngineCoordinator::new(coordinator, providers);
        let kind = coordinator.probe(layers.layers_mut()).await?;
        tracing::info!(
            "Drawing engine started on {} ({}x{}, {} layers)",
            kind,
            layers.width(),
            layers.height(),
            layers.len()
        );

        let compositor = LayerCompositor::new(layers.width(), layers.height());
        Ok(Self {
            coordinator,
            layers,
            compositor,
            sampler: PressureSampler::new(sampler),
            recorder: StrokeRecorder::new(recorder),
            brush: BrushEngine::new(smoothing, outline, pipeline),
            gate: StrokeGate::new(),
            stroke_layer: None,
            preview: None,
            preview_damage: None,
            deferred: Vec::new(),
            pending: None,
            full_recomposite: true,
            render_loop: RenderLoop::new(),
            history: None,
            present_target: None,
        })
    }

    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    /// Structural edits (add, remove, reorder, visibility) go through here;
    /// the next tick recomposites the whole canvas.
    pub fn layers_mut(&mut self) -> &mut LayerStack {
        self.full_recomposite = true;
        &mut self.layers
    }

    pub fn composition(&self) -> &PixelBuffer {
        &self.compositor.buffer().pixels
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.coordinator.current_kind()
    }

    pub fn backend_capability(&self) -> BackendCapability {
        self.coordinator.capability()
    }

    pub fn coordinator_state(&self) -> CoordinatorState {
        self.coordinator.state()
    }

    pub fn is_stroke_active(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn set_history_sink(&mut self, sink: Box<dyn HistorySink>) {
        self.history = Some(sink);
    }

    pub fn set_present_target(&mut self, target: Box<dyn PresentTarget>) {
        self.present_target = Some(target);
        self.full_recomposite = true;
    }

    pub fn subscribe(&self, observer: Arc<dyn BackendObserver>) {
        self.coordinator.subscribe(observer);
    }

    pub fn register_surface(&mut self, surface: Box<dyn FrameSurface>) -> SurfaceId {
        self.render_loop.register(surface)
    }

    pub fn unregister_surface(&mut self, id: SurfaceId) -> Option<Box<dyn FrameSurface>> {
        self.render_loop.unregister(id)
    }

    /// Suspend a competing animation loop; the engine's tick drives from now on
    pub fn take_tick_ownership(&mut self, competitor: &mut dyn TickSource) {
        self.render_loop.take_ownership(competitor);
    }

    // ========================================================================
    // Strokes
    // ========================================================================

    /// Start a stroke on the active layer.
    ///
    /// A stroke still in progress is committed first and returned.
    pub fn begin_stroke(
        &mut self,
        input: &PointerInput,
        settings: BrushSettings,
    ) -> EngineResult<Option<StrokeCommand>> {
        let finished = if self.recorder.is_recording() {
            tracing::warn!("Stroke started before the previous one ended; committing it");
            self.commit_stroke()?
        } else {
            None
        };

        let Some(layer) = self.layers.active_layer() else {
            return Err(EngineError::NoActiveLayer);
        };
        if layer.locked {
            return Err(EngineError::LayerLocked(layer.id));
        }
        let layer_id = layer.id;

        self.discard_preview();
        self.sampler.reset();
        let sample = self.sampler.sample(input);
        self.recorder.start_stroke(sample, &settings);
        self.stroke_layer = Some(layer_id);
        Ok(finished)
    }

    /// Add a pointer position to the stroke in progress; ignored when idle.
    pub fn extend_stroke(&mut self, input: &PointerInput) {
        if !self.recorder.is_recording() {
            return;
        }
        let sample = self.sampler.sample(input);
        self.recorder.add_sample(sample);
    }

    /// Finish the stroke and rasterize it into its layer.
    ///
    /// Returns `None` when no stroke was in progress. When the device is
    /// lost the stroke is queued instead and drawn by the next
    /// [`tick`](Self::tick) once a backend is back; its `bounds` stay `None`.
    pub fn commit_stroke(&mut self) -> EngineResult<Option<StrokeCommand>> {
        let Some(record) = self.recorder.end_stroke() else {
            return Ok(None);
        };
        self.discard_preview();
        let Some(layer_id) = self.stroke_layer.take() else {
            return Ok(None);
        };
        let mut command = StrokeCommand {
            layer_id,
            record,
            bounds: None,
        };

        if self.coordinator.is_device_lost() {
            tracing::warn!("Device lost; stroke on layer {} queued until recovery", layer_id);
            self.deferred.push(command.clone());
            return Ok(Some(command));
        }
        match self.render_record(layer_id, &command.record) {
            Ok(bounds) => command.bounds = bounds,
            Err(e) if self.coordinator.is_device_lost() => {
                tracing::warn!("Stroke on layer {} queued until recovery: {}", layer_id, e);
                self.deferred.push(command.clone());
                return Ok(Some(command));
            }
            Err(e) => return Err(e),
        }
        self.record_history(&command);
        Ok(Some(command))
    }

    fn record_history(&mut self, command: &StrokeCommand) {
        if let Some(history) = self.history.as_mut() {
            history.record(command.clone());
        }
    }

    /// Draw strokes that were committed while the device was lost
    fn flush_deferred(&mut self) {
        for mut command in std::mem::take(&mut self.deferred) {
            match self.render_record(command.layer_id, &command.record) {
                Ok(bounds) => {
                    command.bounds = bounds;
                    self.record_history(&command);
                }
                Err(e) => tracing::warn!(
                    "Dropped queued stroke on layer {}: {}",
                    command.layer_id,
                    e
                ),
            }
        }
    }

    /// Drop the stroke in progress; nothing reaches any layer.
    pub fn cancel_stroke(&mut self) {
        self.recorder.cancel_stroke();
        self.sampler.reset();
        self.stroke_layer = None;
        self.discard_preview();
    }

    /// Route one raw pointer event through the stroke gate.
    ///
    /// Returns the committed stroke when this event finished one.
    pub fn handle_pointer(
        &mut self,
        input: &PointerInput,
        settings: &BrushSettings,
    ) -> EngineResult<Option<StrokeCommand>> {
        match self.gate.resolve(input.pointer_id, input.phase) {
            GateAction::Begin => match self.begin_stroke(input, settings.clone()) {
                Ok(finished) => Ok(finished),
                Err(e) => {
                    self.gate.reset();
                    Err(e)
                }
            },
            GateAction::Extend => {
                self.extend_stroke(input);
                Ok(None)
            }
            GateAction::Commit => {
                self.extend_stroke(input);
                self.commit_stroke()
            }
            GateAction::Cancel => {
                self.cancel_stroke();
                Ok(None)
            }
            GateAction::Ignore => Ok(None),
        }
    }

    /// Redraw a previously committed stroke (redo, or rebuilding after undo).
    pub fn replay(&mut self, command: &StrokeCommand) -> EngineResult<Option<DirtyRect>> {
        self.render_record(command.layer_id, &command.record)
    }

    fn render_record(
        &mut self,
        layer_id: LayerId,
        record: &StrokeRecord,
    ) -> EngineResult<Option<DirtyRect>> {
        let Some(layer) = self.layers.get_mut(layer_id) else {
            return Err(EngineError::LayerNotFound(layer_id));
        };
        if layer.locked {
            return Err(EngineError::LayerLocked(layer_id));
        }

        let geometry = self.brush.process(record);
        let style = StrokeStyle::from_record(record);
        let backend = self.coordinator.backend_mut()?;
        let damage = backend.draw_stroke(layer, &geometry, &style)?;
        if let Some(rect) = damage {
            self.mark_dirty(rect);
        }
        Ok(damage)
    }

    // ========================================================================
    // Preview
    // ========================================================================

    /// Re-render the unfinished stroke into the preview layer.
    ///
    /// The preview sits above the stack and never touches a real layer.
    /// Erase strokes have no preview; their effect shows on commit.
    pub fn refresh_preview(&mut self) -> EngineResult<Option<DirtyRect>> {
        let Some(settings) = self.recorder.settings().cloned() else {
            return Ok(None);
        };
        if settings.mode == StrokeMode::Erase {
            return Ok(None);
        }

        let geometry = self.brush.preview(self.recorder.samples(), settings.size);
        let style = StrokeStyle {
            color: settings.color,
            opacity: settings.opacity.clamp(0.0, 1.0) as f32,
            mode: StrokeMode::Draw,
        };

        let (width, height) = (self.layers.width(), self.layers.height());
        let backend = self.coordinator.backend_mut()?;
        if let Some(layer) = self.preview.as_mut() {
            backend.clear(layer)?;
        } else {
            let mut layer = Layer::new(PREVIEW_LAYER_ID, width, height);
            backend.adopt_layer(&mut layer)?;
            self.preview = Some(layer);
        }
        let Some(layer) = self.preview.as_mut() else {
            return Ok(None);
        };
        let damage = backend.draw_stroke(layer, &geometry, &style)?;

        if let Some(previous) = self.preview_damage.take() {
            self.mark_dirty(previous);
        }
        if let Some(rect) = damage {
            self.mark_dirty(rect);
        }
        self.preview_damage = damage;
        Ok(damage)
    }

    fn discard_preview(&mut self) {
        let Some(mut layer) = self.preview.take() else {
            return;
        };
        if let Ok(backend) = self.coordinator.backend_mut() {
            if let Err(e) = backend.release_layer(&mut layer) {
                tracing::warn!("Failed to release preview layer: {}", e);
            }
        }
        if let Some(rect) = self.preview_damage.take() {
            self.mark_dirty(rect);
        }
    }

    // ========================================================================
    // Layers
    // ========================================================================

    pub fn fill_layer(&mut self, layer_id: LayerId, color: Color) -> EngineResult<()> {
        let Some(layer) = self.layers.get_mut(layer_id) else {
            return Err(EngineError::LayerNotFound(layer_id));
        };
        self.coordinator.backend_mut()?.fill(layer, color)?;
        self.full_recomposite = true;
        Ok(())
    }

    pub fn clear_layer(&mut self, layer_id: LayerId) -> EngineResult<()> {
        let Some(layer) = self.layers.get_mut(layer_id) else {
            return Err(EngineError::LayerNotFound(layer_id));
        };
        self.coordinator.backend_mut()?.clear(layer)?;
        self.full_recomposite = true;
        Ok(())
    }

    /// Host copy of a layer in premultiplied RGBA
    pub fn snapshot_layer(&mut self, layer_id: LayerId) -> EngineResult<PixelBuffer> {
        let Some(layer) = self.layers.get(layer_id) else {
            return Err(EngineError::LayerNotFound(layer_id));
        };
        self.coordinator.backend_mut()?.snapshot_layer(layer)
    }

    /// Layer pixels with straight alpha, ready for encoders
    pub fn export_layer(&mut self, layer_id: LayerId) -> EngineResult<RgbaImage> {
        Ok(self.snapshot_layer(layer_id)?.to_straight())
    }

    /// Resize the canvas, keeping layer content anchored top-left.
    pub fn resize_canvas(&mut self, width: u32, height: u32) -> EngineResult<()> {
        if self.recorder.is_recording() {
            self.cancel_stroke();
        }
        self.discard_preview();

        let backend = self.coordinator.backend_mut()?;
        for layer in self.layers.layers_mut() {
            backend.release_layer(layer)?;
        }
        self.layers.resize(width, height)?;
        for layer in self.layers.layers_mut() {
            backend.adopt_layer(layer)?;
        }

        self.compositor.resize(width, height);
        self.pending = None;
        self.full_recomposite = true;
        tracing::info!("Canvas resized to {}x{}", width, height);
        Ok(())
    }

    // ========================================================================
    // Backends
    // ========================================================================

    /// Switch tiers explicitly; fails for tiers demoted this session.
    pub async fn select_backend(&mut self, kind: BackendKind) -> EngineResult<()> {
        self.discard_preview();
        self.coordinator
            .select_backend(kind, self.layers.layers_mut())
            .await?;
        self.full_recomposite = true;
        Ok(())
    }

    async fn recover_if_lost(&mut self) -> EngineResult<()> {
        if !self.coordinator.is_device_lost() {
            return Ok(());
        }
        self.discard_preview();
        self.coordinator
            .handle_device_lost(self.layers.layers_mut())
            .await?;
        self.full_recomposite = true;
        Ok(())
    }

    // ========================================================================
    // Compositing
    // ========================================================================

    /// Schedule a recomposite of `rect`, or of the whole canvas for `None`.
    pub fn request_recomposite(&mut self, rect: Option<DirtyRect>) {
        match rect {
            Some(rect) => self.mark_dirty(rect),
            None => self.full_recomposite = true,
        }
    }

    fn mark_dirty(&mut self, rect: DirtyRect) {
        self.pending = Some(match self.pending {
            Some(pending) => pending.union(&rect),
            None => rect,
        });
    }

    /// Run one frame: recover a lost device, draw compute surfaces,
    /// composite and present pending damage, then draw overlays.
    ///
    /// Returns the recomposited rect, if anything was pending.
    pub async fn tick(&mut self, timestamp_ms: f64) -> EngineResult<Option<DirtyRect>> {
        self.recover_if_lost().await?;
        self.flush_deferred();

        let frame = self.render_loop.begin_frame(timestamp_ms);
        self.render_loop.run_stage(FrameStage::Compute, &frame);
        let updated = self.composite_and_present();
        self.render_loop.run_stage(FrameStage::Presentation, &frame);
        self.render_loop.run_stage(FrameStage::Overlay, &frame);
        updated
    }

    fn composite_and_present(&mut self) -> EngineResult<Option<DirtyRect>> {
        let rect = if self.full_recomposite {
            None
        } else {
            match self.pending {
                Some(rect) => Some(rect),
                None => return Ok(None),
            }
        };

        let backend = self.coordinator.backend_mut()?;
        for layer in self.layers.layers_mut() {
            backend.adopt_layer(layer)?;
        }
        let updated = self.compositor.recomposite(
            backend,
            self.layers.layers_mut(),
            self.preview.as_ref(),
            rect,
        )?;
        self.pending = None;
        self.full_recomposite = false;

        if let (Some(_), Some(target)) = (updated, self.present_target.as_mut()) {
            backend.present(self.compositor.buffer(), target.as_mut())?;
        }
        Ok(updated)
    }

    /// Current composition as host pixels
    pub fn present(&self) -> PixelBuffer {
        self.compositor.buffer().pixels.clone()
    }
}
