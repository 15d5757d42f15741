//! Layers, the layer stack and the compositor
//!
//! A layer's pixels live either on the host (`PixelBuffer`) or in a backend
//! texture, never both. Backends move content between the two with
//! `adopt_layer` / `release_layer`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::brush::BlendMode;
use crate::core::errors::{EngineError, EngineResult};
use crate::render::{CompositionBuffer, DirtyRect, PixelBuffer, RenderBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u32);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a texture owned by a GPU backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

#[derive(Debug, Clone)]
pub enum LayerSurface {
    Host(PixelBuffer),
    Device(TextureId),
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub id: LayerId,
    pub surface: LayerSurface,
    pub width: u32,
    pub height: u32,
    /// 0.0 - 1.0
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub visible: bool,
    pub locked: bool,
    /// Changed since the last composite
    pub dirty: bool,
}

impl Layer {
    /// Transparent host layer
    pub fn new(id: LayerId, width: u32, height: u32) -> Self {
        Self::with_pixels(id, PixelBuffer::new(width, height))
    }

    pub fn with_pixels(id: LayerId, pixels: PixelBuffer) -> Self {
        Self {
            id,
            width: pixels.width(),
            height: pixels.height(),
            surface: LayerSurface::Host(pixels),
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            visible: true,
            locked: false,
            dirty: true,
        }
    }

    pub fn host_pixels(&self) -> Option<&PixelBuffer> {
        match &self.surface {
            LayerSurface::Host(pixels) => Some(pixels),
            LayerSurface::Device(_) => None,
        }
    }

    pub fn host_pixels_mut(&mut self) -> Option<&mut PixelBuffer> {
        match &mut self.surface {
            LayerSurface::Host(pixels) => Some(pixels),
            LayerSurface::Device(_) => None,
        }
    }

    pub fn texture(&self) -> Option<TextureId> {
        match self.surface {
            LayerSurface::Device(id) => Some(id),
            LayerSurface::Host(_) => None,
        }
    }

    pub fn bounds(&self) -> DirtyRect {
        DirtyRect::full(self.width, self.height)
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = if opacity.is_nan() { 1.0 } else { opacity.clamp(0.0, 1.0) };
        self.dirty = true;
    }

    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        self.blend_mode = mode;
        self.dirty = true;
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        self.dirty = true;
    }

    /// Composite opacity; zero when hidden
    pub fn effective_opacity(&self) -> f32 {
        if self.visible {
            self.opacity
        } else {
            0.0
        }
    }
}

/// Ordered layers (index 0 is the bottom) plus the active selection
#[derive(Debug, Clone)]
pub struct LayerStack {
    width: u32,
    height: u32,
    layers: Vec<Layer>,
    active: Option<LayerId>,
    next_id: u32,
}

impl LayerStack {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            layers: Vec::new(),
            active: None,
            next_id: 1,
        }
    }

    /// Stack with one transparent layer, already active
    pub fn with_layer(width: u32, height: u32) -> Self {
        let mut stack = Self::new(width, height);
        let id = stack.add_layer();
        stack.active = Some(id);
        stack
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Push a transparent host layer on top
    pub fn add_layer(&mut self) -> LayerId {
        let id = LayerId(self.next_id);
        self.next_id += 1;
        self.layers.push(Layer::new(id, self.width, self.height));
        if self.active.is_none() {
            self.active = Some(id);
        }
        id
    }

    /// Push an existing layer on top; its size must match the canvas
    pub fn push_layer(&mut self, mut layer: Layer) -> EngineResult<LayerId> {
        if layer.width != self.width || layer.height != self.height {
            return Err(EngineError::InvalidConfig(format!(
                "layer {} is {}x{}, canvas is {}x{}",
                layer.id, layer.width, layer.height, self.width, self.height
            )));
        }
        if self.index_of(layer.id).is_some() {
            layer.id = LayerId(self.next_id);
        }
        self.next_id = self.next_id.max(layer.id.0 + 1);
        let id = layer.id;
        layer.dirty = true;
        self.layers.push(layer);
        if self.active.is_none() {
            self.active = Some(id);
        }
        Ok(id)
    }

    pub fn remove_layer(&mut self, id: LayerId) -> EngineResult<Layer> {
        let index = self.index_of(id).ok_or(EngineError::LayerNotFound(id))?;
        let layer = self.layers.remove(index);
        if self.active == Some(id) {
            self.active = self.layers.last().map(|l| l.id);
        }
        Ok(layer)
    }

    /// Reorder; `index` is clamped to the stack
    pub fn move_layer(&mut self, id: LayerId, index: usize) -> EngineResult<()> {
        let from = self.index_of(id).ok_or(EngineError::LayerNotFound(id))?;
        let layer = self.layers.remove(from);
        let to = index.min(self.layers.len());
        self.layers.insert(to, layer);
        for layer in &mut self.layers {
            layer.dirty = true;
        }
        Ok(())
    }

    pub fn index_of(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|layer| layer.id == id)
    }

    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|layer| layer.id == id)
    }

    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|layer| layer.id == id)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn active_id(&self) -> Option<LayerId> {
        self.active
    }

    pub fn set_active(&mut self, id: LayerId) -> EngineResult<()> {
        if self.index_of(id).is_none() {
            return Err(EngineError::LayerNotFound(id));
        }
        self.active = Some(id);
        Ok(())
    }

    pub fn active_layer(&self) -> Option<&Layer> {
        self.active.and_then(|id| self.get(id))
    }

    pub fn active_layer_mut(&mut self) -> Option<&mut Layer> {
        let id = self.active?;
        self.get_mut(id)
    }

    /// Resize host layers, keeping their top-left content.
    ///
    /// Device layers must be released to the host first.
    pub fn resize(&mut self, width: u32, height: u32) -> EngineResult<()> {
        if let Some(layer) = self.layers.iter().find(|l| l.host_pixels().is_none()) {
            return Err(EngineError::HostPixelsRequired(layer.id));
        }
        for layer in &mut self.layers {
            if let LayerSurface::Host(pixels) = &mut layer.surface {
                *pixels = pixels.resized(width, height);
            }
            layer.width = width;
            layer.height = height;
            layer.dirty = true;
        }
        self.width = width;
        self.height = height;
        Ok(())
    }
}

/// Owns the composition buffer and drives backend compositing
#[derive(Debug, Clone)]
pub struct LayerCompositor {
    buffer: CompositionBuffer,
}

impl LayerCompositor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            buffer: CompositionBuffer::new(width, height),
        }
    }

    pub fn buffer(&self) -> &CompositionBuffer {
        &self.buffer
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    /// Reallocate at the new canvas size; the next composite must be full
    pub fn resize(&mut self, width: u32, height: u32) {
        self.buffer.resize(width, height);
    }

    /// Recomposite `dirty` (or the whole canvas) from the given layers.
    ///
    /// `overlay` is drawn above the stack without being part of it (live
    /// stroke preview). Returns the rect that was updated, or `None` when
    /// the clamped rect is empty and nothing happened.
    pub fn recomposite(
        &mut self,
        backend: &mut dyn RenderBackend,
        layers: &mut [Layer],
        overlay: Option<&Layer>,
        dirty: Option<DirtyRect>,
    ) -> EngineResult<Option<DirtyRect>> {
        let (width, height) = (self.buffer.width(), self.buffer.height());
        let rect = dirty
            .unwrap_or(DirtyRect::full(width, height))
            .clamp_to(width, height);
        let Some(rect) = rect else {
            return Ok(None);
        };

        let sources: Vec<&Layer> = layers.iter().chain(overlay).collect();
        backend.composite_layers(&sources, &mut self.buffer, Some(rect))?;
        self.buffer.dirty_rect = Some(rect);
        // A partial rect may leave damage elsewhere on the layer
        if rect == DirtyRect::full(width, height) {
            for layer in layers.iter_mut().filter(|layer| layer.visible) {
                layer.dirty = false;
            }
        }

        tracing::debug!(
            "Recomposited {}x{} at ({}, {}) on {}",
            rect.width,
            rect.height,
            rect.x,
            rect.y,
            backend.kind()
        );
        Ok(Some(rect))
    }
}
