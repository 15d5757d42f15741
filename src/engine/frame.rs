//! Single frame loop
//!
//! Once the engine owns the tick, every competing tick source is suspended
//! and all surfaces draw from the one loop in a fixed order: compute
//! surfaces, then the engine's composite/present, then overlays. Within a
//! stage surfaces draw in registration order.

use crate::core::errors::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrameStage {
    /// GPU/compute work that feeds the composite
    Compute,
    /// Drawn right after the engine presents
    Presentation,
    /// UI drawn on top of everything else
    Overlay,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub frame: u64,
    pub timestamp_ms: f64,
}

/// Something that draws once per frame
pub trait FrameSurface {
    fn stage(&self) -> FrameStage;

    fn label(&self) -> &str {
        "surface"
    }

    fn draw(&mut self, frame: &FrameInfo) -> EngineResult<()>;
}

/// An independent animation loop that can be paused
pub trait TickSource {
    fn label(&self) -> &str;
    fn is_running(&self) -> bool;
    fn suspend(&mut self);
    fn resume(&mut self);
}

/// Tick source driven by the caller (headless hosts, tests)
#[derive(Debug, Clone)]
pub struct ManualTickSource {
    label: String,
    running: bool,
}

impl ManualTickSource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            running: true,
        }
    }
}

impl TickSource for ManualTickSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn suspend(&mut self) {
        self.running = false;
    }

    fn resume(&mut self) {
        self.running = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(u64);

#[derive(Default)]
pub struct RenderLoop {
    surfaces: Vec<(SurfaceId, Box<dyn FrameSurface>)>,
    next_id: u64,
    frame: u64,
    suspended: Vec<String>,
}

impl RenderLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, surface: Box<dyn FrameSurface>) -> SurfaceId {
        let id = SurfaceId(self.next_id);
        self.next_id += 1;
        tracing::debug!("Registered {} surface {:?}", surface.label(), surface.stage());
        self.surfaces.push((id, surface));
        id
    }

    pub fn unregister(&mut self, id: SurfaceId) -> Option<Box<dyn FrameSurface>> {
        let index = self.surfaces.iter().position(|(sid, _)| *sid == id)?;
        Some(self.surfaces.remove(index).1)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// Stop a competing loop; from here on this loop drives every draw
    pub fn take_ownership(&mut self, competitor: &mut dyn TickSource) {
        if competitor.is_running() {
            competitor.suspend();
            tracing::info!("Suspended tick source '{}'", competitor.label());
        }
        let label = competitor.label().to_string();
        if !self.suspended.contains(&label) {
            self.suspended.push(label);
        }
    }

    /// Labels of tick sources this loop has taken over
    pub fn suspended_sources(&self) -> &[String] {
        &self.suspended
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn begin_frame(&mut self, timestamp_ms: f64) -> FrameInfo {
        self.frame += 1;
        FrameInfo {
            frame: self.frame,
            timestamp_ms,
        }
    }

    /// Draw every surface of `stage`. A failing surface is logged and
    /// skipped so the rest of the frame still lands.
    pub fn run_stage(&mut self, stage: FrameStage, frame: &FrameInfo) -> usize {
        let mut drawn = 0;
        for (_, surface) in self.surfaces.iter_mut() {
            if surface.stage() != stage {
                continue;
            }
            match surface.draw(frame) {
                Ok(()) => drawn += 1,
                Err(e) => tracing::error!(
                    "Surface '{}' failed in frame {}: {}",
                    surface.label(),
                    frame.frame,
                    e
                ),
            }
        }
        drawn
    }
}
