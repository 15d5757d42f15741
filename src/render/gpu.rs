//! wgpu backend for the WebGPU and WebGL tiers
//!
//! Strokes render in two passes: the triangles go into a 4× MSAA coverage
//! target (resolved to a single-sample coverage texture), then a fullscreen
//! pass scissored to the stroke bounds combines coverage with the previous
//! layer pixels. Compositing ping-pongs between an accumulation texture and
//! a scratch texture, one pass per visible layer.
//!
//! Every device layer keeps a host shadow updated by region readback after
//! each write, so layer content survives a lost device.

use std::collections::HashMap;
use std::sync::mpsc;

use futures::future::{FutureExt, LocalBoxFuture};
use wgpu::util::DeviceExt;

use super::{
    BackendKind, Color, CompositionBuffer, DirtyRect, PixelBuffer, RenderBackend, StrokeStyle,
};
use crate::brush::{StrokeGeometry, StrokeMode};
use crate::core::errors::{EngineError, EngineResult};
use crate::engine::{BackendProvider, DeviceLossSignal};
use crate::layer::{Layer, LayerSurface, TextureId};

const LAYER_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const MSAA_SAMPLES: u32 = 4;

const COVERAGE_SHADER: &str = r#"
struct Params {
    color: vec4<f32>,
    misc: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: Params;

@vertex
fn vs_coverage(@location(0) position: vec2<f32>) -> @builtin(position) vec4<f32> {
    let ndc = vec2<f32>(
        position.x / params.misc.x * 2.0 - 1.0,
        1.0 - position.y / params.misc.y * 2.0,
    );
    return vec4<f32>(ndc, 0.0, 1.0);
}

@fragment
fn fs_coverage() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0);
}
"#;

const PASS_SHADER: &str = r#"
struct Params {
    color: vec4<f32>,
    misc: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var first_tex: texture_2d<f32>;
@group(0) @binding(2) var second_tex: texture_2d<f32>;

@vertex
fn vs_fullscreen(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32((index << 1u) & 2u);
    let y = f32(index & 2u);
    return vec4<f32>(x * 2.0 - 1.0, 1.0 - y * 2.0, 0.0, 1.0);
}

// first = coverage, second = previous layer pixels
// misc.z = opacity, misc.w = 0 draw / 1 erase
@fragment
fn fs_apply(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let p = vec2<i32>(pos.xy);
    let c = textureLoad(first_tex, p, 0).r;
    let dst = textureLoad(second_tex, p, 0);
    if (params.misc.w < 0.5) {
        let src = params.color * c;
        return src + dst * (1.0 - src.a);
    }
    let remove = round(c * params.misc.z * 255.0) / 255.0;
    let alpha = max(dst.a - remove, 0.0);
    if (alpha <= 0.0) {
        return vec4<f32>(0.0);
    }
    return vec4<f32>(dst.rgb * (alpha / dst.a), alpha);
}

fn hard_light(cb: f32, cs: f32) -> f32 {
    if (cs <= 0.5) {
        return cb * 2.0 * cs;
    }
    let s = 2.0 * cs - 1.0;
    return cb + s - cb * s;
}

fn soft_light(cb: f32, cs: f32) -> f32 {
    if (cs <= 0.5) {
        return cb - (1.0 - 2.0 * cs) * cb * (1.0 - cb);
    }
    let d = select(sqrt(cb), ((16.0 * cb - 12.0) * cb + 4.0) * cb, cb <= 0.25);
    return cb + (2.0 * cs - 1.0) * (d - cb);
}

fn blend_channel(mode: u32, cb: f32, cs: f32) -> f32 {
    switch mode {
        case 1u: { return cb * cs; }
        case 2u: { return cb + cs - cb * cs; }
        case 3u: { return hard_light(cs, cb); }
        case 4u: { return min(cb, cs); }
        case 5u: { return max(cb, cs); }
        case 6u: {
            if (cb <= 0.0) { return 0.0; }
            if (cs >= 1.0) { return 1.0; }
            return min(cb / (1.0 - cs), 1.0);
        }
        case 7u: {
            if (cb >= 1.0) { return 1.0; }
            if (cs <= 0.0) { return 0.0; }
            return 1.0 - min((1.0 - cb) / cs, 1.0);
        }
        case 8u: { return hard_light(cb, cs); }
        case 9u: { return soft_light(cb, cs); }
        case 10u: { return abs(cb - cs); }
        case 11u: { return cb + cs - 2.0 * cb * cs; }
        default: { return cs; }
    }
}

// first = backdrop (accumulated), second = layer
// misc.x = layer opacity, misc.y = blend mode index
@fragment
fn fs_composite(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let p = vec2<i32>(pos.xy);
    let b = textureLoad(first_tex, p, 0);
    let s = textureLoad(second_tex, p, 0) * params.misc.x;
    if (s.a <= 0.0) {
        return b;
    }
    let ao = s.a + b.a * (1.0 - s.a);
    let mode = u32(params.misc.y + 0.5);
    if (mode == 0u || b.a <= 0.0) {
        return vec4<f32>(s.rgb + b.rgb * (1.0 - s.a), ao);
    }
    let cb = b.rgb / b.a;
    let cs = s.rgb / s.a;
    let mixed = vec3<f32>(
        blend_channel(mode, cb.r, cs.r),
        blend_channel(mode, cb.g, cs.g),
        blend_channel(mode, cb.b, cs.b),
    );
    let rgb = s.rgb * (1.0 - b.a) + b.rgb * (1.0 - s.a) + s.a * b.a * mixed;
    return vec4<f32>(min(rgb, vec3<f32>(ao)), ao);
}
"#;

/// Uniform block shared by every pass
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    /// Premultiplied stroke color
    color: [f32; 4],
    /// Pass-specific scalars, see the shader
    misc: [f32; 4],
}

struct Pipelines {
    coverage_layout: wgpu::BindGroupLayout,
    pass_layout: wgpu::BindGroupLayout,
    coverage: wgpu::RenderPipeline,
    apply: wgpu::RenderPipeline,
    composite: wgpu::RenderPipeline,
}

/// Canvas-sized work textures
struct Targets {
    width: u32,
    height: u32,
    msaa_view: wgpu::TextureView,
    coverage_view: wgpu::TextureView,
    scratch: wgpu::Texture,
    scratch_view: wgpu::TextureView,
    accum: wgpu::Texture,
    accum_view: wgpu::TextureView,
}

struct LayerTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

pub struct GpuBackend {
    kind: BackendKind,
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Pipelines,
    targets: Option<Targets>,
    textures: HashMap<TextureId, LayerTexture>,
    shadows: HashMap<TextureId, PixelBuffer>,
    next_texture: u64,
    lost: DeviceLossSignal,
}

impl GpuBackend {
    /// Request an adapter and device for `kind`.
    ///
    /// WebGPU uses the primary native backends; WebGL is the GL backend
    /// limited to WebGL2 capabilities.
    pub async fn create(kind: BackendKind) -> EngineResult<Self> {
        let (backends, required_limits) = match kind {
            BackendKind::WebGpu => (wgpu::Backends::PRIMARY, wgpu::Limits::downlevel_defaults()),
            BackendKind::WebGl => (wgpu::Backends::GL, wgpu::Limits::downlevel_webgl2_defaults()),
            BackendKind::Canvas2d => {
                return Err(EngineError::BackendUnavailable {
                    kind,
                    reason: "canvas2d is not a wgpu tier".into(),
                })
            }
        };

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| EngineError::BackendUnavailable {
                kind,
                reason: format!("no adapter: {e}"),
            })?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("inkflow_device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                experimental_features: wgpu::ExperimentalFeatures::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| EngineError::BackendUnavailable {
                kind,
                reason: format!("request_device failed: {e}"),
            })?;

        let lost = DeviceLossSignal::new();
        let signal = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            tracing::error!("GPU device lost ({:?}): {}", reason, message);
            signal.raise();
        });

        let info = adapter.get_info();
        tracing::info!("GPU backend {} on {} ({:?})", kind, info.name, info.backend);

        let pipelines = create_pipelines(&device);
        Ok(Self {
            kind,
            device,
            queue,
            pipelines,
            targets: None,
            textures: HashMap::new(),
            shadows: HashMap::new(),
            next_texture: 1,
            lost,
        })
    }

    fn ensure_targets(&mut self, width: u32, height: u32) {
        if self
            .targets
            .as_ref()
            .is_some_and(|t| t.width == width && t.height == height)
        {
            return;
        }

        let size = extent(width, height);
        let msaa = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("inkflow_coverage_msaa"),
            size,
            mip_level_count: 1,
            sample_count: MSAA_SAMPLES,
            dimension: wgpu::TextureDimension::D2,
            format: LAYER_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let coverage = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("inkflow_coverage"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: LAYER_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let scratch = self.create_layer_texture("inkflow_scratch", width, height);
        let accum = self.create_layer_texture("inkflow_accum", width, height);

        self.targets = Some(Targets {
            width,
            height,
            msaa_view: msaa.create_view(&wgpu::TextureViewDescriptor::default()),
            coverage_view: coverage.create_view(&wgpu::TextureViewDescriptor::default()),
            scratch_view: scratch.create_view(&wgpu::TextureViewDescriptor::default()),
            scratch,
            accum_view: accum.create_view(&wgpu::TextureViewDescriptor::default()),
            accum,
        });
    }

    fn create_layer_texture(&self, label: &str, width: u32, height: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: LAYER_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn upload(&self, texture: &wgpu::Texture, pixels: &PixelBuffer, rect: DirtyRect) {
        if rect.is_empty() {
            return;
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: origin(rect),
                aspect: wgpu::TextureAspect::All,
            },
            &pixels.region_bytes(rect),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(rect.width * 4),
                rows_per_image: Some(rect.height),
            },
            extent(rect.width, rect.height),
        );
    }

    /// Copy `rect` of a texture back to the host, tightly packed
    fn read_region(&self, texture: &wgpu::Texture, rect: DirtyRect) -> EngineResult<Vec<u8>> {
        let row_bytes = rect.width * 4;
        let padded_row_bytes = align_to(row_bytes, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("inkflow_readback"),
            size: padded_row_bytes as u64 * rect.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("inkflow_readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: origin(rect),
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: Some(rect.height),
                },
            },
            extent(rect.width, rect.height),
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| EngineError::Gpu(format!("poll failed: {e:?}")))?;
        rx.recv()
            .map_err(|_| EngineError::Gpu("readback channel closed".into()))?
            .map_err(|e| EngineError::Gpu(format!("readback map failed: {e:?}")))?;

        let mapped = slice.get_mapped_range();
        let mut out = Vec::with_capacity((row_bytes * rect.height) as usize);
        for row in 0..rect.height as usize {
            let start = row * padded_row_bytes as usize;
            out.extend_from_slice(&mapped[start..start + row_bytes as usize]);
        }
        drop(mapped);
        readback.unmap();
        Ok(out)
    }

    /// Texture of a layer, adopting host layers on first use
    fn ensure_device_layer(&mut self, layer: &mut Layer) -> EngineResult<TextureId> {
        self.adopt_layer(layer)?;
        layer.texture().ok_or(EngineError::SurfaceMismatch {
            layer: layer.id,
            backend: self.kind,
        })
    }

    fn layer_texture(&self, layer: &Layer) -> EngineResult<&LayerTexture> {
        layer
            .texture()
            .and_then(|id| self.textures.get(&id))
            .ok_or(EngineError::SurfaceMismatch {
                layer: layer.id,
                backend: self.kind,
            })
    }

    fn params_buffer(&self, params: Params) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("inkflow_params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    fn pass_bind_group(
        &self,
        params: &wgpu::Buffer,
        first: &wgpu::TextureView,
        second: &wgpu::TextureView,
    ) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("inkflow_pass_bg"),
            layout: &self.pipelines.pass_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(first),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(second),
                },
            ],
        })
    }

    /// Replace the whole layer with its (already updated) shadow
    fn sync_from_shadow(&mut self, layer: &mut Layer) -> EngineResult<()> {
        let id = self.ensure_device_layer(layer)?;
        let (Some(texture), Some(shadow)) = (self.textures.get(&id), self.shadows.get(&id)) else {
            return Err(EngineError::SurfaceMismatch {
                layer: layer.id,
                backend: self.kind,
            });
        };
        self.upload(&texture.texture, shadow, shadow.bounds());
        layer.dirty = true;
        Ok(())
    }
}

impl RenderBackend for GpuBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn adopt_layer(&mut self, layer: &mut Layer) -> EngineResult<()> {
        match &mut layer.surface {
            LayerSurface::Device(id) if self.textures.contains_key(id) => Ok(()),
            LayerSurface::Device(_) => Err(EngineError::SurfaceMismatch {
                layer: layer.id,
                backend: self.kind,
            }),
            LayerSurface::Host(pixels) => {
                let max = self.device.limits().max_texture_dimension_2d;
                if pixels.width() > max || pixels.height() > max {
                    return Err(EngineError::Gpu(format!(
                        "layer {}x{} exceeds texture limit {}",
                        pixels.width(),
                        pixels.height(),
                        max
                    )));
                }
                let pixels = std::mem::replace(pixels, PixelBuffer::new(0, 0));
                let id = TextureId(self.next_texture);
                self.next_texture += 1;

                let texture =
                    self.create_layer_texture("inkflow_layer", pixels.width(), pixels.height());
                self.upload(&texture, &pixels, pixels.bounds());
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                self.textures.insert(id, LayerTexture { texture, view });
                self.shadows.insert(id, pixels);
                layer.surface = LayerSurface::Device(id);
                Ok(())
            }
        }
    }

    fn release_layer(&mut self, layer: &mut Layer) -> EngineResult<()> {
        let LayerSurface::Device(id) = layer.surface else {
            return Ok(());
        };
        self.textures.remove(&id);
        let pixels = match self.shadows.remove(&id) {
            Some(pixels) => pixels,
            None => {
                tracing::warn!("Layer {} had no host shadow; released empty", layer.id);
                PixelBuffer::new(layer.width, layer.height)
            }
        };
        layer.surface = LayerSurface::Host(pixels);
        Ok(())
    }

    fn draw_stroke(
        &mut self,
        layer: &mut Layer,
        geometry: &StrokeGeometry,
        style: &StrokeStyle,
    ) -> EngineResult<Option<DirtyRect>> {
        let id = self.ensure_device_layer(layer)?;
        let (width, height) = (layer.width, layer.height);
        let Some(region) = DirtyRect::from_bounds(geometry.bounds, width, height) else {
            return Ok(None);
        };
        let (vertices, indices) = flatten(geometry);
        if indices.is_empty() {
            return Ok(None);
        }
        self.ensure_targets(width, height);

        let mode = match style.mode {
            StrokeMode::Draw => 0.0,
            StrokeMode::Erase => 1.0,
        };
        let params = self.params_buffer(Params {
            color: style.premultiplied(),
            misc: [width as f32, height as f32, style.opacity, mode],
        });
        let vertex_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("inkflow_stroke_vertices"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("inkflow_stroke_indices"),
                contents: bytemuck::cast_slice(&indices),
                usage: wgpu::BufferUsages::INDEX,
            });

        let (Some(targets), Some(layer_texture)) = (self.targets.as_ref(), self.textures.get(&id))
        else {
            return Err(EngineError::BackendNotReady);
        };
        let coverage_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("inkflow_coverage_bg"),
            layout: &self.pipelines.coverage_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: params.as_entire_binding(),
            }],
        });
        let apply_group =
            self.pass_bind_group(&params, &targets.coverage_view, &targets.scratch_view);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("inkflow_stroke_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("inkflow_coverage_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &targets.msaa_view,
                    resolve_target: Some(&targets.coverage_view),
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Discard,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_scissor_rect(region.x, region.y, region.width, region.height);
            pass.set_pipeline(&self.pipelines.coverage);
            pass.set_bind_group(0, &coverage_group, &[]);
            pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            pass.set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..indices.len() as u32, 0, 0..1);
        }

        // The apply pass reads the previous pixels from scratch
        encoder.copy_texture_to_texture(
            copy_info(&layer_texture.texture, region),
            copy_info(&targets.scratch, region),
            extent(region.width, region.height),
        );
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("inkflow_apply_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &layer_texture.view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_scissor_rect(region.x, region.y, region.width, region.height);
            pass.set_pipeline(&self.pipelines.apply);
            pass.set_bind_group(0, &apply_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));

        let bytes = self.read_region(&layer_texture.texture, region)?;
        if let Some(shadow) = self.shadows.get_mut(&id) {
            shadow.write_region(region, &bytes);
        }
        layer.dirty = true;
        tracing::debug!("GPU stroke ({:?}) region {:?}", style.mode, region);
        Ok(Some(region))
    }

    fn fill(&mut self, layer: &mut Layer, color: Color) -> EngineResult<()> {
        let id = self.ensure_device_layer(layer)?;
        if let Some(shadow) = self.shadows.get_mut(&id) {
            shadow.fill(color);
        }
        self.sync_from_shadow(layer)
    }

    fn clear(&mut self, layer: &mut Layer) -> EngineResult<()> {
        let id = self.ensure_device_layer(layer)?;
        if let Some(shadow) = self.shadows.get_mut(&id) {
            shadow.clear();
        }
        self.sync_from_shadow(layer)
    }

    fn composite_layers(
        &mut self,
        layers: &[&Layer],
        target: &mut CompositionBuffer,
        rect: Option<DirtyRect>,
    ) -> EngineResult<()> {
        let (width, height) = (target.width(), target.height());
        let Some(rect) = rect.unwrap_or(DirtyRect::full(width, height)).clamp_to(width, height)
        else {
            return Ok(());
        };
        self.ensure_targets(width, height);

        let mut steps = Vec::new();
        for layer in layers.iter().filter(|l| l.visible && l.opacity > 0.0) {
            let params = self.params_buffer(Params {
                color: [0.0; 4],
                misc: [layer.opacity, layer.blend_mode.shader_index() as f32, 0.0, 0.0],
            });
            steps.push((params, self.layer_texture(layer)?));
        }
        let Some(targets) = self.targets.as_ref() else {
            return Err(EngineError::BackendNotReady);
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("inkflow_composite_encoder"),
            });
        {
            let _clear = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("inkflow_composite_clear"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &targets.accum_view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }

        for (params, layer_texture) in &steps {
            let group = self.pass_bind_group(params, &targets.accum_view, &layer_texture.view);
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("inkflow_composite_pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &targets.scratch_view,
                        resolve_target: None,
                        depth_slice: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_scissor_rect(rect.x, rect.y, rect.width, rect.height);
                pass.set_pipeline(&self.pipelines.composite);
                pass.set_bind_group(0, &group, &[]);
                pass.draw(0..3, 0..1);
            }
            encoder.copy_texture_to_texture(
                copy_info(&targets.scratch, rect),
                copy_info(&targets.accum, rect),
                extent(rect.width, rect.height),
            );
        }
        self.queue.submit(Some(encoder.finish()));

        let bytes = self.read_region(&targets.accum, rect)?;
        target.pixels.write_region(rect, &bytes);
        target.dirty_rect = Some(rect);
        Ok(())
    }

    fn snapshot_layer(&mut self, layer: &Layer) -> EngineResult<PixelBuffer> {
        match &layer.surface {
            LayerSurface::Host(pixels) => Ok(pixels.clone()),
            LayerSurface::Device(id) => {
                self.shadows
                    .get(id)
                    .cloned()
                    .ok_or(EngineError::SurfaceMismatch {
                        layer: layer.id,
                        backend: self.kind,
                    })
            }
        }
    }

    fn is_device_lost(&self) -> bool {
        self.lost.is_raised()
    }
}

/// Provider for one wgpu tier
#[derive(Debug, Clone, Copy)]
pub struct GpuProvider {
    kind: BackendKind,
}

impl GpuProvider {
    pub fn webgpu() -> Self {
        Self {
            kind: BackendKind::WebGpu,
        }
    }

    pub fn webgl() -> Self {
        Self {
            kind: BackendKind::WebGl,
        }
    }
}

impl BackendProvider for GpuProvider {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn initialize(&self) -> LocalBoxFuture<'static, EngineResult<Box<dyn RenderBackend>>> {
        let kind = self.kind;
        async move {
            let backend = GpuBackend::create(kind).await?;
            Ok(Box::new(backend) as Box<dyn RenderBackend>)
        }
        .boxed_local()
    }
}

fn create_pipelines(device: &wgpu::Device) -> Pipelines {
    let uniform_entry = |visibility| wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    };

    let coverage_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("inkflow_coverage_bgl"),
        entries: &[uniform_entry(wgpu::ShaderStages::VERTEX)],
    });
    let pass_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("inkflow_pass_bgl"),
        entries: &[
            uniform_entry(wgpu::ShaderStages::FRAGMENT),
            texture_entry(1),
            texture_entry(2),
        ],
    });

    let coverage_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("inkflow_coverage_shader"),
        source: wgpu::ShaderSource::Wgsl(COVERAGE_SHADER.into()),
    });
    let pass_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("inkflow_pass_shader"),
        source: wgpu::ShaderSource::Wgsl(PASS_SHADER.into()),
    });

    let coverage_pl = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("inkflow_coverage_pl"),
        bind_group_layouts: &[&coverage_layout],
        push_constant_ranges: &[],
    });
    let pass_pl = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("inkflow_pass_pl"),
        bind_group_layouts: &[&pass_layout],
        push_constant_ranges: &[],
    });

    let target = [Some(wgpu::ColorTargetState {
        format: LAYER_FORMAT,
        blend: None,
        write_mask: wgpu::ColorWrites::ALL,
    })];

    let coverage = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("inkflow_coverage_pipeline"),
        layout: Some(&coverage_pl),
        vertex: wgpu::VertexState {
            module: &coverage_shader,
            entry_point: Some("vs_coverage"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &wgpu::vertex_attr_array![0 => Float32x2],
            }],
        },
        fragment: Some(wgpu::FragmentState {
            module: &coverage_shader,
            entry_point: Some("fs_coverage"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &target,
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState {
            count: MSAA_SAMPLES,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
        cache: None,
    });

    let fullscreen = |label: &'static str, entry: &'static str| {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(&pass_pl),
            vertex: wgpu::VertexState {
                module: &pass_shader,
                entry_point: Some("vs_fullscreen"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &pass_shader,
                entry_point: Some(entry),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &target,
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    };
    let apply = fullscreen("inkflow_apply_pipeline", "fs_apply");
    let composite = fullscreen("inkflow_composite_pipeline", "fs_composite");

    Pipelines {
        coverage_layout,
        pass_layout,
        coverage,
        apply,
        composite,
    }
}

/// Concatenate every part into one indexed mesh
fn flatten(geometry: &StrokeGeometry) -> (Vec<[f32; 2]>, Vec<u32>) {
    let mut vertices = Vec::with_capacity(geometry.vertex_count());
    let mut indices = Vec::with_capacity(geometry.triangle_count() * 3);
    for part in &geometry.parts {
        let base = vertices.len() as u32;
        vertices.extend_from_slice(&part.vertices);
        indices.extend(part.indices.iter().map(|i| base + i));
    }
    (vertices, indices)
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

fn origin(rect: DirtyRect) -> wgpu::Origin3d {
    wgpu::Origin3d {
        x: rect.x,
        y: rect.y,
        z: 0,
    }
}

fn copy_info(texture: &wgpu::Texture, rect: DirtyRect) -> wgpu::TexelCopyTextureInfo<'_> {
    wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: 0,
        origin: origin(rect),
        aspect: wgpu::TextureAspect::All,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::Geometry;
    use crate::layer::LayerId;

    #[test]
    fn test_align_to_row_alignment() {
        assert_eq!(align_to(4, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(1028, 256), 1280);
    }

    #[test]
    fn test_params_match_wgsl_layout() {
        assert_eq!(std::mem::size_of::<Params>(), 32);
    }

    #[test]
    fn test_flatten_offsets_indices() {
        let tri = |x: f32| Geometry {
            vertices: vec![[x, 0.0], [x + 1.0, 0.0], [x, 1.0]],
            indices: vec![0, 1, 2],
        };
        let geometry = StrokeGeometry::from_parts(vec![tri(0.0), tri(5.0)], false);
        let (vertices, indices) = flatten(&geometry);
        assert_eq!(vertices.len(), 6);
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    // Runs only where an adapter exists; headless CI without a GPU skips it
    #[tokio::test]
    async fn test_gpu_draw_and_erase_when_available() {
        let Ok(mut backend) = GpuBackend::create(BackendKind::WebGpu).await else {
            return;
        };
        let mut layer = Layer::new(LayerId(1), 32, 32);
        let square = StrokeGeometry::from_parts(
            vec![Geometry {
                vertices: vec![[4.0, 4.0], [12.0, 4.0], [12.0, 12.0], [4.0, 12.0]],
                indices: vec![0, 1, 2, 0, 2, 3],
            }],
            false,
        );
        let draw = StrokeStyle {
            color: Color::rgb(0.0, 0.0, 1.0),
            opacity: 1.0,
            mode: StrokeMode::Draw,
        };
        let Ok(Some(_)) = backend.draw_stroke(&mut layer, &square, &draw) else {
            panic!("stroke should draw");
        };
        let Ok(snapshot) = backend.snapshot_layer(&layer) else {
            panic!("snapshot should succeed");
        };
        assert_eq!(snapshot.pixel(8, 8), Some([0, 0, 255, 255]));

        let erase = StrokeStyle {
            mode: StrokeMode::Erase,
            ..draw
        };
        let Ok(Some(_)) = backend.draw_stroke(&mut layer, &square, &erase) else {
            panic!("erase should draw");
        };
        let Ok(()) = backend.release_layer(&mut layer) else {
            panic!("release should succeed");
        };
        let Some(pixels) = layer.host_pixels() else {
            panic!("released layer is on the host");
        };
        assert!(pixels.as_raw().chunks(4).all(|px| px[3] == 0));
    }
}
