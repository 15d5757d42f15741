//! Pixel storage shared by every backend
//!
//! Layer and composite pixels are premultiplied RGBA8. Conversion to the
//! straight-alpha form used by image encoders happens only at the export
//! boundary.

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

/// Straight-alpha color with channels in 0.0 - 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0, 1.0);
    pub const TRANSPARENT: Color = Color::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self::new(r, g, b, 1.0)
    }

    pub fn from_rgba8(rgba: [u8; 4]) -> Self {
        Self::new(
            rgba[0] as f32 / 255.0,
            rgba[1] as f32 / 255.0,
            rgba[2] as f32 / 255.0,
            rgba[3] as f32 / 255.0,
        )
    }

    pub fn with_alpha(self, a: f32) -> Self {
        Self { a, ..self }
    }

    /// Channels clamped to 0.0 - 1.0; NaN becomes 0.0
    pub fn clamped(self) -> Self {
        let c = |v: f32| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        Self::new(c(self.r), c(self.g), c(self.b), c(self.a))
    }

    /// Premultiplied float channels
    pub fn to_premultiplied(self) -> [f32; 4] {
        let c = self.clamped();
        [c.r * c.a, c.g * c.a, c.b * c.a, c.a]
    }

    pub fn to_premultiplied_rgba8(self) -> [u8; 4] {
        let p = self.to_premultiplied();
        [unit_to_u8(p[0]), unit_to_u8(p[1]), unit_to_u8(p[2]), unit_to_u8(p[3])]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

pub(crate) fn unit_to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DirtyRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole canvas
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Smallest rect containing both; empty rects are ignored
    pub fn union(&self, other: &DirtyRect) -> DirtyRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        DirtyRect::new(
            x,
            y,
            self.right().max(other.right()) - x,
            self.bottom().max(other.bottom()) - y,
        )
    }

    pub fn intersect(&self, other: &DirtyRect) -> Option<DirtyRect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (right > x && bottom > y).then(|| DirtyRect::new(x, y, right - x, bottom - y))
    }

    /// Clip to a `width` x `height` canvas; `None` when nothing is left
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<DirtyRect> {
        self.intersect(&DirtyRect::full(width, height))
    }

    /// Pixel rect covering a layer-space rectangle, clipped to the canvas.
    ///
    /// Grown by one pixel on each side so anti-aliased edges are included.
    pub fn from_bounds(bounds: kurbo::Rect, width: u32, height: u32) -> Option<DirtyRect> {
        let bounds = bounds.abs();
        if !(bounds.x0.is_finite() && bounds.y0.is_finite())
            || !(bounds.x1.is_finite() && bounds.y1.is_finite())
        {
            return None;
        }
        let x0 = (bounds.x0.floor() - 1.0).max(0.0);
        let y0 = (bounds.y0.floor() - 1.0).max(0.0);
        let x1 = (bounds.x1.ceil() + 1.0).min(width as f64);
        let y1 = (bounds.y1.ceil() + 1.0).min(height as f64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(DirtyRect::new(
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        ))
    }
}

/// Premultiplied RGBA8 pixels
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    image: RgbaImage,
}

impl PixelBuffer {
    /// Fully transparent buffer
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    pub fn filled(width: u32, height: u32, color: Color) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, Rgba(color.to_premultiplied_rgba8())),
        }
    }

    /// Wrap bytes that are already premultiplied
    pub fn from_premultiplied(width: u32, height: u32, bytes: Vec<u8>) -> Option<Self> {
        RgbaImage::from_raw(width, height, bytes).map(|image| Self { image })
    }

    /// Import a straight-alpha image
    pub fn from_straight(image: &RgbaImage) -> Self {
        let mut image = image.clone();
        for pixel in image.pixels_mut() {
            let a = pixel[3] as u32;
            for c in 0..3 {
                pixel[c] = ((pixel[c] as u32 * a + 127) / 255) as u8;
            }
        }
        Self { image }
    }

    /// Export as straight alpha for encoders
    pub fn to_straight(&self) -> RgbaImage {
        let mut image = self.image.clone();
        for pixel in image.pixels_mut() {
            let a = pixel[3] as u32;
            if a == 0 {
                *pixel = Rgba([0, 0, 0, 0]);
                continue;
            }
            for c in 0..3 {
                pixel[c] = ((pixel[c] as u32 * 255 + a / 2) / a).min(255) as u8;
            }
        }
        image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn bounds(&self) -> DirtyRect {
        DirtyRect::full(self.width(), self.height())
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        (x < self.width() && y < self.height()).then(|| self.image.get_pixel(x, y).0)
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x < self.width() && y < self.height() {
            self.image.put_pixel(x, y, Rgba(rgba));
        }
    }

    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn as_raw_mut(&mut self) -> &mut [u8] {
        &mut *self.image
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.width() as usize * 4
    }

    pub fn fill(&mut self, color: Color) {
        let rgba = Rgba(color.to_premultiplied_rgba8());
        for pixel in self.image.pixels_mut() {
            *pixel = rgba;
        }
    }

    pub fn clear(&mut self) {
        self.as_raw_mut().fill(0);
    }

    /// Zero a rectangle
    pub fn clear_rect(&mut self, rect: DirtyRect) {
        let Some(rect) = rect.clamp_to(self.width(), self.height()) else {
            return;
        };
        let stride = self.stride();
        let raw = self.as_raw_mut();
        for y in rect.y..rect.bottom() {
            let start = y as usize * stride + rect.x as usize * 4;
            raw[start..start + rect.width as usize * 4].fill(0);
        }
    }

    /// Copy `rect` from `source` at the same position
    pub fn copy_rect_from(&mut self, source: &PixelBuffer, rect: DirtyRect) {
        let Some(rect) = rect
            .clamp_to(self.width(), self.height())
            .and_then(|r| r.clamp_to(source.width(), source.height()))
        else {
            return;
        };
        let dst_stride = self.stride();
        let src_stride = source.stride();
        let row_bytes = rect.width as usize * 4;
        let src = source.as_raw();
        let dst = self.as_raw_mut();
        for y in rect.y as usize..rect.bottom() as usize {
            let s = y * src_stride + rect.x as usize * 4;
            let d = y * dst_stride + rect.x as usize * 4;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
    }

    /// Tightly packed copy of a sub-rectangle
    pub fn region_bytes(&self, rect: DirtyRect) -> Vec<u8> {
        let Some(rect) = rect.clamp_to(self.width(), self.height()) else {
            return Vec::new();
        };
        let stride = self.stride();
        let row_bytes = rect.width as usize * 4;
        let raw = self.as_raw();
        let mut out = Vec::with_capacity(row_bytes * rect.height as usize);
        for y in rect.y as usize..rect.bottom() as usize {
            let start = y * stride + rect.x as usize * 4;
            out.extend_from_slice(&raw[start..start + row_bytes]);
        }
        out
    }

    /// Write tightly packed rows into `rect`
    pub fn write_region(&mut self, rect: DirtyRect, bytes: &[u8]) {
        let row_bytes = rect.width as usize * 4;
        if rect.right() > self.width() || rect.bottom() > self.height() {
            tracing::warn!("write_region {:?} outside {}x{}", rect, self.width(), self.height());
            return;
        }
        if bytes.len() < row_bytes * rect.height as usize {
            tracing::warn!("write_region got {} bytes for {:?}", bytes.len(), rect);
            return;
        }
        let stride = self.stride();
        let raw = self.as_raw_mut();
        for (row, chunk) in bytes.chunks_exact(row_bytes).take(rect.height as usize).enumerate() {
            let start = (rect.y as usize + row) * stride + rect.x as usize * 4;
            raw[start..start + row_bytes].copy_from_slice(chunk);
        }
    }

    /// New buffer of the given size holding this buffer's top-left content
    pub fn resized(&self, width: u32, height: u32) -> PixelBuffer {
        let mut out = PixelBuffer::new(width, height);
        let overlap = DirtyRect::full(self.width().min(width), self.height().min(height));
        out.copy_rect_from(self, overlap);
        out
    }
}

/// Composited canvas image plus the region updated by the last composite
#[derive(Debug, Clone)]
pub struct CompositionBuffer {
    pub pixels: PixelBuffer,
    pub dirty_rect: Option<DirtyRect>,
}

impl CompositionBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            pixels: PixelBuffer::new(width, height),
            dirty_rect: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.pixels = PixelBuffer::new(width, height);
        self.dirty_rect = None;
    }
}
