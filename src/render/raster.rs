//! Anti-aliased coverage rasterizer
//!
//! Signed-area accumulation in the style of font-rs: every edge deposits its
//! exact area contribution into the cells it crosses, and a running sum along
//! each row turns those into coverage. Shared interior edges of adjacent
//! triangles cancel out, so a tessellated polygon renders without seams and
//! every part of a stroke lands in one coverage union.

use super::pixels::DirtyRect;
use crate::brush::StrokeGeometry;

/// Coverage below this is rounding noise (under half an 8-bit step)
const COVERAGE_EPSILON: f32 = 1.0 / 512.0;

/// Coverage accumulator for one rectangular region of a layer
#[derive(Debug, Clone)]
pub struct Rasterizer {
    region: DirtyRect,
    stride: usize,
    cells: Vec<f32>,
}

impl Rasterizer {
    pub fn new(region: DirtyRect) -> Self {
        // One spare column catches contributions on the right edge
        let stride = region.width as usize + 1;
        Self {
            region,
            stride,
            cells: vec![0.0; stride * region.height as usize + 1],
        }
    }

    pub fn region(&self) -> DirtyRect {
        self.region
    }

    /// Accumulate every triangle of a stroke
    pub fn fill_geometry(&mut self, geometry: &StrokeGeometry) {
        for [a, b, c] in geometry.triangles() {
            self.fill_triangle(a, b, c);
        }
    }

    /// Accumulate one triangle given in layer coordinates
    pub fn fill_triangle(&mut self, a: [f32; 2], b: [f32; 2], c: [f32; 2]) {
        let ox = self.region.x as f32;
        let oy = self.region.y as f32;
        let local = |p: [f32; 2]| [p[0] - ox, p[1] - oy];
        let (a, b, c) = (local(a), local(b), local(c));
        self.draw_edge(a, b);
        self.draw_edge(b, c);
        self.draw_edge(c, a);
    }

    /// Clip an edge against the left and right region borders.
    ///
    /// Pieces outside are projected onto the border as vertical edges, which
    /// keeps their winding contribution for every cell inside.
    fn draw_edge(&mut self, from: [f32; 2], to: [f32; 2]) {
        if !from.iter().chain(&to).all(|v| v.is_finite()) {
            return;
        }
        let right = self.region.width as f32;
        let mut splits = [0.0f32, 1.0, 1.0, 1.0];
        let mut count = 1;
        let dx = to[0] - from[0];
        for border in [0.0, right] {
            if (from[0] - border) * (to[0] - border) < 0.0 {
                splits[count] = (border - from[0]) / dx;
                count += 1;
            }
        }
        splits[count] = 1.0;
        splits[..=count].sort_by(f32::total_cmp);

        for window in splits[..=count].windows(2) {
            let at = |t: f32| {
                [
                    (from[0] + dx * t).clamp(0.0, right),
                    from[1] + (to[1] - from[1]) * t,
                ]
            };
            self.draw_line(at(window[0]), at(window[1]));
        }
    }

    /// Deposit the signed area of a line with x inside `[0, width]`.
    fn draw_line(&mut self, p0: [f32; 2], p1: [f32; 2]) {
        if (p0[1] - p1[1]).abs() <= f32::EPSILON {
            return;
        }
        let (direction, p0, p1) = if p0[1] < p1[1] {
            (1.0, p0, p1)
        } else {
            (-1.0, p1, p0)
        };
        let height = self.region.height as usize;
        let right = self.region.width as f32;
        let slope = (p1[0] - p0[0]) / (p1[1] - p0[1]);

        let mut x = p0[0];
        if p0[1] < 0.0 {
            x -= p0[1] * slope;
        }
        x = x.clamp(0.0, right);
        let y_start = p0[1].max(0.0) as usize;
        let y_end = height.min(p1[1].ceil().max(0.0) as usize);

        for y in y_start..y_end {
            let row = y * self.stride;
            let dy = ((y + 1) as f32).min(p1[1]) - (y as f32).max(p0[1]);
            let x_next = (x + slope * dy).clamp(0.0, right);
            let d = dy * direction;

            let (x0, x1) = if x < x_next { (x, x_next) } else { (x_next, x) };
            let x0_floor = x0.floor();
            let x0i = x0_floor as usize;
            let x1_ceil = x1.ceil();
            let x1i = x1_ceil as usize;

            if x1i <= x0i + 1 {
                // Whole step inside one cell
                let xmf = 0.5 * (x + x_next) - x0_floor;
                self.add(row + x0i, d - d * xmf);
                self.add(row + x0i + 1, d * xmf);
            } else {
                let s = (x1 - x0).recip();
                let x0f = x0 - x0_floor;
                let a0 = 0.5 * s * (1.0 - x0f) * (1.0 - x0f);
                let x1f = x1 - x1_ceil + 1.0;
                let am = 0.5 * s * x1f * x1f;

                self.add(row + x0i, d * a0);
                if x1i == x0i + 2 {
                    self.add(row + x0i + 1, d * (1.0 - a0 - am));
                } else {
                    let a1 = s * (1.5 - x0f);
                    self.add(row + x0i + 1, d * (a1 - a0));
                    for xi in x0i + 2..x1i - 1 {
                        self.add(row + xi, d * s);
                    }
                    let a2 = a1 + (x1i - x0i - 3) as f32 * s;
                    self.add(row + x1i - 1, d * (1.0 - a2 - am));
                }
                self.add(row + x1i, d * am);
            }
            x = x_next;
        }
    }

    #[inline]
    fn add(&mut self, index: usize, value: f32) {
        if let Some(cell) = self.cells.get_mut(index) {
            *cell += value;
        }
    }

    /// Resolve accumulated areas into per-pixel coverage
    pub fn into_mask(self) -> CoverageMask {
        let width = self.region.width as usize;
        let height = self.region.height as usize;
        let mut coverage = vec![0.0; width * height];
        for y in 0..height {
            let mut acc = 0.0f32;
            let row = &self.cells[y * self.stride..y * self.stride + self.stride];
            for (x, cell) in row.iter().take(width).enumerate() {
                acc += *cell;
                coverage[y * width + x] = acc.abs().min(1.0);
            }
        }
        CoverageMask {
            region: self.region,
            coverage,
        }
    }
}

/// Per-pixel coverage (0.0 - 1.0) of a region
#[derive(Debug, Clone)]
pub struct CoverageMask {
    region: DirtyRect,
    coverage: Vec<f32>,
}

impl CoverageMask {
    pub fn region(&self) -> DirtyRect {
        self.region
    }

    /// Coverage at layer coordinates; zero outside the region
    pub fn coverage_at(&self, x: u32, y: u32) -> f32 {
        if !self.region.contains(x, y) {
            return 0.0;
        }
        let index = (y - self.region.y) as usize * self.region.width as usize
            + (x - self.region.x) as usize;
        self.coverage[index]
    }

    /// Coverage of one row inside the region
    pub fn row(&self, local_y: usize) -> &[f32] {
        let width = self.region.width as usize;
        let start = local_y * width;
        self.coverage.get(start..start + width).unwrap_or(&[])
    }

    /// Sum of coverage, in pixels
    pub fn total(&self) -> f32 {
        self.coverage.iter().sum()
    }

    /// Tight pixel rect of non-zero coverage
    pub fn covered_rect(&self) -> Option<DirtyRect> {
        let width = self.region.width as usize;
        let mut bounds: Option<DirtyRect> = None;
        for (i, value) in self.coverage.iter().enumerate() {
            if *value > COVERAGE_EPSILON {
                let px = DirtyRect::new(
                    self.region.x + (i % width) as u32,
                    self.region.y + (i / width) as u32,
                    1,
                    1,
                );
                bounds = Some(bounds.map_or(px, |b| b.union(&px)));
            }
        }
        bounds
    }
}

/// Rasterize a stroke into `region`
pub fn rasterize(geometry: &StrokeGeometry, region: DirtyRect) -> CoverageMask {
    let mut rasterizer = Rasterizer::new(region);
    rasterizer.fill_geometry(geometry);
    rasterizer.into_mask()
}
