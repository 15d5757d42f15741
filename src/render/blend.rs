//! Per-pixel blending on premultiplied RGBA8
//!
//! Separable blend modes follow the W3C compositing formulas: with source
//! and backdrop premultiplied,
//! `co = cs·(1 − αb) + cb·(1 − αs) + αs·αb·B(Cb, Cs)` and
//! `αo = αs + αb·(1 − αs)`.

use crate::brush::BlendMode;

/// Separable blend function on straight (unpremultiplied) channels
pub fn blend_channel(mode: BlendMode, cb: f32, cs: f32) -> f32 {
    match mode {
        BlendMode::Normal => cs,
        BlendMode::Multiply => cb * cs,
        BlendMode::Screen => cb + cs - cb * cs,
        BlendMode::Overlay => blend_channel(BlendMode::HardLight, cs, cb),
        BlendMode::Darken => cb.min(cs),
        BlendMode::Lighten => cb.max(cs),
        BlendMode::ColorDodge => {
            if cb <= 0.0 {
                0.0
            } else if cs >= 1.0 {
                1.0
            } else {
                (cb / (1.0 - cs)).min(1.0)
            }
        }
        BlendMode::ColorBurn => {
            if cb >= 1.0 {
                1.0
            } else if cs <= 0.0 {
                0.0
            } else {
                1.0 - ((1.0 - cb) / cs).min(1.0)
            }
        }
        BlendMode::HardLight => {
            if cs <= 0.5 {
                cb * 2.0 * cs
            } else {
                let s = 2.0 * cs - 1.0;
                cb + s - cb * s
            }
        }
        BlendMode::SoftLight => {
            if cs <= 0.5 {
                cb - (1.0 - 2.0 * cs) * cb * (1.0 - cb)
            } else {
                let d = if cb <= 0.25 {
                    ((16.0 * cb - 12.0) * cb + 4.0) * cb
                } else {
                    cb.sqrt()
                };
                cb + (2.0 * cs - 1.0) * (d - cb)
            }
        }
        BlendMode::Difference => (cb - cs).abs(),
        BlendMode::Exclusion => cb + cs - 2.0 * cb * cs,
    }
}

#[inline]
fn to_unit(px: [u8; 4]) -> [f32; 4] {
    [
        px[0] as f32 / 255.0,
        px[1] as f32 / 255.0,
        px[2] as f32 / 255.0,
        px[3] as f32 / 255.0,
    ]
}

#[inline]
fn to_bytes(px: [f32; 4]) -> [u8; 4] {
    let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    let a = q(px[3]);
    // Keep the premultiplied invariant c <= a after rounding
    [q(px[0]).min(a), q(px[1]).min(a), q(px[2]).min(a), a]
}

/// Composite one premultiplied source pixel over a premultiplied backdrop.
#[inline]
pub fn composite_pixel(
    backdrop: [u8; 4],
    source: [u8; 4],
    opacity: f32,
    mode: BlendMode,
) -> [u8; 4] {
    if source[3] == 0 || opacity <= 0.0 {
        return backdrop;
    }
    let b = to_unit(backdrop);
    let mut s = to_unit(source);
    for channel in &mut s {
        *channel *= opacity;
    }

    let ab = b[3];
    let as_ = s[3];
    let ao = as_ + ab * (1.0 - as_);

    if mode == BlendMode::Normal || ab == 0.0 {
        return to_bytes([
            s[0] + b[0] * (1.0 - as_),
            s[1] + b[1] * (1.0 - as_),
            s[2] + b[2] * (1.0 - as_),
            ao,
        ]);
    }

    let mut out = [0.0; 4];
    for c in 0..3 {
        let cb = b[c] / ab;
        let cs = s[c] / as_;
        out[c] = s[c] * (1.0 - ab) + b[c] * (1.0 - as_) + as_ * ab * blend_channel(mode, cb, cs);
    }
    out[3] = ao;
    to_bytes(out)
}

/// Source-over of a premultiplied color scaled by coverage.
///
/// `color` is premultiplied and already includes the stroke opacity.
#[inline]
pub fn draw_coverage(dst: &mut [u8], color: [f32; 4], coverage: f32) {
    if coverage <= 0.0 {
        return;
    }
    let src_a = color[3] * coverage;
    let keep = 1.0 - src_a;
    for c in 0..4 {
        let value = color[c] * coverage * 255.0 + dst[c] as f32 * keep;
        dst[c] = value.round().clamp(0.0, 255.0) as u8;
    }
    let a = dst[3];
    for value in dst.iter_mut().take(3) {
        *value = (*value).min(a);
    }
}

/// Remove `amount` (0.0 - 1.0) of alpha, rescaling color to stay premultiplied.
///
/// The subtraction is quantized to whole alpha steps so erasing with the
/// same coverage and opacity as a draw on a transparent pixel returns it to
/// zero exactly.
#[inline]
pub fn erase_coverage(dst: &mut [u8], amount: f32) {
    if amount <= 0.0 || dst[3] == 0 {
        return;
    }
    let remove = (amount.min(1.0) * 255.0).round() as u16;
    let old_a = dst[3] as u16;
    let new_a = old_a.saturating_sub(remove);
    if new_a == 0 {
        dst[..4].fill(0);
        return;
    }
    for value in dst.iter_mut().take(3) {
        *value = ((*value as u32 * new_a as u32 + old_a as u32 / 2) / old_a as u32) as u8;
    }
    dst[3] = new_a as u8;
}
