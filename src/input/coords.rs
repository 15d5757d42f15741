//! Screen to layer-local coordinate mapping.
//!
//! A point on screen was produced as `camera * layer * local`; mapping back
//! applies both inverses. Transforms are passed explicitly so there is no
//! hidden camera or viewport state.

use kurbo::{Affine, Point};

/// Map a screen-space point into the layer's local space.
///
/// Returns `None` when either transform is singular (e.g. zero zoom).
pub fn screen_to_layer_local(
    point: Point,
    layer_transform: Affine,
    camera_transform: Affine,
) -> Option<Point> {
    let combined = camera_transform * layer_transform;
    if combined.determinant().abs() < f64::EPSILON {
        return None;
    }
    let local = combined.inverse() * point;
    (local.x.is_finite() && local.y.is_finite()).then_some(local)
}

/// Map a layer-local point back to screen space.
pub fn layer_local_to_screen(
    point: Point,
    layer_transform: Affine,
    camera_transform: Affine,
) -> Point {
    camera_transform * layer_transform * point
}
