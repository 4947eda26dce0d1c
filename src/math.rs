//! Screen-space matrices.
//!
//! Callers work in pixels with the origin at the top-left corner. The view
//! matrix moves that origin to the center and orients Y for the driver's
//! clip space; the projection then scales pixels into [-1, 1].

use crate::backend::ClipSpace;
use glam::{Mat4, Vec3, Vec4};

pub fn projection_matrix(width: f32, height: f32) -> Mat4 {
    Mat4::from_scale(Vec3::new(2.0 / width, 2.0 / height, 1.0))
}

/// `auto_flip` is accepted for API parity; both clip spaces are already
/// handled here, so it never changes the result.
pub fn view_matrix(width: f32, height: f32, clip_space: ClipSpace, _auto_flip: bool) -> Mat4 {
    match clip_space {
        ClipSpace::YUp => Mat4::from_cols(
            Vec4::X,
            Vec4::NEG_Y,
            Vec4::Z,
            Vec4::new(-width / 2.0, height / 2.0, 0.0, 1.0),
        ),
        ClipSpace::YDown => Mat4::from_translation(Vec3::new(-width / 2.0, -height / 2.0, 0.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn to_clip(point: Vec3, width: f32, height: f32, clip_space: ClipSpace) -> Vec3 {
        let m = projection_matrix(width, height) * view_matrix(width, height, clip_space, false);
        m.transform_point3(point)
    }

    #[test]
    fn top_left_pixel_is_top_left_of_clip_space() {
        let y_up = to_clip(Vec3::ZERO, 640.0, 480.0, ClipSpace::YUp);
        assert!(y_up.abs_diff_eq(Vec3::new(-1.0, 1.0, 0.0), 1e-6));

        let y_down = to_clip(Vec3::ZERO, 640.0, 480.0, ClipSpace::YDown);
        assert!(y_down.abs_diff_eq(Vec3::new(-1.0, -1.0, 0.0), 1e-6));
    }

    #[test]
    fn bottom_right_pixel_maps_to_opposite_corner() {
        let corner = Vec3::new(640.0, 480.0, 0.0);
        assert!(to_clip(corner, 640.0, 480.0, ClipSpace::YUp)
            .abs_diff_eq(Vec3::new(1.0, -1.0, 0.0), 1e-6));
        assert!(to_clip(corner, 640.0, 480.0, ClipSpace::YDown)
            .abs_diff_eq(Vec3::new(1.0, 1.0, 0.0), 1e-6));
    }

    #[test]
    fn auto_flip_changes_nothing() {
        for clip_space in [ClipSpace::YUp, ClipSpace::YDown] {
            assert_eq!(
                view_matrix(256.0, 224.0, clip_space, true),
                view_matrix(256.0, 224.0, clip_space, false)
            );
        }
    }
}
