// SPDX-License-Identifier: GPL-3.0-only

//! Buffer-to-display orientation transforms

use crate::backends::camera::{DevicePosition, VideoOrientation};
use std::f32::consts::{FRAC_PI_2, PI};

/// 2D affine transform
///
/// Maps `(x, y)` to `(a*x + c*y + tx, b*x + d*y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl AffineTransform {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Counter-clockwise rotation by `angle` radians
    pub fn rotation(angle: f32) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self {
            a: cos,
            b: sin,
            c: -sin,
            d: cos,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self {
            a: sx,
            b: 0.0,
            c: 0.0,
            d: sy,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn translation(tx: f32, ty: f32) -> Self {
        Self {
            tx,
            ty,
            ..Self::IDENTITY
        }
    }

    /// `self` followed by `next`
    pub fn then(&self, next: &AffineTransform) -> Self {
        Self {
            a: self.a * next.a + self.b * next.c,
            b: self.a * next.b + self.b * next.d,
            c: self.c * next.a + self.d * next.c,
            d: self.c * next.b + self.d * next.d,
            tx: self.tx * next.a + self.ty * next.c + next.tx,
            ty: self.tx * next.b + self.ty * next.d + next.ty,
        }
    }

    pub fn determinant(&self) -> f32 {
        self.a * self.d - self.b * self.c
    }

    /// Inverse transform, `None` when singular
    pub fn inverse(&self) -> Option<Self> {
        let det = self.determinant();
        if det.abs() <= f32::EPSILON {
            return None;
        }
        Some(Self {
            a: self.d / det,
            b: -self.b / det,
            c: -self.c / det,
            d: self.a / det,
            tx: (self.c * self.ty - self.d * self.tx) / det,
            ty: (self.b * self.tx - self.a * self.ty) / det,
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.tx,
            self.b * x + self.d * y + self.ty,
        )
    }

    pub fn is_identity(&self) -> bool {
        self.approx_eq(&Self::IDENTITY, 1e-5)
    }

    pub fn approx_eq(&self, other: &AffineTransform, tolerance: f32) -> bool {
        [
            self.a - other.a,
            self.b - other.b,
            self.c - other.c,
            self.d - other.d,
            self.tx - other.tx,
            self.ty - other.ty,
        ]
        .iter()
        .all(|delta| delta.abs() <= tolerance)
    }
}

/// Rotation from portrait to `orientation`, in radians
pub fn angle_offset_from_portrait(orientation: VideoOrientation) -> f32 {
    match orientation {
        VideoOrientation::Portrait => 0.0,
        VideoOrientation::PortraitUpsideDown => PI,
        VideoOrientation::LandscapeRight => -FRAC_PI_2,
        VideoOrientation::LandscapeLeft => FRAC_PI_2,
    }
}

/// Transform that presents a buffer captured in `video_orientation` upright
/// in `requested`.
///
/// Front cameras are mirrored horizontally when `mirroring` is set. Without
/// mirroring, portrait output from a front camera gets an extra half turn so
/// that it is not upside down.
pub fn transform_for(
    video_orientation: VideoOrientation,
    position: DevicePosition,
    requested: VideoOrientation,
    mirroring: bool,
) -> AffineTransform {
    let angle = angle_offset_from_portrait(requested) - angle_offset_from_portrait(video_orientation);
    let transform = AffineTransform::rotation(angle);

    if position != DevicePosition::Front {
        return transform;
    }
    if mirroring {
        AffineTransform::scale(-1.0, 1.0).then(&transform)
    } else if requested.is_portrait() {
        AffineTransform::rotation(PI).then(&transform)
    } else {
        transform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_point(actual: (f32, f32), expected: (f32, f32)) {
        assert!(
            (actual.0 - expected.0).abs() < 1e-5 && (actual.1 - expected.1).abs() < 1e-5,
            "{:?} != {:?}",
            actual,
            expected
        );
    }

    #[test]
    fn test_same_orientation_is_identity() {
        for orientation in VideoOrientation::ALL {
            let t = transform_for(orientation, DevicePosition::Back, orientation, false);
            assert!(t.is_identity(), "{orientation}: {t:?}");
        }
    }

    #[test]
    fn test_landscape_sensor_to_portrait() {
        let t = transform_for(
            VideoOrientation::LandscapeRight,
            DevicePosition::Back,
            VideoOrientation::Portrait,
            false,
        );
        // Quarter turn counter-clockwise
        assert_point(t.apply((1.0, 0.0)), (0.0, 1.0));
    }

    #[test]
    fn test_front_mirroring_flips_x() {
        let t = transform_for(
            VideoOrientation::Portrait,
            DevicePosition::Front,
            VideoOrientation::Portrait,
            true,
        );
        assert_point(t.apply((1.0, 2.0)), (-1.0, 2.0));
    }

    #[test]
    fn test_front_without_mirroring_turns_portrait() {
        let portrait = transform_for(
            VideoOrientation::Portrait,
            DevicePosition::Front,
            VideoOrientation::Portrait,
            false,
        );
        assert_point(portrait.apply((1.0, 2.0)), (-1.0, -2.0));

        let landscape = transform_for(
            VideoOrientation::LandscapeLeft,
            DevicePosition::Front,
            VideoOrientation::LandscapeLeft,
            false,
        );
        assert!(landscape.is_identity());
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        for video in VideoOrientation::ALL {
            for requested in VideoOrientation::ALL {
                for position in [DevicePosition::Back, DevicePosition::Front] {
                    let t = transform_for(video, position, requested, false);
                    let inverse = t.inverse().unwrap();
                    assert!(t.then(&inverse).is_identity());
                    assert!(inverse.then(&t).is_identity());
                }
            }
        }
    }

    #[test]
    fn test_then_applies_in_order() {
        let t = AffineTransform::translation(1.0, 0.0).then(&AffineTransform::scale(2.0, 2.0));
        assert_point(t.apply((0.0, 0.0)), (2.0, 0.0));
        assert!(AffineTransform::scale(0.0, 1.0).inverse().is_none());
    }
}
