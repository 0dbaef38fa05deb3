//! Pinhole camera model and world-to-camera poses.

use glam::{Mat3, Mat4, Vec3, Vec4};

/// Pinhole intrinsics in pixel units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PinholeIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl PinholeIntrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Read `fx`, `fy`, `cx`, `cy` out of a 3x3 intrinsic matrix.
    pub fn from_matrix(k: &Mat3) -> Self {
        Self {
            fx: k.x_axis.x,
            fy: k.y_axis.y,
            cx: k.z_axis.x,
            cy: k.z_axis.y,
        }
    }

    /// Project a camera-space point to pixel coordinates `(u, v)`.
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, p: Vec3) -> Option<(f32, f32)> {
        if p.z <= 0.0 {
            return None;
        }
        Some((
            p.x / p.z * self.fx + self.cx,
            p.y / p.z * self.fy + self.cy,
        ))
    }

    /// Camera-space point of pixel `(u, v)` at z-depth `z`.
    pub fn unproject(&self, u: f32, v: f32, z: f32) -> Vec3 {
        Vec3::new((u - self.cx) / self.fx * z, (v - self.cy) / self.fy * z, z)
    }

    /// Direction through pixel `(u, v)` with unit z, so marching the ray by
    /// `t` along it advances the z-depth by exactly `t`.
    pub fn pixel_ray(&self, u: f32, v: f32) -> Vec3 {
        self.unproject(u, v, 1.0)
    }
}

/// World-to-camera rigid transform.
///
/// Uses the depth-sensor convention: the camera looks along +Z, so camera-
/// space z of a visible point is its positive depth.
#[derive(Clone, Copy, Debug)]
pub struct Extrinsic(pub Mat4);

impl Extrinsic {
    pub fn identity() -> Self {
        Self(Mat4::IDENTITY)
    }

    /// Build a world-to-camera transform from an eye position and a target.
    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Self {
        let z = (target - eye).normalize();
        let x = up.cross(z).normalize();
        let y = z.cross(x);
        // Rows of the rotation are the camera axes; translation brings the
        // eye to the origin.
        Self(Mat4::from_cols(
            Vec4::new(x.x, y.x, z.x, 0.0),
            Vec4::new(x.y, y.y, z.y, 0.0),
            Vec4::new(x.z, y.z, z.z, 0.0),
            Vec4::new(-x.dot(eye), -y.dot(eye), -z.dot(eye), 1.0),
        ))
    }

    pub fn to_camera(&self, p_world: Vec3) -> Vec3 {
        self.0.transform_point3(p_world)
    }

    /// Inverse pose, mapping camera space back to world space.
    pub fn camera_to_world(&self) -> Mat4 {
        self.0.inverse()
    }
}
