//! Camera math: projection and look-at view matrices.
//!
//! All matrices use Vulkan clip-space conventions:
//! - Y is flipped (negative in projection)
//! - Depth range [0, 1], optionally reversed (near = 1, far = 0)
//! - Column-major storage (glam default)

use glam::{Mat3, Mat4, Vec3, Vec4};

/// Create a perspective projection matrix for Vulkan clip space.
///
/// The Y axis is flipped (m[1][1] = -f) to match Vulkan's top-down convention.
/// Passing `near > far` yields a reversed depth range.
pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let f = 1.0 / (fov_y / 2.0).tan();

    Mat4::from_cols(
        Vec4::new(f / aspect, 0.0, 0.0, 0.0),
        Vec4::new(0.0, -f, 0.0, 0.0),
        Vec4::new(0.0, 0.0, far / (near - far), -1.0),
        Vec4::new(0.0, 0.0, (near * far) / (near - far), 0.0),
    )
}

/// Orthographic projection centred on the view axis, Y flipped for Vulkan.
pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Mat4 {
    let half_width = width * 0.5;
    let half_height = height * 0.5;

    let mut proj = Mat4::orthographic_rh(
        -half_width,
        half_width,
        -half_height,
        half_height,
        near,
        far,
    );
    proj.y_axis.y = -proj.y_axis.y;
    proj
}

/// Create a look-at view matrix (column-major).
pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
    let f = (target - eye).normalize();
    let s = f.cross(up).normalize();
    let u = s.cross(f);

    Mat4::from_cols(
        Vec4::new(s.x, u.x, -f.x, 0.0),
        Vec4::new(s.y, u.y, -f.y, 0.0),
        Vec4::new(s.z, u.z, -f.z, 0.0),
        Vec4::new(-s.dot(eye), -u.dot(eye), f.dot(eye), 1.0),
    )
}

// ===========================================================================
// Scene camera
// ===========================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraLocation {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
}

impl Default for CameraLocation {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 3.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
        }
    }
}

/// `y_fov == 0` selects an orthographic projection of `width` x `height` units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraProjection {
    pub y_fov: f32,
    pub width: f32,
    pub height: f32,
    pub z_near: f32,
    pub z_far: f32,
}

impl Default for CameraProjection {
    fn default() -> Self {
        Self {
            y_fov: 45.0f32.to_radians(),
            width: 16.0,
            height: 9.0,
            z_near: 0.1,
            z_far: 100.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Camera {
    pub location: CameraLocation,
    pub projection: CameraProjection,
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        let location = &self.location;
        look_at(
            location.position,
            location.position + location.direction,
            location.up,
        )
    }

    /// View without translation, used to draw the environment around the eye.
    pub fn rotation_view(&self) -> Mat4 {
        Mat4::from_mat3(Mat3::from_mat4(self.view()))
    }

    pub fn projection(&self, reverse_depth: bool) -> Mat4 {
        let p = &self.projection;
        let (near, far) = if reverse_depth {
            (p.z_far, p.z_near)
        } else {
            (p.z_near, p.z_far)
        };

        if p.y_fov == 0.0 {
            return orthographic(p.width, p.height, near, far);
        }
        perspective(p.y_fov, p.width / p.height, near, far)
    }

    pub fn view_projection(&self, reverse_depth: bool) -> Mat4 {
        self.projection(reverse_depth) * self.view()
    }

    /// Maps clip-space positions back to world space.
    pub fn inverse_view_projection(&self, reverse_depth: bool) -> Mat4 {
        self.view().inverse() * self.projection(reverse_depth).inverse()
    }

    pub fn set_aspect(&mut self, width: u32, height: u32) {
        self.projection.width = width as f32;
        self.projection.height = height.max(1) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_of(proj: Mat4, view_z: f32) -> f32 {
        let clip = proj * Vec4::new(0.0, 0.0, view_z, 1.0);
        clip.z / clip.w
    }

    #[test]
    fn perspective_maps_near_and_far_to_unit_depth() {
        let proj = perspective(60.0f32.to_radians(), 1.0, 0.1, 100.0);
        assert!(depth_of(proj, -0.1).abs() < 1e-5);
        assert!((depth_of(proj, -100.0) - 1.0).abs() < 1e-4);
        assert!(proj.y_axis.y < 0.0);
    }

    #[test]
    fn reverse_depth_swaps_depth_range() {
        let camera = Camera::default();
        let proj = camera.projection(true);
        assert!((depth_of(proj, -camera.projection.z_near) - 1.0).abs() < 1e-4);
        assert!(depth_of(proj, -camera.projection.z_far).abs() < 1e-4);
    }

    #[test]
    fn zero_fov_is_orthographic() {
        let mut camera = Camera::default();
        camera.projection.y_fov = 0.0;
        camera.projection.width = 4.0;
        camera.projection.height = 2.0;

        let proj = camera.projection(false);
        assert_eq!(proj.w_axis.w, 1.0);
        assert!((proj.x_axis.x - 0.5).abs() < 1e-6);
        assert!((proj.y_axis.y + 1.0).abs() < 1e-6);
    }

    #[test]
    fn look_at_puts_target_on_negative_z() {
        let view = look_at(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, Vec3::Y);
        let target = view * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!((target.z + 3.0).abs() < 1e-6);
        assert!(target.x.abs() < 1e-6 && target.y.abs() < 1e-6);
    }

    #[test]
    fn inverse_view_projection_round_trips() {
        let camera = Camera::default();
        let world = Vec4::new(0.3, -0.2, -1.0, 1.0);
        let clip = camera.view_projection(false) * world;
        let back = camera.inverse_view_projection(false) * clip;
        let back = back / back.w;
        assert!((back - world).length() < 1e-4);
    }

    #[test]
    fn rotation_view_drops_translation() {
        let camera = Camera::default();
        let rotation = camera.rotation_view();
        assert_eq!(rotation.w_axis, Vec4::W);
    }
}
