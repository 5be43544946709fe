//! Orbit camera.
//!
//! The camera circles a fixed target on a sphere described by a radius and
//! two angles. Mouse drags change the angles, the scroll wheel changes the
//! radius.

use glam::{Mat4, Vec3};

/// Radius limits for [`Camera::zoom`].
pub const MIN_RADIUS: f32 = 0.5;
/// Radius limits for [`Camera::zoom`].
pub const MAX_RADIUS: f32 = 50.0;
/// Elevation limit, keeps the view direction away from the poles.
pub const MAX_PHI: f32 = 89.0 * std::f32::consts::PI / 180.0;

/// An orbit camera looking at `target`.
#[derive(Clone, Debug)]
pub struct Camera {
    /// Distance from the target.
    radius: f32,
    /// Azimuth in radians.
    theta: f32,
    /// Elevation in radians, within `[-MAX_PHI, MAX_PHI]`.
    phi: f32,
    /// Radians per pixel of drag.
    pub orbit_speed: f32,
    /// Radius change per scroll line.
    pub zoom_speed: f32,
    /// Point the camera orbits.
    pub target: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    /// Near clip distance.
    pub near: f32,
    /// Far clip distance.
    pub far: f32,
    aspect: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            radius: 5.0,
            theta: 0.0,
            phi: 0.0,
            orbit_speed: 0.005,
            zoom_speed: 0.5,
            target: Vec3::ZERO,
            fov_y: 45.0_f32.to_radians(),
            near: 0.1,
            far: 100.0,
            aspect: 16.0 / 9.0,
        }
    }
}

impl Camera {
    /// Create a camera for a viewport of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        let mut camera = Self::default();
        camera.set_viewport(width, height);
        camera
    }

    /// Update the aspect ratio. A zero-sized viewport keeps the previous one.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    /// Rotate around the target by a mouse drag in pixels.
    pub fn orbit(&mut self, dx: f32, dy: f32) {
        self.theta -= dx * self.orbit_speed;
        self.phi = (self.phi + dy * self.orbit_speed).clamp(-MAX_PHI, MAX_PHI);
    }

    /// Move toward (positive) or away from (negative) the target.
    pub fn zoom(&mut self, scroll: f32) {
        self.radius = (self.radius - scroll * self.zoom_speed).clamp(MIN_RADIUS, MAX_RADIUS);
    }

    #[inline]
    pub fn radius(&self) -> f32 {
        self.radius
    }

    #[inline]
    pub fn theta(&self) -> f32 {
        self.theta
    }

    #[inline]
    pub fn phi(&self) -> f32 {
        self.phi
    }

    #[inline]
    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    /// World-space eye position.
    pub fn position(&self) -> Vec3 {
        let (sin_phi, cos_phi) = self.phi.sin_cos();
        let (sin_theta, cos_theta) = self.theta.sin_cos();
        self.target
            + self.radius * Vec3::new(cos_phi * sin_theta, sin_phi, cos_phi * cos_theta)
    }

    /// Get the view matrix.
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position(), self.target, Vec3::Y)
    }

    /// Get the projection matrix (with Vulkan Y-flip and a `[0, 1]` depth range).
    pub fn projection_matrix(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far);
        // Flip Y for Vulkan coordinate system
        proj.y_axis.y *= -1.0;
        proj
    }

    /// Get the view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    #[test]
    fn test_default_position_on_positive_z() {
        let camera = Camera::default();
        assert!((camera.position() - Vec3::new(0.0, 0.0, 5.0)).length() < EPS);
    }

    #[test]
    fn test_zoom_clamps_radius() {
        let mut camera = Camera::default();
        camera.zoom(100.0);
        assert_eq!(camera.radius(), MIN_RADIUS);
        camera.zoom(-1000.0);
        assert_eq!(camera.radius(), MAX_RADIUS);
        camera.zoom(2.0);
        assert_eq!(camera.radius(), MAX_RADIUS - 1.0);
    }

    #[test]
    fn test_orbit_clamps_elevation() {
        let mut camera = Camera::default();
        camera.orbit(0.0, 1.0e6);
        assert_eq!(camera.phi(), MAX_PHI);
        camera.orbit(0.0, -1.0e6);
        assert_eq!(camera.phi(), -MAX_PHI);
    }

    #[test]
    fn test_orbit_horizontal_is_unbounded() {
        let mut camera = Camera::default();
        camera.orbit(-200.0, 0.0);
        assert!((camera.theta() - 1.0).abs() < EPS);
        // Radius is preserved while orbiting.
        assert!((camera.position().length() - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_zero_viewport_keeps_aspect() {
        let mut camera = Camera::new(800, 400);
        assert_eq!(camera.aspect(), 2.0);
        camera.set_viewport(0, 400);
        assert_eq!(camera.aspect(), 2.0);
    }

    #[test]
    fn test_target_projects_to_center() {
        let camera = Camera::new(1280, 720);
        let clip = camera.view_projection_matrix() * camera.target.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < EPS && ndc.y.abs() < EPS);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn test_projection_flips_y() {
        let camera = Camera::default();
        let above = camera.view_projection_matrix() * Vec3::new(0.0, 1.0, 0.0).extend(1.0);
        assert!(above.y / above.w < 0.0);
    }
}
