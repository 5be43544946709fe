//! Scene light.

use glam::Vec3;

/// A single point light with a constant ambient term.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    /// Light position in world space
    pub position: Vec3,
    /// Light color
    pub color: Vec3,
    /// Ambient color added to every lit surface
    pub ambient: Vec3,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 0.0),
            color: Vec3::ONE,
            ambient: Vec3::splat(0.2),
        }
    }
}

impl PointLight {
    /// Create a white light at `position`.
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_light() {
        let light = PointLight::default();
        assert_eq!(light.position, Vec3::new(0.0, 2.0, 0.0));
        assert_eq!(light.color, Vec3::ONE);
        assert_eq!(light.ambient, Vec3::splat(0.2));
    }

    #[test]
    fn test_at_keeps_default_colors() {
        let light = PointLight::at(Vec3::X);
        assert_eq!(light.position, Vec3::X);
        assert_eq!(light.ambient, PointLight::default().ambient);
    }
}
