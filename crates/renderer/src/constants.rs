//! Constant buffer and push constant layouts shared with the shaders.
//!
//! These structures must match the GLSL blocks exactly. [`ObjectConstants`]
//! is a std140 uniform block; the rest are read through descriptor table
//! views as std430 storage blocks, which lay out `vec4`/`mat4` members and
//! padded `vec3`s the same way. Arrays of them use the struct size as stride,
//! so every size is a multiple of 16.
//!
//! All structures use `#[repr(C)]` for predictable memory layout and implement
//! `Pod` and `Zeroable` for safe byte casting. Every `vec3` is followed by an
//! explicit pad word.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use renderer_scene::{Camera, PointLight};

/// World transform of the single mesh instance.
pub fn object_world() -> Mat4 {
    Mat4::from_translation(Vec3::new(0.0, -1.0, 0.0))
}

/// Per-object transforms for the raster pipeline.
///
/// Matches `ObjectData` (set 1, binding 0) in `mesh.vert`.
///
/// # Memory Layout
///
/// - Offset 0: world matrix (64 bytes)
/// - Offset 64: model-view-projection matrix (64 bytes)
/// - Total size: 128 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ObjectConstants {
    /// Object to world.
    pub world: Mat4,
    /// Object to clip.
    pub mvp: Mat4,
}

impl ObjectConstants {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Builds the constants for `world` seen through `camera`.
    pub fn new(world: Mat4, camera: &Camera) -> Self {
        Self {
            world,
            mvp: camera.view_projection_matrix() * world,
        }
    }
}

/// Light and eye position, shared by both back ends.
///
/// # Memory Layout
///
/// - Offset 0: ambient color (16 bytes)
/// - Offset 16: light color (16 bytes)
/// - Offset 32: light position (12 bytes) + pad
/// - Offset 48: camera position (12 bytes) + pad
/// - Total size: 64 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LightConstants {
    pub ambient: Vec4,
    pub light_color: Vec4,
    pub light_position: Vec3,
    pub _pad0: f32,
    pub camera_position: Vec3,
    pub _pad1: f32,
}

impl Default for LightConstants {
    fn default() -> Self {
        Self::new(&PointLight::default(), Vec3::ZERO)
    }
}

impl LightConstants {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Packs `light` and the eye position.
    pub fn new(light: &PointLight, camera_position: Vec3) -> Self {
        Self {
            ambient: light.ambient.extend(1.0),
            light_color: light.color.extend(1.0),
            light_position: light.position,
            _pad0: 0.0,
            camera_position,
            _pad1: 0.0,
        }
    }
}

/// Specular material parameters. Written once at scene load.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialConstants {
    /// Specular color.
    pub specular: Vec4,
    /// Phong exponent.
    pub power: f32,
    pub _pad: [f32; 3],
}

impl Default for MaterialConstants {
    fn default() -> Self {
        Self {
            specular: Vec4::ONE,
            power: 32.0,
            _pad: [0.0; 3],
        }
    }
}

impl MaterialConstants {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Camera data for ray generation.
///
/// # Memory Layout
///
/// - Offset 0: inverse view-projection (64 bytes)
/// - Offset 64: eye position (12 bytes) + pad
/// - Total size: 80 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RtCameraConstants {
    /// Clip to world; unprojects pixel centers into ray directions.
    pub inverse_view_projection: Mat4,
    /// Ray origin.
    pub position: Vec3,
    pub _pad: f32,
}

impl RtCameraConstants {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(camera: &Camera) -> Self {
        Self {
            inverse_view_projection: camera.view_projection_matrix().inverse(),
            position: camera.position(),
            _pad: 0.0,
        }
    }
}

/// Object transforms for the closest-hit shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RtObjectConstants {
    /// Object to world.
    pub world: Mat4,
    /// Normal transform.
    pub inverse_transpose_world: Mat4,
}

impl RtObjectConstants {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(world: Mat4) -> Self {
        Self {
            world,
            inverse_transpose_world: world.inverse().transpose(),
        }
    }
}

/// Table slots the raster fragment shader reads, pushed per draw.
///
/// Matches `RasterViews` in `mesh.frag`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RasterViewIndices {
    /// Light view of the current frame slot.
    pub light: u32,
    pub material: u32,
    pub texture: u32,
}

impl RasterViewIndices {
    /// Size of the struct in bytes.
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Table slots the ray-tracing shaders read, pushed per dispatch.
///
/// Matches `RayTraceViews` in `raytrace.glsl`. Camera, object and light
/// views each cover one array with an entry per frame slot; `frame` selects
/// the entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RtViewIndices {
    pub output: u32,
    pub camera: u32,
    pub object: u32,
    pub light: u32,
    pub material: u32,
    pub texture: u32,
    pub vertices: u32,
    pub indices: u32,
    pub frame: u32,
}

impl RtViewIndices {
    /// Size of the struct in bytes.
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Ray payload as declared by every ray-tracing shader.
///
/// Its size is the payload size the pipeline is created with.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RayPayload {
    /// Radiance carried back to the ray generation shader.
    pub color: Vec3,
    /// Trace depth of the ray that owns the payload.
    pub depth: u32,
    /// 1.0 when a shadow ray reached the light, 0.0 when occluded.
    pub visibility: f32,
}

impl RayPayload {
    /// Size of the struct in bytes.
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Size of the built-in triangle hit attributes (two barycentrics).
pub const HIT_ATTRIBUTE_SIZE: u32 = 2 * std::mem::size_of::<f32>() as u32;

const _: () = assert!(ObjectConstants::SIZE == 128);
const _: () = assert!(LightConstants::SIZE == 64);
const _: () = assert!(MaterialConstants::SIZE == 32);
const _: () = assert!(RtCameraConstants::SIZE == 80);
const _: () = assert!(RtObjectConstants::SIZE == 128);
const _: () = assert!(RayPayload::SIZE == 20);
const _: () = assert!(RasterViewIndices::SIZE == 12);
const _: () = assert!(RtViewIndices::SIZE == 36);

#[cfg(test)]
mod tests {
    use super::*;
    use renderer_rhi::raytracing::RtPipelineDesc;

    #[test]
    fn test_light_offsets_match_std140() {
        assert_eq!(std::mem::offset_of!(LightConstants, ambient), 0);
        assert_eq!(std::mem::offset_of!(LightConstants, light_color), 16);
        assert_eq!(std::mem::offset_of!(LightConstants, light_position), 32);
        assert_eq!(std::mem::offset_of!(LightConstants, camera_position), 48);
        assert_eq!(std::mem::offset_of!(RtCameraConstants, position), 64);
    }

    #[test]
    fn test_payload_matches_pipeline_defaults() {
        let desc = RtPipelineDesc::default();
        assert_eq!(desc.payload_size, RayPayload::SIZE);
        assert_eq!(desc.attribute_size, HIT_ATTRIBUTE_SIZE);
    }

    #[test]
    fn test_default_light_constants() {
        let light = LightConstants::default();
        assert_eq!(light.ambient, Vec4::new(0.2, 0.2, 0.2, 1.0));
        assert_eq!(light.light_color, Vec4::ONE);
        assert_eq!(light.light_position, Vec3::new(0.0, 2.0, 0.0));
    }

    #[test]
    fn test_default_material() {
        let material = MaterialConstants::default();
        assert_eq!(material.specular, Vec4::ONE);
        assert_eq!(material.power, 32.0);
    }

    #[test]
    fn test_object_mvp_composition() {
        let camera = Camera::new(1280, 720);
        let world = object_world();
        let constants = ObjectConstants::new(world, &camera);
        let point = Vec3::new(0.25, 0.5, -0.5).extend(1.0);
        let expected = camera.view_projection_matrix() * (world * point);
        assert!((constants.mvp * point - expected).length() < 1e-4);
        assert_eq!(world.w_axis.truncate(), Vec3::new(0.0, -1.0, 0.0));
    }

    #[test]
    fn test_rt_camera_unprojects_center_towards_target() {
        let camera = Camera::new(1280, 720);
        let constants = RtCameraConstants::new(&camera);
        let far = constants.inverse_view_projection * Vec4::new(0.0, 0.0, 1.0, 1.0);
        let direction = (far.truncate() / far.w - constants.position).normalize();
        let to_target = (camera.target - camera.position()).normalize();
        assert!(direction.dot(to_target) > 0.999);
    }

    #[test]
    fn test_inverse_transpose_of_translation_keeps_normals() {
        let constants = RtObjectConstants::new(object_world());
        let normal = constants.inverse_transpose_world * Vec4::new(0.0, 1.0, 0.0, 0.0);
        assert!((normal.truncate() - Vec3::Y).length() < 1e-6);
    }
}
