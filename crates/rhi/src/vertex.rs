//! Mesh vertex format and its input descriptions.
//!
//! The same layout is read by the raster pipeline (as vertex input) and by the
//! closest-hit shader (as a storage buffer of 12 floats per vertex), so field
//! order and packing are fixed.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

/// Mesh vertex.
///
/// # Memory Layout
///
/// - Offset 0: position (12 bytes)
/// - Offset 12: color (16 bytes)
/// - Offset 28: tex_coord (8 bytes)
/// - Offset 36: normal (12 bytes)
/// - Total size: 48 bytes
///
/// # Shader Locations
///
/// - location 0: position (vec3)
/// - location 1: color (vec4)
/// - location 2: tex_coord (vec2)
/// - location 3: normal (vec3)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position.
    pub position: Vec3,
    /// Linear RGBA vertex color. Stored as an array: `Vec4` is 16-byte
    /// aligned and would pad the vertex.
    pub color: [f32; 4],
    /// Texture coordinates.
    pub tex_coord: Vec2,
    /// Object-space normal.
    pub normal: Vec3,
}

/// Index type used by every mesh.
pub type Index = u32;

/// Vulkan index type matching [`Index`].
pub const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;

impl Vertex {
    /// Size of one vertex in bytes.
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    /// Creates a vertex.
    #[inline]
    pub fn new(position: Vec3, color: Vec4, tex_coord: Vec2, normal: Vec3) -> Self {
        Self {
            position,
            color: color.to_array(),
            tex_coord,
            normal,
        }
    }

    /// Vertex color as a vector.
    #[inline]
    pub fn color(&self) -> Vec4 {
        Vec4::from_array(self.color)
    }

    /// Get the vertex input binding description.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: Self::STRIDE,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Get the vertex attribute descriptions.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 2,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, tex_coord) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 3,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, normal) as u32,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_size() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        assert_eq!(Vertex::STRIDE, 48);
    }

    #[test]
    fn test_attribute_offsets() {
        let attributes = Vertex::attribute_descriptions();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 28, 36]);
        for (location, attribute) in attributes.iter().enumerate() {
            assert_eq!(attribute.location, location as u32);
            assert_eq!(attribute.binding, 0);
        }
    }

    #[test]
    fn test_binding_description() {
        let binding = Vertex::binding_description();
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.stride, 48);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);
    }

    #[test]
    fn test_vertex_is_pod() {
        let vertices = [Vertex::new(Vec3::X, Vec4::ONE, Vec2::new(0.5, 1.0), Vec3::Y)];
        let bytes: &[u8] = bytemuck::cast_slice(&vertices);
        assert_eq!(bytes.len(), 48);
        let floats: &[f32] = bytemuck::cast_slice(&vertices);
        assert_eq!(floats[0], 1.0);
        assert_eq!(floats[3..7], [1.0, 1.0, 1.0, 1.0]);
        assert_eq!(floats[7..9], [0.5, 1.0]);
        assert_eq!(floats[9..12], [0.0, 1.0, 0.0]);
    }
}
