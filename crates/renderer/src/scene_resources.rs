//! GPU-resident scene: mesh buffers, texture, material and the mesh BLAS,
//! plus the table views both back ends read them through.

use std::sync::Arc;

use tracing::info;

use renderer_resources::{MeshData, TextureData};
use renderer_rhi::RhiResult;
use renderer_rhi::acceleration_structure::{Blas, BlasGeometry};
use renderer_rhi::buffer::{BufferDesc, BufferState, BufferUsage, GpuBuffer, UploadTracker};
use renderer_rhi::command::CommandBuffer;
use renderer_rhi::descriptor::{DescriptorAllocation, DescriptorTable, ResourceView, SlotAllocator};
use renderer_rhi::device::Device;
use renderer_rhi::image::{Image2D, Sampler};
use renderer_rhi::vertex::Vertex;

use crate::constants::MaterialConstants;

/// Everything both back ends read from the loaded scene.
///
/// Immutable once the upload has completed; shared by the raster and the
/// ray-tracing back ends.
pub struct SceneResources {
    /// Device-local vertex buffer, also bound as a storage buffer.
    pub vertex_buffer: GpuBuffer,
    /// Device-local `u32` index buffer, also bound as a storage buffer.
    pub index_buffer: GpuBuffer,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Sampled RGBA8 texture.
    pub texture: Image2D,
    pub sampler: Sampler,
    /// Upload-heap [`MaterialConstants`].
    pub material: GpuBuffer,
    /// Bottom-level structure over the mesh; only with ray tracing enabled.
    pub blas: Option<Blas>,
}

impl SceneResources {
    /// Records the upload of `mesh` and `texture` into `cmd`.
    ///
    /// Every staging buffer is handed to `uploads`; the caller must keep
    /// them until the GPU has executed `cmd`. With ray tracing enabled the
    /// BLAS build is recorded after the copies.
    ///
    /// # Errors
    ///
    /// Returns an error if the mesh or texture is empty or an allocation
    /// fails.
    pub fn upload(
        device: &Arc<Device>,
        cmd: &CommandBuffer,
        mesh: &MeshData,
        texture: &TextureData,
        uploads: &mut UploadTracker,
    ) -> RhiResult<Self> {
        let (vertex_buffer, staging) = GpuBuffer::create_and_upload_default(
            device.clone(),
            cmd,
            bytemuck::cast_slice(&mesh.vertices),
            BufferUsage::Vertex,
            BufferState::VertexInput,
            "mesh vertices",
        )?;
        uploads.track(staging);

        let (index_buffer, staging) = GpuBuffer::create_and_upload_default(
            device.clone(),
            cmd,
            bytemuck::cast_slice(&mesh.indices),
            BufferUsage::Index,
            BufferState::IndexInput,
            "mesh indices",
        )?;
        uploads.track(staging);

        let (texture_image, staging) = Image2D::upload_rgba8(
            device.clone(),
            cmd,
            texture.width,
            texture.height,
            &texture.pixels,
            "mesh texture",
        )?;
        uploads.track(staging);

        let sampler = Sampler::linear_repeat(device.clone())?;

        let mut material = GpuBuffer::create(
            device.clone(),
            &BufferDesc::constant("material constants", MaterialConstants::SIZE as u64),
        )?;
        material.write_pod(0, &MaterialConstants::default())?;

        let vertex_count = mesh.vertices.len() as u32;
        let index_count = mesh.indices.len() as u32;

        let blas = if device.ray_tracing().is_supported() {
            let geometry = BlasGeometry {
                vertex_address: vertex_buffer.device_address()?,
                vertex_stride: u64::from(Vertex::STRIDE),
                vertex_count,
                index_address: index_buffer.device_address()?,
                index_count,
            };
            Some(Blas::build(device, cmd, &geometry, "mesh BLAS")?)
        } else {
            None
        };

        info!(
            "Scene upload recorded: {} vertices, {} indices, {}x{} texture, BLAS: {}",
            vertex_count,
            index_count,
            texture.width,
            texture.height,
            blas.is_some()
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_count,
            index_count,
            texture: texture_image,
            sampler,
            material,
            blas,
        })
    }

    /// Drops the BLAS build scratch. Only valid once the build has executed.
    pub fn release_build_scratch(&mut self) {
        if let Some(blas) = self.blas.as_mut() {
            blas.release_scratch();
        }
    }
}

/// Table slots for the scene views shared by both back ends.
///
/// Reserved once at start-up; written whenever a scene is loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SceneViews {
    pub material: DescriptorAllocation,
    pub texture: DescriptorAllocation,
}

impl SceneViews {
    /// Reserves the material and texture slots.
    ///
    /// # Errors
    ///
    /// Returns [`renderer_rhi::RhiError::OutOfSlots`] if the table is full.
    pub fn allocate(slots: &mut impl SlotAllocator) -> RhiResult<Self> {
        Ok(Self {
            material: slots.allocate_slot()?,
            texture: slots.allocate_slot()?,
        })
    }

    /// Points the views at `scene`. Nothing may be reading the table.
    pub fn write(&self, table: &DescriptorTable, scene: &SceneResources) {
        table.write(&self.material, ResourceView::Buffer(scene.material.handle()));
        table.write(
            &self.texture,
            ResourceView::SampledImage {
                sampler: scene.sampler.handle(),
                view: scene.texture.view(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderer_rhi::RhiError;
    use renderer_rhi::descriptor::{DescriptorAllocator, DescriptorCapacity};

    #[test]
    fn test_scene_views_take_the_shared_slots() {
        let mut table =
            DescriptorAllocator::create(DescriptorCapacity::SHARED_VIEWS, true).unwrap();
        let views = SceneViews::allocate(&mut table).unwrap();
        assert_ne!(views.material.index, views.texture.index);
        assert_eq!(table.remaining(), 0);
    }

    #[test]
    fn test_scene_views_fail_on_a_full_table() {
        let mut table = DescriptorAllocator::create(1, true).unwrap();
        assert!(matches!(
            SceneViews::allocate(&mut table),
            Err(RhiError::OutOfSlots { capacity: 1 })
        ));
    }
}
