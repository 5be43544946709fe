//! Bottom- and top-level ray-tracing acceleration structures.
//!
//! # Overview
//!
//! - [`Blas`] is built once per static mesh and never changes afterwards.
//!   Its scratch buffer only has to live until the build has executed on
//!   the GPU, after which [`Blas::release_scratch`] frees it.
//! - [`Tlas`] references one or more BLAS results through
//!   [`TlasInstance`]s and is refreshed on every ray-traced frame.
//!
//! A top-level refresh is either an in-place update or a full rebuild, as
//! decided by [`TlasBuildMode::for_refresh`]: an update needs the same
//! instance count as the previous build and a previous result at least as
//! large as the new requirement, anything else rebuilds into a freshly
//! sized buffer.
//!
//! Every build records a memory barrier so that later builds and ray
//! dispatches observe the finished structure.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use tracing::{debug, info};

use crate::buffer::{BufferDesc, BufferUsage, GpuBuffer, HeapClass, align_up};
use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Alignment applied to scratch addresses. Covers
/// `minAccelerationStructureScratchOffsetAlignment` on current hardware.
const SCRATCH_ALIGNMENT: vk::DeviceSize = 256;

/// Stages and access types that read a finished acceleration structure.
fn structure_readers() -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    (
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
            | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    )
}

/// Stages and access types of a build.
fn structure_build() -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    (
        vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
    )
}

// =============================================================================
// Shared Storage
// =============================================================================

/// An acceleration structure object and the buffer that backs it.
pub struct AccelerationStructure {
    device: Arc<Device>,
    handle: vk::AccelerationStructureKHR,
    buffer: GpuBuffer,
    address: vk::DeviceAddress,
    level: &'static str,
}

impl AccelerationStructure {
    fn new(
        device: &Arc<Device>,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: &str,
    ) -> RhiResult<Self> {
        let level = if ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            "TLAS"
        } else {
            "BLAS"
        };
        if size == 0 {
            return Err(RhiError::AccelerationStructureError(format!(
                "{level} '{name}' reported a result size of 0"
            )));
        }

        let loaders = device.rt_loaders()?;
        let buffer = GpuBuffer::create(
            device.clone(),
            &BufferDesc {
                size,
                heap: HeapClass::Default,
                usage: BufferUsage::AccelerationStructure,
                is_constant: false,
                name,
            },
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .offset(0)
            .size(size)
            .ty(ty);

        // SAFETY: `buffer` has ACCELERATION_STRUCTURE_STORAGE usage and at
        // least `size` bytes bound.
        let handle = unsafe {
            loaders
                .acceleration_structure
                .create_acceleration_structure(&create_info, None)?
        };

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        // SAFETY: `handle` was just created on this device.
        let address = unsafe {
            loaders
                .acceleration_structure
                .get_acceleration_structure_device_address(&address_info)
        };

        debug!("Created {} '{}': {} bytes", level, name, size);

        Ok(Self {
            device: device.clone(),
            handle,
            buffer,
            address,
            level,
        })
    }

    /// Returns the structure handle.
    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Returns the device address instances reference.
    #[inline]
    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    /// Returns the result buffer capacity in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        match self.device.rt_loaders() {
            // SAFETY: owners retire structures only after the GPU is done
            // with them.
            Ok(loaders) => unsafe {
                loaders
                    .acceleration_structure
                    .destroy_acceleration_structure(self.handle, None);
            },
            Err(e) => tracing::error!("Leaking {}: {}", self.level, e),
        }
        debug!("Destroyed {} '{}'", self.level, self.buffer.name());
    }
}

fn create_scratch(device: &Arc<Device>, size: vk::DeviceSize, name: &str) -> RhiResult<GpuBuffer> {
    GpuBuffer::create(
        device.clone(),
        &BufferDesc {
            size: size + SCRATCH_ALIGNMENT,
            heap: HeapClass::Default,
            usage: BufferUsage::Scratch,
            is_constant: false,
            name,
        },
    )
}

fn scratch_address(scratch: &GpuBuffer) -> RhiResult<vk::DeviceAddress> {
    Ok(align_up(scratch.device_address()?, SCRATCH_ALIGNMENT))
}

/// Usable bytes of a scratch buffer created by [`create_scratch`].
fn scratch_capacity(scratch: &GpuBuffer) -> vk::DeviceSize {
    scratch.size().saturating_sub(SCRATCH_ALIGNMENT)
}

// =============================================================================
// Bottom Level
// =============================================================================

/// Triangle geometry of one mesh, by device address.
///
/// Positions are `R32G32B32_SFLOAT` at the start of each vertex; indices
/// are `u32`.
#[derive(Clone, Copy, Debug)]
pub struct BlasGeometry {
    /// Address of the first vertex.
    pub vertex_address: vk::DeviceAddress,
    /// Bytes between consecutive vertices.
    pub vertex_stride: vk::DeviceSize,
    /// Number of vertices.
    pub vertex_count: u32,
    /// Address of the first index.
    pub index_address: vk::DeviceAddress,
    /// Number of indices (three per triangle).
    pub index_count: u32,
}

/// Bottom-level acceleration structure over one static mesh.
pub struct Blas {
    structure: AccelerationStructure,
    scratch: Option<GpuBuffer>,
    triangle_count: u32,
}

impl Blas {
    /// Records the build of a BLAS for `geometry` into `cmd`.
    ///
    /// Allocates the scratch and result buffers from the sizes the device
    /// reports, records the build and a barrier that makes the result
    /// visible to top-level builds and ray tracing.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AccelerationStructureError`] for empty geometry
    /// or a zero result size and [`RhiError::RayTracingUnsupported`] when
    /// ray tracing is not enabled.
    pub fn build(
        device: &Arc<Device>,
        cmd: &CommandBuffer,
        geometry: &BlasGeometry,
        name: &str,
    ) -> RhiResult<Self> {
        let loaders = device.rt_loaders()?;
        let triangle_count = geometry.index_count / 3;
        if triangle_count == 0 || geometry.vertex_count == 0 {
            return Err(RhiError::AccelerationStructureError(format!(
                "BLAS '{name}' has no triangles"
            )));
        }

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: geometry.vertex_address,
            })
            .vertex_stride(geometry.vertex_stride)
            .max_vertex(geometry.vertex_count - 1)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: geometry.index_address,
            });
        let as_geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles });

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&as_geometry));

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        // SAFETY: `build_info` describes valid geometry for the query.
        unsafe {
            loaders
                .acceleration_structure
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[triangle_count],
                    &mut sizes,
                );
        }

        let structure = AccelerationStructure::new(
            device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            sizes.acceleration_structure_size,
            name,
        )?;
        let scratch = create_scratch(device, sizes.build_scratch_size, &format!("{name} scratch"))?;

        build_info = build_info
            .dst_acceleration_structure(structure.handle())
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address(&scratch)?,
            });
        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(triangle_count);

        cmd.build_acceleration_structures(
            &loaders.acceleration_structure,
            std::slice::from_ref(&build_info),
            &[std::slice::from_ref(&range)],
        );
        cmd.memory_barrier(structure_build(), structure_readers());

        info!(
            "BLAS '{}' recorded: {} triangles, {} bytes, scratch {} bytes",
            name, triangle_count, sizes.acceleration_structure_size, sizes.build_scratch_size
        );

        Ok(Self {
            structure,
            scratch: Some(scratch),
            triangle_count,
        })
    }

    /// Frees the scratch buffer. Call only after the build has executed.
    pub fn release_scratch(&mut self) {
        if self.scratch.take().is_some() {
            debug!("Released BLAS scratch");
        }
    }

    /// Returns the device address top-level instances reference.
    #[inline]
    pub fn address(&self) -> vk::DeviceAddress {
        self.structure.address()
    }

    /// Returns the structure handle.
    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.structure.handle()
    }

    /// Returns the number of triangles.
    #[inline]
    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }
}

// =============================================================================
// Top Level
// =============================================================================

/// One instance of a BLAS in the top-level structure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TlasInstance {
    /// Object-to-world transform. Only the upper 3x4 part is used.
    pub transform: Mat4,
    /// Device address of the referenced BLAS.
    pub blas_address: vk::DeviceAddress,
    /// Value of `gl_InstanceCustomIndexEXT` (24 bits).
    pub instance_id: u32,
    /// Visibility mask tested against the ray's cull mask.
    pub mask: u8,
    /// Offset added to the hit group index.
    pub sbt_offset: u32,
    /// Instance flags.
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl TlasInstance {
    /// Instance with id 0, mask 1, no SBT offset and face culling disabled.
    pub fn new(blas_address: vk::DeviceAddress, transform: Mat4) -> Self {
        Self {
            transform,
            blas_address,
            instance_id: 0,
            mask: 1,
            sbt_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    /// Encodes the instance in the layout `vkCmdBuildAccelerationStructuresKHR`
    /// reads.
    pub fn to_record(&self) -> InstanceRecord {
        let mut transform = [0.0f32; 12];
        for row in 0..3 {
            transform[row * 4..row * 4 + 4].copy_from_slice(&self.transform.row(row).to_array());
        }
        InstanceRecord {
            transform,
            custom_index_and_mask: (self.instance_id & 0x00FF_FFFF) | (u32::from(self.mask) << 24),
            sbt_offset_and_flags: (self.sbt_offset & 0x00FF_FFFF)
                | ((self.flags.as_raw() & 0xFF) << 24),
            blas_address: self.blas_address,
        }
    }
}

/// Wire layout of `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 transform.
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, mask in the high 8.
    pub custom_index_and_mask: u32,
    /// SBT record offset in the low 24 bits, flags in the high 8.
    pub sbt_offset_and_flags: u32,
    /// BLAS device address.
    pub blas_address: u64,
}

/// How a top-level refresh is performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlasBuildMode {
    /// Build from scratch into a freshly sized result buffer.
    Rebuild,
    /// Refit in place, using the previous result as source.
    Update,
}

impl TlasBuildMode {
    /// Chooses between an in-place update and a full rebuild.
    ///
    /// An update is only possible when a previous result exists and its
    /// buffer holds at least `required` bytes.
    pub fn decide(previous_result_size: Option<vk::DeviceSize>, required: vk::DeviceSize) -> Self {
        match previous_result_size {
            Some(previous) if previous >= required => TlasBuildMode::Update,
            _ => TlasBuildMode::Rebuild,
        }
    }

    /// Chooses the mode for refreshing `count` instances that need
    /// `required` result bytes.
    ///
    /// Refitting requires the same instance count as the source build, so a
    /// first build or a changed count always rebuilds.
    pub fn for_refresh(
        previous_count: Option<usize>,
        count: usize,
        previous_result_size: Option<vk::DeviceSize>,
        required: vk::DeviceSize,
    ) -> Self {
        if previous_count != Some(count) {
            return TlasBuildMode::Rebuild;
        }
        Self::decide(previous_result_size, required)
    }

    /// Vulkan build mode.
    pub fn to_vk(self) -> vk::BuildAccelerationStructureModeKHR {
        match self {
            TlasBuildMode::Rebuild => vk::BuildAccelerationStructureModeKHR::BUILD,
            TlasBuildMode::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
        }
    }
}

/// Top-level acceleration structure.
///
/// Instance descriptions are written into one host-visible buffer per frame
/// slot, so writing the current frame's instances never races with a build
/// still reading an earlier frame's. Structures and scratch buffers replaced
/// by a rebuild are retired and only dropped after `frames_in_flight`
/// further refreshes.
pub struct Tlas {
    device: Arc<Device>,
    structure: Option<AccelerationStructure>,
    scratch: Option<GpuBuffer>,
    instance_buffers: Vec<Option<GpuBuffer>>,
    instance_count: Option<usize>,
    retired_structures: Vec<(usize, AccelerationStructure)>,
    retired_buffers: Vec<(usize, GpuBuffer)>,
    frames_in_flight: usize,
}

impl Tlas {
    /// Creates an empty TLAS for `frames_in_flight` frame slots.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::RayTracingUnsupported`] if ray tracing is not
    /// enabled on `device`.
    pub fn new(device: Arc<Device>, frames_in_flight: usize) -> RhiResult<Self> {
        device.rt_loaders()?;
        let slots = frames_in_flight.max(1);
        Ok(Self {
            device,
            structure: None,
            scratch: None,
            instance_buffers: (0..slots).map(|_| None).collect(),
            instance_count: None,
            retired_structures: Vec::new(),
            retired_buffers: Vec::new(),
            frames_in_flight: slots,
        })
    }

    /// Returns the current structure, if built.
    #[inline]
    pub fn structure(&self) -> Option<&AccelerationStructure> {
        self.structure.as_ref()
    }

    /// Returns the structure handle, or null before the first build.
    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.structure
            .as_ref()
            .map_or(vk::AccelerationStructureKHR::null(), |s| s.handle())
    }

    /// Records a build or in-place update for `instances` into `cmd`.
    ///
    /// `slot` selects the instance buffer; the caller must have waited for
    /// that slot's previous submission.
    ///
    /// # Returns
    ///
    /// The mode that was recorded.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AccelerationStructureError`] for an empty
    /// instance list or a zero result size.
    pub fn build_or_update(
        &mut self,
        cmd: &CommandBuffer,
        slot: usize,
        instances: &[TlasInstance],
    ) -> RhiResult<TlasBuildMode> {
        if instances.is_empty() {
            return Err(RhiError::AccelerationStructureError(
                "TLAS requires at least one instance".to_string(),
            ));
        }
        self.age_retired();

        let device = self.device.clone();
        let loaders = device.rt_loaders()?;
        let slot = slot % self.frames_in_flight;

        let records: Vec<InstanceRecord> = instances.iter().map(TlasInstance::to_record).collect();
        let instance_address = self.write_instances(slot, &records)?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_address,
            });
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            });

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(
                vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                    | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            )
            .geometries(std::slice::from_ref(&geometry));

        let instance_count = instances.len() as u32;
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        // SAFETY: `build_info` describes valid instance geometry.
        unsafe {
            loaders
                .acceleration_structure
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[instance_count],
                    &mut sizes,
                );
        }

        let previous_size = self.structure.as_ref().map(AccelerationStructure::size);
        let mode = TlasBuildMode::for_refresh(
            self.instance_count,
            instances.len(),
            previous_size,
            sizes.acceleration_structure_size,
        );

        if mode == TlasBuildMode::Rebuild {
            let structure = AccelerationStructure::new(
                &device,
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                sizes.acceleration_structure_size,
                "tlas",
            )?;
            if let Some(old) = self.structure.replace(structure) {
                self.retired_structures.push((0, old));
            }
        }

        let scratch_size = match mode {
            TlasBuildMode::Rebuild => sizes.build_scratch_size,
            TlasBuildMode::Update => sizes.update_scratch_size,
        };
        let scratch_too_small = self
            .scratch
            .as_ref()
            .is_none_or(|s| scratch_capacity(s) < scratch_size);
        if scratch_too_small {
            let scratch = create_scratch(&device, scratch_size.max(1), "tlas scratch")?;
            if let Some(old) = self.scratch.replace(scratch) {
                self.retired_buffers.push((0, old));
            }
        }

        let (Some(structure), Some(scratch)) = (self.structure.as_ref(), self.scratch.as_ref())
        else {
            return Err(RhiError::AccelerationStructureError(
                "TLAS storage missing after allocation".to_string(),
            ));
        };

        build_info = build_info
            .mode(mode.to_vk())
            .dst_acceleration_structure(structure.handle())
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address(scratch)?,
            });
        if mode == TlasBuildMode::Update {
            build_info = build_info.src_acceleration_structure(structure.handle());
        }
        let range =
            vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(instance_count);

        // Earlier frames may still trace against the structure or use the
        // scratch buffer.
        cmd.memory_barrier(
            (
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR
                    | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            ),
            structure_build(),
        );
        cmd.build_acceleration_structures(
            &loaders.acceleration_structure,
            std::slice::from_ref(&build_info),
            &[std::slice::from_ref(&range)],
        );
        cmd.memory_barrier(structure_build(), structure_readers());

        self.instance_count = Some(instances.len());

        debug!(
            ?mode,
            instances = instance_count,
            size = sizes.acceleration_structure_size,
            "TLAS refresh recorded"
        );
        Ok(mode)
    }

    fn write_instances(
        &mut self,
        slot: usize,
        records: &[InstanceRecord],
    ) -> RhiResult<vk::DeviceAddress> {
        let bytes: &[u8] = bytemuck::cast_slice(records);
        let needed = bytes.len() as vk::DeviceSize;

        let too_small = self.instance_buffers[slot]
            .as_ref()
            .is_none_or(|b| b.size() < needed);
        if too_small {
            // The slot's previous submission has completed, so the old
            // buffer can go right away.
            self.instance_buffers[slot] = Some(GpuBuffer::create(
                self.device.clone(),
                &BufferDesc {
                    size: needed,
                    heap: HeapClass::Upload,
                    usage: BufferUsage::Instances,
                    is_constant: false,
                    name: "tlas instances",
                },
            )?);
        }

        let Some(buffer) = self.instance_buffers[slot].as_mut() else {
            return Err(RhiError::AccelerationStructureError(
                "TLAS instance buffer missing".to_string(),
            ));
        };
        buffer.write(0, bytes)?;
        buffer.device_address()
    }

    fn age_retired(&mut self) {
        let limit = self.frames_in_flight;
        let before = self.retired_count();
        for (age, _) in &mut self.retired_structures {
            *age += 1;
        }
        for (age, _) in &mut self.retired_buffers {
            *age += 1;
        }
        self.retired_structures.retain(|(age, _)| *age <= limit);
        self.retired_buffers.retain(|(age, _)| *age <= limit);
        let dropped = before - self.retired_count();
        if dropped > 0 {
            debug!("Dropped {} retired TLAS resource(s)", dropped);
        }
    }

    /// Number of retired resources still waiting for in-flight frames.
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.retired_structures.len() + self.retired_buffers.len()
    }

    /// Drops retired resources immediately. Only valid once the queue has
    /// been drained.
    pub fn release_retired(&mut self) {
        self.retired_structures.clear();
        self.retired_buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_update_when_previous_is_large_enough() {
        assert_eq!(TlasBuildMode::decide(Some(1024), 1024), TlasBuildMode::Update);
        assert_eq!(TlasBuildMode::decide(Some(1024), 512), TlasBuildMode::Update);
    }

    #[test]
    fn test_rebuild_when_growing_or_first_build() {
        assert_eq!(TlasBuildMode::decide(Some(1024), 1025), TlasBuildMode::Rebuild);
        assert_eq!(TlasBuildMode::decide(None, 64), TlasBuildMode::Rebuild);
        assert_eq!(TlasBuildMode::decide(None, 0), TlasBuildMode::Rebuild);
    }

    #[test]
    fn test_refresh_refits_unchanged_instance_count() {
        assert_eq!(
            TlasBuildMode::for_refresh(Some(1), 1, Some(256), 256),
            TlasBuildMode::Update
        );
        assert_eq!(
            TlasBuildMode::for_refresh(Some(3), 3, Some(512), 384),
            TlasBuildMode::Update
        );
    }

    #[test]
    fn test_refresh_rebuilds_first_build_or_changed_count() {
        assert_eq!(TlasBuildMode::for_refresh(None, 1, None, 256), TlasBuildMode::Rebuild);
        // A larger previous result does not allow refitting a different count.
        assert_eq!(
            TlasBuildMode::for_refresh(Some(2), 1, Some(4096), 256),
            TlasBuildMode::Rebuild
        );
        assert_eq!(
            TlasBuildMode::for_refresh(Some(1), 1, Some(256), 512),
            TlasBuildMode::Rebuild
        );
    }

    #[test]
    fn test_mode_maps_to_vulkan() {
        assert_eq!(
            TlasBuildMode::Update.to_vk(),
            vk::BuildAccelerationStructureModeKHR::UPDATE
        );
        assert_eq!(
            TlasBuildMode::Rebuild.to_vk(),
            vk::BuildAccelerationStructureModeKHR::BUILD
        );
    }

    #[test]
    fn test_instance_record_matches_vulkan_layout() {
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 64);
        assert_eq!(
            std::mem::size_of::<InstanceRecord>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn test_instance_defaults() {
        let instance = TlasInstance::new(0xABCD_0000, Mat4::IDENTITY);
        let record = instance.to_record();

        assert_eq!(instance.instance_id, 0);
        assert_eq!(instance.mask, 1);
        assert_eq!(record.custom_index_and_mask, 1 << 24);
        assert_eq!(
            record.sbt_offset_and_flags >> 24,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(record.blas_address, 0xABCD_0000);
    }

    #[test]
    fn test_transform_is_row_major_3x4() {
        let instance = TlasInstance::new(0, Mat4::from_translation(Vec3::new(0.0, -1.0, 0.0)));
        let record = instance.to_record();
        assert_eq!(
            record.transform,
            [
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, -1.0, //
                0.0, 0.0, 1.0, 0.0,
            ]
        );
    }

    #[test]
    fn test_instance_id_is_truncated_to_24_bits() {
        let mut instance = TlasInstance::new(0, Mat4::IDENTITY);
        instance.instance_id = 0x0123_4567;
        instance.mask = 0xFF;
        let record = instance.to_record();
        assert_eq!(record.custom_index_and_mask, 0xFF23_4567);
    }

    #[test]
    fn test_repeated_refresh_refits_after_first_build() {
        use crate::buffer::BufferState;
        use crate::command::CommandPool;
        use crate::queue::{CommandQueue, SubmitBatch};

        let Some(ctx) = crate::test_support::headless_with(true) else {
            return;
        };
        if !ctx.device.ray_tracing().is_supported() {
            eprintln!("Skipping test: ray tracing not supported");
            return;
        }
        let device = ctx.device.clone();
        let mut queue = CommandQueue::new(device.clone()).expect("queue");
        let pool = CommandPool::new(device.clone(), device.queue_family()).expect("pool");
        let cmd = CommandBuffer::new(device.clone(), &pool).expect("command buffer");
        cmd.begin().expect("begin");

        let positions: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let indices: [u32; 3] = [0, 1, 2];
        let (vertices, vertex_staging) = GpuBuffer::create_and_upload_default(
            device.clone(),
            &cmd,
            bytemuck::cast_slice(&positions),
            BufferUsage::Vertex,
            BufferState::BuildInput,
            "triangle vertices",
        )
        .expect("vertices");
        let (index_buffer, index_staging) = GpuBuffer::create_and_upload_default(
            device.clone(),
            &cmd,
            bytemuck::cast_slice(&indices),
            BufferUsage::Index,
            BufferState::BuildInput,
            "triangle indices",
        )
        .expect("indices");
        let geometry = BlasGeometry {
            vertex_address: vertices.device_address().expect("vertex address"),
            vertex_stride: 12,
            vertex_count: 3,
            index_address: index_buffer.device_address().expect("index address"),
            index_count: 3,
        };
        let blas = Blas::build(&device, &cmd, &geometry, "triangle").expect("blas");

        let mut tlas = Tlas::new(device.clone(), 2).expect("tlas");
        let one = [TlasInstance::new(blas.address(), Mat4::IDENTITY)];
        let modes: Vec<TlasBuildMode> = (0..3)
            .map(|frame| tlas.build_or_update(&cmd, frame, &one).expect("refresh"))
            .collect();
        assert_eq!(
            modes,
            vec![
                TlasBuildMode::Rebuild,
                TlasBuildMode::Update,
                TlasBuildMode::Update
            ]
        );

        let two = [
            one[0],
            TlasInstance::new(blas.address(), Mat4::from_translation(Vec3::X)),
        ];
        assert_eq!(
            tlas.build_or_update(&cmd, 3, &two).expect("grow"),
            TlasBuildMode::Rebuild
        );
        assert_ne!(tlas.handle(), vk::AccelerationStructureKHR::null());

        cmd.end().expect("end");
        queue
            .submit(SubmitBatch {
                command_buffers: &[cmd.handle()],
                ..Default::default()
            })
            .expect("submit");
        queue.join().expect("join");
        drop((vertex_staging, index_staging));
    }
}
