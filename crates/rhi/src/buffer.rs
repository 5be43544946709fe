//! GPU buffer management.
//!
//! # Overview
//!
//! - [`HeapClass`] picks where the memory lives: [`HeapClass::Upload`] is
//!   CPU-writable and GPU-readable, [`HeapClass::Default`] is GPU-only,
//!   [`HeapClass::Readback`] is GPU-writable and CPU-readable
//! - [`BufferUsage`] says what the buffer is bound as
//! - [`GpuBuffer`] owns a `VkBuffer` and its `gpu-allocator` allocation
//! - [`GpuBuffer::create_and_upload_default`] fills a GPU-only buffer through
//!   a staging buffer and hands the staging buffer back as a
//!   [`StagingBuffer`], which must outlive the GPU copy
//! - [`UploadTracker`] keeps staging buffers alive until a fence value passes
//!
//! Constant buffers are padded to [`CONSTANT_BUFFER_ALIGNMENT`] bytes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderer_rhi::buffer::{BufferDesc, BufferState, BufferUsage, GpuBuffer, HeapClass, UploadTracker};
//! use renderer_rhi::command::CommandBuffer;
//! use renderer_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>, cmd: &CommandBuffer) -> Result<(), renderer_rhi::RhiError> {
//! let mut constants = GpuBuffer::create(device.clone(), &BufferDesc::constant("light", 44))?;
//! constants.write(0, &[0u8; 44])?;
//!
//! let mut uploads = UploadTracker::default();
//! let (vertices, staging) = GpuBuffer::create_and_upload_default(
//!     device,
//!     cmd,
//!     &[0u8; 1024],
//!     BufferUsage::Vertex,
//!     BufferState::VertexInput,
//!     "mesh vertices",
//! )?;
//! uploads.track(staging);
//! # Ok(())
//! # }
//! ```

use std::ops::Range;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, trace, warn};

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::queue::Timeline;

/// Size multiple required for constant (uniform) buffers.
pub const CONSTANT_BUFFER_ALIGNMENT: vk::DeviceSize = 256;

/// Rounds `size` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
pub const fn align_up(size: u64, alignment: u64) -> u64 {
    (size + alignment - 1) & !(alignment - 1)
}

/// Memory heap class of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapClass {
    /// CPU-writable, GPU-readable. Persistently mapped.
    Upload,
    /// GPU-only. Filled through copies.
    Default,
    /// GPU-writable, CPU-readable. Persistently mapped.
    Readback,
}

impl HeapClass {
    /// Returns the allocator memory location for this heap.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            HeapClass::Upload => MemoryLocation::CpuToGpu,
            HeapClass::Default => MemoryLocation::GpuOnly,
            HeapClass::Readback => MemoryLocation::GpuToCpu,
        }
    }

    /// Returns `true` if the CPU can map buffers of this class.
    #[inline]
    pub fn is_host_visible(self) -> bool {
        !matches!(self, HeapClass::Default)
    }
}

/// Buffer usage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Vertex data, also readable from ray-tracing shaders.
    Vertex,
    /// 32-bit index data, also readable from ray-tracing shaders.
    Index,
    /// Constant data, bound directly or through a descriptor table view.
    Constant,
    /// General storage.
    Storage,
    /// Source of a copy.
    Staging,
    /// Destination of a copy read back by the CPU.
    Readback,
    /// Acceleration structure storage.
    AccelerationStructure,
    /// Scratch memory for acceleration structure builds.
    Scratch,
    /// Instance descriptions for a top-level build.
    Instances,
    /// Shader binding table records.
    ShaderBindingTable,
}

impl BufferUsage {
    /// Converts to Vulkan usage flags.
    ///
    /// Ray-tracing related flags are only added when `ray_tracing` is true,
    /// since they require the corresponding extensions to be enabled.
    pub fn to_vk_usage(self, ray_tracing: bool) -> vk::BufferUsageFlags {
        let address = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let build_input = if ray_tracing {
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR | address
        } else {
            vk::BufferUsageFlags::empty()
        };

        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | build_input
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | build_input
            }
            BufferUsage::Constant => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER
            }
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::Readback => vk::BufferUsageFlags::TRANSFER_DST,
            BufferUsage::AccelerationStructure => {
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | address
            }
            BufferUsage::Scratch => vk::BufferUsageFlags::STORAGE_BUFFER | address,
            BufferUsage::Instances => build_input | address,
            BufferUsage::ShaderBindingTable => {
                vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | address
            }
        }
    }

    /// Returns `true` if buffers of this usage need a device address.
    pub fn needs_device_address(self, ray_tracing: bool) -> bool {
        self.to_vk_usage(ray_tracing)
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
    }

    /// Returns a short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Constant => "constant",
            BufferUsage::Storage => "storage",
            BufferUsage::Staging => "staging",
            BufferUsage::Readback => "readback",
            BufferUsage::AccelerationStructure => "acceleration structure",
            BufferUsage::Scratch => "scratch",
            BufferUsage::Instances => "instances",
            BufferUsage::ShaderBindingTable => "shader binding table",
        }
    }
}

/// How the GPU accesses a buffer after a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Destination of a transfer.
    CopyDest,
    /// Source of a transfer.
    CopySource,
    /// Bound as vertex buffer (and readable by ray-tracing shaders).
    VertexInput,
    /// Bound as index buffer (and readable by ray-tracing shaders).
    IndexInput,
    /// Read by shaders as constant or storage data.
    ShaderRead,
    /// Read as acceleration structure build input.
    BuildInput,
    /// Read by the host after GPU writes.
    HostRead,
}

impl BufferState {
    /// Returns the pipeline stages and access mask of this state.
    pub fn stage_access(self) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        match self {
            BufferState::CopyDest => (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            BufferState::CopySource => (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            BufferState::VertexInput => (
                vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT
                    | vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ | vk::AccessFlags2::SHADER_READ,
            ),
            BufferState::IndexInput => (
                vk::PipelineStageFlags2::INDEX_INPUT | vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::INDEX_READ | vk::AccessFlags2::SHADER_READ,
            ),
            BufferState::ShaderRead => (
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::UNIFORM_READ,
            ),
            BufferState::BuildInput => (
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::SHADER_READ,
            ),
            BufferState::HostRead => (vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ),
        }
    }
}

/// Parameters for [`GpuBuffer::create`].
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    /// Logical size in bytes.
    pub size: vk::DeviceSize,
    /// Heap class.
    pub heap: HeapClass,
    /// Usage.
    pub usage: BufferUsage,
    /// Pad the allocation to [`CONSTANT_BUFFER_ALIGNMENT`].
    pub is_constant: bool,
    /// Debug name used in logs and allocator reports.
    pub name: &'a str,
}

impl<'a> BufferDesc<'a> {
    /// Upload-heap constant buffer of `size` logical bytes.
    pub fn constant(name: &'a str, size: vk::DeviceSize) -> Self {
        Self {
            size,
            heap: HeapClass::Upload,
            usage: BufferUsage::Constant,
            is_constant: true,
            name,
        }
    }

    /// Size the buffer is actually created with.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AllocationFailed`] for a zero size.
    pub fn padded_size(&self) -> RhiResult<vk::DeviceSize> {
        if self.size == 0 {
            return Err(RhiError::AllocationFailed(format!(
                "buffer '{}' requested with size 0",
                self.name
            )));
        }
        Ok(if self.is_constant {
            align_up(self.size, CONSTANT_BUFFER_ALIGNMENT)
        } else {
            self.size
        })
    }
}

/// GPU buffer with allocator-managed memory.
///
/// # Thread Safety
///
/// Writes take `&mut self`. Share between threads only behind external
/// synchronization.
pub struct GpuBuffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    padded_size: vk::DeviceSize,
    heap: HeapClass,
    usage: BufferUsage,
    address: Option<vk::DeviceAddress>,
    mapped: bool,
    name: String,
}

impl GpuBuffer {
    /// Creates a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AllocationFailed`] for a zero size or when the
    /// allocator is out of memory.
    pub fn create(device: Arc<Device>, desc: &BufferDesc<'_>) -> RhiResult<Self> {
        let padded_size = desc.padded_size()?;
        let ray_tracing = device.ray_tracing().is_supported();

        let buffer_info = vk::BufferCreateInfo::default()
            .size(padded_size)
            .usage(desc.usage.to_vk_usage(ray_tracing))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the create info is fully initialised.
        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };
        // SAFETY: `buffer` was just created on this device.
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().and_then(|mut allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.name,
                    requirements,
                    location: desc.heap.memory_location(),
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| RhiError::AllocationFailed(format!("buffer '{}': {e}", desc.name)))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: the buffer has no memory bound and is not in use.
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        // SAFETY: the allocation satisfies the buffer's requirements.
        unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        let address = desc
            .usage
            .needs_device_address(ray_tracing)
            .then(|| device.buffer_address(buffer));

        debug!(
            "Created {} buffer '{}': {} bytes ({} padded, {:?})",
            desc.usage.name(),
            desc.name,
            desc.size,
            padded_size,
            desc.heap
        );

        Ok(Self {
            device,
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            padded_size,
            heap: desc.heap,
            usage: desc.usage,
            address,
            mapped: false,
            name: desc.name.to_string(),
        })
    }

    /// Creates a GPU-only buffer filled with `data` through a staging copy.
    ///
    /// Records into `cmd`:
    /// 1. a copy from a fresh upload-heap staging buffer into the new buffer
    /// 2. a barrier moving the new buffer from copy destination to `final_state`
    ///
    /// # Returns
    ///
    /// The destination buffer and the staging buffer. The staging buffer
    /// must stay alive until the GPU has executed `cmd`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AllocationFailed`] if `data` is empty or either
    /// allocation fails.
    pub fn create_and_upload_default(
        device: Arc<Device>,
        cmd: &CommandBuffer,
        data: &[u8],
        usage: BufferUsage,
        final_state: BufferState,
        name: &str,
    ) -> RhiResult<(GpuBuffer, StagingBuffer)> {
        let size = data.len() as vk::DeviceSize;

        let destination = GpuBuffer::create(
            device.clone(),
            &BufferDesc {
                size,
                heap: HeapClass::Default,
                usage,
                is_constant: false,
                name,
            },
        )?;

        let staging_name = format!("{name} (staging)");
        let mut staging = GpuBuffer::create(
            device,
            &BufferDesc {
                size,
                heap: HeapClass::Upload,
                usage: BufferUsage::Staging,
                is_constant: false,
                name: &staging_name,
            },
        )?;

        let mapped = staging.map().ok_or_else(|| {
            RhiError::AllocationFailed(format!("staging buffer for '{name}' is not mappable"))
        })?;
        mapped[..data.len()].copy_from_slice(data);
        staging.unmap(Some(0..data.len()))?;

        cmd.copy_buffer(
            staging.handle(),
            destination.handle(),
            &[vk::BufferCopy::default().size(size)],
        );
        cmd.buffer_barrier(&destination, BufferState::CopyDest, final_state);

        trace!("Recorded upload of {} bytes into '{}'", size, name);

        Ok((destination, StagingBuffer::from_buffer(staging)))
    }

    /// Returns the mapped bytes of a host-visible buffer.
    ///
    /// Mapping a [`HeapClass::Default`] buffer is a programming error: it is
    /// logged and `None` is returned.
    pub fn map(&mut self) -> Option<&mut [u8]> {
        if !self.heap.is_host_visible() {
            warn!("Attempted to map default-heap buffer '{}'", self.name);
            return None;
        }
        let padded = self.padded_size as usize;
        let slice = self.allocation.as_mut()?.mapped_slice_mut()?;
        self.mapped = true;
        Some(&mut slice[..padded])
    }

    /// Ends a CPU write window started with [`GpuBuffer::map`].
    ///
    /// `written` limits the flush to the given byte range; `None` flushes the
    /// whole buffer. Flushing only happens for non-coherent memory.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn unmap(&mut self, written: Option<Range<usize>>) -> RhiResult<()> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;

        let Some(allocation) = self.allocation.as_ref() else {
            return Ok(());
        };
        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }

        let range = written.unwrap_or(0..self.padded_size as usize);
        if range.is_empty() {
            return Ok(());
        }
        let atom = self.device.properties().limits.non_coherent_atom_size.max(1);
        let start = allocation.offset() + range.start as u64;
        let aligned_start = start / atom * atom;
        let end = align_up(allocation.offset() + range.end as u64, atom).min(
            allocation.offset() + align_up(allocation.size(), atom),
        );
        // SAFETY: the memory object outlives this call; only its handle is read.
        let memory = unsafe { allocation.memory() };
        let flush = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(aligned_start)
            .size(end - aligned_start);

        // SAFETY: the range lies inside this allocation's mapped memory.
        unsafe { self.device.handle().flush_mapped_memory_ranges(&[flush])? };
        Ok(())
    }

    /// Copies `data` into the buffer at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not host-visible or the write would
    /// pass the padded size.
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as vk::DeviceSize;
        if end > self.padded_size {
            return Err(RhiError::InvalidHandle(format!(
                "write of {} bytes at {} exceeds buffer '{}' ({} bytes)",
                data.len(),
                offset,
                self.name,
                self.padded_size
            )));
        }
        let name = self.name.clone();
        let mapped = self
            .map()
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer '{name}' is not mappable")))?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        self.unmap(Some(offset as usize..end as usize))
    }

    /// Writes a plain-old-data value at `offset`.
    ///
    /// # Errors
    ///
    /// Same as [`GpuBuffer::write`].
    pub fn write_pod<T: bytemuck::Pod>(
        &mut self,
        offset: vk::DeviceSize,
        value: &T,
    ) -> RhiResult<()> {
        self.write(offset, bytemuck::bytes_of(value))
    }

    /// Returns a copy of the buffer contents of a readback buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not host-visible.
    pub fn read_bytes(&self) -> RhiResult<Vec<u8>> {
        let slice = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!("buffer '{}' is not mappable", self.name))
            })?;
        Ok(slice[..self.size as usize].to_vec())
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Returns the logical size in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Returns the allocated size in bytes (constant buffers are padded).
    #[inline]
    pub fn padded_size(&self) -> vk::DeviceSize {
        self.padded_size
    }

    /// Returns the heap class.
    #[inline]
    pub fn heap(&self) -> HeapClass {
        self.heap
    }

    /// Returns the usage.
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Returns the GPU virtual address.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidHandle`] for buffers created without
    /// device-address usage.
    pub fn device_address(&self) -> RhiResult<vk::DeviceAddress> {
        self.address.ok_or_else(|| {
            RhiError::InvalidHandle(format!("buffer '{}' has no device address", self.name))
        })
    }

    /// Returns the debug name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            match self.device.allocator() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        tracing::error!("Failed to free buffer allocation: {:?}", e);
                    }
                }
                Err(e) => tracing::error!("Leaking buffer allocation: {}", e),
            }
        }

        // SAFETY: owners guarantee the GPU no longer uses the buffer.
        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }

        debug!("Destroyed {} buffer '{}'", self.usage.name(), self.name);
    }
}

/// Upload-heap buffer whose contents a recorded copy still reads.
///
/// Dropping it before the copy has executed on the GPU is a use-after-free
/// on the device. Keep it in an [`UploadTracker`] until the submission's
/// fence value is reached.
#[must_use = "staging buffers must outlive the GPU copy that reads them"]
pub struct StagingBuffer(GpuBuffer);

impl StagingBuffer {
    pub(crate) fn from_buffer(buffer: GpuBuffer) -> Self {
        Self(buffer)
    }

    /// Returns the underlying buffer.
    #[inline]
    pub fn buffer(&self) -> &GpuBuffer {
        &self.0
    }
}

/// Keeps staging buffers alive until their upload has completed.
#[derive(Default)]
pub struct UploadTracker {
    pending: Vec<StagingBuffer>,
}

impl UploadTracker {
    /// Takes ownership of a staging buffer.
    pub fn track(&mut self, staging: StagingBuffer) {
        self.pending.push(staging);
    }

    /// Number of staging buffers still held.
    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` when nothing is held.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Waits for `fence_value` and then releases every held buffer.
    ///
    /// # Errors
    ///
    /// Returns an error (and keeps the buffers) if waiting fails.
    pub fn release_after(&mut self, timeline: &impl Timeline, fence_value: u64) -> RhiResult<()> {
        timeline.wait_for(fence_value)?;
        let released = self.pending.len();
        self.pending.clear();
        debug!("Released {} staging buffer(s)", released);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::queue::{CommandQueue, SubmitBatch};

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(44, 16), 48);
    }

    #[test]
    fn test_constant_sizes_are_padded() {
        for size in [1u64, 4, 128, 255, 256, 257, 4096, 5000] {
            let padded = BufferDesc::constant("test", size).padded_size().unwrap();
            assert!(padded >= size);
            assert_eq!(padded % CONSTANT_BUFFER_ALIGNMENT, 0);
            assert!(padded - size < CONSTANT_BUFFER_ALIGNMENT);
        }
    }

    #[test]
    fn test_non_constant_sizes_are_exact() {
        let desc = BufferDesc {
            size: 300,
            heap: HeapClass::Default,
            usage: BufferUsage::Vertex,
            is_constant: false,
            name: "vb",
        };
        assert_eq!(desc.padded_size().unwrap(), 300);
    }

    #[test]
    fn test_zero_size_fails() {
        let desc = BufferDesc::constant("empty", 0);
        assert!(matches!(
            desc.padded_size(),
            Err(RhiError::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_heap_class_memory_location() {
        assert_eq!(HeapClass::Upload.memory_location(), MemoryLocation::CpuToGpu);
        assert_eq!(HeapClass::Default.memory_location(), MemoryLocation::GpuOnly);
        assert_eq!(HeapClass::Readback.memory_location(), MemoryLocation::GpuToCpu);
        assert!(!HeapClass::Default.is_host_visible());
    }

    #[test]
    fn test_ray_tracing_flags_only_when_enabled() {
        let rt = BufferUsage::Vertex.to_vk_usage(true);
        let raster = BufferUsage::Vertex.to_vk_usage(false);
        let build_input = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        assert!(rt.contains(build_input));
        assert!(!raster.contains(build_input));
        assert!(raster.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(BufferUsage::ShaderBindingTable.needs_device_address(true));
        assert!(!BufferUsage::Constant.needs_device_address(true));
    }

    #[test]
    fn test_constant_buffers_can_back_table_views() {
        let usage = BufferUsage::Constant.to_vk_usage(false);
        assert!(usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn test_partial_writes_reach_mapped_memory() {
        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        let mut buffer = GpuBuffer::create(ctx.device.clone(), &BufferDesc::constant("writes", 80))
            .expect("buffer");
        let words: [u32; 4] = [1, 2, 3, 4];
        buffer.write_pod(64, &words).expect("write at offset");
        buffer.write(0, &[0xAB; 8]).expect("write at start");
        let mapped = buffer.map().expect("upload heap is mappable");
        mapped[8..12].copy_from_slice(&[7; 4]);
        buffer.unmap(None).expect("flush whole buffer");

        let bytes = buffer.read_bytes().expect("read");
        assert_eq!(bytes.len(), 80);
        assert_eq!(&bytes[..8], &[0xAB; 8]);
        assert_eq!(&bytes[8..12], &[7; 4]);
        assert_eq!(&bytes[64..80], bytemuck::bytes_of(&words));
    }

    #[test]
    fn test_upload_round_trip() {
        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        let device = ctx.device.clone();
        let mut queue = CommandQueue::new(device.clone()).expect("queue");
        let pool = CommandPool::new(device.clone(), device.queue_family()).expect("pool");

        for size in [1usize, 4, 256, 4096] {
            let data: Vec<u8> = (0..size).map(|i| (i * 7 + 3) as u8).collect();
            let cmd = CommandBuffer::new(device.clone(), &pool).expect("command buffer");
            cmd.begin().expect("begin");

            let (gpu, staging) = GpuBuffer::create_and_upload_default(
                device.clone(),
                &cmd,
                &data,
                BufferUsage::Storage,
                BufferState::CopySource,
                "round trip",
            )
            .expect("upload");

            let readback = GpuBuffer::create(
                device.clone(),
                &BufferDesc {
                    size: size as u64,
                    heap: HeapClass::Readback,
                    usage: BufferUsage::Readback,
                    is_constant: false,
                    name: "readback",
                },
            )
            .expect("readback buffer");
            cmd.copy_buffer(
                gpu.handle(),
                readback.handle(),
                &[vk::BufferCopy::default().size(size as u64)],
            );
            cmd.buffer_barrier(&readback, BufferState::CopyDest, BufferState::HostRead);
            cmd.end().expect("end");

            let mut uploads = UploadTracker::default();
            uploads.track(staging);
            let value = queue
                .submit(SubmitBatch {
                    command_buffers: &[cmd.handle()],
                    ..Default::default()
                })
                .expect("submit");
            uploads.release_after(&queue, value).expect("wait");
            assert!(uploads.is_empty());

            assert_eq!(readback.read_bytes().expect("read"), data, "size {size}");
        }
    }

    #[test]
    fn test_map_default_heap_returns_none() {
        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        let mut buffer = GpuBuffer::create(
            ctx.device.clone(),
            &BufferDesc {
                size: 64,
                heap: HeapClass::Default,
                usage: BufferUsage::Storage,
                is_constant: false,
                name: "gpu only",
            },
        )
        .expect("buffer");
        assert!(buffer.map().is_none());
        assert!(buffer.write(0, &[1, 2, 3]).is_err());
    }
}
