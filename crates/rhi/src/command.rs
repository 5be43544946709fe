//! Command pools, command buffers and per-frame recording contexts.
//!
//! # Overview
//!
//! - [`CommandPool`] allocates command buffers for one queue family
//! - [`CommandBuffer`] records commands; every method is a thin wrapper over
//!   one `vkCmd*` call
//! - [`CommandContext`] pairs a pool with one primary buffer. Each frame slot
//!   owns one, so resetting it never touches work still in flight for
//!   another slot
//!
//! Barriers use synchronization2 and are expressed in terms of
//! [`ImageState`] and [`BufferState`] rather than raw layouts and masks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderer_rhi::command::CommandContext;
//! use renderer_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> Result<(), renderer_rhi::RhiError> {
//! let context = CommandContext::new(device, "frame 0")?;
//! context.reset()?;
//! let cmd = context.command_buffer();
//! cmd.begin()?;
//! // ... record ...
//! cmd.end()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::buffer::{BufferState, GpuBuffer};
use crate::device::Device;
use crate::error::RhiResult;
use crate::image::{ImageState, full_range};

/// Vulkan command pool wrapper.
///
/// # Thread Safety
///
/// Command pools are externally synchronized; record from one thread per pool.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    queue_family_index: u32,
}

impl CommandPool {
    /// Creates a pool whose buffers can be reset individually.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(device: Arc<Device>, queue_family_index: u32) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        // SAFETY: the device is valid and the family index came from it.
        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };

        debug!("Command pool created for queue family {}", queue_family_index);

        Ok(Self {
            device,
            pool,
            queue_family_index,
        })
    }

    /// Returns the pool handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Returns the queue family index.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Allocates one primary command buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        // SAFETY: the pool is valid; exactly one buffer is requested.
        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        Ok(buffers[0])
    }

    /// Resets every buffer allocated from this pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        // SAFETY: callers only reset once the pool's submissions completed.
        unsafe {
            self.device
                .handle()
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // SAFETY: the pool's buffers are no longer executing at drop time.
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!(
            "Command pool destroyed for queue family {}",
            self.queue_family_index
        );
    }
}

/// Vulkan command buffer wrapper.
///
/// Does not own the handle; it is freed with its [`CommandPool`].
pub struct CommandBuffer {
    device: Arc<Device>,
    buffer: vk::CommandBuffer,
}

impl CommandBuffer {
    /// Allocates a command buffer from `pool`.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn new(device: Arc<Device>, pool: &CommandPool) -> RhiResult<Self> {
        let buffer = pool.allocate_command_buffer()?;
        Ok(Self { device, buffer })
    }

    /// Returns the raw command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Returns the device the buffer records for.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins one-time-submit recording.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is already recording.
    pub fn begin(&self) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        // SAFETY: the buffer is in the initial state.
        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }
        Ok(())
    }

    /// Ends recording ("close" the list).
    ///
    /// # Errors
    ///
    /// Returns an error if recording produced an invalid buffer.
    pub fn end(&self) -> RhiResult<()> {
        // SAFETY: the buffer is recording.
        unsafe {
            self.device.handle().end_command_buffer(self.buffer)?;
        }
        Ok(())
    }

    // =========================================================================
    // Dynamic Rendering
    // =========================================================================

    /// Begins dynamic rendering.
    pub fn begin_rendering(&self, rendering_info: &vk::RenderingInfo) {
        // SAFETY: attachments referenced by `rendering_info` are alive.
        unsafe {
            self.device
                .handle()
                .cmd_begin_rendering(self.buffer, rendering_info);
        }
    }

    /// Ends dynamic rendering.
    pub fn end_rendering(&self) {
        // SAFETY: matched with `begin_rendering`.
        unsafe {
            self.device.handle().cmd_end_rendering(self.buffer);
        }
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Binds a pipeline.
    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        // SAFETY: the pipeline outlives the submission.
        unsafe {
            self.device
                .handle()
                .cmd_bind_pipeline(self.buffer, bind_point, pipeline);
        }
    }

    /// Binds one vertex buffer at binding 0.
    pub fn bind_vertex_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: the buffer outlives the submission.
        unsafe {
            self.device
                .handle()
                .cmd_bind_vertex_buffers(self.buffer, 0, &[buffer], &[0]);
        }
    }

    /// Binds a 32-bit index buffer.
    pub fn bind_index_buffer_u32(&self, buffer: vk::Buffer) {
        // SAFETY: the buffer outlives the submission.
        unsafe {
            self.device
                .handle()
                .cmd_bind_index_buffer(self.buffer, buffer, 0, vk::IndexType::UINT32);
        }
    }

    /// Binds descriptor sets.
    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: the sets were written before recording and outlive it.
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                self.buffer,
                bind_point,
                layout,
                first_set,
                descriptor_sets,
                &[],
            );
        }
    }

    /// Writes push constants at offset 0 of `layout`'s range for `stages`.
    pub fn push_constants<T: bytemuck::Pod>(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        value: &T,
    ) {
        // SAFETY: the layout declares a range of at least `size_of::<T>()`
        // bytes at offset 0 for `stages`.
        unsafe {
            self.device.handle().cmd_push_constants(
                self.buffer,
                layout,
                stages,
                0,
                bytemuck::bytes_of(value),
            );
        }
    }

    // =========================================================================
    // Dynamic State
    // =========================================================================

    /// Sets viewport 0 covering `extent`, depth range 0..1.
    pub fn set_viewport(&self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        // SAFETY: the bound pipeline declares a dynamic viewport.
        unsafe {
            self.device
                .handle()
                .cmd_set_viewport(self.buffer, 0, &[viewport]);
        }
    }

    /// Sets scissor 0 covering `extent`.
    pub fn set_scissor(&self, extent: vk::Extent2D) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        // SAFETY: the bound pipeline declares a dynamic scissor.
        unsafe {
            self.device
                .handle()
                .cmd_set_scissor(self.buffer, 0, &[scissor]);
        }
    }

    // =========================================================================
    // Draw
    // =========================================================================

    /// Records an indexed draw.
    pub fn draw_indexed(&self, index_count: u32, instance_count: u32) {
        // SAFETY: pipeline, vertex and index buffers are bound.
        unsafe {
            self.device
                .handle()
                .cmd_draw_indexed(self.buffer, index_count, instance_count, 0, 0, 0);
        }
    }

    // =========================================================================
    // Ray Tracing
    // =========================================================================

    /// Records acceleration structure builds.
    pub fn build_acceleration_structures(
        &self,
        loader: &ash::khr::acceleration_structure::Device,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        // SAFETY: every buffer address in `infos` refers to a live buffer.
        unsafe {
            loader.cmd_build_acceleration_structures(self.buffer, infos, ranges);
        }
    }

    /// Dispatches a `width` x `height` grid of rays.
    pub fn trace_rays(
        &self,
        loader: &ash::khr::ray_tracing_pipeline::Device,
        regions: &ShaderTableRegions,
        width: u32,
        height: u32,
    ) {
        // SAFETY: a ray-tracing pipeline and its descriptor sets are bound.
        unsafe {
            loader.cmd_trace_rays(
                self.buffer,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                width,
                height,
                1,
            );
        }
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Records an image layout transition between two states.
    pub fn transition_image(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        from: ImageState,
        to: ImageState,
    ) {
        let (src_stage, src_access) = from.stage_access();
        let (dst_stage, dst_access) = to.stage_access();
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(from.layout())
            .new_layout(to.layout())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(full_range(aspect));
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: the image outlives the submission.
        unsafe {
            self.device
                .handle()
                .cmd_pipeline_barrier2(self.buffer, &dependency);
        }
    }

    /// Records a buffer barrier between two access states.
    pub fn buffer_barrier(&self, buffer: &GpuBuffer, from: BufferState, to: BufferState) {
        let (src_stage, src_access) = from.stage_access();
        let (dst_stage, dst_access) = to.stage_access();
        let barrier = vk::BufferMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.handle())
            .offset(0)
            .size(vk::WHOLE_SIZE);
        let dependency =
            vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: the buffer outlives the submission.
        unsafe {
            self.device
                .handle()
                .cmd_pipeline_barrier2(self.buffer, &dependency);
        }
    }

    /// Records a global memory barrier.
    pub fn memory_barrier(
        &self,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    ) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src.0)
            .src_access_mask(src.1)
            .dst_stage_mask(dst.0)
            .dst_access_mask(dst.1);
        let dependency =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: a global barrier references no resources.
        unsafe {
            self.device
                .handle()
                .cmd_pipeline_barrier2(self.buffer, &dependency);
        }
    }

    // =========================================================================
    // Copy and Clear
    // =========================================================================

    /// Copies data between buffers.
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        // SAFETY: both buffers outlive the submission.
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(self.buffer, src, dst, regions);
        }
    }

    /// Copies a buffer into an image.
    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: both resources outlive the submission.
        unsafe {
            self.device.handle().cmd_copy_buffer_to_image(
                self.buffer,
                src,
                dst,
                dst_layout,
                regions,
            );
        }
    }

    /// Copies a whole color image of `extent` into another of the same size,
    /// converting formats (for example a UNORM storage image into an sRGB
    /// swapchain image).
    pub fn blit_image(&self, src: vk::Image, dst: vk::Image, extent: vk::Extent2D) {
        let layers = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .layer_count(1);
        let corner = vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let region = vk::ImageBlit::default()
            .src_subresource(layers)
            .src_offsets([vk::Offset3D::default(), corner])
            .dst_subresource(layers)
            .dst_offsets([vk::Offset3D::default(), corner]);
        // SAFETY: `src` is in TRANSFER_SRC and `dst` in TRANSFER_DST layout,
        // and both are at least `extent` in size.
        unsafe {
            self.device.handle().cmd_blit_image(
                self.buffer,
                src,
                ImageState::CopySource.layout(),
                dst,
                ImageState::CopyDest.layout(),
                &[region],
                vk::Filter::NEAREST,
            );
        }
    }

    /// Clears a color image that is in [`ImageState::CopyDest`].
    pub fn clear_color_image(&self, image: vk::Image, color: [f32; 4]) {
        let clear = vk::ClearColorValue { float32: color };
        // SAFETY: the image is in TRANSFER_DST layout.
        unsafe {
            self.device.handle().cmd_clear_color_image(
                self.buffer,
                image,
                ImageState::CopyDest.layout(),
                &clear,
                &[full_range(vk::ImageAspectFlags::COLOR)],
            );
        }
    }
}

/// Device address regions of the four shader tables for `vkCmdTraceRaysKHR`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShaderTableRegions {
    /// Ray generation record.
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    /// Miss records, indexed by ray type.
    pub miss: vk::StridedDeviceAddressRegionKHR,
    /// Hit group records, indexed by ray type.
    pub hit: vk::StridedDeviceAddressRegionKHR,
    /// Callable records (unused, empty).
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Command pool plus one primary command buffer.
///
/// Plays the role of a per-frame allocator and list pair.
pub struct CommandContext {
    // Buffer before pool: the buffer handle dies with the pool.
    command_buffer: CommandBuffer,
    pool: CommandPool,
    name: String,
}

impl CommandContext {
    /// Creates a pool on the device's graphics family and one buffer in it.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation or allocation fails.
    pub fn new(device: Arc<Device>, name: &str) -> RhiResult<Self> {
        let pool = CommandPool::new(device.clone(), device.queue_family())?;
        let command_buffer = CommandBuffer::new(device, &pool)?;
        debug!("Command context '{}' created", name);
        Ok(Self {
            command_buffer,
            pool,
            name: name.to_string(),
        })
    }

    /// Resets the pool, returning the buffer to the initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails. Callers must only reset once the
    /// previous submission from this context has completed.
    pub fn reset(&self) -> RhiResult<()> {
        self.pool.reset()
    }

    /// Returns the command buffer.
    #[inline]
    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.command_buffer
    }

    /// Returns the context name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_types_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer>();
        assert_send::<CommandPool>();
        assert_send::<CommandContext>();
    }

    #[test]
    fn test_default_regions_are_empty() {
        let regions = ShaderTableRegions::default();
        assert_eq!(regions.callable.size, 0);
        assert_eq!(regions.raygen.device_address, 0);
    }

    #[test]
    fn test_context_records_empty_buffer() {
        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        let context = CommandContext::new(ctx.device.clone(), "test").expect("context");
        let cmd = context.command_buffer();
        cmd.begin().expect("begin");
        cmd.end().expect("end");
        context.reset().expect("reset");
        cmd.begin().expect("begin after reset");
        cmd.end().expect("end after reset");
    }
}
