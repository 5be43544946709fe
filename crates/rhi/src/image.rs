//! GPU images, resource states and samplers.
//!
//! # Overview
//!
//! - [`ImageState`] names the handful of states an image moves through in
//!   this renderer and maps each to a Vulkan layout, stage and access mask
//! - [`Image2D`] owns a 2D image, its allocation and a default view, and
//!   tracks its current [`ImageState`] so transitions are recorded only when
//!   the state actually changes
//! - [`Sampler`] owns a `VkSampler`
//!
//! Images created here cover the sampled texture, the depth target and the
//! ray-tracing output. Swapchain images are not owned here; their states are
//! tracked by the frame renderer.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::debug;

use crate::buffer::{BufferDesc, BufferUsage, GpuBuffer, HeapClass, StagingBuffer};
use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Resource state of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageState {
    /// Contents are undefined and may be discarded.
    Undefined,
    /// Owned by the presentation engine.
    Present,
    /// Bound as color attachment.
    RenderTarget,
    /// Bound as depth attachment.
    DepthTarget,
    /// Source of a transfer.
    CopySource,
    /// Destination of a transfer or clear.
    CopyDest,
    /// Read and written by shaders as a storage image.
    UnorderedAccess,
    /// Sampled by shaders.
    ShaderResource,
}

impl ImageState {
    /// Returns the Vulkan image layout for this state.
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ImageState::Undefined => vk::ImageLayout::UNDEFINED,
            ImageState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            ImageState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageState::DepthTarget => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            ImageState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageState::UnorderedAccess => vk::ImageLayout::GENERAL,
            ImageState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Returns the stages and accesses that use an image in this state.
    pub fn stage_access(self) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        match self {
            ImageState::Undefined => (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE),
            ImageState::Present => (
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            ),
            ImageState::RenderTarget => (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE | vk::AccessFlags2::COLOR_ATTACHMENT_READ,
            ),
            ImageState::DepthTarget => (
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            ),
            ImageState::CopySource => (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            ImageState::CopyDest => (
                vk::PipelineStageFlags2::TRANSFER | vk::PipelineStageFlags2::CLEAR,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            ImageState::UnorderedAccess => (
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR
                    | vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
            ImageState::ShaderResource => (
                vk::PipelineStageFlags2::FRAGMENT_SHADER
                    | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            ),
        }
    }
}

/// Parameters for [`Image2D::new`].
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc<'a> {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: vk::Format,
    /// Usage flags.
    pub usage: vk::ImageUsageFlags,
    /// Aspect of the default view.
    pub aspect: vk::ImageAspectFlags,
    /// Debug name.
    pub name: &'a str,
}

/// GPU-only 2D image with a default view and a tracked state.
pub struct Image2D {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    extent: vk::Extent2D,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    state: ImageState,
    name: String,
}

impl Image2D {
    /// Creates an image in [`ImageState::Undefined`].
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AllocationFailed`] for a zero extent or when
    /// memory allocation fails.
    pub fn new(device: Arc<Device>, desc: &ImageDesc<'_>) -> RhiResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::AllocationFailed(format!(
                "image '{}' requested with extent {}x{}",
                desc.name, desc.width, desc.height
            )));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: the create info is fully initialised.
        let image = unsafe { device.handle().create_image(&image_info, None)? };
        // SAFETY: `image` was just created on this device.
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = device.allocator().and_then(|mut allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.name,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| RhiError::AllocationFailed(format!("image '{}': {e}", desc.name)))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: no memory is bound and the image is unused.
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e);
            }
        };

        // SAFETY: the allocation satisfies the image's requirements.
        unsafe {
            device
                .handle()
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(full_range(desc.aspect));
        // SAFETY: `image` is bound to memory and matches the view format.
        let view = unsafe { device.handle().create_image_view(&view_info, None)? };

        debug!(
            "Created image '{}' {}x{} {:?}",
            desc.name, desc.width, desc.height, desc.format
        );

        Ok(Self {
            device,
            image,
            view,
            allocation: Some(allocation),
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            format: desc.format,
            aspect: desc.aspect,
            state: ImageState::Undefined,
            name: desc.name.to_string(),
        })
    }

    /// Creates a sampled RGBA8 texture and records its upload.
    ///
    /// The texture ends in [`ImageState::ShaderResource`]. The returned
    /// staging buffer must outlive the GPU execution of `cmd`.
    ///
    /// # Errors
    ///
    /// Returns an error if `pixels` is not `width * height * 4` bytes or an
    /// allocation fails.
    pub fn upload_rgba8(
        device: Arc<Device>,
        cmd: &CommandBuffer,
        width: u32,
        height: u32,
        pixels: &[u8],
        name: &str,
    ) -> RhiResult<(Self, StagingBuffer)> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(RhiError::AllocationFailed(format!(
                "texture '{name}' has {} bytes, expected {expected}",
                pixels.len()
            )));
        }

        let mut image = Self::new(
            device.clone(),
            &ImageDesc {
                width,
                height,
                format: vk::Format::R8G8B8A8_SRGB,
                usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                aspect: vk::ImageAspectFlags::COLOR,
                name,
            },
        )?;

        let staging_name = format!("{name} (staging)");
        let mut staging = GpuBuffer::create(
            device,
            &BufferDesc {
                size: pixels.len() as u64,
                heap: HeapClass::Upload,
                usage: BufferUsage::Staging,
                is_constant: false,
                name: &staging_name,
            },
        )?;
        staging.write(0, pixels)?;

        image.transition(cmd, ImageState::CopyDest);
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });
        cmd.copy_buffer_to_image(
            staging.handle(),
            image.image,
            ImageState::CopyDest.layout(),
            &[region],
        );
        image.transition(cmd, ImageState::ShaderResource);

        Ok((image, StagingBuffer::from_buffer(staging)))
    }

    /// Records a barrier to `target` if the image is not already in it.
    pub fn transition(&mut self, cmd: &CommandBuffer, target: ImageState) {
        if self.state == target {
            return;
        }
        cmd.transition_image(self.image, self.aspect, self.state, target);
        self.state = target;
    }

    /// Returns the Vulkan image handle.
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Returns the default view.
    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Returns the image extent.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Returns the pixel format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Returns the state the last recorded transition left the image in.
    #[inline]
    pub fn state(&self) -> ImageState {
        self.state
    }
}

impl Drop for Image2D {
    fn drop(&mut self) {
        // SAFETY: owners guarantee the GPU no longer uses the image.
        unsafe {
            self.device.handle().destroy_image_view(self.view, None);
            self.device.handle().destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            match self.device.allocator() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        tracing::error!("Failed to free image allocation: {:?}", e);
                    }
                }
                Err(e) => tracing::error!("Leaking image allocation: {}", e),
            }
        }
        debug!("Destroyed image '{}'", self.name);
    }
}

/// Linear-filtering, repeat-addressing sampler.
pub struct Sampler {
    device: Arc<Device>,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Creates a linear repeat sampler with anisotropy when the device allows it.
    ///
    /// # Errors
    ///
    /// Returns an error if sampler creation fails.
    pub fn linear_repeat(device: Arc<Device>) -> RhiResult<Self> {
        let max_anisotropy = device.properties().limits.max_sampler_anisotropy.min(16.0);
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(max_anisotropy > 1.0)
            .max_anisotropy(max_anisotropy)
            .max_lod(vk::LOD_CLAMP_NONE);

        // SAFETY: the device was created with samplerAnisotropy.
        let sampler = unsafe { device.handle().create_sampler(&create_info, None)? };
        debug!("Created linear sampler");
        Ok(Self { device, sampler })
    }

    /// Returns the sampler handle.
    #[inline]
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        // SAFETY: no pending work references the sampler at drop time.
        unsafe { self.device.handle().destroy_sampler(self.sampler, None) };
    }
}

/// Full single-mip, single-layer subresource range.
#[inline]
pub fn full_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_layouts() {
        assert_eq!(ImageState::Present.layout(), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            ImageState::RenderTarget.layout(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(ImageState::UnorderedAccess.layout(), vk::ImageLayout::GENERAL);
        assert_eq!(
            ImageState::CopySource.layout(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            ImageState::CopyDest.layout(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
    }

    #[test]
    fn test_write_states_have_write_access() {
        for state in [
            ImageState::RenderTarget,
            ImageState::DepthTarget,
            ImageState::CopyDest,
            ImageState::UnorderedAccess,
        ] {
            let (_, access) = state.stage_access();
            assert!(
                access.intersects(
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
                        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
                        | vk::AccessFlags2::TRANSFER_WRITE
                        | vk::AccessFlags2::SHADER_STORAGE_WRITE
                ),
                "{state:?}"
            );
        }
    }

    #[test]
    fn test_full_range_covers_one_mip_one_layer() {
        let range = full_range(vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 1);
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::DEPTH);
    }
}
