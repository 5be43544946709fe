//! Depth buffer management.
//!
//! # Overview
//!
//! - [`DepthBuffer`] wraps a GPU-only [`Image2D`] used as depth attachment
//! - Uses D32_SFLOAT (32-bit floating point)
//! - Recreated whenever the swapchain is resized
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderer_rhi::device::Device;
//! use renderer_renderer::depth_buffer::DepthBuffer;
//!
//! # fn example(device: Arc<Device>) -> Result<(), renderer_rhi::RhiError> {
//! let depth_buffer = DepthBuffer::new(device, 1920, 1080)?;
//! let view = depth_buffer.image_view();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use renderer_rhi::RhiResult;
use renderer_rhi::command::CommandBuffer;
use renderer_rhi::device::Device;
use renderer_rhi::image::{Image2D, ImageDesc, ImageState};

/// Depth format (32-bit floating point).
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Depth attachment for the raster back end.
pub struct DepthBuffer {
    image: Image2D,
    initialized: bool,
}

impl DepthBuffer {
    /// Creates a depth buffer of the given size.
    ///
    /// # Errors
    ///
    /// Returns an error if the size is zero or allocation fails.
    pub fn new(device: Arc<Device>, width: u32, height: u32) -> RhiResult<Self> {
        let image = Image2D::new(
            device,
            &ImageDesc {
                width,
                height,
                format: DEPTH_FORMAT,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: vk::ImageAspectFlags::DEPTH,
                name: "depth buffer",
            },
        )?;
        debug!("Created depth buffer: {}x{}", width, height);
        Ok(Self {
            image,
            initialized: false,
        })
    }

    /// Records the barrier that makes the buffer writable for this frame's pass.
    ///
    /// The first use leaves the undefined layout. Later uses keep the layout
    /// and order this frame's depth writes after the previous frame's, since
    /// one buffer is shared by every frame in flight.
    pub fn prepare(&mut self, cmd: &CommandBuffer) {
        let from = if self.initialized {
            ImageState::DepthTarget
        } else {
            ImageState::Undefined
        };
        cmd.transition_image(
            self.image.handle(),
            vk::ImageAspectFlags::DEPTH,
            from,
            ImageState::DepthTarget,
        );
        self.initialized = true;
    }

    /// Get the image view handle.
    #[inline]
    pub fn image_view(&self) -> vk::ImageView {
        self.image.view()
    }

    /// Get the depth format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.image.format()
    }

    /// Get the dimensions.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_format_is_d32() {
        assert_eq!(DEPTH_FORMAT, vk::Format::D32_SFLOAT);
    }
}
