//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// The device was lost (driver reset, hang, or removal).
    ///
    /// Kept separate from [`RhiError::VulkanError`] so callers can treat it
    /// as fatal without inspecting result codes.
    #[error("GPU device lost")]
    DeviceLost,

    /// Ray tracing was requested on a device without the required extensions.
    #[error("Ray tracing is not supported by the selected device")]
    RayTracingUnsupported,

    /// A fixed-capacity descriptor table has no slots left.
    #[error("Descriptor table exhausted: all {capacity} slots are allocated")]
    OutOfSlots {
        /// Capacity of the exhausted table.
        capacity: u32,
    },

    /// Memory allocation failed or was requested with an invalid size.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// A shader entry point required by a pipeline is missing.
    #[error("Missing shader export: {0}")]
    MissingExport(String),

    /// Acceleration structure build error
    #[error("Acceleration structure error: {0}")]
    AccelerationStructureError(String),

    /// Shader compilation error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            other => RhiError::VulkanError(other),
        }
    }
}

impl RhiError {
    /// Returns `true` if this error means the device can no longer be used.
    #[inline]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RhiError::DeviceLost)
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_is_distinct() {
        let err: RhiError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(err.is_device_lost());
        assert!(matches!(err, RhiError::DeviceLost));
    }

    #[test]
    fn test_other_results_stay_generic() {
        let err: RhiError = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into();
        assert!(!err.is_device_lost());
        assert!(matches!(
            err,
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
    }

    #[test]
    fn test_out_of_slots_message() {
        let err = RhiError::OutOfSlots { capacity: 16 };
        assert_eq!(
            err.to_string(),
            "Descriptor table exhausted: all 16 slots are allocated"
        );
    }
}
