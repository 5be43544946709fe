//! Renderer error type.

use thiserror::Error;

use renderer_resources::ResourceError;
use renderer_rhi::RhiError;

/// Errors surfaced by [`Renderer`](crate::Renderer).
#[derive(Error, Debug)]
pub enum RendererError {
    /// A Vulkan-level failure.
    #[error(transparent)]
    Rhi(#[from] RhiError),

    /// A mesh or texture could not be loaded.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Window, surface or configuration failure.
    #[error(transparent)]
    Platform(#[from] renderer_core::Error),
}

impl RendererError {
    /// Returns `true` if the device was lost. Rendering cannot continue.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RendererError::Rhi(e) if e.is_device_lost())
    }
}

/// Result type for renderer operations.
pub type RendererResult<T> = std::result::Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_is_distinguished() {
        assert!(RendererError::from(RhiError::DeviceLost).is_device_lost());
        assert!(!RendererError::from(RhiError::NoSuitableGpu).is_device_lost());
        assert!(!RendererError::from(ResourceError::NoMeshes("x".into())).is_device_lost());
    }

    #[test]
    fn test_messages_are_forwarded() {
        let err = RendererError::from(RhiError::RayTracingUnsupported);
        assert_eq!(err.to_string(), RhiError::RayTracingUnsupported.to_string());
    }
}
