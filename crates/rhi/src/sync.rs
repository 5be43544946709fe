//! Synchronization primitives.
//!
//! - [`Semaphore`]: binary semaphore for GPU-to-GPU ordering (swapchain
//!   acquire and present)
//! - [`Fence`]: monotonic 64-bit completion counter backed by a Vulkan
//!   timeline semaphore, used for GPU-to-CPU waits
//!
//! # Overview
//!
//! A [`Fence`] value only ever grows. The GPU raises it when a submission
//! that signals it completes; the CPU reads it with
//! [`Fence::completed_value`] or blocks with [`Fence::wait`]. Values are
//! handed out by [`crate::queue::CommandQueue`], never chosen by callers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(device: Arc<Device>) -> Result<(), renderer_rhi::RhiError> {
//! let image_available = Semaphore::new(device.clone())?;
//! let fence = Fence::new(device)?;
//! assert_eq!(fence.completed_value()?, 0);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;

/// Binary semaphore wrapper.
///
/// # Thread Safety
///
/// Immutable after creation; the handle may be shared between threads.
pub struct Semaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates an unsignaled binary semaphore.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();

        // SAFETY: the device is valid.
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        debug!("Created binary semaphore");

        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: no pending submission references the semaphore at drop time;
        // owners wait on the queue before releasing frame resources.
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed binary semaphore");
    }
}

/// Monotonic GPU completion counter (timeline semaphore).
///
/// # Thread Safety
///
/// Reading and waiting are safe from any thread. Signalling happens only
/// through queue submissions.
pub struct Fence {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Fence {
    /// Creates a fence whose counter starts at 0.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        // SAFETY: the device was created with the timelineSemaphore feature.
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        debug!("Created timeline fence");

        Ok(Self { device, semaphore })
    }

    /// Returns the timeline semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Returns the highest value the GPU has reached.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::DeviceLost`] if the device was lost.
    pub fn completed_value(&self) -> RhiResult<u64> {
        // SAFETY: the semaphore is a live timeline semaphore.
        let value = unsafe {
            self.device
                .handle()
                .get_semaphore_counter_value(self.semaphore)?
        };
        Ok(value)
    }

    /// Blocks until the counter reaches `value`. There is no timeout.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::DeviceLost`] if the device was lost while
    /// waiting.
    pub fn wait(&self, value: u64) -> RhiResult<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        // SAFETY: the semaphore is a live timeline semaphore.
        unsafe { self.device.handle().wait_semaphores(&wait_info, u64::MAX)? };
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // SAFETY: the owning queue drains before dropping its fence.
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed timeline fence");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
    }

    #[test]
    fn test_fence_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Fence>();
    }

    #[test]
    fn test_new_fence_starts_at_zero() {
        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        let fence = Fence::new(ctx.device.clone()).expect("fence creation");
        assert_eq!(fence.completed_value().expect("counter read"), 0);
        fence.wait(0).expect("waiting on zero returns immediately");
    }
}
