//! Command queue and its completion fence.
//!
//! # Overview
//!
//! [`CommandQueue`] wraps the graphics queue and owns exactly one
//! [`Fence`]. Every submission signals the next fence value, so the value
//! returned by [`CommandQueue::submit`] or [`CommandQueue::signal`] marks the
//! point at which that work is done.
//!
//! Value bookkeeping:
//! - the fence counter starts at 0 and the first value handed out is 1
//! - a value is consumed only if the submission succeeded
//! - [`CommandQueue::wait_for`] blocks only when the value is not yet reached
//! - [`CommandQueue::join`] signals and waits, draining everything submitted
//!   before it
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::queue::{CommandQueue, Timeline};
//!
//! # fn example(device: Arc<Device>) -> Result<(), renderer_rhi::RhiError> {
//! let mut queue = CommandQueue::new(device)?;
//! let value = queue.signal()?;
//! queue.wait_for(value)?;
//! assert!(queue.is_complete(value)?);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace};

use crate::device::Device;
use crate::error::RhiResult;
use crate::sync::Fence;

/// Read side of a GPU completion counter.
///
/// Implemented by [`CommandQueue`]; frame pacing code depends on this trait
/// so it can be driven by a simulated GPU in tests.
pub trait Timeline {
    /// Highest value the GPU has completed.
    fn completed_value(&self) -> RhiResult<u64>;

    /// Blocks until `value` is reached. Returns immediately if it already is.
    fn wait_for(&self, value: u64) -> RhiResult<()>;

    /// Returns `true` once `value` has been reached.
    fn is_complete(&self, value: u64) -> RhiResult<bool> {
        Ok(self.completed_value()? >= value)
    }
}

/// A semaphore the submission waits on before the given stages run.
#[derive(Clone, Copy, Debug)]
pub struct WaitSemaphore {
    /// Binary semaphore handle.
    pub semaphore: vk::Semaphore,
    /// Stages that must not start before the semaphore is signaled.
    pub stage: vk::PipelineStageFlags2,
}

/// One batch of recorded command buffers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitBatch<'a> {
    /// Command buffers executed in order.
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Binary semaphores to wait on.
    pub waits: &'a [WaitSemaphore],
    /// Binary semaphores to signal on completion.
    pub signals: &'a [vk::Semaphore],
}

/// Graphics queue with a monotonic fence.
///
/// # Thread Safety
///
/// Submission takes `&mut self`; a single thread records and submits.
pub struct CommandQueue {
    device: Arc<Device>,
    queue: vk::Queue,
    fence: Fence,
    next_value: u64,
}

impl CommandQueue {
    /// Wraps the device's graphics queue and creates its fence.
    ///
    /// # Errors
    ///
    /// Returns an error if the fence cannot be created.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let fence = Fence::new(device.clone())?;
        let queue = device.graphics_queue();
        debug!("Command queue created on family {}", device.queue_family());
        Ok(Self {
            device,
            queue,
            fence,
            next_value: 1,
        })
    }

    /// Returns the raw queue handle.
    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    /// Returns the owning device.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Returns the fence.
    #[inline]
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Returns the most recently handed out fence value (0 if none).
    #[inline]
    pub fn last_signaled_value(&self) -> u64 {
        self.next_value - 1
    }

    /// Submits a batch and signals the next fence value.
    ///
    /// # Returns
    ///
    /// The fence value reached once the batch has executed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::DeviceLost`] if the device was lost;
    /// the fence value is not consumed on failure.
    pub fn submit(&mut self, batch: SubmitBatch<'_>) -> RhiResult<u64> {
        let value = self.next_value;

        let command_buffer_infos: Vec<vk::CommandBufferSubmitInfo> = batch
            .command_buffers
            .iter()
            .map(|&cb| vk::CommandBufferSubmitInfo::default().command_buffer(cb))
            .collect();
        let wait_infos: Vec<vk::SemaphoreSubmitInfo> = batch
            .waits
            .iter()
            .map(|wait| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(wait.semaphore)
                    .stage_mask(wait.stage)
            })
            .collect();
        let mut signal_infos: Vec<vk::SemaphoreSubmitInfo> = batch
            .signals
            .iter()
            .map(|&semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        signal_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(self.fence.handle())
                .value(value)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
        );

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffer_infos)
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos);

        // SAFETY: command buffers are in the executable state and all
        // semaphores are owned by live wrappers.
        unsafe {
            self.device
                .handle()
                .queue_submit2(self.queue, &[submit_info], vk::Fence::null())?;
        }

        self.next_value += 1;
        trace!(value, "Queue submission signaled");
        Ok(value)
    }

    /// Signals the next fence value after all previously submitted work.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::DeviceLost`] if the device was lost.
    pub fn signal(&mut self) -> RhiResult<u64> {
        self.submit(SubmitBatch::default())
    }

    /// Signals then waits: every submission made so far has completed on
    /// return.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::DeviceLost`] if the device was lost.
    pub fn join(&mut self) -> RhiResult<()> {
        let value = self.signal()?;
        self.wait_for(value)?;
        debug!(value, "Queue drained");
        Ok(())
    }
}

impl Timeline for CommandQueue {
    fn completed_value(&self) -> RhiResult<u64> {
        self.fence.completed_value()
    }

    fn wait_for(&self, value: u64) -> RhiResult<()> {
        if self.is_complete(value)? {
            return Ok(());
        }
        self.fence.wait(value)
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let last = self.last_signaled_value();
        if last > 0
            && let Err(e) = self.fence.wait(last)
        {
            tracing::error!("Failed to drain queue during drop: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTimeline(u64);

    impl Timeline for FixedTimeline {
        fn completed_value(&self) -> RhiResult<u64> {
            Ok(self.0)
        }

        fn wait_for(&self, _value: u64) -> RhiResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_is_complete_compares_inclusive() {
        let timeline = FixedTimeline(5);
        assert!(timeline.is_complete(4).unwrap());
        assert!(timeline.is_complete(5).unwrap());
        assert!(!timeline.is_complete(6).unwrap());
    }

    #[test]
    fn test_signal_values_increase_from_one() {
        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        let mut queue = CommandQueue::new(ctx.device.clone()).expect("queue");
        assert_eq!(queue.last_signaled_value(), 0);

        let first = queue.signal().expect("signal");
        let second = queue.signal().expect("signal");
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        queue.wait_for(second).expect("wait");
        assert!(queue.is_complete(first).expect("query"));
    }

    #[test]
    fn test_join_drains_queue() {
        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        let mut queue = CommandQueue::new(ctx.device.clone()).expect("queue");
        queue.signal().expect("signal");
        queue.join().expect("join");
        let last = queue.last_signaled_value();
        assert_eq!(last, 2);
        assert_eq!(queue.completed_value().expect("query"), last);
    }
}
