//! Frame slots and fence-bounded reuse.
//!
//! The renderer round-robins over [`MAX_FRAMES_IN_FLIGHT`] slots. Each slot
//! remembers the fence value of its last submission; before the slot is
//! recorded into again the CPU waits for exactly that value, so the CPU can
//! run at most `MAX_FRAMES_IN_FLIGHT` frames ahead of the GPU and never
//! overwrites constants or resets a command pool the GPU is still reading.

use std::sync::Arc;

use tracing::{debug, trace};

use renderer_rhi::RhiResult;
use renderer_rhi::buffer::{BufferDesc, GpuBuffer};
use renderer_rhi::command::CommandContext;
use renderer_rhi::descriptor::{DescriptorAllocation, DescriptorTable, ResourceView, SlotAllocator};
use renderer_rhi::device::Device;
use renderer_rhi::queue::Timeline;
use renderer_rhi::sync::Semaphore;

use crate::constants::{LightConstants, ObjectConstants};

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// GPU objects owned by one frame slot.
pub struct SlotResources {
    /// Command pool and list recorded into for this slot.
    pub context: CommandContext,
    /// Persistently mapped [`ObjectConstants`].
    pub object_constants: GpuBuffer,
    /// Persistently mapped [`LightConstants`].
    pub light_constants: GpuBuffer,
    /// Table slot holding the view of `light_constants`.
    pub light_view: DescriptorAllocation,
    /// Signaled by the swapchain when the acquired image is ready.
    pub image_available: Semaphore,
}

impl SlotResources {
    /// Creates the command context, constant buffers and acquire semaphore
    /// for slot `index` and writes the light view into `light_view`.
    ///
    /// # Errors
    ///
    /// Returns an error if any allocation fails.
    pub fn new(
        device: &Arc<Device>,
        index: usize,
        table: &DescriptorTable,
        light_view: DescriptorAllocation,
    ) -> RhiResult<Self> {
        let context = CommandContext::new(device.clone(), &format!("frame slot {index}"))?;
        let object_constants = GpuBuffer::create(
            device.clone(),
            &BufferDesc::constant(
                &format!("object constants [{index}]"),
                ObjectConstants::SIZE as u64,
            ),
        )?;
        let light_constants = GpuBuffer::create(
            device.clone(),
            &BufferDesc::constant(
                &format!("light constants [{index}]"),
                LightConstants::SIZE as u64,
            ),
        )?;
        table.write(&light_view, ResourceView::Buffer(light_constants.handle()));
        let image_available = Semaphore::new(device.clone())?;
        Ok(Self {
            context,
            object_constants,
            light_constants,
            light_view,
            image_available,
        })
    }

    /// Swaps in a fresh acquire semaphore.
    ///
    /// Needed when a frame is abandoned after acquiring: the old semaphore
    /// stays signaled with no submission left to wait on it.
    pub fn replace_image_available(&mut self, device: &Arc<Device>) -> RhiResult<()> {
        self.image_available = Semaphore::new(device.clone())?;
        Ok(())
    }
}

/// Reserves one light view per frame slot.
///
/// # Errors
///
/// Returns [`renderer_rhi::RhiError::OutOfSlots`] if the table is full.
pub fn light_views(
    slots: &mut impl SlotAllocator,
    frames: usize,
) -> RhiResult<Vec<DescriptorAllocation>> {
    (0..frames).map(|_| slots.allocate_slot()).collect()
}

/// One entry of the frame ring.
pub struct FrameSlot<R = SlotResources> {
    index: usize,
    fence_value: u64,
    /// Per-slot resources.
    pub resources: R,
}

impl<R> FrameSlot<R> {
    /// Position in the ring.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Fence value of the last submission from this slot (0 if none).
    #[inline]
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    /// Returns `true` once the slot has been submitted at least once.
    #[inline]
    pub fn needs_wait(&self) -> bool {
        self.fence_value > 0
    }
}

/// Ring of frame slots.
pub struct FrameSlots<R = SlotResources> {
    slots: Vec<FrameSlot<R>>,
    current: usize,
}

impl<R> FrameSlots<R> {
    /// Builds a ring with one slot per element of `resources`.
    ///
    /// # Panics
    ///
    /// Panics if `resources` is empty.
    pub fn new(resources: Vec<R>) -> Self {
        assert!(!resources.is_empty(), "a frame ring needs at least one slot");
        let slots = resources
            .into_iter()
            .enumerate()
            .map(|(index, resources)| FrameSlot {
                index,
                fence_value: 0,
                resources,
            })
            .collect();
        Self { slots, current: 0 }
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always `false`; a ring is never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slot the next frame records into.
    #[inline]
    pub fn current(&self) -> &FrameSlot<R> {
        &self.slots[self.current]
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut FrameSlot<R> {
        &mut self.slots[self.current]
    }

    /// Iterates over all slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot<R>> {
        self.slots.iter()
    }

    /// Iterates mutably over all slots in index order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FrameSlot<R>> {
        self.slots.iter_mut()
    }

    /// Blocks until the current slot's previous submission has completed.
    ///
    /// Waits on that slot's own fence value and nothing else; a slot that was
    /// never submitted returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`renderer_rhi::RhiError::DeviceLost`] if the device was lost
    /// while waiting.
    pub fn wait_for_current(&self, timeline: &impl Timeline) -> RhiResult<()> {
        let slot = self.current();
        if slot.needs_wait() {
            trace!(slot = slot.index, value = slot.fence_value, "Waiting for frame slot");
            timeline.wait_for(slot.fence_value)?;
        }
        Ok(())
    }

    /// Records that the current slot's work will be complete at `fence_value`.
    pub fn record_submission(&mut self, fence_value: u64) {
        let slot = self.current_mut();
        debug_assert!(
            fence_value > slot.fence_value,
            "fence values must increase ({} after {})",
            fence_value,
            slot.fence_value
        );
        slot.fence_value = fence_value;
    }

    /// Moves to the next slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }
}

impl FrameSlots<SlotResources> {
    /// Creates [`MAX_FRAMES_IN_FLIGHT`] slots on `device`, each with a light
    /// view in `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if any slot's resources cannot be created or the
    /// table is full.
    pub fn create(device: &Arc<Device>, table: &mut DescriptorTable) -> RhiResult<Self> {
        let views = light_views(table, MAX_FRAMES_IN_FLIGHT)?;
        let resources = views
            .into_iter()
            .enumerate()
            .map(|(index, view)| SlotResources::new(device, index, table, view))
            .collect::<RhiResult<Vec<_>>>()?;
        debug!("Created {} frame slots", resources.len());
        Ok(Self::new(resources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// GPU stand-in: completes work only when the CPU waits for it.
    #[derive(Default)]
    struct LazyGpu {
        completed: Cell<u64>,
        waits: RefCell<Vec<u64>>,
    }

    impl Timeline for LazyGpu {
        fn completed_value(&self) -> RhiResult<u64> {
            Ok(self.completed.get())
        }

        fn wait_for(&self, value: u64) -> RhiResult<()> {
            self.waits.borrow_mut().push(value);
            if self.completed.get() < value {
                self.completed.set(value);
            }
            Ok(())
        }
    }

    fn ring() -> FrameSlots<()> {
        FrameSlots::new(vec![(); MAX_FRAMES_IN_FLIGHT])
    }

    #[test]
    fn test_ring_round_robins() {
        let mut slots = ring();
        let visited: Vec<usize> = (0..7)
            .map(|_| {
                let index = slots.current().index();
                slots.advance();
                index
            })
            .collect();
        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_fresh_slots_do_not_wait() {
        let slots = ring();
        let gpu = LazyGpu::default();
        assert!(!slots.current().needs_wait());
        slots.wait_for_current(&gpu).unwrap();
        assert!(gpu.waits.borrow().is_empty());
    }

    #[test]
    fn test_slot_reuse_waits_on_its_own_fence() {
        let mut slots = ring();
        let gpu = LazyGpu::default();
        let mut next_value = 1;

        for _ in 0..20 {
            let previous = slots.current().fence_value();
            slots.wait_for_current(&gpu).unwrap();
            // The slot's previous work is complete before it is reused.
            assert!(gpu.completed.get() >= previous);

            slots.record_submission(next_value);
            next_value += 1;
            slots.advance();
        }

        // Each wait targets the value submitted exactly one ring earlier.
        let waits = gpu.waits.borrow();
        let expected: Vec<u64> = (1..=(20 - MAX_FRAMES_IN_FLIGHT as u64)).collect();
        assert_eq!(*waits, expected);
    }

    #[test]
    fn test_cpu_never_runs_more_than_ring_ahead() {
        let mut slots = ring();
        let gpu = LazyGpu::default();
        for value in 1..=50u64 {
            slots.wait_for_current(&gpu).unwrap();
            let in_flight = value - 1 - gpu.completed.get();
            assert!(in_flight < MAX_FRAMES_IN_FLIGHT as u64);
            slots.record_submission(value);
            slots.advance();
        }
    }

    #[test]
    fn test_light_views_are_consecutive_slots() {
        use renderer_rhi::descriptor::DescriptorAllocator;

        let mut table = DescriptorAllocator::create(8, true).unwrap();
        table.allocate().unwrap();
        let views = light_views(&mut table, MAX_FRAMES_IN_FLIGHT).unwrap();
        let indices: Vec<u32> = views.iter().map(|v| v.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert!(views.iter().all(|v| v.gpu.is_some()));
    }

    #[test]
    fn test_record_submission_updates_current_only() {
        let mut slots = ring();
        slots.record_submission(5);
        assert_eq!(slots.current().fence_value(), 5);
        assert!(slots.current().needs_wait());
        slots.advance();
        assert_eq!(slots.current().fence_value(), 0);
        assert_eq!(slots.iter().map(|s| s.fence_value()).collect::<Vec<_>>(), vec![5, 0, 0]);
    }
}
