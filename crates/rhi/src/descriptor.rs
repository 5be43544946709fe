//! Descriptor slots and descriptor set management.
//!
//! This module provides three layers:
//! - [`DescriptorAllocator`] is a bump allocator over a fixed-capacity table
//!   of resource view slots. Slots are handed out once and never freed.
//! - [`DescriptorSetLayoutBuilder`], [`DescriptorPool`] and
//!   [`DescriptorWriter`] wrap the Vulkan descriptor objects.
//! - [`DescriptorTable`] puts the two together: one shader-visible set whose
//!   array bindings are indexed by the allocator's slots.
//!
//! # Overview
//!
//! Every resource view the renderer creates lives for the whole session, so
//! the slot table needs no free list. Capacity is computed up front with
//! [`DescriptorCapacity::compute`]; running out is a configuration bug and
//! surfaces as [`RhiError::OutOfSlots`].
//!
//! Writing a slot ("creating the view") is a separate step:
//! [`DescriptorTable::write`] stores a [`ResourceView`] at the slot's array
//! element. Shaders receive slot indices through push constants.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::descriptor::{DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWriter};
//!
//! # fn example(device: Arc<Device>, buffer: vk::Buffer) -> Result<(), renderer_rhi::RhiError> {
//! let layout = DescriptorSetLayoutBuilder::new()
//!     .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
//!     .build(device.clone())?;
//!
//! let pool = DescriptorPool::for_layout(device.clone(), &layout, 3)?;
//! let sets = pool.allocate(&[layout.handle(); 3])?;
//!
//! DescriptorWriter::new(sets[0])
//!     .uniform_buffer(0, buffer, 0, vk::WHOLE_SIZE)
//!     .update(&device);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

// =============================================================================
// Slot Allocation
// =============================================================================

/// CPU-side handle to a descriptor slot, used when writing the view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CpuDescriptorHandle(pub u32);

/// Shader-side handle to a descriptor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuDescriptorHandle(pub u32);

/// One slot handed out by a [`DescriptorAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorAllocation {
    /// Slot index in the table.
    pub index: u32,
    /// Handle used to write the view.
    pub cpu: CpuDescriptorHandle,
    /// Handle shaders reference; `None` for tables that are not shader visible.
    pub gpu: Option<GpuDescriptorHandle>,
}

/// Bump allocator over a fixed-capacity descriptor table.
///
/// Indices are strictly increasing and are never reused.
#[derive(Debug)]
pub struct DescriptorAllocator {
    capacity: u32,
    next: u32,
    shader_visible: bool,
}

impl DescriptorAllocator {
    /// Reserves a table of `capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AllocationFailed`] if `capacity` is zero.
    pub fn create(capacity: u32, shader_visible: bool) -> RhiResult<Self> {
        if capacity == 0 {
            return Err(RhiError::AllocationFailed(
                "descriptor table capacity must be non-zero".to_string(),
            ));
        }
        debug!(
            "Descriptor table reserved: capacity={}, shader_visible={}",
            capacity, shader_visible
        );
        Ok(Self {
            capacity,
            next: 0,
            shader_visible,
        })
    }

    /// Hands out the next unused slot.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::OutOfSlots`] once every slot has been handed out.
    pub fn allocate(&mut self) -> RhiResult<DescriptorAllocation> {
        if self.next >= self.capacity {
            return Err(RhiError::OutOfSlots {
                capacity: self.capacity,
            });
        }
        let index = self.next;
        self.next += 1;
        trace!(index, "Descriptor slot allocated");
        Ok(DescriptorAllocation {
            index,
            cpu: CpuDescriptorHandle(index),
            gpu: self.shader_visible.then_some(GpuDescriptorHandle(index)),
        })
    }

    /// Returns the table capacity.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns how many slots have been handed out.
    #[inline]
    pub fn allocated(&self) -> u32 {
        self.next
    }

    /// Returns how many slots remain.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.capacity - self.next
    }

    /// Returns `true` if allocations carry a shader-side handle.
    #[inline]
    pub fn is_shader_visible(&self) -> bool {
        self.shader_visible
    }
}

/// Anything that hands out descriptor slots.
pub trait SlotAllocator {
    /// Hands out the next unused slot.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::OutOfSlots`] once the table is full.
    fn allocate_slot(&mut self) -> RhiResult<DescriptorAllocation>;
}

impl SlotAllocator for DescriptorAllocator {
    fn allocate_slot(&mut self) -> RhiResult<DescriptorAllocation> {
        self.allocate()
    }
}

/// Descriptor table sizing.
pub struct DescriptorCapacity;

impl DescriptorCapacity {
    /// Views shared by both back ends besides the per-frame light buffers:
    /// one material buffer and one texture.
    pub const SHARED_VIEWS: u32 = 2;
    /// Ray-tracing views: output image, camera, object, light and material
    /// buffers, vertex and index buffers.
    pub const RAY_TRACING_VIEWS: u32 = 7;
    /// Spare slots.
    pub const SPARE: u32 = 4;

    /// Computes the table capacity for the given frame count.
    pub const fn compute(frames_in_flight: u32, ray_tracing: bool) -> u32 {
        let rt = if ray_tracing {
            Self::RAY_TRACING_VIEWS
        } else {
            0
        };
        frames_in_flight + Self::SHARED_VIEWS + rt + Self::SPARE
    }
}

// =============================================================================
// Set Layouts
// =============================================================================

/// Descriptor set layout wrapper.
///
/// # Thread Safety
///
/// The layout is immutable after creation and can be shared in an `Arc`.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayout {
    /// Creates a layout from raw bindings.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding<'static>],
    ) -> RhiResult<Self> {
        Self::with_binding_flags(device, bindings, &[])
    }

    /// Creates a layout whose bindings carry `flags`, one entry per binding.
    ///
    /// An empty `flags` slice creates a plain layout.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidHandle`] if `flags` is non-empty and its
    /// length differs from `bindings`, or an error if layout creation fails.
    pub fn with_binding_flags(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding<'static>],
        flags: &[vk::DescriptorBindingFlags],
    ) -> RhiResult<Self> {
        if !flags.is_empty() && flags.len() != bindings.len() {
            return Err(RhiError::InvalidHandle(format!(
                "{} binding flag(s) for {} binding(s)",
                flags.len(),
                bindings.len()
            )));
        }

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(flags);
        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        if flags.iter().any(|f| !f.is_empty()) {
            create_info = create_info.push_next(&mut flags_info);
        }

        // SAFETY: the bindings carry no immutable samplers and the chained
        // flags outlive the call.
        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        debug!(
            "Created descriptor set layout with {} binding(s)",
            bindings.len()
        );

        Ok(Self {
            device,
            layout,
            bindings: bindings.to_vec(),
        })
    }

    /// Returns the Vulkan descriptor set layout handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Returns the bindings the layout was created from.
    #[inline]
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    /// Pool sizes needed to allocate `sets` sets of this layout.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.descriptor_count * sets;
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(binding.descriptor_type)
                        .descriptor_count(count),
                ),
            }
        }
        sizes
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        // SAFETY: pipelines built from this layout are dropped first.
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("Destroyed descriptor set layout");
    }
}

/// Fluent builder for [`DescriptorSetLayout`].
///
/// # Example
///
/// ```no_run
/// use ash::vk;
/// use renderer_rhi::descriptor::DescriptorSetLayoutBuilder;
///
/// let builder = DescriptorSetLayoutBuilder::new()
///     .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
///     .combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT);
/// assert_eq!(builder.bindings().len(), 2);
/// ```
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    flags: Vec<vk::DescriptorBindingFlags>,
}

impl DescriptorSetLayoutBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn binding(
        self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.array(binding, descriptor_type, 1, stage_flags)
    }

    /// Adds an array binding of `count` descriptors.
    pub fn array(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self.flags.push(vk::DescriptorBindingFlags::empty());
        self
    }

    /// Lets the most recently added binding hold unwritten elements that
    /// shaders never access.
    pub fn partially_bound(mut self) -> Self {
        if let Some(flags) = self.flags.last_mut() {
            *flags |= vk::DescriptorBindingFlags::PARTIALLY_BOUND;
        }
        self
    }

    /// Adds a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    /// Adds a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags)
    }

    /// Adds a combined image sampler binding.
    pub fn combined_image_sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stage_flags,
        )
    }

    /// Adds a storage image binding.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, stage_flags)
    }

    /// Adds a top-level acceleration structure binding.
    pub fn acceleration_structure(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            stage_flags,
        )
    }

    /// Returns the bindings added so far.
    #[inline]
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    /// Returns the binding flags, one entry per binding.
    #[inline]
    pub fn binding_flags(&self) -> &[vk::DescriptorBindingFlags] {
        &self.flags
    }

    /// Creates the layout.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn build(self, device: Arc<Device>) -> RhiResult<DescriptorSetLayout> {
        DescriptorSetLayout::with_binding_flags(device, &self.bindings, &self.flags)
    }
}

// =============================================================================
// Pools
// =============================================================================

/// Descriptor pool for allocating descriptor sets.
///
/// # Thread Safety
///
/// Descriptor pool operations are not thread-safe. Synchronize access
/// externally when sharing between threads.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Creates a new descriptor pool.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `max_sets` - Maximum number of descriptor sets that can be allocated
    /// * `pool_sizes` - Array of pool sizes for each descriptor type
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn new(
        device: Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        // SAFETY: pool sizes are non-empty for every layout used here.
        let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

        debug!(
            "Created descriptor pool: max_sets={}, pool_sizes={}",
            max_sets,
            pool_sizes.len()
        );

        Ok(Self {
            device,
            pool,
            max_sets,
        })
    }

    /// Creates a pool sized for exactly `sets` sets of `layout`.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn for_layout(
        device: Arc<Device>,
        layout: &DescriptorSetLayout,
        sets: u32,
    ) -> RhiResult<Self> {
        let sizes = layout.pool_sizes(sets);
        Self::new(device, sets, &sizes)
    }

    /// Allocates descriptor sets from the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails (e.g., pool exhausted).
    pub fn allocate(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        // SAFETY: the layouts are alive for the duration of the call.
        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info)? };

        debug!("Allocated {} descriptor set(s)", sets.len());

        Ok(sets)
    }

    /// Returns the Vulkan descriptor pool handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Returns the maximum number of sets that can be allocated from this pool.
    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        // SAFETY: no submitted command buffer references the pool's sets.
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.pool, None);
        }
        debug!("Destroyed descriptor pool");
    }
}

// =============================================================================
// Writes
// =============================================================================

enum PendingWrite {
    Buffer {
        binding: u32,
        element: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        binding: u32,
        element: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    },
    AccelerationStructure {
        binding: u32,
        handle: vk::AccelerationStructureKHR,
    },
}

/// Collects resource views for one descriptor set and writes them in a
/// single `vkUpdateDescriptorSets` call.
pub struct DescriptorWriter {
    set: vk::DescriptorSet,
    writes: Vec<PendingWrite>,
}

impl DescriptorWriter {
    /// Starts a batch of writes into `set`.
    pub fn new(set: vk::DescriptorSet) -> Self {
        Self {
            set,
            writes: Vec::new(),
        }
    }

    /// Writes a uniform buffer view.
    pub fn uniform_buffer(
        mut self,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Self {
        self.writes.push(PendingWrite::Buffer {
            binding,
            element: 0,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            info: buffer_info(buffer, offset, range),
        });
        self
    }

    /// Writes a storage buffer view covering the whole buffer.
    pub fn storage_buffer(mut self, binding: u32, buffer: vk::Buffer) -> Self {
        self.writes.push(PendingWrite::Buffer {
            binding,
            element: 0,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            info: buffer_info(buffer, 0, vk::WHOLE_SIZE),
        });
        self
    }

    /// Writes a sampled texture view.
    pub fn combined_image_sampler(
        mut self,
        binding: u32,
        sampler: vk::Sampler,
        view: vk::ImageView,
    ) -> Self {
        self.writes.push(PendingWrite::Image {
            binding,
            element: 0,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            info: image_info(sampler, view, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        });
        self
    }

    /// Writes a storage image view; the image must be in `GENERAL` layout
    /// when the shader runs.
    pub fn storage_image(mut self, binding: u32, view: vk::ImageView) -> Self {
        self.writes.push(PendingWrite::Image {
            binding,
            element: 0,
            ty: vk::DescriptorType::STORAGE_IMAGE,
            info: image_info(vk::Sampler::null(), view, vk::ImageLayout::GENERAL),
        });
        self
    }

    /// Writes a top-level acceleration structure.
    pub fn acceleration_structure(
        mut self,
        binding: u32,
        handle: vk::AccelerationStructureKHR,
    ) -> Self {
        self.writes
            .push(PendingWrite::AccelerationStructure { binding, handle });
        self
    }

    /// Writes `view` into array element `element` of the table binding
    /// matching its kind.
    pub fn view(mut self, element: u32, view: ResourceView) -> Self {
        let binding = view.binding();
        let ty = view.descriptor_type();
        self.writes.push(match view {
            ResourceView::Buffer(buffer) => PendingWrite::Buffer {
                binding,
                element,
                ty,
                info: buffer_info(buffer, 0, vk::WHOLE_SIZE),
            },
            ResourceView::SampledImage { sampler, view } => PendingWrite::Image {
                binding,
                element,
                ty,
                info: image_info(sampler, view, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            },
            ResourceView::StorageImage(view) => PendingWrite::Image {
                binding,
                element,
                ty,
                info: image_info(vk::Sampler::null(), view, vk::ImageLayout::GENERAL),
            },
        });
        self
    }

    /// Returns the number of pending writes.
    #[inline]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Returns `true` if nothing has been queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Applies every queued write.
    pub fn update(self, device: &Device) {
        if self.writes.is_empty() {
            return;
        }

        let as_handles: Vec<(u32, vk::AccelerationStructureKHR)> = self
            .writes
            .iter()
            .filter_map(|w| match w {
                PendingWrite::AccelerationStructure { binding, handle } => {
                    Some((*binding, *handle))
                }
                _ => None,
            })
            .collect();
        let mut as_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = as_handles
            .iter()
            .map(|(_, handle)| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(std::slice::from_ref(handle))
            })
            .collect();

        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(self.writes.len());
        for pending in &self.writes {
            match pending {
                PendingWrite::Buffer {
                    binding,
                    element,
                    ty,
                    info,
                } => writes.push(
                    vk::WriteDescriptorSet::default()
                        .dst_set(self.set)
                        .dst_binding(*binding)
                        .dst_array_element(*element)
                        .descriptor_type(*ty)
                        .buffer_info(std::slice::from_ref(info)),
                ),
                PendingWrite::Image {
                    binding,
                    element,
                    ty,
                    info,
                } => writes.push(
                    vk::WriteDescriptorSet::default()
                        .dst_set(self.set)
                        .dst_binding(*binding)
                        .dst_array_element(*element)
                        .descriptor_type(*ty)
                        .image_info(std::slice::from_ref(info)),
                ),
                PendingWrite::AccelerationStructure { .. } => {}
            }
        }
        for ((binding, _), info) in as_handles.iter().zip(as_infos.iter_mut()) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .descriptor_count(1)
                    .push_next(info),
            );
        }

        // SAFETY: every referenced buffer, view and structure is alive.
        unsafe {
            device.handle().update_descriptor_sets(&writes, &[]);
        }

        trace!("Updated {} descriptor(s)", writes.len());
    }
}

// =============================================================================
// Resource View Table
// =============================================================================

/// A view written into a [`DescriptorTable`] slot.
///
/// Constant and structured buffers are both exposed as read-only storage
/// buffers so the table is not bound by the small per-stage uniform buffer
/// limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceView {
    /// Whole-buffer constant or structured data.
    Buffer(vk::Buffer),
    /// Texture read through a sampler.
    SampledImage {
        sampler: vk::Sampler,
        view: vk::ImageView,
    },
    /// Image written by shaders, in `GENERAL` layout.
    StorageImage(vk::ImageView),
}

impl ResourceView {
    /// Table binding that holds views of this kind.
    pub fn binding(&self) -> u32 {
        match self {
            ResourceView::Buffer(_) => DescriptorTable::BUFFERS,
            ResourceView::SampledImage { .. } => DescriptorTable::SAMPLED_IMAGES,
            ResourceView::StorageImage(_) => DescriptorTable::STORAGE_IMAGES,
        }
    }

    /// Descriptor type of this kind of view.
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            ResourceView::Buffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            ResourceView::SampledImage { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            ResourceView::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// Shader-visible resource view table.
///
/// One descriptor set with an array binding per view kind, each as long as
/// the table capacity. A slot index is meaningful in exactly one of those
/// arrays, the one matching the view written into it; the other arrays
/// leave that element unwritten, which the partially-bound flag permits.
///
/// The set is bound as set 0 of every pipeline layout.
///
/// # Thread Safety
///
/// [`DescriptorTable::write`] must not run while a submitted command buffer
/// that bound the set is still executing.
pub struct DescriptorTable {
    device: Arc<Device>,
    slots: DescriptorAllocator,
    // Freed with the pool.
    set: vk::DescriptorSet,
    pool: DescriptorPool,
    layout: DescriptorSetLayout,
}

impl DescriptorTable {
    /// Binding of the storage buffer array.
    pub const BUFFERS: u32 = 0;
    /// Binding of the combined image sampler array.
    pub const SAMPLED_IMAGES: u32 = 1;
    /// Binding of the storage image array.
    pub const STORAGE_IMAGES: u32 = 2;

    /// Creates a table of `capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AllocationFailed`] for a zero capacity, or an
    /// error if the layout, pool or set cannot be created.
    pub fn new(device: Arc<Device>, capacity: u32) -> RhiResult<Self> {
        let slots = DescriptorAllocator::create(capacity, true)?;
        let layout = Self::layout_builder(capacity).build(device.clone())?;
        let pool = DescriptorPool::for_layout(device.clone(), &layout, 1)?;
        let set = pool
            .allocate(&[layout.handle()])?
            .into_iter()
            .next()
            .ok_or_else(|| {
                RhiError::AllocationFailed("descriptor table set allocation".to_string())
            })?;

        debug!("Descriptor table created: {} slots per view kind", capacity);

        Ok(Self {
            device,
            slots,
            set,
            pool,
            layout,
        })
    }

    /// Layout of a table with `capacity` slots.
    pub fn layout_builder(capacity: u32) -> DescriptorSetLayoutBuilder {
        let stages = vk::ShaderStageFlags::ALL;
        DescriptorSetLayoutBuilder::new()
            .array(
                Self::BUFFERS,
                vk::DescriptorType::STORAGE_BUFFER,
                capacity,
                stages,
            )
            .partially_bound()
            .array(
                Self::SAMPLED_IMAGES,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                capacity,
                stages,
            )
            .partially_bound()
            .array(
                Self::STORAGE_IMAGES,
                vk::DescriptorType::STORAGE_IMAGE,
                capacity,
                stages,
            )
            .partially_bound()
    }

    /// Hands out the next unused slot.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::OutOfSlots`] once every slot has been handed out.
    #[inline]
    pub fn allocate(&mut self) -> RhiResult<DescriptorAllocation> {
        self.slots.allocate()
    }

    /// Creates `view` in `slot`.
    pub fn write(&self, slot: &DescriptorAllocation, view: ResourceView) {
        trace!(index = slot.index, ?view, "Writing descriptor table slot");
        DescriptorWriter::new(self.set)
            .view(slot.cpu.0, view)
            .update(&self.device);
    }

    /// Returns the descriptor set to bind.
    #[inline]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Returns the set layout.
    #[inline]
    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    /// Returns the slot allocator.
    #[inline]
    pub fn slots(&self) -> &DescriptorAllocator {
        &self.slots
    }

    /// Returns the pool the set was allocated from.
    #[inline]
    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

impl SlotAllocator for DescriptorTable {
    fn allocate_slot(&mut self) -> RhiResult<DescriptorAllocation> {
        self.allocate()
    }
}

/// Creates a buffer info for descriptor set updates.
#[inline]
pub fn buffer_info(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range)
}

/// Creates an image info for descriptor set updates.
#[inline]
pub fn image_info(
    sampler: vk::Sampler,
    image_view: vk::ImageView,
    image_layout: vk::ImageLayout,
) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(image_view)
        .image_layout(image_layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(
            DescriptorAllocator::create(0, true),
            Err(RhiError::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_allocations_are_strictly_increasing() {
        let mut allocator = DescriptorAllocator::create(8, true).unwrap();
        let indices: Vec<u32> = (0..8).map(|_| allocator.allocate().unwrap().index).collect();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
        assert_eq!(allocator.remaining(), 0);
    }

    #[test]
    fn test_allocation_past_capacity_fails() {
        for capacity in [1u32, 2, 5, 17] {
            let mut allocator = DescriptorAllocator::create(capacity, false).unwrap();
            for _ in 0..capacity {
                allocator.allocate().unwrap();
            }
            match allocator.allocate() {
                Err(RhiError::OutOfSlots { capacity: c }) => assert_eq!(c, capacity),
                other => panic!("expected OutOfSlots, got {other:?}"),
            }
            // Exhaustion is sticky.
            assert!(allocator.allocate().is_err());
            assert_eq!(allocator.allocated(), capacity);
        }
    }

    #[test]
    fn test_gpu_handle_only_when_shader_visible() {
        let mut visible = DescriptorAllocator::create(1, true).unwrap();
        let mut hidden = DescriptorAllocator::create(1, false).unwrap();

        let a = visible.allocate().unwrap();
        let b = hidden.allocate().unwrap();

        assert_eq!(a.gpu, Some(GpuDescriptorHandle(0)));
        assert_eq!(a.cpu, CpuDescriptorHandle(0));
        assert_eq!(b.gpu, None);
        assert!(visible.is_shader_visible());
        assert!(!hidden.is_shader_visible());
    }

    #[test]
    fn test_capacity_covers_every_view() {
        assert_eq!(DescriptorCapacity::compute(3, false), 3 + 2 + 4);
        assert_eq!(DescriptorCapacity::compute(3, true), 3 + 2 + 7 + 4);
        assert!(DescriptorCapacity::compute(1, true) > DescriptorCapacity::compute(1, false));
    }

    #[test]
    fn test_layout_builder_bindings() {
        let builder = DescriptorSetLayoutBuilder::new()
            .storage_image(0, vk::ShaderStageFlags::RAYGEN_KHR)
            .acceleration_structure(1, vk::ShaderStageFlags::RAYGEN_KHR)
            .uniform_buffer(2, vk::ShaderStageFlags::CLOSEST_HIT_KHR);

        let bindings = builder.bindings();
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(
            bindings[1].descriptor_type,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
        assert_eq!(bindings[2].binding, 2);
        assert!(bindings.iter().all(|b| b.descriptor_count == 1));
    }

    #[test]
    fn test_partially_bound_marks_last_binding() {
        let builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .array(1, vk::DescriptorType::STORAGE_BUFFER, 8, vk::ShaderStageFlags::ALL)
            .partially_bound();
        assert_eq!(
            builder.binding_flags(),
            &[
                vk::DescriptorBindingFlags::empty(),
                vk::DescriptorBindingFlags::PARTIALLY_BOUND
            ]
        );
        assert_eq!(builder.bindings()[1].descriptor_count, 8);
    }

    #[test]
    fn test_table_layout_has_one_array_per_view_kind() {
        let builder = DescriptorTable::layout_builder(16);
        let bindings = builder.bindings();
        assert_eq!(bindings.len(), 3);
        for view in [
            ResourceView::Buffer(vk::Buffer::null()),
            ResourceView::SampledImage {
                sampler: vk::Sampler::null(),
                view: vk::ImageView::null(),
            },
            ResourceView::StorageImage(vk::ImageView::null()),
        ] {
            let binding = &bindings[view.binding() as usize];
            assert_eq!(binding.binding, view.binding());
            assert_eq!(binding.descriptor_type, view.descriptor_type());
            assert_eq!(binding.descriptor_count, 16);
        }
        assert!(
            builder
                .binding_flags()
                .iter()
                .all(|f| f.contains(vk::DescriptorBindingFlags::PARTIALLY_BOUND))
        );
    }

    #[test]
    fn test_view_writes_target_the_slot_element() {
        let writer = DescriptorWriter::new(vk::DescriptorSet::null())
            .view(5, ResourceView::Buffer(vk::Buffer::null()))
            .view(2, ResourceView::StorageImage(vk::ImageView::null()))
            .uniform_buffer(0, vk::Buffer::null(), 0, 64);
        let targets: Vec<(u32, u32)> = writer
            .writes
            .iter()
            .map(|w| match w {
                PendingWrite::Buffer {
                    binding, element, ..
                }
                | PendingWrite::Image {
                    binding, element, ..
                } => (*binding, *element),
                PendingWrite::AccelerationStructure { binding, .. } => (*binding, 0),
            })
            .collect();
        assert_eq!(
            targets,
            vec![
                (DescriptorTable::BUFFERS, 5),
                (DescriptorTable::STORAGE_IMAGES, 2),
                (0, 0)
            ]
        );
    }

    #[test]
    fn test_slot_allocator_is_shared_by_table_and_allocator() {
        fn take_two(slots: &mut impl SlotAllocator) -> RhiResult<[u32; 2]> {
            Ok([slots.allocate_slot()?.index, slots.allocate_slot()?.index])
        }
        let mut allocator = DescriptorAllocator::create(3, true).unwrap();
        assert_eq!(take_two(&mut allocator).unwrap(), [0, 1]);
        assert!(matches!(
            take_two(&mut allocator),
            Err(RhiError::OutOfSlots { capacity: 3 })
        ));
    }

    #[test]
    fn test_writer_counts_pending_writes() {
        let writer = DescriptorWriter::new(vk::DescriptorSet::null())
            .uniform_buffer(0, vk::Buffer::null(), 0, 256)
            .storage_buffer(1, vk::Buffer::null())
            .acceleration_structure(2, vk::AccelerationStructureKHR::null());
        assert_eq!(writer.len(), 3);
        assert!(DescriptorWriter::new(vk::DescriptorSet::null()).is_empty());
    }

    #[test]
    fn test_buffer_info_helper() {
        let info = buffer_info(vk::Buffer::null(), 64, 128);
        assert_eq!(info.buffer, vk::Buffer::null());
        assert_eq!(info.offset, 64);
        assert_eq!(info.range, 128);
    }

    #[test]
    fn test_pool_sizes_merge_types() {
        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
            .uniform_buffer(2, vk::ShaderStageFlags::FRAGMENT)
            .build(ctx.device.clone())
            .expect("layout");
        let sizes = layout.pool_sizes(3);
        assert_eq!(sizes.len(), 2);
        let uniform = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(uniform.descriptor_count, 6);

        let pool = DescriptorPool::for_layout(ctx.device.clone(), &layout, 3).expect("pool");
        let sets = pool.allocate(&[layout.handle(); 3]).expect("sets");
        assert_eq!(sets.len(), 3);
    }

    #[test]
    fn test_table_writes_views_at_allocated_slots() {
        use crate::buffer::{BufferDesc, GpuBuffer};

        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        let capacity = DescriptorCapacity::compute(2, false);
        let mut table = DescriptorTable::new(ctx.device.clone(), capacity).expect("table");
        assert_ne!(table.set(), vk::DescriptorSet::null());
        assert_eq!(table.layout().bindings().len(), 3);
        assert_eq!(table.pool().max_sets(), 1);

        let buffer =
            GpuBuffer::create(ctx.device.clone(), &BufferDesc::constant("table view", 64))
                .expect("buffer");
        let first = table.allocate().expect("slot");
        let last = (1..capacity)
            .map(|_| table.allocate().expect("slot"))
            .last()
            .expect("capacity above one");
        table.write(&first, ResourceView::Buffer(buffer.handle()));
        table.write(&last, ResourceView::Buffer(buffer.handle()));

        assert_eq!(first.index, 0);
        assert_eq!(last.index, capacity - 1);
        assert_eq!(table.slots().remaining(), 0);
        assert!(matches!(
            table.allocate(),
            Err(RhiError::OutOfSlots { capacity: c }) if c == capacity
        ));
        ctx.device.wait_idle().expect("idle");
    }
}
