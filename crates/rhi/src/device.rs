//! Vulkan logical device.
//!
//! # Overview
//!
//! The [`Device`] owns:
//! - the logical device with the features every backend needs (timeline
//!   semaphores, buffer device addresses, dynamic rendering, synchronization2
//!   and the descriptor indexing the resource view table relies on)
//! - the ray-tracing extensions, enabled only when the physical device
//!   supports them and the caller asks for them
//! - the `gpu-allocator` allocator shared by all buffers and images
//!
//! Whether ray tracing ended up enabled is reported by [`Device::ray_tracing`].
//! Callers must check it before creating acceleration structures or
//! ray-tracing pipelines; the extension loaders are `None` otherwise.
//!
//! # Example
//!
//! ```no_run
//! use renderer_rhi::instance::Instance;
//! use renderer_rhi::physical_device::select_physical_device;
//! use renderer_rhi::device::Device;
//!
//! let instance = Instance::new_headless(false).expect("no Vulkan");
//! let info = select_physical_device(&instance, None).expect("no GPU");
//! let device = Device::new(&instance, &info, true).expect("device creation failed");
//! println!("ray tracing enabled: {}", device.ray_tracing().is_supported());
//! ```

use std::ffi::{CStr, c_char};
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, error, info, warn};

use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, RAY_TRACING_EXTENSIONS, RayTracingSupport};

/// Loaders for the ray-tracing device extensions.
pub struct RayTracingLoaders {
    /// `VK_KHR_acceleration_structure` entry points.
    pub acceleration_structure: ash::khr::acceleration_structure::Device,
    /// `VK_KHR_ray_tracing_pipeline` entry points.
    pub ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,
}

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// Shared across the renderer through `Arc`. The allocator sits behind a
/// `Mutex`; a poisoned lock is reported as an error instead of panicking.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    graphics_queue: vk::Queue,
    queue_family: u32,
    ray_tracing: RayTracingSupport,
    rt_loaders: Option<RayTracingLoaders>,
}

impl Device {
    /// Creates the logical device.
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance
    /// * `physical_device_info` - The selected physical device
    /// * `request_ray_tracing` - Enable the ray-tracing extensions if the
    ///   device supports them
    ///
    /// # Errors
    ///
    /// Returns an error if device creation or allocator initialisation fails.
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
        request_ray_tracing: bool,
    ) -> RhiResult<Arc<Self>> {
        let enable_rt = request_ray_tracing && physical_device_info.ray_tracing.is_supported();
        if request_ray_tracing && !enable_rt {
            warn!(
                "Ray tracing requested but unavailable ({:?}), continuing raster-only",
                physical_device_info.ray_tracing
            );
        }

        let extensions = device_extensions(instance.supports_surfaces(), enable_rt);
        let extension_names: Vec<*const c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();

        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(physical_device_info.queue_family)
            .queue_priorities(&queue_priorities)];

        let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .scalar_block_layout(true);

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut rt_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .shader_storage_buffer_array_dynamic_indexing(true)
            .shader_sampled_image_array_dynamic_indexing(true)
            .shader_storage_image_array_dynamic_indexing(true);

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut features_1_2)
            .push_next(&mut features_1_3);
        if enable_rt {
            create_info = create_info
                .push_next(&mut as_features)
                .push_next(&mut rt_features);
        }

        // SAFETY: every chained struct outlives this call.
        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device_info.device, &create_info, None)?
        };

        info!(
            "Logical device created with {} extension(s), ray tracing {}",
            extensions.len(),
            if enable_rt { "enabled" } else { "disabled" }
        );

        // SAFETY: queue index 0 of the family was requested above.
        let graphics_queue =
            unsafe { device.get_device_queue(physical_device_info.queue_family, 0) };
        debug!(
            "Graphics queue retrieved from family {}",
            physical_device_info.queue_family
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical_device_info.device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;
        debug!("GPU memory allocator initialized");

        let (ray_tracing, rt_loaders) = if enable_rt {
            let loaders = RayTracingLoaders {
                acceleration_structure: ash::khr::acceleration_structure::Device::new(
                    instance.handle(),
                    &device,
                ),
                ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device::new(
                    instance.handle(),
                    &device,
                ),
            };
            (physical_device_info.ray_tracing, Some(loaders))
        } else {
            (
                RayTracingSupport::Unsupported {
                    reason: "ray tracing not enabled on this device",
                },
                None,
            )
        };

        Ok(Arc::new(Self {
            device,
            physical_device: physical_device_info.device,
            properties: physical_device_info.properties,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            graphics_queue,
            queue_family: physical_device_info.queue_family,
            ray_tracing,
            rt_loaders,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the physical device properties.
    #[inline]
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Returns the graphics queue handle.
    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Returns the graphics queue family index.
    #[inline]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Returns the ray-tracing tier enabled on this device.
    #[inline]
    pub fn ray_tracing(&self) -> &RayTracingSupport {
        &self.ray_tracing
    }

    /// Returns the ray-tracing extension loaders.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::RayTracingUnsupported`] when ray tracing is not
    /// enabled on this device.
    pub fn rt_loaders(&self) -> RhiResult<&RayTracingLoaders> {
        self.rt_loaders
            .as_ref()
            .ok_or(RhiError::RayTracingUnsupported)
    }

    /// Locks the GPU memory allocator.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidHandle`] if a previous holder panicked.
    pub fn allocator(&self) -> RhiResult<MutexGuard<'_, Allocator>> {
        self.allocator
            .lock()
            .map_err(|_| RhiError::InvalidHandle("allocator mutex poisoned".to_string()))
    }

    /// Returns the GPU virtual address of a buffer created with
    /// `SHADER_DEVICE_ADDRESS` usage.
    pub fn buffer_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        // SAFETY: the buffer is alive and has device-address usage.
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// Waits for the device to become idle.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DeviceLost`] if the device was lost.
    pub fn wait_idle(&self) -> RhiResult<()> {
        // SAFETY: the device handle is valid.
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // SAFETY: all resources holding an Arc<Device> are gone by now; the
        // allocator must release its memory blocks before the device dies.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// SAFETY: ash::Device is Send + Sync, handles are plain integers and the
// allocator is guarded by a Mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

/// Builds the device extension list.
fn device_extensions(presenting: bool, ray_tracing: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::with_capacity(4);
    if presenting {
        extensions.push(ash::khr::swapchain::NAME);
    }
    if ray_tracing {
        extensions.extend_from_slice(&RAY_TRACING_EXTENSIONS);
    }
    extensions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_raster_extensions_are_empty() {
        assert!(device_extensions(false, false).is_empty());
    }

    #[test]
    fn test_ray_tracing_extensions_added_on_request() {
        let extensions = device_extensions(true, true);
        assert_eq!(extensions.len(), 4);
        assert!(extensions.contains(&ash::khr::swapchain::NAME));
        assert!(extensions.contains(&ash::khr::acceleration_structure::NAME));
        assert!(extensions.contains(&ash::khr::ray_tracing_pipeline::NAME));
        assert!(extensions.contains(&ash::khr::deferred_host_operations::NAME));
    }

    #[test]
    fn test_raster_only_device_has_no_ray_tracing() {
        let Some(ctx) = crate::test_support::headless() else {
            return;
        };
        assert!(!ctx.device.ray_tracing().is_supported());
        assert!(matches!(
            ctx.device.rt_loaders(),
            Err(RhiError::RayTracingUnsupported)
        ));
    }

    #[test]
    fn test_ray_tracing_enabled_only_when_supported() {
        let Some(ctx) = crate::test_support::headless_with(true) else {
            return;
        };
        assert_eq!(
            ctx.device.ray_tracing().is_supported(),
            ctx.physical.ray_tracing.is_supported()
        );
        assert_eq!(
            ctx.device.rt_loaders().is_ok(),
            ctx.physical.ray_tracing.is_supported()
        );
    }

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }
}
