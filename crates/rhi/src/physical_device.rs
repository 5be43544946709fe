//! Physical device (GPU) selection and capability queries.
//!
//! # Overview
//!
//! Selection works in three steps:
//! 1. Enumerate every GPU and drop those without Vulkan 1.3, a graphics
//!    queue family, the descriptor indexing features the resource view
//!    table needs, or (when presenting) a family that can present
//! 2. Score the survivors, preferring discrete GPUs and larger VRAM
//! 3. Query the ray-tracing tier of the winner
//!
//! The ray-tracing tier is a property of the physical device and is reported
//! as [`RayTracingSupport`]. A device without it is still selected; the
//! renderer then runs raster-only.
//!
//! # Example
//!
//! ```no_run
//! use renderer_rhi::instance::Instance;
//! use renderer_rhi::physical_device::select_physical_device;
//!
//! let instance = Instance::new_headless(false).expect("no Vulkan");
//! let info = select_physical_device(&instance, None).expect("no GPU");
//! println!("{} ray tracing: {}", info.device_name(), info.ray_tracing.is_supported());
//! ```

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;

/// Device extensions required by the ray-tracing tier.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Ray-tracing pipeline limits needed to lay out shader binding tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size in bytes of one shader group handle.
    pub shader_group_handle_size: u32,
    /// Required alignment of each record inside a table.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each table start address.
    pub shader_group_base_alignment: u32,
    /// Maximum `traceRay` recursion depth.
    pub max_ray_recursion_depth: u32,
    /// Maximum record stride.
    pub max_shader_group_stride: u32,
}

impl From<&vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>> for RayTracingProperties {
    fn from(props: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>) -> Self {
        Self {
            shader_group_handle_size: props.shader_group_handle_size,
            shader_group_handle_alignment: props.shader_group_handle_alignment,
            shader_group_base_alignment: props.shader_group_base_alignment,
            max_ray_recursion_depth: props.max_ray_recursion_depth,
            max_shader_group_stride: props.max_shader_group_stride,
        }
    }
}

/// Ray-tracing capability tier of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RayTracingSupport {
    /// The device cannot run the ray-tracing backend.
    Unsupported {
        /// Short human-readable reason, for logs.
        reason: &'static str,
    },
    /// The device exposes acceleration structures and ray-tracing pipelines.
    Supported(RayTracingProperties),
}

impl RayTracingSupport {
    /// Decides the tier from raw query results.
    ///
    /// All three extensions must be present and both the acceleration
    /// structure and ray-tracing pipeline features must be enabled-able,
    /// together with buffer device addresses.
    pub fn evaluate(
        has_extensions: bool,
        acceleration_structure: bool,
        ray_tracing_pipeline: bool,
        buffer_device_address: bool,
        properties: RayTracingProperties,
    ) -> Self {
        if !has_extensions {
            return Self::Unsupported {
                reason: "ray tracing extensions not present",
            };
        }
        if !acceleration_structure {
            return Self::Unsupported {
                reason: "accelerationStructure feature not supported",
            };
        }
        if !ray_tracing_pipeline {
            return Self::Unsupported {
                reason: "rayTracingPipeline feature not supported",
            };
        }
        if !buffer_device_address {
            return Self::Unsupported {
                reason: "bufferDeviceAddress feature not supported",
            };
        }
        if properties.max_ray_recursion_depth < 2 {
            return Self::Unsupported {
                reason: "max ray recursion depth below 2",
            };
        }
        Self::Supported(properties)
    }

    /// Returns `true` for [`RayTracingSupport::Supported`].
    #[inline]
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Supported(_))
    }

    /// Returns the pipeline limits when supported.
    #[inline]
    pub fn properties(&self) -> Option<&RayTracingProperties> {
        match self {
            Self::Supported(props) => Some(props),
            Self::Unsupported { .. } => None,
        }
    }
}

/// Information about the selected physical device.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version, etc.).
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory properties (heap sizes, memory types).
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family used for graphics, compute, transfer and present.
    pub queue_family: u32,
    /// Whether the queue family can present to the surface passed at selection.
    pub can_present: bool,
    /// Ray-tracing capability tier.
    pub ray_tracing: RayTracingSupport,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Returns the total device local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_family", &self.queue_family)
            .field("ray_tracing", &self.ray_tracing)
            .finish()
    }
}

/// Selects the most suitable physical device.
///
/// # Arguments
///
/// * `instance` - The Vulkan instance
/// * `surface` - Surface and loader to check present support against, or
///   `None` for headless use
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no device meets the requirements.
pub fn select_physical_device(
    instance: &Instance,
    surface: Option<(vk::SurfaceKHR, &ash::khr::surface::Instance)>,
) -> RhiResult<PhysicalDeviceInfo> {
    // SAFETY: the instance is valid for the duration of the call.
    let devices = unsafe { instance.handle().enumerate_physical_devices()? };

    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }

    info!("Found {} GPU(s)", devices.len());

    let best = devices
        .into_iter()
        .filter_map(|device| check_device_suitability(instance.handle(), device, surface))
        .map(|info| {
            let score = rate_device(&info);
            debug!(
                "GPU '{}' ({}) - score {}",
                info.device_name(),
                info.device_type_name(),
                score
            );
            (info, score)
        })
        .max_by_key(|(_, score)| *score);

    let Some((selected, score)) = best else {
        warn!("No suitable GPU found with required capabilities");
        return Err(RhiError::NoSuitableGpu);
    };

    info!(
        "Selected GPU: '{}' ({}), score {}, ray tracing: {:?}",
        selected.device_name(),
        selected.device_type_name(),
        score,
        selected.ray_tracing
    );

    Ok(selected)
}

fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<(vk::SurfaceKHR, &ash::khr::surface::Instance)>,
) -> Option<PhysicalDeviceInfo> {
    // SAFETY: `device` was enumerated from `instance`.
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    let name = properties
        .device_name_as_c_str()
        .ok()
        .and_then(|n| n.to_str().ok())
        .unwrap_or("Unknown")
        .to_owned();

    if properties.api_version < vk::API_VERSION_1_3 {
        debug!("GPU '{}' skipped: Vulkan 1.3 not supported", name);
        return None;
    }

    // SAFETY: `device` was enumerated from `instance`.
    let extensions = unsafe { instance.enumerate_device_extension_properties(device) }.ok()?;
    let has_extension = |wanted: &CStr| {
        extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|n| n == wanted))
    };

    if surface.is_some() && !has_extension(ash::khr::swapchain::NAME) {
        debug!("GPU '{}' skipped: no swapchain extension", name);
        return None;
    }

    let (queue_family, can_present) = find_queue_family(instance, device, surface)?;
    if surface.is_some() && !can_present {
        debug!("GPU '{}' skipped: graphics queue cannot present", name);
        return None;
    }

    if !query_descriptor_table_support(instance, device) {
        debug!("GPU '{}' skipped: descriptor indexing features missing", name);
        return None;
    }

    let ray_tracing = query_ray_tracing(
        instance,
        device,
        RAY_TRACING_EXTENSIONS.iter().all(|ext| has_extension(ext)),
    );

    Some(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_family,
        can_present,
        ray_tracing,
    })
}

/// Returns `true` if shaders can index the resource view table.
///
/// The table is a set of runtime-sized, partially bound descriptor arrays
/// indexed with push-constant values.
pub fn supports_descriptor_table(
    core: &vk::PhysicalDeviceFeatures,
    vk12: &vk::PhysicalDeviceVulkan12Features<'_>,
) -> bool {
    [
        core.shader_storage_buffer_array_dynamic_indexing,
        core.shader_sampled_image_array_dynamic_indexing,
        core.shader_storage_image_array_dynamic_indexing,
        vk12.runtime_descriptor_array,
        vk12.descriptor_binding_partially_bound,
    ]
    .into_iter()
    .all(|feature| feature == vk::TRUE)
}

fn query_descriptor_table_support(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vk12_features);
    // SAFETY: the chained struct lives until the end of this call.
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    let core = features.features;
    supports_descriptor_table(&core, &vk12_features)
}

/// Queries the ray-tracing features and pipeline properties of a device.
fn query_ray_tracing(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    has_extensions: bool,
) -> RayTracingSupport {
    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vk12_features);
    if has_extensions {
        features = features.push_next(&mut as_features).push_next(&mut rt_features);
    }
    // SAFETY: the chained structs live until the end of this call.
    unsafe { instance.get_physical_device_features2(device, &mut features) };

    let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    if has_extensions {
        let mut properties = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_properties);
        // SAFETY: as above.
        unsafe { instance.get_physical_device_properties2(device, &mut properties) };
    }

    RayTracingSupport::evaluate(
        has_extensions,
        as_features.acceleration_structure == vk::TRUE,
        rt_features.ray_tracing_pipeline == vk::TRUE,
        vk12_features.buffer_device_address == vk::TRUE,
        RayTracingProperties::from(&rt_properties),
    )
}

/// Finds the first graphics queue family, preferring one that can present.
fn find_queue_family(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<(vk::SurfaceKHR, &ash::khr::surface::Instance)>,
) -> Option<(u32, bool)> {
    // SAFETY: `device` was enumerated from `instance`.
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let mut fallback = None;
    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if family.queue_count == 0 || !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }
        let can_present = match surface {
            // SAFETY: the surface belongs to the same instance.
            Some((surface, loader)) => unsafe {
                loader
                    .get_physical_device_surface_support(device, index, surface)
                    .unwrap_or(false)
            },
            None => false,
        };
        if can_present || surface.is_none() {
            return Some((index, can_present));
        }
        fallback.get_or_insert((index, false));
    }
    fallback
}

/// Rates a physical device; higher is better.
fn rate_device(info: &PhysicalDeviceInfo) -> u64 {
    let mut score = match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 10_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1_000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 100,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    };

    score += u64::from(info.properties.limits.max_image_dimension2_d);
    score += (info.device_local_memory() / (1024 * 1024)).min(16_000);

    if info.ray_tracing.is_supported() {
        score += 5_000;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(depth: u32) -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: depth,
            max_shader_group_stride: 4096,
        }
    }

    #[test]
    fn test_supported_when_everything_present() {
        let support = RayTracingSupport::evaluate(true, true, true, true, props(31));
        assert!(support.is_supported());
        assert_eq!(support.properties(), Some(&props(31)));
    }

    #[test]
    fn test_descriptor_table_needs_every_indexing_feature() {
        let core = vk::PhysicalDeviceFeatures::default()
            .shader_storage_buffer_array_dynamic_indexing(true)
            .shader_sampled_image_array_dynamic_indexing(true)
            .shader_storage_image_array_dynamic_indexing(true);
        let vk12 = vk::PhysicalDeviceVulkan12Features::default()
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true);
        assert!(supports_descriptor_table(&core, &vk12));

        let no_partial = vk12.descriptor_binding_partially_bound(false);
        assert!(!supports_descriptor_table(&core, &no_partial));
        let no_images = core.shader_storage_image_array_dynamic_indexing(false);
        assert!(!supports_descriptor_table(&no_images, &vk12));
        assert!(!supports_descriptor_table(
            &vk::PhysicalDeviceFeatures::default(),
            &vk::PhysicalDeviceVulkan12Features::default()
        ));
    }

    #[test]
    fn test_missing_extensions_is_unsupported() {
        let support = RayTracingSupport::evaluate(false, true, true, true, props(31));
        assert!(!support.is_supported());
        assert!(support.properties().is_none());
    }

    #[test]
    fn test_missing_features_is_unsupported() {
        assert!(!RayTracingSupport::evaluate(true, false, true, true, props(31)).is_supported());
        assert!(!RayTracingSupport::evaluate(true, true, false, true, props(31)).is_supported());
        assert!(!RayTracingSupport::evaluate(true, true, true, false, props(31)).is_supported());
    }

    #[test]
    fn test_shadow_rays_need_recursion_depth_two() {
        assert!(!RayTracingSupport::evaluate(true, true, true, true, props(1)).is_supported());
        assert!(RayTracingSupport::evaluate(true, true, true, true, props(2)).is_supported());
    }

    #[test]
    fn test_headless_selection() {
        let instance = match Instance::new_headless(false) {
            Ok(instance) => instance,
            Err(e) => {
                eprintln!("Skipping test: Vulkan not available ({e})");
                return;
            }
        };
        match select_physical_device(&instance, None) {
            Ok(info) => assert!(!info.can_present),
            Err(RhiError::NoSuitableGpu) => eprintln!("Skipping test: no Vulkan 1.3 GPU"),
            Err(e) => panic!("Unexpected error: {e:?}"),
        }
    }
}
