//! Shared fixtures for tests that need a real device.

use std::sync::Arc;

use crate::device::Device;
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, select_physical_device};

/// Headless device fixture. Field order is drop order.
pub(crate) struct HeadlessContext {
    pub device: Arc<Device>,
    pub physical: PhysicalDeviceInfo,
    #[allow(dead_code)]
    pub instance: Instance,
}

/// Creates a headless device, or prints a skip notice and returns `None`
/// when the machine has no usable Vulkan driver.
pub(crate) fn headless() -> Option<HeadlessContext> {
    headless_with(false)
}

/// Same as [`headless`] but asks for ray tracing when available.
pub(crate) fn headless_with(ray_tracing: bool) -> Option<HeadlessContext> {
    let instance = match Instance::new_headless(false) {
        Ok(instance) => instance,
        Err(e) => {
            eprintln!("Skipping test: Vulkan not available ({e})");
            return None;
        }
    };
    let physical = match select_physical_device(&instance, None) {
        Ok(info) => info,
        Err(e) => {
            eprintln!("Skipping test: no suitable GPU ({e})");
            return None;
        }
    };
    let device = match Device::new(&instance, &physical, ray_tracing) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Skipping test: device creation failed ({e})");
            return None;
        }
    };
    Some(HeadlessContext {
        device,
        physical,
        instance,
    })
}
