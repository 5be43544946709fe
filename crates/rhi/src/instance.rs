//! Vulkan instance management.
//!
//! # Overview
//!
//! The [`Instance`] owns the loaded Vulkan entry, the `VkInstance` and, when
//! validation is requested and installed, a debug messenger that forwards
//! validation output into `tracing`.
//!
//! Two construction paths exist:
//! - [`Instance::with_surface_extensions`] for windowed rendering, taking the
//!   extension list reported by the windowing system
//! - [`Instance::new_headless`] without any surface extension, used for
//!   offscreen work and for tests on machines without a display
//!
//! # Example
//!
//! ```no_run
//! use renderer_rhi::instance::Instance;
//!
//! let instance = Instance::new_headless(cfg!(debug_assertions)).expect("no Vulkan");
//! assert!(!instance.supports_surfaces());
//! ```

use std::ffi::{CStr, c_char};

use ash::{Entry, vk};
use tracing::{debug, error, info, warn};

use crate::error::RhiResult;

/// The Khronos validation layer name.
const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan instance wrapper with optional validation layer support.
pub struct Instance {
    entry: Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surfaces: bool,
}

impl Instance {
    /// Creates an instance able to present to a window.
    ///
    /// # Arguments
    ///
    /// * `enable_validation` - Enable the Khronos validation layer if installed
    /// * `surface_extensions` - Extension names required by the window system,
    ///   usually from `ash_window::enumerate_required_extensions`
    ///
    /// # Errors
    ///
    /// Returns an error if the Vulkan library cannot be loaded or instance
    /// creation fails.
    pub fn with_surface_extensions(
        enable_validation: bool,
        surface_extensions: &[*const c_char],
    ) -> RhiResult<Self> {
        Self::create(enable_validation, surface_extensions)
    }

    /// Creates an instance without surface support.
    ///
    /// # Errors
    ///
    /// Returns an error if the Vulkan library cannot be loaded or instance
    /// creation fails.
    pub fn new_headless(enable_validation: bool) -> RhiResult<Self> {
        Self::create(enable_validation, &[])
    }

    fn create(enable_validation: bool, surface_extensions: &[*const c_char]) -> RhiResult<Self> {
        // SAFETY: loading the system Vulkan library has no preconditions beyond
        // the library itself being well-formed.
        let entry = unsafe { Entry::load()? };

        let validation_available =
            enable_validation && Self::is_validation_layer_available(&entry)?;
        if enable_validation && !validation_available {
            warn!("Validation layer requested but not available, proceeding without it");
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"Hybrid Renderer")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"renderer")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = surface_extensions.to_vec();
        if validation_available {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layers = if validation_available {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        // SAFETY: every pointer in `create_info` references data that lives
        // until the end of this call.
        let instance = unsafe { entry.create_instance(&create_info, None)? };

        info!(
            surfaces = !surface_extensions.is_empty(),
            validation = validation_available,
            "Vulkan instance created (API 1.3)"
        );

        let (debug_utils, debug_messenger) = if validation_available {
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&debug_utils)?;
            debug!("Debug messenger created");
            (Some(debug_utils), Some(messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
            surfaces: !surface_extensions.is_empty(),
        })
    }

    /// Returns the Vulkan instance handle.
    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    /// Returns the Vulkan entry point loader.
    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Returns whether validation layers are enabled.
    #[inline]
    pub fn has_validation(&self) -> bool {
        self.debug_messenger.is_some()
    }

    /// Returns whether the instance was created with surface extensions.
    #[inline]
    pub fn supports_surfaces(&self) -> bool {
        self.surfaces
    }

    fn is_validation_layer_available(entry: &Entry) -> RhiResult<bool> {
        // SAFETY: enumerating layers has no preconditions.
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };

        Ok(available_layers.iter().any(|layer| {
            layer
                .layer_name_as_c_str()
                .is_ok_and(|name| name == VALIDATION_LAYER_NAME)
        }))
    }

    fn setup_debug_messenger(
        debug_utils: &ash::ext::debug_utils::Instance,
    ) -> RhiResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        // SAFETY: the callback is a plain function with 'static lifetime.
        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
        Ok(messenger)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // SAFETY: all child objects are owned by types that hold an Arc to the
        // device, which in turn must be dropped before the instance.
        unsafe {
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        info!("Vulkan instance destroyed");
    }
}

/// Forwards validation layer messages into `tracing`.
///
/// # Safety
///
/// Called by the Vulkan loader with a valid (or null) callback data pointer.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }

    // SAFETY: checked for null above; the loader keeps it alive for the call.
    let callback_data = unsafe { &*p_callback_data };
    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::Borrowed("(no message)")
    } else {
        // SAFETY: p_message is a null-terminated string owned by the loader.
        unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() }
    };

    let kind = if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", kind, "{}", message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", kind, "{}", message);
    } else {
        debug!(target: "vulkan", kind, "{}", message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_instance_has_no_surfaces() {
        match Instance::new_headless(false) {
            Ok(instance) => {
                assert!(!instance.supports_surfaces());
                assert!(!instance.has_validation());
            }
            Err(e) => eprintln!("Skipping test: Vulkan not available ({e})"),
        }
    }

    #[test]
    fn test_validation_request_is_tolerated() {
        match Instance::new_headless(true) {
            Ok(instance) => {
                if instance.has_validation() {
                    assert!(instance.debug_utils.is_some());
                }
            }
            Err(e) => eprintln!("Skipping test: Vulkan not available ({e})"),
        }
    }
}
