//! Shader module management.
//!
//! This module handles SPIR-V loading and VkShaderModule creation for both
//! the raster and the ray-tracing pipelines. Shader sources are compiled
//! ahead of time; only SPIR-V blobs are consumed here.
//!
//! # Overview
//!
//! - [`ShaderStage`] defines the type of shader (vertex, ray generation, etc.)
//! - [`Shader`] wraps VkShaderModule with stage and entry point information
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::path::Path;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::shader::{Shader, ShaderStage};
//!
//! # fn example(device: Arc<Device>) -> Result<(), renderer_rhi::RhiError> {
//! // Load vertex shader from SPIR-V file
//! let vertex_shader = Shader::from_spirv_file(
//!     device.clone(),
//!     Path::new("shaders/triangle.vert.spv"),
//!     ShaderStage::Vertex,
//!     "main",
//! )?;
//!
//! // Load fragment shader from SPIR-V file
//! let fragment_shader = Shader::from_spirv_file(
//!     device.clone(),
//!     Path::new("shaders/triangle.frag.spv"),
//!     ShaderStage::Fragment,
//!     "main",
//! )?;
//!
//! // Get pipeline shader stage create info for pipeline creation
//! let _vertex_stage_info = vertex_shader.stage_create_info();
//! let _fragment_stage_info = fragment_shader.stage_create_info();
//! # Ok(())
//! # }
//! ```

use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Shader stage type.
///
/// Defines which stage of the graphics, compute or ray-tracing pipeline
/// the shader will be used in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader stage - processes each vertex
    Vertex,
    /// Fragment (pixel) shader stage - processes each fragment
    Fragment,
    /// Compute shader stage - general-purpose GPU computation
    Compute,
    /// Ray generation - launches primary rays, one invocation per pixel
    RayGen,
    /// Miss - runs when a ray hits nothing
    Miss,
    /// Closest hit - runs for the nearest intersection
    ClosestHit,
    /// Any hit - runs for every candidate intersection
    AnyHit,
}

impl ShaderStage {
    /// Converts the shader stage to Vulkan shader stage flags.
    ///
    /// # Returns
    ///
    /// The corresponding `vk::ShaderStageFlags` for this stage.
    pub fn to_vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
            ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        }
    }

    /// Returns a human-readable name for the shader stage.
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
            ShaderStage::RayGen => "ray generation",
            ShaderStage::Miss => "miss",
            ShaderStage::ClosestHit => "closest hit",
            ShaderStage::AnyHit => "any hit",
        }
    }

    /// Returns `true` for the ray-tracing stages.
    pub fn is_ray_tracing(self) -> bool {
        matches!(
            self,
            ShaderStage::RayGen | ShaderStage::Miss | ShaderStage::ClosestHit | ShaderStage::AnyHit
        )
    }

    /// Guesses the stage from a glslang-style file name such as
    /// `shadow.rmiss.spv`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".spv").unwrap_or(name);
        let extension = stem.rsplit('.').next()?;
        match extension {
            "vert" => Some(ShaderStage::Vertex),
            "frag" => Some(ShaderStage::Fragment),
            "comp" => Some(ShaderStage::Compute),
            "rgen" => Some(ShaderStage::RayGen),
            "rmiss" => Some(ShaderStage::Miss),
            "rchit" => Some(ShaderStage::ClosestHit),
            "rahit" => Some(ShaderStage::AnyHit),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Vulkan shader module wrapper.
///
/// This struct manages the lifecycle of a VkShaderModule and provides
/// the necessary information for creating graphics or compute pipelines.
///
/// # Thread Safety
///
/// The shader module itself is immutable after creation and can be
/// safely shared between threads. The underlying Vulkan handle is
/// managed by the device.
pub struct Shader {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan shader module handle.
    module: vk::ShaderModule,
    /// Shader stage type.
    stage: ShaderStage,
    /// Entry point function name.
    entry_point: CString,
}

impl Shader {
    /// Creates a shader module from a SPIR-V file.
    ///
    /// This method reads the SPIR-V binary from the specified file path
    /// and creates a Vulkan shader module.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `path` - Path to the SPIR-V file
    /// * `stage` - The shader stage (vertex, fragment, etc.)
    /// * `entry_point` - The name of the entry point function (typically "main")
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The SPIR-V data is invalid
    /// - Shader module creation fails
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use std::path::Path;
    /// use renderer_rhi::device::Device;
    /// use renderer_rhi::shader::{Shader, ShaderStage};
    ///
    /// # fn example(device: Arc<Device>) -> Result<(), renderer_rhi::RhiError> {
    /// let shader = Shader::from_spirv_file(
    ///     device,
    ///     Path::new("shaders/main.vert.spv"),
    ///     ShaderStage::Vertex,
    ///     "main",
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_spirv_file(
        device: Arc<Device>,
        path: &Path,
        stage: ShaderStage,
        entry_point: &str,
    ) -> RhiResult<Self> {
        debug!("Loading {} shader from {:?}", stage, path);

        let bytes = std::fs::read(path).map_err(|e| {
            RhiError::ShaderError(format!("Failed to read shader file {:?}: {}", path, e))
        })?;

        Self::from_spirv_bytes(device, &bytes, stage, entry_point)
    }

    /// Creates a shader module from SPIR-V bytes.
    ///
    /// This method creates a Vulkan shader module from pre-loaded SPIR-V data.
    /// The bytes must be valid SPIR-V code and properly aligned (4-byte alignment).
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `bytes` - The SPIR-V binary data
    /// * `stage` - The shader stage (vertex, fragment, etc.)
    /// * `entry_point` - The name of the entry point function (typically "main")
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The byte length is not a multiple of 4 (SPIR-V alignment requirement)
    /// - The entry point name contains null bytes
    /// - Shader module creation fails
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use renderer_rhi::device::Device;
    /// use renderer_rhi::shader::{Shader, ShaderStage};
    ///
    /// # fn example(device: Arc<Device>, spirv_bytes: &[u8]) -> Result<(), renderer_rhi::RhiError> {
    /// let shader = Shader::from_spirv_bytes(
    ///     device,
    ///     spirv_bytes,
    ///     ShaderStage::Fragment,
    ///     "main",
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_spirv_bytes(
        device: Arc<Device>,
        bytes: &[u8],
        stage: ShaderStage,
        entry_point: &str,
    ) -> RhiResult<Self> {
        // Validate SPIR-V alignment
        if !bytes.len().is_multiple_of(4) {
            return Err(RhiError::ShaderError(format!(
                "SPIR-V code must be 4-byte aligned, got {} bytes",
                bytes.len()
            )));
        }

        // Convert bytes to u32 code words
        let code: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        // Create shader module
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        // SAFETY: `code` is word-aligned SPIR-V; the driver validates the rest.
        let module = unsafe {
            device
                .handle()
                .create_shader_module(&create_info, None)
                .map_err(|e| RhiError::ShaderError(format!("{stage} module rejected: {e}")))?
        };

        // Create entry point CString
        let entry_point_cstring = CString::new(entry_point)
            .map_err(|e| RhiError::ShaderError(format!("Invalid entry point name: {}", e)))?;

        debug!(
            "Created {} shader module with entry point '{}'",
            stage, entry_point
        );

        Ok(Self {
            device,
            module,
            stage,
            entry_point: entry_point_cstring,
        })
    }

    /// Returns the Vulkan shader module handle.
    ///
    /// This handle can be used directly with Vulkan API calls.
    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Returns the shader stage.
    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Returns the entry point function name as a C string reference.
    #[inline]
    pub fn entry_point(&self) -> &std::ffi::CStr {
        &self.entry_point
    }

    /// Creates a pipeline shader stage create info structure.
    ///
    /// This structure is used when creating graphics or compute pipelines.
    /// The returned structure borrows from this shader and must not outlive it.
    ///
    /// # Returns
    ///
    /// A `vk::PipelineShaderStageCreateInfo` ready for pipeline creation.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use std::path::Path;
    /// use renderer_rhi::device::Device;
    /// use renderer_rhi::shader::{Shader, ShaderStage};
    ///
    /// # fn example(device: Arc<Device>) -> Result<(), renderer_rhi::RhiError> {
    /// let vertex_shader = Shader::from_spirv_file(
    ///     device.clone(),
    ///     Path::new("shaders/main.vert.spv"),
    ///     ShaderStage::Vertex,
    ///     "main",
    /// )?;
    ///
    /// let stage_info = vertex_shader.stage_create_info();
    /// // Use stage_info in pipeline creation...
    /// # Ok(())
    /// # }
    /// ```
    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.to_vk_stage())
            .module(self.module)
            .name(&self.entry_point)
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        // SAFETY: modules are only referenced during pipeline creation.
        unsafe {
            self.device
                .handle()
                .destroy_shader_module(self.module, None);
        }
        debug!("Destroyed {} shader module", self.stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_stage_to_vk_stage() {
        assert_eq!(
            ShaderStage::Vertex.to_vk_stage(),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            ShaderStage::Fragment.to_vk_stage(),
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            ShaderStage::RayGen.to_vk_stage(),
            vk::ShaderStageFlags::RAYGEN_KHR
        );
        assert_eq!(ShaderStage::Miss.to_vk_stage(), vk::ShaderStageFlags::MISS_KHR);
        assert_eq!(
            ShaderStage::ClosestHit.to_vk_stage(),
            vk::ShaderStageFlags::CLOSEST_HIT_KHR
        );
        assert_eq!(
            ShaderStage::AnyHit.to_vk_stage(),
            vk::ShaderStageFlags::ANY_HIT_KHR
        );
    }

    #[test]
    fn test_shader_stage_name() {
        assert_eq!(ShaderStage::Vertex.name(), "vertex");
        assert_eq!(ShaderStage::RayGen.name(), "ray generation");
        assert_eq!(format!("{}", ShaderStage::ClosestHit), "closest hit");
    }

    #[test]
    fn test_ray_tracing_stages() {
        assert!(ShaderStage::Miss.is_ray_tracing());
        assert!(ShaderStage::AnyHit.is_ray_tracing());
        assert!(!ShaderStage::Fragment.is_ray_tracing());
        assert!(!ShaderStage::Compute.is_ray_tracing());
    }

    #[test]
    fn test_stage_from_file_name() {
        assert_eq!(
            ShaderStage::from_file_name("raytrace.rgen.spv"),
            Some(ShaderStage::RayGen)
        );
        assert_eq!(
            ShaderStage::from_file_name("shadow.rmiss.spv"),
            Some(ShaderStage::Miss)
        );
        assert_eq!(
            ShaderStage::from_file_name("shadow.rahit"),
            Some(ShaderStage::AnyHit)
        );
        assert_eq!(
            ShaderStage::from_file_name("mesh.vert.spv"),
            Some(ShaderStage::Vertex)
        );
        assert_eq!(ShaderStage::from_file_name("readme.txt"), None);
    }
}
