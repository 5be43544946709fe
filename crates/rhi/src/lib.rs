//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - Instance and device creation, including the ray-tracing capability query
//! - The command queue and its monotonic timeline fence
//! - Command recording, buffers, images and descriptors
//! - Raster pipelines, ray-tracing pipelines and shader binding tables
//! - Bottom- and top-level acceleration structures
//! - Swapchain management

mod error;

pub mod acceleration_structure;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod queue;
pub mod raytracing;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vertex;

#[cfg(test)]
mod test_support;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
