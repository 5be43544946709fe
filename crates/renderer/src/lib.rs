//! Frame orchestration and the two rendering back ends.
//!
//! This crate orchestrates the rendering process:
//! - Frame slots bounded by a monotonic fence
//! - Scene upload, BLAS and initial TLAS build
//! - The raster and ray-tracing back ends behind [`RenderBackend`]
//! - Swapchain acquire, submit and present

pub mod backend;
pub mod constants;
pub mod depth_buffer;
mod error;
pub mod frame;
mod frame_renderer;
pub mod raster;
pub mod raytrace;
pub mod scene_resources;

pub use backend::{BackBuffer, BackendKind, FrameContext, RenderBackend, SceneContext};
pub use error::{RendererError, RendererResult};
pub use frame::{FrameSlots, MAX_FRAMES_IN_FLIGHT};
pub use frame_renderer::Renderer;
pub use scene_resources::SceneResources;
