//! The seam between the frame loop and the two rendering techniques.
//!
//! # Overview
//!
//! The [`Renderer`](crate::Renderer) owns the swapchain, the frame ring and
//! the scene. Every frame it hands the active [`RenderBackend`] a
//! [`FrameContext`] whose back buffer is already in the render-target state;
//! the back end must leave it in that state when it returns.
//!
//! Both back ends bind the renderer's [`DescriptorTable`] as set 0 and pass
//! the table slots they read as push constants.

use std::fmt;

use ash::vk;

use renderer_rhi::RhiResult;
use renderer_rhi::command::CommandBuffer;
use renderer_rhi::descriptor::DescriptorTable;
use renderer_scene::Camera;

use crate::constants::LightConstants;
use crate::frame::FrameSlots;
use crate::scene_resources::{SceneResources, SceneViews};

/// Which technique produces the image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Vertex and fragment shading into the back buffer.
    #[default]
    Raster,
    /// Hardware ray tracing into an offscreen image, then copied.
    RayTrace,
}

impl BackendKind {
    /// Mode label shown in the window title.
    pub fn label(self) -> &'static str {
        match self {
            BackendKind::Raster => "Rasterization",
            BackendKind::RayTrace => "Raytracing",
        }
    }

    /// Back end selected by a toggle request.
    ///
    /// Without ray tracing the request is ignored and raster stays active.
    pub fn toggled(self, ray_tracing_available: bool) -> Self {
        match self {
            BackendKind::Raster if ray_tracing_available => BackendKind::RayTrace,
            BackendKind::Raster => BackendKind::Raster,
            BackendKind::RayTrace => BackendKind::Raster,
        }
    }

    /// Back end used at start-up.
    pub fn initial(prefer_ray_tracing: bool, ray_tracing_available: bool) -> Self {
        if prefer_ray_tracing && ray_tracing_available {
            BackendKind::RayTrace
        } else {
            BackendKind::Raster
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The acquired swapchain image for this frame.
#[derive(Clone, Copy, Debug)]
pub struct BackBuffer {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

/// Everything a back end may touch while recording one frame.
pub struct FrameContext<'a> {
    /// Open command buffer of the current slot.
    pub cmd: &'a CommandBuffer,
    /// Index of the current frame slot.
    pub slot: usize,
    /// Back buffer in the render-target state.
    pub target: BackBuffer,
    /// `None` until a scene has been loaded.
    pub scene: Option<&'a SceneResources>,
    /// Light constants written into the slot's light buffer this frame.
    pub light: &'a LightConstants,
    /// Table slot of the slot's light view.
    pub light_view: u32,
    pub camera: &'a Camera,
}

/// Everything a back end may touch while binding a newly uploaded scene.
pub struct SceneContext<'a> {
    pub scene: &'a SceneResources,
    /// Shared material and texture views, already written.
    pub views: SceneViews,
    pub table: &'a DescriptorTable,
    pub slots: &'a FrameSlots,
    /// Open command buffer of the upload, submitted by the caller.
    pub cmd: &'a CommandBuffer,
}

/// A rendering technique.
///
/// Implementations keep their own pipelines, descriptor sets and
/// size-dependent images. They never present and never submit.
pub trait RenderBackend {
    /// Writes the back end's views of the scene and records any build work.
    ///
    /// Called once per scene load, with nothing in flight on the GPU.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource the back end needs cannot be created.
    fn attach_scene(&mut self, ctx: &SceneContext<'_>) -> RhiResult<()>;

    /// Writes back-end specific constants for the current slot.
    ///
    /// # Errors
    ///
    /// Returns an error if a constant buffer cannot be written.
    fn update(&mut self, _ctx: &FrameContext<'_>) -> RhiResult<()> {
        Ok(())
    }

    /// Records this frame's commands.
    ///
    /// # Errors
    ///
    /// Returns an error if recording fails.
    fn record_frame(&mut self, ctx: &mut FrameContext<'_>) -> RhiResult<()>;

    /// Recreates size-dependent resources and rewrites their table views.
    /// The GPU is idle when called.
    ///
    /// # Errors
    ///
    /// Returns an error if the new resources cannot be created.
    fn resize(&mut self, extent: vk::Extent2D, table: &DescriptorTable) -> RhiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_without_ray_tracing_stays_raster() {
        assert_eq!(BackendKind::Raster.toggled(false), BackendKind::Raster);
    }

    #[test]
    fn test_toggle_flips_with_ray_tracing() {
        let kind = BackendKind::Raster.toggled(true);
        assert_eq!(kind, BackendKind::RayTrace);
        assert_eq!(kind.toggled(true), BackendKind::Raster);
    }

    #[test]
    fn test_initial_backend() {
        assert_eq!(BackendKind::initial(true, true), BackendKind::RayTrace);
        assert_eq!(BackendKind::initial(true, false), BackendKind::Raster);
        assert_eq!(BackendKind::initial(false, true), BackendKind::Raster);
    }

    #[test]
    fn test_labels() {
        assert_eq!(BackendKind::Raster.to_string(), "Rasterization");
        assert_eq!(BackendKind::RayTrace.to_string(), "Raytracing");
    }
}
