//! Frame orchestration.
//!
//! This module provides the [`Renderer`] that owns the device, the swapchain
//! and the frame ring, and drives the active back end once per frame.
//!
//! # Frame sequence
//!
//! 1. Wait for the current slot's previous submission
//! 2. Acquire a swapchain image
//! 3. Write the slot's constants and let the back end write its own
//! 4. Back buffer: undefined → render target
//! 5. Record the active back end
//! 6. Back buffer: render target → present
//! 7. Submit, record the fence value against the slot, present, advance

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, warn};

use renderer_core::RendererConfig;
use renderer_platform::{Surface, Window};
use renderer_resources::{MeshData, TextureData};
use renderer_rhi::buffer::UploadTracker;
use renderer_rhi::command::CommandContext;
use renderer_rhi::descriptor::{DescriptorCapacity, DescriptorTable};
use renderer_rhi::device::Device;
use renderer_rhi::image::ImageState;
use renderer_rhi::instance::Instance;
use renderer_rhi::physical_device::select_physical_device;
use renderer_rhi::queue::{CommandQueue, SubmitBatch, WaitSemaphore};
use renderer_rhi::swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
use renderer_rhi::sync::Semaphore;
use renderer_rhi::{RhiError, RhiResult};
use renderer_scene::{Camera, PointLight};

use crate::backend::{BackBuffer, BackendKind, FrameContext, RenderBackend, SceneContext};
use crate::constants::{LightConstants, ObjectConstants, object_world};
use crate::error::RendererResult;
use crate::frame::{FrameSlots, MAX_FRAMES_IN_FLIGHT};
use crate::raster::RasterBackend;
use crate::raytrace::RayTraceBackend;
use crate::scene_resources::{SceneResources, SceneViews};

/// Dual-back-end renderer for one window.
///
/// # Resource Destruction Order
///
/// Fields drop in declaration order after [`Drop`] has drained the queue:
/// back ends and scene first, then frame slots and semaphores, the
/// swapchain, the queue, the last reference to the device, the surface and
/// finally the instance.
pub struct Renderer {
    raster: RasterBackend,
    ray_trace: Option<RayTraceBackend>,
    scene: Option<SceneResources>,
    slots: FrameSlots,
    /// One per swapchain image, signaled by the submission that renders it.
    render_finished: Vec<Semaphore>,
    descriptors: DescriptorTable,
    scene_views: SceneViews,
    swapchain: Swapchain,
    queue: CommandQueue,
    device: Arc<Device>,
    surface: Surface,
    instance: Instance,

    active: BackendKind,
    width: u32,
    height: u32,
    needs_recreate: bool,
}

impl Renderer {
    /// Creates a renderer for `window`.
    ///
    /// Ray tracing is enabled only when the configuration prefers it and the
    /// selected GPU supports it; the ray-tracing back end exists only then.
    ///
    /// # Errors
    ///
    /// Returns an error if any part of initialization fails, including a
    /// missing shader.
    pub fn new(window: &Window, config: &RendererConfig) -> RendererResult<Self> {
        let width = window.width();
        let height = window.height();
        info!("Initializing Vulkan renderer ({}x{})", width, height);

        let extensions = window.required_extensions()?;
        let instance =
            Instance::with_surface_extensions(config.render.enable_validation, &extensions)?;
        let surface = window.create_surface(instance.entry(), instance.handle())?;

        let physical_device_info =
            select_physical_device(&instance, Some((surface.handle(), surface.loader())))?;
        let device = Device::new(
            &instance,
            &physical_device_info,
            config.render.prefer_ray_tracing,
        )?;
        let ray_tracing = device.ray_tracing().is_supported();

        let queue = CommandQueue::new(device.clone())?;
        let swapchain = Swapchain::new(
            &instance,
            device.clone(),
            surface.handle(),
            width,
            height,
            config.render.vsync,
        )?;
        let mut descriptors = DescriptorTable::new(
            device.clone(),
            DescriptorCapacity::compute(MAX_FRAMES_IN_FLIGHT as u32, ray_tracing),
        )?;
        let slots = FrameSlots::create(&device, &mut descriptors)?;
        let scene_views = SceneViews::allocate(&mut descriptors)?;
        let render_finished = Self::create_render_finished(&device, swapchain.image_count())?;

        let shader_dir = config.assets.shader_dir.as_path();
        let raster = RasterBackend::new(
            device.clone(),
            &descriptors,
            &slots,
            shader_dir,
            swapchain.format(),
            swapchain.extent(),
        )?;
        let ray_trace = if ray_tracing {
            Some(RayTraceBackend::new(
                device.clone(),
                &mut descriptors,
                shader_dir,
                swapchain.extent(),
                slots.len(),
            )?)
        } else {
            info!("Ray tracing unavailable, running raster only");
            None
        };

        let active = BackendKind::initial(config.render.prefer_ray_tracing, ray_trace.is_some());

        info!(
            "Renderer initialized: {} swapchain images, {} frames in flight, \
             {}/{} descriptor slots, back end: {}",
            swapchain.image_count(),
            slots.len(),
            descriptors.slots().allocated(),
            descriptors.slots().capacity(),
            active
        );

        Ok(Self {
            raster,
            ray_trace,
            scene: None,
            slots,
            render_finished,
            descriptors,
            scene_views,
            swapchain,
            queue,
            device,
            surface,
            instance,
            active,
            width,
            height,
            needs_recreate: false,
        })
    }

    fn create_render_finished(device: &Arc<Device>, count: u32) -> RhiResult<Vec<Semaphore>> {
        (0..count).map(|_| Semaphore::new(device.clone())).collect()
    }

    // =========================================================================
    // Scene
    // =========================================================================

    /// Uploads `mesh` and `texture` and binds them into both back ends.
    ///
    /// Blocks until the upload, the BLAS build and the initial TLAS build
    /// have completed; staging and scratch memory is released afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if an allocation, the submission or the wait fails.
    pub fn load_scene(&mut self, mesh: &MeshData, texture: &TextureData) -> RendererResult<()> {
        // Table views are rewritten below; nothing may still read them.
        self.queue.join()?;

        let context = CommandContext::new(self.device.clone(), "scene upload")?;
        let cmd = context.command_buffer();
        cmd.begin()?;

        let mut uploads = UploadTracker::default();
        let mut scene = SceneResources::upload(&self.device, cmd, mesh, texture, &mut uploads)?;
        self.scene_views.write(&self.descriptors, &scene);
        let ctx = SceneContext {
            scene: &scene,
            views: self.scene_views,
            table: &self.descriptors,
            slots: &self.slots,
            cmd,
        };
        self.raster.attach_scene(&ctx)?;
        if let Some(ray_trace) = self.ray_trace.as_mut() {
            ray_trace.attach_scene(&ctx)?;
        }
        cmd.end()?;

        let command_buffers = [cmd.handle()];
        let value = self.queue.submit(SubmitBatch {
            command_buffers: &command_buffers,
            ..Default::default()
        })?;
        self.queue.join()?;
        uploads.release_after(&self.queue, value)?;
        scene.release_build_scratch();

        info!("Scene loaded: {} triangles", scene.index_count / 3);
        self.scene = Some(scene);
        Ok(())
    }

    // =========================================================================
    // Back-end selection
    // =========================================================================

    /// The back end used for the next frame.
    #[inline]
    pub fn active_backend(&self) -> BackendKind {
        self.active
    }

    /// Descriptor table shared by the back ends.
    #[inline]
    pub fn descriptor_table(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// Returns `true` if the ray-tracing back end exists.
    #[inline]
    pub fn ray_tracing_available(&self) -> bool {
        self.ray_trace.is_some()
    }

    /// Selects the back end for the next frame.
    ///
    /// Selecting ray tracing without ray-tracing support is logged and
    /// ignored.
    pub fn set_backend(&mut self, kind: BackendKind) {
        if kind == BackendKind::RayTrace && !self.ray_tracing_available() {
            info!("Ray tracing unavailable, staying on {}", self.active);
            return;
        }
        if kind != self.active {
            info!("Switching back end: {} -> {}", self.active, kind);
            self.active = kind;
        }
    }

    /// Flips between raster and ray tracing and returns the new selection.
    pub fn toggle_backend(&mut self) -> BackendKind {
        let next = self.active.toggled(self.ray_tracing_available());
        if next == self.active {
            info!("Ray tracing unavailable, toggle ignored");
        }
        self.set_backend(next);
        self.active
    }

    // =========================================================================
    // Size
    // =========================================================================

    /// Handles a window resize.
    ///
    /// A zero size (minimized window) only suspends rendering. Otherwise the
    /// queue is drained and the swapchain and every size-dependent image are
    /// recreated.
    ///
    /// # Errors
    ///
    /// Returns an error if the drain or a recreation fails.
    pub fn resize(&mut self, width: u32, height: u32) -> RendererResult<()> {
        if width == self.width && height == self.height {
            return Ok(());
        }
        debug!(
            "Resize: {}x{} -> {}x{}",
            self.width, self.height, width, height
        );
        self.width = width;
        self.height = height;
        if self.is_minimized() {
            return Ok(());
        }
        self.recreate_swapchain()
    }

    /// Current swapchain extent.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Returns `true` while the window has no area.
    #[inline]
    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn recreate_swapchain(&mut self) -> RendererResult<()> {
        self.queue.join()?;
        self.swapchain.recreate(
            &self.instance,
            self.surface.handle(),
            self.width,
            self.height,
        )?;

        let extent = self.swapchain.extent();
        self.raster.resize(extent, &self.descriptors)?;
        if let Some(ray_trace) = self.ray_trace.as_mut() {
            ray_trace.resize(extent, &self.descriptors)?;
        }
        self.render_finished =
            Self::create_render_finished(&self.device, self.swapchain.image_count())?;

        self.needs_recreate = false;
        debug!(
            "Swapchain recreated: {}x{}, {} images",
            extent.width,
            extent.height,
            self.swapchain.image_count()
        );
        Ok(())
    }

    // =========================================================================
    // Frame
    // =========================================================================

    /// Renders and presents one frame seen through `camera` and lit by `light`.
    ///
    /// A frame whose recording or submission fails is logged and skipped;
    /// the swapchain is recreated before the next frame.
    ///
    /// # Errors
    ///
    /// Returns an error for which
    /// [`is_device_lost`](crate::RendererError::is_device_lost) holds when the
    /// device is lost, or an error from swapchain recreation.
    pub fn render_frame(&mut self, camera: &Camera, light: &PointLight) -> RendererResult<()> {
        if self.is_minimized() {
            return Ok(());
        }
        if self.needs_recreate {
            self.recreate_swapchain()?;
        }

        self.slots.wait_for_current(&self.queue)?;

        let image_available = self.slots.current().resources.image_available.handle();
        let image_index = match self.swapchain.acquire_next_image(image_available)? {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    debug!("Acquire returned suboptimal, recreating after present");
                    self.needs_recreate = true;
                }
                index
            }
            AcquireOutcome::OutOfDate => {
                debug!("Swapchain out of date, recreating");
                return self.recreate_swapchain();
            }
        };

        let fence_value = match self.record_and_submit(image_index, camera, light) {
            Ok(value) => value,
            Err(e) if e.is_device_lost() => return Err(e),
            Err(e) => {
                error!("Frame skipped: {}", e);
                // The acquired image is never presented; recreating the
                // swapchain reclaims it and leaves the GPU idle.
                self.recreate_swapchain()?;
                let device = self.device.clone();
                self.slots
                    .current_mut()
                    .resources
                    .replace_image_available(&device)?;
                return Ok(());
            }
        };
        self.slots.record_submission(fence_value);

        let outcome = self.swapchain.present(
            self.queue.handle(),
            image_index,
            self.render_finished[image_index as usize].handle(),
        );
        self.slots.advance();

        match outcome {
            Ok(PresentOutcome::Presented) => {}
            Ok(PresentOutcome::NeedsRecreate) => self.needs_recreate = true,
            Err(RhiError::DeviceLost) => return Err(RhiError::DeviceLost.into()),
            Err(e) => {
                warn!("Present failed: {}", e);
                self.needs_recreate = true;
            }
        }

        if self.needs_recreate {
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    /// Records the current slot's command buffer and submits it.
    fn record_and_submit(
        &mut self,
        image_index: u32,
        camera: &Camera,
        light: &PointLight,
    ) -> RendererResult<u64> {
        let target = BackBuffer {
            image: self.swapchain.image(image_index),
            view: self.swapchain.image_view(image_index),
            extent: self.swapchain.extent(),
            format: self.swapchain.format(),
        };

        let light_constants = LightConstants::new(light, camera.position());
        {
            let resources = &mut self.slots.current_mut().resources;
            resources
                .object_constants
                .write_pod(0, &ObjectConstants::new(object_world(), camera))?;
            resources.light_constants.write_pod(0, &light_constants)?;
        }

        let slot = self.slots.current();
        let resources = &slot.resources;
        resources.context.reset()?;
        let cmd = resources.context.command_buffer();
        cmd.begin()?;

        let mut ctx = FrameContext {
            cmd,
            slot: slot.index(),
            target,
            scene: self.scene.as_ref(),
            light: &light_constants,
            light_view: resources.light_view.index,
            camera,
        };

        let backend = select_backend(self.active, &mut self.raster, self.ray_trace.as_mut());
        backend.update(&ctx)?;

        cmd.transition_image(
            target.image,
            vk::ImageAspectFlags::COLOR,
            ImageState::Undefined,
            ImageState::RenderTarget,
        );
        backend.record_frame(&mut ctx)?;
        cmd.transition_image(
            target.image,
            vk::ImageAspectFlags::COLOR,
            ImageState::RenderTarget,
            ImageState::Present,
        );
        cmd.end()?;

        let command_buffers = [cmd.handle()];
        let waits = [WaitSemaphore {
            semaphore: resources.image_available.handle(),
            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        }];
        let signals = [self.render_finished[image_index as usize].handle()];
        let value = self.queue.submit(SubmitBatch {
            command_buffers: &command_buffers,
            waits: &waits,
            signals: &signals,
        })?;
        Ok(value)
    }
}

/// Resolves `active` to a back end, falling back to raster when ray tracing
/// does not exist.
fn select_backend<'a>(
    active: BackendKind,
    raster: &'a mut RasterBackend,
    ray_trace: Option<&'a mut RayTraceBackend>,
) -> &'a mut dyn RenderBackend {
    match (active, ray_trace) {
        (BackendKind::RayTrace, Some(ray_trace)) => ray_trace,
        _ => raster,
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.queue.join() {
            error!("Failed to drain the queue during renderer drop: {:?}", e);
        }
        info!("Renderer destroyed");
    }
}
