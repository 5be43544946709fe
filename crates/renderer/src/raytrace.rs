//! Ray-tracing back end.
//!
//! # Overview
//!
//! Traces one primary ray per pixel into an offscreen storage image and
//! copies the result into the back buffer. Closest-hit shading casts one
//! shadow ray towards the point light.
//!
//! Set 0 is the descriptor table; the back end owns seven of its slots
//! ([`RtViews`]): the output image, one array each of [`RtCameraConstants`],
//! [`RtObjectConstants`] and [`LightConstants`] with an entry per frame
//! slot, the material, and the vertex and index buffers. The texture view is
//! shared with the raster pass. Set 1 holds the TLAS, one set per frame slot,
//! rewritten every frame because a rebuild replaces the structure.
//!
//! The TLAS is refreshed at the start of every ray-traced frame; with an
//! unchanged instance count that is an in-place update.
//!
//! # Fail-soft frames
//!
//! When any resource the dispatch needs is missing the frame is cleared to
//! [`FALLBACK_COLOR`] instead of tracing with undefined bindings.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, trace, warn};

use renderer_rhi::RhiResult;
use renderer_rhi::acceleration_structure::{Tlas, TlasInstance};
use renderer_rhi::buffer::{BufferDesc, GpuBuffer};
use renderer_rhi::command::CommandBuffer;
use renderer_rhi::descriptor::{
    DescriptorAllocation, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder,
    DescriptorTable, DescriptorWriter, ResourceView, SlotAllocator,
};
use renderer_rhi::device::Device;
use renderer_rhi::image::{Image2D, ImageDesc, ImageState};
use renderer_rhi::pipeline::PipelineLayout;
use renderer_rhi::raytracing::{RtPipeline, RtPipelineDesc, RtShaderLibrary, ShaderBindingTable};

use crate::backend::{BackBuffer, FrameContext, RenderBackend, SceneContext};
use crate::constants::{
    HIT_ATTRIBUTE_SIZE, LightConstants, RayPayload, RtCameraConstants, RtObjectConstants,
    RtViewIndices, object_world,
};

/// Color of frames rendered while a ray-tracing resource is missing.
pub const FALLBACK_COLOR: [f32; 4] = [0.4, 0.1, 0.4, 1.0];

/// Format of the offscreen output image.
pub const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Stages that read [`RtViewIndices`].
const PUSH_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw() | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw(),
);

/// Descriptor table slots owned by the ray-tracing back end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtViews {
    pub output: DescriptorAllocation,
    pub camera: DescriptorAllocation,
    pub object: DescriptorAllocation,
    pub light: DescriptorAllocation,
    pub material: DescriptorAllocation,
    pub vertices: DescriptorAllocation,
    pub indices: DescriptorAllocation,
}

impl RtViews {
    /// Reserves the seven slots.
    ///
    /// # Errors
    ///
    /// Returns [`renderer_rhi::RhiError::OutOfSlots`] if the table is full.
    pub fn allocate(slots: &mut impl SlotAllocator) -> RhiResult<Self> {
        Ok(Self {
            output: slots.allocate_slot()?,
            camera: slots.allocate_slot()?,
            object: slots.allocate_slot()?,
            light: slots.allocate_slot()?,
            material: slots.allocate_slot()?,
            vertices: slots.allocate_slot()?,
            indices: slots.allocate_slot()?,
        })
    }

    /// Push constants for a dispatch from frame slot `frame`.
    pub fn indices(&self, texture: &DescriptorAllocation, frame: usize) -> RtViewIndices {
        RtViewIndices {
            output: self.output.index,
            camera: self.camera.index,
            object: self.object.index,
            light: self.light.index,
            material: self.material.index,
            texture: texture.index,
            vertices: self.vertices.index,
            indices: self.indices.index,
            frame: frame as u32,
        }
    }
}

/// Which of the resources a dispatch depends on are present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub pipeline: bool,
    pub binding_table: bool,
    pub tlas: bool,
    /// Output image exists and matches the back buffer size.
    pub output_image: bool,
    pub output_view: bool,
    /// Camera and object constants exist for the current slot.
    pub constants: bool,
    /// Material, texture, vertex and index views are written.
    pub scene_views: bool,
}

impl Readiness {
    /// Name of the first missing resource, or `None` when the dispatch can run.
    pub fn first_missing(&self) -> Option<&'static str> {
        [
            (self.pipeline, "pipeline"),
            (self.binding_table, "shader binding table"),
            (self.tlas, "top-level acceleration structure"),
            (self.output_image, "output image"),
            (self.output_view, "output view"),
            (self.constants, "camera/object constants"),
            (self.scene_views, "scene views"),
        ]
        .into_iter()
        .find_map(|(present, name)| (!present).then_some(name))
    }

    /// Returns `true` when nothing is missing.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.first_missing().is_none()
    }
}

/// Ray-tracing [`RenderBackend`].
pub struct RayTraceBackend {
    device: Arc<Device>,
    pipeline: RtPipeline,
    sbt: ShaderBindingTable,
    layout: PipelineLayout,
    table_set: vk::DescriptorSet,
    // Sets are freed with the pool.
    tlas_sets: Vec<vk::DescriptorSet>,
    pool: DescriptorPool,
    tlas_layout: DescriptorSetLayout,
    tlas: Tlas,
    output: Option<Image2D>,
    frames: usize,
    camera_constants: GpuBuffer,
    object_constants: GpuBuffer,
    light_constants: GpuBuffer,
    views: RtViews,
    texture_view: Option<DescriptorAllocation>,
    blas_address: Option<vk::DeviceAddress>,
    in_fallback: bool,
}

impl RayTraceBackend {
    /// Creates the pipeline, binding table, TLAS and per-slot constants, and
    /// reserves and writes [`RtViews`] in `table`.
    ///
    /// # Arguments
    ///
    /// * `table` - Descriptor table bound as set 0
    /// * `shader_dir` - Directory holding the five compiled ray-tracing programs
    /// * `extent` - Initial output size; a zero extent defers the output image
    /// * `frames` - Number of frame slots
    ///
    /// # Errors
    ///
    /// Returns [`renderer_rhi::RhiError::RayTracingUnsupported`] without ray
    /// tracing on the device, [`renderer_rhi::RhiError::MissingExport`] if a
    /// program is missing, [`renderer_rhi::RhiError::OutOfSlots`] if the
    /// table has no room for [`RtViews`], or any creation error.
    pub fn new(
        device: Arc<Device>,
        table: &mut DescriptorTable,
        shader_dir: &Path,
        extent: vk::Extent2D,
        frames: usize,
    ) -> RhiResult<Self> {
        let tlas = Tlas::new(device.clone(), frames)?;

        let tlas_layout = DescriptorSetLayoutBuilder::new()
            .acceleration_structure(0, PUSH_STAGES)
            .build(device.clone())?;
        let push_constants = [vk::PushConstantRange::default()
            .stage_flags(PUSH_STAGES)
            .offset(0)
            .size(RtViewIndices::SIZE)];
        let layout = PipelineLayout::new(
            device.clone(),
            &[table.layout().handle(), tlas_layout.handle()],
            &push_constants,
        )?;

        let library = RtShaderLibrary::load(&device, shader_dir)?;
        let desc = RtPipelineDesc {
            payload_size: RayPayload::SIZE,
            attribute_size: HIT_ATTRIBUTE_SIZE,
            ..RtPipelineDesc::default()
        };
        let pipeline = RtPipeline::new(device.clone(), &library, &layout, &desc)?;
        let sbt = ShaderBindingTable::new(device.clone(), &pipeline)?;

        let pool = DescriptorPool::for_layout(device.clone(), &tlas_layout, frames as u32)?;
        let tlas_sets = pool.allocate(&vec![tlas_layout.handle(); frames])?;

        let per_frame = |name: &str, size: usize| {
            GpuBuffer::create(
                device.clone(),
                &BufferDesc::constant(name, (size * frames) as u64),
            )
        };
        let camera_constants = per_frame("rt camera constants", RtCameraConstants::SIZE)?;
        let object_constants = per_frame("rt object constants", RtObjectConstants::SIZE)?;
        let light_constants = per_frame("rt light constants", LightConstants::SIZE)?;

        let views = RtViews::allocate(&mut *table)?;
        table.write(&views.camera, ResourceView::Buffer(camera_constants.handle()));
        table.write(&views.object, ResourceView::Buffer(object_constants.handle()));
        table.write(&views.light, ResourceView::Buffer(light_constants.handle()));

        let output = Self::create_output(&device, extent)?;
        if let Some(image) = output.as_ref() {
            table.write(&views.output, ResourceView::StorageImage(image.view()));
        }

        info!(
            "Ray-tracing back end ready: {} shader groups, table slots {}..={}",
            pipeline.group_count(),
            views.output.index,
            views.indices.index
        );

        Ok(Self {
            device,
            pipeline,
            sbt,
            layout,
            table_set: table.set(),
            tlas_sets,
            pool,
            tlas_layout,
            tlas,
            output,
            frames,
            camera_constants,
            object_constants,
            light_constants,
            views,
            texture_view: None,
            blas_address: None,
            in_fallback: false,
        })
    }

    fn create_output(device: &Arc<Device>, extent: vk::Extent2D) -> RhiResult<Option<Image2D>> {
        if extent.width == 0 || extent.height == 0 {
            return Ok(None);
        }
        let image = Image2D::new(
            device.clone(),
            &ImageDesc {
                width: extent.width,
                height: extent.height,
                format: OUTPUT_FORMAT,
                usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
                aspect: vk::ImageAspectFlags::COLOR,
                name: "ray-tracing output",
            },
        )?;
        debug!("Ray-tracing output image: {}x{}", extent.width, extent.height);
        Ok(Some(image))
    }

    /// Layout of the per-slot TLAS sets.
    #[inline]
    pub fn tlas_layout(&self) -> &DescriptorSetLayout {
        &self.tlas_layout
    }

    /// Checks every resource the dispatch for `slot` depends on.
    pub fn readiness(&self, slot: usize, target: &BackBuffer) -> Readiness {
        let output = self.output.as_ref();
        Readiness {
            pipeline: self.pipeline.handle() != vk::Pipeline::null(),
            binding_table: self.sbt.buffer().handle() != vk::Buffer::null(),
            tlas: self.blas_address.is_some() && self.tlas.structure().is_some(),
            output_image: output.is_some_and(|image| image.extent() == target.extent),
            output_view: output.is_some_and(|image| image.view() != vk::ImageView::null()),
            constants: slot < self.frames,
            scene_views: self.texture_view.is_some() && slot < self.tlas_sets.len(),
        }
    }

    /// Clears the back buffer to [`FALLBACK_COLOR`].
    fn record_fallback(&mut self, cmd: &CommandBuffer, target: &BackBuffer, missing: &str) {
        if !self.in_fallback {
            warn!("Ray tracing not ready ({} missing), rendering fallback frames", missing);
            self.in_fallback = true;
        }
        cmd.transition_image(
            target.image,
            vk::ImageAspectFlags::COLOR,
            ImageState::RenderTarget,
            ImageState::CopyDest,
        );
        cmd.clear_color_image(target.image, FALLBACK_COLOR);
        cmd.transition_image(
            target.image,
            vk::ImageAspectFlags::COLOR,
            ImageState::CopyDest,
            ImageState::RenderTarget,
        );
    }

    /// Records the TLAS refresh, the dispatch and the copy into the back buffer.
    fn trace(&mut self, ctx: &FrameContext<'_>) -> RhiResult<()> {
        let cmd = ctx.cmd;
        let target = ctx.target;
        let slot = ctx.slot;

        let (Some(blas_address), Some(texture)) = (self.blas_address, self.texture_view) else {
            return Ok(());
        };
        let instances = [TlasInstance::new(blas_address, object_world())];
        let mode = self.tlas.build_or_update(cmd, slot, &instances)?;
        trace!(?mode, slot, "TLAS refreshed");

        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };

        // The slot's previous submission has completed, so its set is free.
        DescriptorWriter::new(self.tlas_sets[slot])
            .acceleration_structure(0, self.tlas.handle())
            .update(&self.device);

        output.transition(cmd, ImageState::UnorderedAccess);

        let extent = output.extent();
        cmd.bind_pipeline(vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline.handle());
        cmd.bind_descriptor_sets(
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.layout.handle(),
            0,
            &[self.table_set, self.tlas_sets[slot]],
        );
        cmd.push_constants(
            self.layout.handle(),
            PUSH_STAGES,
            &self.views.indices(&texture, slot),
        );
        let loaders = self.device.rt_loaders()?;
        cmd.trace_rays(
            &loaders.ray_tracing_pipeline,
            &self.sbt.regions(),
            extent.width,
            extent.height,
        );

        output.transition(cmd, ImageState::CopySource);
        cmd.transition_image(
            target.image,
            vk::ImageAspectFlags::COLOR,
            ImageState::RenderTarget,
            ImageState::CopyDest,
        );
        cmd.blit_image(output.handle(), target.image, extent);
        cmd.transition_image(
            target.image,
            vk::ImageAspectFlags::COLOR,
            ImageState::CopyDest,
            ImageState::RenderTarget,
        );

        if self.in_fallback {
            info!("Ray tracing resources ready, leaving fallback");
            self.in_fallback = false;
        }
        Ok(())
    }
}

impl RenderBackend for RayTraceBackend {
    fn attach_scene(&mut self, ctx: &SceneContext<'_>) -> RhiResult<()> {
        let scene = ctx.scene;
        let Some(blas) = scene.blas.as_ref() else {
            return Err(renderer_rhi::RhiError::AccelerationStructureError(
                "scene was uploaded without a BLAS".to_string(),
            ));
        };

        let table = ctx.table;
        table.write(&self.views.material, ResourceView::Buffer(scene.material.handle()));
        table.write(&self.views.vertices, ResourceView::Buffer(scene.vertex_buffer.handle()));
        table.write(&self.views.indices, ResourceView::Buffer(scene.index_buffer.handle()));
        self.texture_view = Some(ctx.views.texture);

        let instances = [TlasInstance::new(blas.address(), object_world())];
        let mode = self.tlas.build_or_update(ctx.cmd, 0, &instances)?;
        self.blas_address = Some(blas.address());
        self.in_fallback = false;

        debug!(
            "Ray-tracing scene views written, {} of {} TLAS sets, initial TLAS {:?}",
            ctx.slots.len(),
            self.pool.max_sets(),
            mode
        );
        Ok(())
    }

    fn update(&mut self, ctx: &FrameContext<'_>) -> RhiResult<()> {
        if ctx.slot >= self.frames {
            return Ok(());
        }
        let slot = ctx.slot as u64;
        self.camera_constants.write_pod(
            slot * RtCameraConstants::SIZE as u64,
            &RtCameraConstants::new(ctx.camera),
        )?;
        self.object_constants.write_pod(
            slot * RtObjectConstants::SIZE as u64,
            &RtObjectConstants::new(object_world()),
        )?;
        self.light_constants
            .write_pod(slot * LightConstants::SIZE as u64, ctx.light)?;
        Ok(())
    }

    fn record_frame(&mut self, ctx: &mut FrameContext<'_>) -> RhiResult<()> {
        let cmd = ctx.cmd;
        let target = ctx.target;

        match self.readiness(ctx.slot, &target).first_missing() {
            Some(missing) => {
                self.record_fallback(cmd, &target, missing);
                Ok(())
            }
            None => self.trace(ctx),
        }
    }

    fn resize(&mut self, extent: vk::Extent2D, table: &DescriptorTable) -> RhiResult<()> {
        self.output = Self::create_output(&self.device, extent)?;
        if let Some(image) = self.output.as_ref() {
            table.write(&self.views.output, ResourceView::StorageImage(image.view()));
        }
        self.tlas.release_retired();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{MAX_FRAMES_IN_FLIGHT, light_views};
    use crate::scene_resources::SceneViews;
    use renderer_rhi::RhiError;
    use renderer_rhi::descriptor::{DescriptorAllocator, DescriptorCapacity};

    fn ready() -> Readiness {
        Readiness {
            pipeline: true,
            binding_table: true,
            tlas: true,
            output_image: true,
            output_view: true,
            constants: true,
            scene_views: true,
        }
    }

    #[test]
    fn test_all_present_is_ready() {
        assert!(ready().is_ready());
        assert_eq!(ready().first_missing(), None);
    }

    #[test]
    fn test_nothing_present_reports_pipeline_first() {
        let readiness = Readiness::default();
        assert!(!readiness.is_ready());
        assert_eq!(readiness.first_missing(), Some("pipeline"));
    }

    #[test]
    fn test_each_missing_resource_is_named() {
        let cases: [(fn(&mut Readiness), &str); 7] = [
            (|r| r.pipeline = false, "pipeline"),
            (|r| r.binding_table = false, "shader binding table"),
            (|r| r.tlas = false, "top-level acceleration structure"),
            (|r| r.output_image = false, "output image"),
            (|r| r.output_view = false, "output view"),
            (|r| r.constants = false, "camera/object constants"),
            (|r| r.scene_views = false, "scene views"),
        ];
        for (clear, name) in cases {
            let mut readiness = ready();
            clear(&mut readiness);
            assert_eq!(readiness.first_missing(), Some(name));
        }
    }

    #[test]
    fn test_fallback_color_is_purple() {
        assert_eq!(FALLBACK_COLOR, [0.4, 0.1, 0.4, 1.0]);
    }

    fn ray_tracing_table(ray_tracing: bool) -> DescriptorAllocator {
        let frames = MAX_FRAMES_IN_FLIGHT as u32;
        DescriptorAllocator::create(DescriptorCapacity::compute(frames, ray_tracing), true)
            .unwrap()
    }

    #[test]
    fn test_all_views_leave_only_spare_slots() {
        let mut table = ray_tracing_table(true);
        light_views(&mut table, MAX_FRAMES_IN_FLIGHT).unwrap();
        SceneViews::allocate(&mut table).unwrap();
        let views = RtViews::allocate(&mut table).unwrap();

        assert_eq!(table.remaining(), DescriptorCapacity::SPARE);
        assert_eq!(
            views.indices.index - views.output.index + 1,
            DescriptorCapacity::RAY_TRACING_VIEWS
        );
    }

    #[test]
    fn test_raster_only_table_has_no_room_for_ray_tracing() {
        let mut table = ray_tracing_table(false);
        light_views(&mut table, MAX_FRAMES_IN_FLIGHT).unwrap();
        SceneViews::allocate(&mut table).unwrap();
        assert!(matches!(
            RtViews::allocate(&mut table),
            Err(RhiError::OutOfSlots { .. })
        ));
    }

    #[test]
    fn test_push_constants_name_each_view() {
        let mut table = ray_tracing_table(true);
        let lights = light_views(&mut table, MAX_FRAMES_IN_FLIGHT).unwrap();
        let scene = SceneViews::allocate(&mut table).unwrap();
        let views = RtViews::allocate(&mut table).unwrap();

        let pushed = views.indices(&scene.texture, 2);
        assert_eq!(pushed.texture, scene.texture.index);
        assert_eq!(pushed.frame, 2);
        let own = [
            pushed.output,
            pushed.camera,
            pushed.object,
            pushed.light,
            pushed.material,
            pushed.vertices,
            pushed.indices,
        ];
        // Own views never alias the frame ring's light views.
        assert!(own.iter().all(|i| lights.iter().all(|l| l.index != *i)));
        assert!(own.windows(2).all(|w| w[0] + 1 == w[1]));
    }
}
