//! Raster back end: one indexed draw of the scene mesh.
//!
//! # Overview
//!
//! Renders straight into the back buffer with dynamic rendering and a depth
//! attachment. The pipeline layout has two sets:
//!
//! | Set | Contents | Stage |
//! |-----|----------|-------|
//! | 0 | descriptor table | fragment |
//! | 1 | [`ObjectConstants`] of the frame slot | vertex |
//!
//! The fragment shader finds the slot's light view, the material view and
//! the texture view in the table through [`RasterViewIndices`] push
//! constants.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use renderer_rhi::RhiResult;
use renderer_rhi::command::CommandBuffer;
use renderer_rhi::descriptor::{
    DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorTable,
    DescriptorWriter,
};
use renderer_rhi::device::Device;
use renderer_rhi::pipeline::{
    CullMode, FrontFace, GraphicsPipelineBuilder, Pipeline, PipelineLayout,
};
use renderer_rhi::shader::{Shader, ShaderStage};
use renderer_rhi::vertex::Vertex;

use crate::backend::{FrameContext, RenderBackend, SceneContext};
use crate::constants::{ObjectConstants, RasterViewIndices};
use crate::depth_buffer::{DEPTH_FORMAT, DepthBuffer};
use crate::frame::FrameSlots;
use crate::scene_resources::SceneViews;

/// Back buffer clear color.
pub const CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.1, 1.0];

/// Vertex shader file inside the shader directory.
pub const VERTEX_SHADER: &str = "mesh.vert.spv";
/// Fragment shader file inside the shader directory.
pub const FRAGMENT_SHADER: &str = "mesh.frag.spv";

/// Rasterizing [`RenderBackend`].
pub struct RasterBackend {
    device: Arc<Device>,
    pipeline: Pipeline,
    layout: PipelineLayout,
    table_set: vk::DescriptorSet,
    // Sets are freed with the pool.
    object_sets: Vec<vk::DescriptorSet>,
    pool: DescriptorPool,
    object_layout: DescriptorSetLayout,
    depth: DepthBuffer,
    scene_views: Option<SceneViews>,
}

impl RasterBackend {
    /// Creates the pipeline, one object constant set per frame slot and the
    /// depth buffer.
    ///
    /// The raster pass only reads views the renderer owns (the slots' light
    /// views and the shared scene views), so it reserves no table slots.
    ///
    /// # Arguments
    ///
    /// * `table` - Descriptor table bound as set 0
    /// * `slots` - Frame ring whose object constant buffers are bound as set 1
    /// * `shader_dir` - Directory holding [`VERTEX_SHADER`] and [`FRAGMENT_SHADER`]
    /// * `color_format` - Swapchain format the pipeline renders into
    ///
    /// # Errors
    ///
    /// Returns an error if a shader cannot be loaded or pipeline creation
    /// fails.
    pub fn new(
        device: Arc<Device>,
        table: &DescriptorTable,
        slots: &FrameSlots,
        shader_dir: &Path,
        color_format: vk::Format,
        extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        let object_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(device.clone())?;
        let push_constants = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(RasterViewIndices::SIZE)];
        let layout = PipelineLayout::new(
            device.clone(),
            &[table.layout().handle(), object_layout.handle()],
            &push_constants,
        )?;

        let vertex_shader = Shader::from_spirv_file(
            device.clone(),
            &shader_dir.join(VERTEX_SHADER),
            ShaderStage::Vertex,
            "main",
        )?;
        let fragment_shader = Shader::from_spirv_file(
            device.clone(),
            &shader_dir.join(FRAGMENT_SHADER),
            ShaderStage::Fragment,
            "main",
        )?;

        let pipeline = GraphicsPipelineBuilder::new()
            .vertex_shader(&vertex_shader)
            .fragment_shader(&fragment_shader)
            .vertex_binding(Vertex::binding_description())
            .vertex_attributes(&Vertex::attribute_descriptions())
            .cull_mode(CullMode::Back)
            .front_face(FrontFace::CounterClockwise)
            .depth_test(true)
            .color_attachment_format(color_format)
            .depth_attachment_format(DEPTH_FORMAT)
            .build(device.clone(), &layout)?;

        let frames = slots.len();
        let pool = DescriptorPool::for_layout(device.clone(), &object_layout, frames as u32)?;
        let object_sets = pool.allocate(&vec![object_layout.handle(); frames])?;
        for (slot, &set) in slots.iter().zip(&object_sets) {
            DescriptorWriter::new(set)
                .uniform_buffer(
                    0,
                    slot.resources.object_constants.handle(),
                    0,
                    ObjectConstants::SIZE as u64,
                )
                .update(&device);
        }

        let depth = DepthBuffer::new(device.clone(), extent.width, extent.height)?;

        info!(
            "Raster back end ready: {} of {} object constant sets",
            object_sets.len(),
            pool.max_sets()
        );

        Ok(Self {
            device,
            pipeline,
            layout,
            table_set: table.set(),
            object_sets,
            pool,
            object_layout,
            depth,
            scene_views: None,
        })
    }

    /// Layout of the per-slot object constant sets.
    #[inline]
    pub fn object_layout(&self) -> &DescriptorSetLayout {
        &self.object_layout
    }

    /// Push constants for a draw from the frame slot whose light view is
    /// `light_view`.
    pub fn view_indices(views: &SceneViews, light_view: u32) -> RasterViewIndices {
        RasterViewIndices {
            light: light_view,
            material: views.material.index,
            texture: views.texture.index,
        }
    }

    /// Records a pass that only clears color and depth.
    fn record_clear(&mut self, ctx: &FrameContext<'_>) {
        self.depth.prepare(ctx.cmd);
        self.begin_pass(ctx.cmd, ctx.target.view, ctx.target.extent);
        ctx.cmd.end_rendering();
    }

    fn begin_pass(&self, cmd: &CommandBuffer, view: vk::ImageView, extent: vk::Extent2D) {
        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: CLEAR_COLOR,
                },
            })];
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(self.depth.image_view())
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);
        cmd.begin_rendering(&rendering_info);
    }
}

impl RenderBackend for RasterBackend {
    fn attach_scene(&mut self, ctx: &SceneContext<'_>) -> RhiResult<()> {
        self.scene_views = Some(ctx.views);
        debug!(
            "Raster pass reads material view {} and texture view {}",
            ctx.views.material.index, ctx.views.texture.index
        );
        Ok(())
    }

    fn record_frame(&mut self, ctx: &mut FrameContext<'_>) -> RhiResult<()> {
        let (scene, views) = match (ctx.scene, self.scene_views.as_ref()) {
            (Some(scene), Some(views)) => (scene, views),
            _ => {
                self.record_clear(ctx);
                return Ok(());
            }
        };

        let cmd = ctx.cmd;
        let extent = ctx.target.extent;

        self.depth.prepare(cmd);
        self.begin_pass(cmd, ctx.target.view, extent);

        cmd.set_viewport(extent);
        cmd.set_scissor(extent);
        cmd.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle());
        cmd.bind_descriptor_sets(
            vk::PipelineBindPoint::GRAPHICS,
            self.layout.handle(),
            0,
            &[self.table_set, self.object_sets[ctx.slot]],
        );
        cmd.push_constants(
            self.layout.handle(),
            vk::ShaderStageFlags::FRAGMENT,
            &Self::view_indices(views, ctx.light_view),
        );
        cmd.bind_vertex_buffer(scene.vertex_buffer.handle());
        cmd.bind_index_buffer_u32(scene.index_buffer.handle());
        cmd.draw_indexed(scene.index_count, 1);

        cmd.end_rendering();
        Ok(())
    }

    fn resize(&mut self, extent: vk::Extent2D, _table: &DescriptorTable) -> RhiResult<()> {
        self.depth = DepthBuffer::new(self.device.clone(), extent.width, extent.height)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{MAX_FRAMES_IN_FLIGHT, light_views};
    use renderer_rhi::descriptor::{DescriptorAllocator, DescriptorCapacity};

    #[test]
    fn test_clear_color() {
        assert_eq!(CLEAR_COLOR, [0.1, 0.1, 0.1, 1.0]);
    }

    #[test]
    fn test_raster_views_leave_only_spare_slots() {
        let frames = MAX_FRAMES_IN_FLIGHT;
        let capacity = DescriptorCapacity::compute(frames as u32, false);
        let mut table = DescriptorAllocator::create(capacity, true).unwrap();

        let lights = light_views(&mut table, frames).unwrap();
        let scene = SceneViews::allocate(&mut table).unwrap();

        assert_eq!(table.remaining(), DescriptorCapacity::SPARE);
        let mut indices: Vec<u32> = lights.iter().map(|v| v.index).collect();
        indices.extend([scene.material.index, scene.texture.index]);
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), frames + 2);
    }

    #[test]
    fn test_view_indices_follow_allocated_slots() {
        let mut table = DescriptorAllocator::create(8, true).unwrap();
        let lights = light_views(&mut table, MAX_FRAMES_IN_FLIGHT).unwrap();
        let scene = SceneViews::allocate(&mut table).unwrap();

        let pushed = RasterBackend::view_indices(&scene, lights[1].index);
        assert_eq!(
            pushed,
            RasterViewIndices {
                light: 1,
                material: 3,
                texture: 4,
            }
        );
    }
}
