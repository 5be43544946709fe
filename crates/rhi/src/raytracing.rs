//! Ray-tracing pipeline and shader binding table.
//!
//! # Overview
//!
//! - [`RayType`] names the two kinds of rays the renderer traces. Its value
//!   is both the miss index and the hit group index passed to `traceRayEXT`,
//!   and it is the position of the matching record in the binding table.
//! - [`RtShaderLibrary`] holds the compiled entry points by export name.
//! - [`RtPipeline`] creates the pipeline with its shader groups in a fixed
//!   order: ray generation, one miss group per ray type, one hit group per
//!   ray type.
//! - [`SbtLayout`] computes aligned table offsets; [`ShaderBindingTable`]
//!   fills an upload-heap buffer with the group handles at those offsets.
//!
//! The table layout on the GPU stays positional. Changing the order of
//! [`RayType`] variants changes which program a ray invokes.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::buffer::{BufferDesc, BufferUsage, GpuBuffer, HeapClass, align_up};
use crate::command::ShaderTableRegions;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::PipelineLayout;
use crate::shader::{Shader, ShaderStage};

// =============================================================================
// Ray Types
// =============================================================================

/// Kind of ray traced by the ray-tracing shaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RayType {
    /// Camera rays; shade the closest hit.
    Primary = 0,
    /// Occlusion rays towards the light.
    Shadow = 1,
}

/// Number of ray types, and so of miss and hit group records.
pub const RAY_TYPE_COUNT: u32 = 2;

impl RayType {
    /// Every ray type in table order.
    pub const ALL: [RayType; RAY_TYPE_COUNT as usize] = [RayType::Primary, RayType::Shadow];

    /// Index into the miss table (`missIndex` of `traceRayEXT`).
    #[inline]
    pub const fn miss_index(self) -> u32 {
        self as u32
    }

    /// Offset into the hit group table (`sbtRecordOffset` of `traceRayEXT`).
    #[inline]
    pub const fn hit_group_index(self) -> u32 {
        self as u32
    }

    /// Returns a short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            RayType::Primary => "primary",
            RayType::Shadow => "shadow",
        }
    }
}

// =============================================================================
// Shader Library
// =============================================================================

/// Entry points the ray-tracing pipeline requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RtExport {
    /// Ray generation.
    RayGen,
    /// Miss program of primary rays.
    Miss,
    /// Miss program of shadow rays.
    ShadowMiss,
    /// Closest hit of primary rays.
    ClosestHit,
    /// Any hit of shadow rays.
    ShadowAnyHit,
}

impl RtExport {
    /// Every export, in pipeline stage order.
    pub const ALL: [RtExport; 5] = [
        RtExport::RayGen,
        RtExport::Miss,
        RtExport::ShadowMiss,
        RtExport::ClosestHit,
        RtExport::ShadowAnyHit,
    ];

    /// Export name. Case-sensitive.
    pub fn name(self) -> &'static str {
        match self {
            RtExport::RayGen => "RayGen",
            RtExport::Miss => "Miss",
            RtExport::ShadowMiss => "ShadowMiss",
            RtExport::ClosestHit => "ClosestHit",
            RtExport::ShadowAnyHit => "ShadowAnyHit",
        }
    }

    /// Stage the export must be compiled for.
    pub fn stage(self) -> ShaderStage {
        match self {
            RtExport::RayGen => ShaderStage::RayGen,
            RtExport::Miss | RtExport::ShadowMiss => ShaderStage::Miss,
            RtExport::ClosestHit => ShaderStage::ClosestHit,
            RtExport::ShadowAnyHit => ShaderStage::AnyHit,
        }
    }

    /// File the export is loaded from by [`RtShaderLibrary::load`].
    pub fn file_name(self) -> &'static str {
        match self {
            RtExport::RayGen => "raytrace.rgen.spv",
            RtExport::Miss => "raytrace.rmiss.spv",
            RtExport::ShadowMiss => "shadow.rmiss.spv",
            RtExport::ClosestHit => "raytrace.rchit.spv",
            RtExport::ShadowAnyHit => "shadow.rahit.spv",
        }
    }
}

/// Compiled ray-tracing programs keyed by export name.
#[derive(Default)]
pub struct RtShaderLibrary {
    exports: Vec<(String, Shader)>,
}

impl RtShaderLibrary {
    /// Creates an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every [`RtExport`] whose file exists in `dir`.
    ///
    /// Missing files are skipped here and reported by [`Self::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ShaderError`] if a present file is not valid
    /// SPIR-V.
    pub fn load(device: &Arc<Device>, dir: &Path) -> RhiResult<Self> {
        let mut library = Self::new();
        for export in RtExport::ALL {
            let path = dir.join(export.file_name());
            if !path.exists() {
                warn!("Ray-tracing shader {:?} not found", path);
                continue;
            }
            let shader = Shader::from_spirv_file(device.clone(), &path, export.stage(), "main")?;
            library.insert(export.name(), shader);
        }
        Ok(library)
    }

    /// Adds or replaces an export.
    pub fn insert(&mut self, name: &str, shader: Shader) {
        self.exports.retain(|(existing, _)| existing != name);
        self.exports.push((name.to_string(), shader));
    }

    /// Looks up an export by its exact name.
    pub fn get(&self, name: &str) -> Option<&Shader> {
        self.exports
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, shader)| shader)
    }

    /// Checks that every required export is present with the right stage.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::MissingExport`] naming the first missing export.
    pub fn validate(&self) -> RhiResult<()> {
        for export in RtExport::ALL {
            match self.get(export.name()) {
                None => return Err(RhiError::MissingExport(export.name().to_string())),
                Some(shader) if shader.stage() != export.stage() => {
                    return Err(RhiError::MissingExport(format!(
                        "{} (compiled as {}, expected {})",
                        export.name(),
                        shader.stage(),
                        export.stage()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn require(&self, export: RtExport) -> RhiResult<&Shader> {
        self.get(export.name())
            .ok_or_else(|| RhiError::MissingExport(export.name().to_string()))
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Fixed parameters shared by the host and the ray-tracing shaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtPipelineDesc {
    /// Bytes of the ray payload (`rayPayloadEXT`).
    pub payload_size: u32,
    /// Bytes of the hit attributes (barycentrics).
    pub attribute_size: u32,
    /// Maximum trace depth: a primary ray plus one shadow ray.
    pub max_recursion_depth: u32,
}

impl Default for RtPipelineDesc {
    fn default() -> Self {
        Self {
            payload_size: 20,
            attribute_size: 8,
            max_recursion_depth: 2,
        }
    }
}

/// Index of the ray generation group.
pub const RAYGEN_GROUP: u32 = 0;
/// Index of the first miss group.
pub const FIRST_MISS_GROUP: u32 = 1;
/// Index of the first hit group.
pub const FIRST_HIT_GROUP: u32 = FIRST_MISS_GROUP + RAY_TYPE_COUNT;
/// Total number of shader groups.
pub const GROUP_COUNT: u32 = FIRST_HIT_GROUP + RAY_TYPE_COUNT;

/// Ray-tracing pipeline.
pub struct RtPipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    desc: RtPipelineDesc,
}

impl RtPipeline {
    /// Creates the pipeline from `library`.
    ///
    /// Stage order is the [`RtExport::ALL`] order; group order is ray
    /// generation, `Miss`, `ShadowMiss`, `HitGroup` (closest hit) and
    /// `ShadowHitGroup` (any hit).
    ///
    /// # Errors
    ///
    /// - [`RhiError::MissingExport`] if an entry point is missing
    /// - [`RhiError::RayTracingUnsupported`] without ray tracing
    /// - [`RhiError::PipelineError`] if the recursion depth exceeds the
    ///   device limit or the sizes are not whole words
    pub fn new(
        device: Arc<Device>,
        library: &RtShaderLibrary,
        layout: &PipelineLayout,
        desc: &RtPipelineDesc,
    ) -> RhiResult<Self> {
        library.validate()?;
        let loaders = device.rt_loaders()?;
        let properties = device
            .ray_tracing()
            .properties()
            .ok_or(RhiError::RayTracingUnsupported)?;

        if desc.max_recursion_depth == 0
            || desc.max_recursion_depth > properties.max_ray_recursion_depth
        {
            return Err(RhiError::PipelineError(format!(
                "recursion depth {} outside 1..={}",
                desc.max_recursion_depth, properties.max_ray_recursion_depth
            )));
        }
        if desc.payload_size % 4 != 0 || desc.attribute_size % 4 != 0 {
            return Err(RhiError::PipelineError(format!(
                "payload ({}) and attribute ({}) sizes must be multiples of 4",
                desc.payload_size, desc.attribute_size
            )));
        }

        let stages = [
            library.require(RtExport::RayGen)?.stage_create_info(),
            library.require(RtExport::Miss)?.stage_create_info(),
            library.require(RtExport::ShadowMiss)?.stage_create_info(),
            library.require(RtExport::ClosestHit)?.stage_create_info(),
            library.require(RtExport::ShadowAnyHit)?.stage_create_info(),
        ];

        let general = |stage: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(stage)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
        };
        let hit_group = |closest_hit: u32, any_hit: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(closest_hit)
                .any_hit_shader(any_hit)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
        };
        let groups = [
            general(0),
            general(1),
            general(2),
            hit_group(3, vk::SHADER_UNUSED_KHR),
            hit_group(vk::SHADER_UNUSED_KHR, 4),
        ];
        debug_assert_eq!(groups.len() as u32, GROUP_COUNT);

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(layout.handle());

        // SAFETY: stages and groups reference live shader modules; the
        // layout outlives the call.
        let pipeline = unsafe {
            loaders
                .ray_tracing_pipeline
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|(_, result)| RhiError::from(result))?[0]
        };

        info!(
            "Ray-tracing pipeline created: {} groups, recursion {}, payload {} B, attributes {} B",
            GROUP_COUNT, desc.max_recursion_depth, desc.payload_size, desc.attribute_size
        );

        Ok(Self {
            device,
            pipeline,
            desc: *desc,
        })
    }

    /// Returns the pipeline handle.
    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Returns the parameters the pipeline was built with.
    #[inline]
    pub fn desc(&self) -> &RtPipelineDesc {
        &self.desc
    }

    /// Returns the number of shader groups.
    #[inline]
    pub fn group_count(&self) -> u32 {
        GROUP_COUNT
    }
}

impl Drop for RtPipeline {
    fn drop(&mut self) {
        // SAFETY: no command buffer using the pipeline is still executing.
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
        }
        debug!("Ray-tracing pipeline destroyed");
    }
}

// =============================================================================
// Shader Binding Table
// =============================================================================

/// Sub-table of the shader binding table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SbtTable {
    /// One ray generation record.
    RayGen,
    /// One miss record per ray type.
    Miss,
    /// One hit group record per ray type.
    HitGroup,
}

/// Byte layout of the shader binding table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtLayout {
    /// Size of one group handle.
    pub handle_size: u64,
    /// Distance between records, `handle_size` rounded to the record alignment.
    pub stride: u64,
    /// Start of the miss table.
    pub miss_offset: u64,
    /// Number of miss records.
    pub miss_count: u64,
    /// Start of the hit group table.
    pub hit_offset: u64,
    /// Number of hit group records.
    pub hit_count: u64,
    /// Total size, rounded to the table alignment.
    pub total_size: u64,
    /// Table start alignment.
    pub base_alignment: u64,
}

impl SbtLayout {
    /// Lays out the ray generation table at offset 0 followed by the miss
    /// and hit group tables, each starting on `base_alignment`.
    pub fn compute(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
        miss_count: u32,
        hit_count: u32,
    ) -> Self {
        let handle_size = u64::from(handle_size);
        let base_alignment = u64::from(base_alignment).max(1);
        let stride = align_up(handle_size, u64::from(handle_alignment).max(1));
        let miss_count = u64::from(miss_count);
        let hit_count = u64::from(hit_count);

        let miss_offset = align_up(stride, base_alignment);
        let hit_offset = align_up(miss_offset + miss_count * stride, base_alignment);
        let total_size = align_up(hit_offset + hit_count * stride, base_alignment);

        Self {
            handle_size,
            stride,
            miss_offset,
            miss_count,
            hit_offset,
            hit_count,
            total_size,
            base_alignment,
        }
    }

    /// Start offset of a sub-table.
    pub fn table_offset(&self, table: SbtTable) -> u64 {
        match table {
            SbtTable::RayGen => 0,
            SbtTable::Miss => self.miss_offset,
            SbtTable::HitGroup => self.hit_offset,
        }
    }

    /// Number of records in a sub-table.
    pub fn table_len(&self, table: SbtTable) -> u64 {
        match table {
            SbtTable::RayGen => 1,
            SbtTable::Miss => self.miss_count,
            SbtTable::HitGroup => self.hit_count,
        }
    }

    /// Offset of record `index` of `table`.
    pub fn record_offset(&self, table: SbtTable, index: u32) -> u64 {
        self.table_offset(table) + u64::from(index) * self.stride
    }

    /// Pipeline group whose handle goes into record `index` of `table`.
    pub fn group_for(table: SbtTable, index: u32) -> u32 {
        match table {
            SbtTable::RayGen => RAYGEN_GROUP + index,
            SbtTable::Miss => FIRST_MISS_GROUP + index,
            SbtTable::HitGroup => FIRST_HIT_GROUP + index,
        }
    }

    /// Trace regions for a table starting at `base_address`.
    pub fn regions(&self, base_address: vk::DeviceAddress) -> ShaderTableRegions {
        let region = |table: SbtTable| vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + self.table_offset(table),
            stride: self.stride,
            size: self.table_len(table) * self.stride,
        };
        ShaderTableRegions {
            raygen: region(SbtTable::RayGen),
            miss: region(SbtTable::Miss),
            hit: region(SbtTable::HitGroup),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        }
    }
}

/// Shader binding table in an upload-heap buffer.
pub struct ShaderBindingTable {
    buffer: GpuBuffer,
    layout: SbtLayout,
    base_address: vk::DeviceAddress,
}

impl ShaderBindingTable {
    /// Fetches the group handles of `pipeline` and writes them at the
    /// offsets of [`SbtLayout::compute`].
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::RayTracingUnsupported`] without ray tracing and
    /// [`RhiError::PipelineError`] if the record stride exceeds the device
    /// limit.
    pub fn new(device: Arc<Device>, pipeline: &RtPipeline) -> RhiResult<Self> {
        let loaders = device.rt_loaders()?;
        let properties = *device
            .ray_tracing()
            .properties()
            .ok_or(RhiError::RayTracingUnsupported)?;

        let layout = SbtLayout::compute(
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            properties.shader_group_base_alignment,
            RAY_TYPE_COUNT,
            RAY_TYPE_COUNT,
        );
        if layout.stride > u64::from(properties.max_shader_group_stride) {
            return Err(RhiError::PipelineError(format!(
                "record stride {} exceeds device limit {}",
                layout.stride, properties.max_shader_group_stride
            )));
        }

        let handle_size = layout.handle_size as usize;
        let group_count = pipeline.group_count();
        // SAFETY: the pipeline was created with `group_count` groups.
        let handles = unsafe {
            loaders
                .ray_tracing_pipeline
                .get_ray_tracing_shader_group_handles(
                    pipeline.handle(),
                    0,
                    group_count,
                    handle_size * group_count as usize,
                )?
        };

        // The buffer address is only guaranteed to be aligned to the
        // allocation; pad so the table can start on a base boundary.
        let mut buffer = GpuBuffer::create(
            device,
            &BufferDesc {
                size: layout.total_size + layout.base_alignment,
                heap: HeapClass::Upload,
                usage: BufferUsage::ShaderBindingTable,
                is_constant: false,
                name: "shader binding table",
            },
        )?;
        let buffer_address = buffer.device_address()?;
        let base_address = align_up(buffer_address, layout.base_alignment);
        let start = base_address - buffer_address;

        let mut contents = vec![0u8; layout.total_size as usize];
        for table in [SbtTable::RayGen, SbtTable::Miss, SbtTable::HitGroup] {
            for index in 0..layout.table_len(table) as u32 {
                let group = SbtLayout::group_for(table, index) as usize;
                let src = &handles[group * handle_size..(group + 1) * handle_size];
                let dst = layout.record_offset(table, index) as usize;
                contents[dst..dst + handle_size].copy_from_slice(src);
            }
        }
        buffer.write(start, &contents)?;

        info!(
            "Shader binding table: stride={}, miss@{}, hit@{}, {} bytes",
            layout.stride, layout.miss_offset, layout.hit_offset, layout.total_size
        );

        Ok(Self {
            buffer,
            layout,
            base_address,
        })
    }

    /// Returns the layout.
    #[inline]
    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    /// Returns the trace regions.
    pub fn regions(&self) -> ShaderTableRegions {
        self.layout.regions(self.base_address)
    }

    /// Returns the backing buffer.
    #[inline]
    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_type_indices() {
        assert_eq!(RayType::Primary.miss_index(), 0);
        assert_eq!(RayType::Primary.hit_group_index(), 0);
        assert_eq!(RayType::Shadow.miss_index(), 1);
        assert_eq!(RayType::Shadow.hit_group_index(), 1);
        assert_eq!(RayType::ALL.len() as u32, RAY_TYPE_COUNT);
    }

    #[test]
    fn test_group_order() {
        assert_eq!(SbtLayout::group_for(SbtTable::RayGen, 0), 0);
        assert_eq!(
            SbtLayout::group_for(SbtTable::Miss, RayType::Shadow.miss_index()),
            2
        );
        assert_eq!(
            SbtLayout::group_for(SbtTable::HitGroup, RayType::Primary.hit_group_index()),
            3
        );
        assert_eq!(
            SbtLayout::group_for(SbtTable::HitGroup, RayType::Shadow.hit_group_index()),
            4
        );
        assert_eq!(GROUP_COUNT, 5);
    }

    #[test]
    fn test_export_stages() {
        assert_eq!(RtExport::RayGen.stage(), ShaderStage::RayGen);
        assert_eq!(RtExport::ShadowMiss.stage(), ShaderStage::Miss);
        assert_eq!(RtExport::ShadowAnyHit.stage(), ShaderStage::AnyHit);
        for export in RtExport::ALL {
            assert_eq!(
                ShaderStage::from_file_name(export.file_name()),
                Some(export.stage())
            );
        }
    }

    #[test]
    fn test_empty_library_reports_first_missing_export() {
        let library = RtShaderLibrary::new();
        match library.validate() {
            Err(RhiError::MissingExport(name)) => assert_eq!(name, "RayGen"),
            other => panic!("expected MissingExport, got {other:?}"),
        }
    }

    #[test]
    fn test_default_desc() {
        let desc = RtPipelineDesc::default();
        assert_eq!(desc.payload_size, 20);
        assert_eq!(desc.attribute_size, 8);
        assert_eq!(desc.max_recursion_depth, 2);
    }

    #[test]
    fn test_layout_for_common_hardware() {
        // Handle 32, record alignment 32, table alignment 64.
        let layout = SbtLayout::compute(32, 32, 64, 2, 2);
        assert_eq!(layout.stride, 32);
        assert_eq!(layout.miss_offset, 64);
        assert_eq!(layout.hit_offset, 128);
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn test_layout_offsets_follow_alignment_rules() {
        for (handle, record_align, base_align) in
            [(32u32, 32u32, 64u32), (32, 16, 32), (16, 16, 64), (48, 32, 128), (32, 64, 256)]
        {
            let layout = SbtLayout::compute(handle, record_align, base_align, 2, 2);
            let a = u64::from(base_align);

            assert_eq!(layout.stride % u64::from(record_align), 0);
            assert!(layout.stride >= u64::from(handle));
            assert_eq!(layout.miss_offset % a, 0);
            assert_eq!(layout.hit_offset % a, 0);
            assert_eq!(layout.total_size % a, 0);

            assert_eq!(layout.miss_offset, align_up(layout.stride, a));
            assert_eq!(
                layout.hit_offset,
                align_up(layout.miss_offset + 2 * layout.stride, a)
            );

            let shadow = RayType::Shadow;
            assert_eq!(
                layout.record_offset(SbtTable::Miss, shadow.miss_index()),
                layout.miss_offset + layout.stride
            );
            assert_eq!(
                layout.record_offset(SbtTable::HitGroup, shadow.hit_group_index()),
                layout.hit_offset + layout.stride
            );
            assert!(layout.hit_offset + 2 * layout.stride <= layout.total_size);
        }
    }

    #[test]
    fn test_regions_cover_each_table() {
        let layout = SbtLayout::compute(32, 32, 64, 2, 2);
        let regions = layout.regions(0x1000);

        assert_eq!(regions.raygen.device_address, 0x1000);
        assert_eq!(regions.raygen.size, regions.raygen.stride);
        assert_eq!(regions.miss.device_address, 0x1000 + 64);
        assert_eq!(regions.miss.size, 64);
        assert_eq!(regions.hit.device_address, 0x1000 + 128);
        assert_eq!(regions.hit.stride, 32);
        assert_eq!(regions.callable.size, 0);
    }
}
