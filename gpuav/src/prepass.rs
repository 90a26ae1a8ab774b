//! Auxiliary programs that check the parameters of indirect operations and copies before the
//! real operation reads them.
//!
//! Each kind of pre-pass is a small WGSL program, compiled to SPIR-V with naga the first time it
//! is needed and cached for the lifetime of the validator. Pre-passes only read application
//! buffers; what they find is written as records into the error log of the command they
//! precede, with [`PREPASS_SHADER_ID`] as the shader id.
//!
//! Every pre-pass uses the same interface:
//!
//! ```text
//! set 0, binding 0    error log of the command
//! set 0, binding 1    input buffer (indirect parameters, or copy source)
//! set 0, binding 2    count buffer (or the input buffer again)
//! push constants      PrepassParams
//! ```

use crate::{
    cache::OnceCache,
    command::{BindPointState, CommandBufferState},
    device::{
        DeviceLimits, GpuavDevice, MemoryBarrier, ProgramTarget, RenderingInfo, StorageBinding,
        StorageBufferWrite, ValidationProgram, ValidationProgramCreateInfo,
    },
    record::{
        ErrorKind, LOG_HEADER_WORDS, PREPASS_SHADER_ID, RECORD_WORDS, STAGE_UNKNOWN,
    },
    vk, DeviceSize, GpuavError, VulkanError,
};
use bytemuck::{Pod, Zeroable};
use std::{fmt::Write, sync::Arc};

/// The kinds of pre-pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PrepassKind {
    /// Group counts of `vkCmdDispatchIndirect` against `maxComputeWorkGroupCount`.
    DispatchIndirect,

    /// `firstInstance` of `vkCmdDrawIndirect` and the draw count of its count variant.
    DrawIndirect,

    /// Same as `DrawIndirect`, for indexed draws.
    DrawIndexedIndirect,

    /// Task counts of `vkCmdDrawMeshTasksIndirectEXT` against the task or mesh limits.
    DrawMeshTasksIndirect,

    /// Dimensions of `vkCmdTraceRaysIndirectKHR` against the ray dispatch limits.
    TraceRaysIndirect,

    /// Depth values of a buffer to `D32_SFLOAT` image copy, which must lie in `[0, 1]`.
    CopyBufferToImageDepth,
}

impl PrepassKind {
    /// Whether the pre-pass runs on the graphics bind point, so that it can be recorded inside
    /// a render pass.
    #[inline]
    pub fn is_graphics(self) -> bool {
        matches!(
            self,
            PrepassKind::DrawIndirect
                | PrepassKind::DrawIndexedIndirect
                | PrepassKind::DrawMeshTasksIndirect,
        )
    }

    #[inline]
    pub fn bind_point(self) -> vk::PipelineBindPoint {
        if self.is_graphics() {
            vk::PipelineBindPoint::GRAPHICS
        } else {
            vk::PipelineBindPoint::COMPUTE
        }
    }

    #[inline]
    pub fn stage(self) -> vk::ShaderStageFlags {
        if self.is_graphics() {
            vk::ShaderStageFlags::VERTEX
        } else {
            vk::ShaderStageFlags::COMPUTE
        }
    }

    fn pipeline_stage(self) -> vk::PipelineStageFlags {
        if self.is_graphics() {
            vk::PipelineStageFlags::VERTEX_SHADER
        } else {
            vk::PipelineStageFlags::COMPUTE_SHADER
        }
    }
}

/// Identifies one cached pre-pass program.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PrepassKey {
    pub kind: PrepassKind,

    /// The render pass a graphics pre-pass must be compatible with. `None` for compute
    /// pre-passes.
    pub rendering: Option<RenderingInfo>,

    /// Whether the program is built as a shader object.
    pub shader_object: bool,
}

/// Push constants of every pre-pass program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct PrepassParams {
    /// Offset of the first parameter struct in the input buffer binding, in words.
    pub input_offset: u32,
    /// Stride between parameter structs, in words.
    pub stride: u32,
    /// Maximum number of draws, or number of texels to check.
    pub draw_count: u32,
    /// Offset of the draw count in the count buffer binding, in words, or [`NO_COUNT_BUFFER`].
    pub count_offset: u32,
    /// Number of parameter structs that fit in the input buffer.
    pub draw_capacity: u32,
    /// Per-dimension limits for the mesh task counts.
    pub limit: [u32; 3],
    /// Limit for the total mesh task count.
    pub limit_total: u32,
}

/// Value of [`PrepassParams::count_offset`] for operations without a count buffer.
pub const NO_COUNT_BUFFER: u32 = u32::MAX;

const PARAMS_SIZE: u32 = std::mem::size_of::<PrepassParams>() as u32;

const COPY_WORKGROUP_SIZE: u32 = 64;

/// The compiled program of one pre-pass, with the layouts it was built against.
#[derive(Debug)]
pub struct SharedValidationResources {
    device: Arc<dyn GpuavDevice>,
    kind: PrepassKind,
    program: ValidationProgram,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

impl SharedValidationResources {
    #[inline]
    pub fn kind(&self) -> PrepassKind {
        self.kind
    }

    #[inline]
    pub fn program(&self) -> ValidationProgram {
        self.program
    }

    #[inline]
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    #[inline]
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.kind.bind_point()
    }
}

impl Drop for SharedValidationResources {
    fn drop(&mut self) {
        // SAFETY: The resources are only dropped with the validator, once nothing can be
        // pending anymore.
        unsafe {
            self.device.destroy_validation_program(self.program);
        }
        // SAFETY: See above.
        unsafe {
            self.device.destroy_pipeline_layout(self.pipeline_layout);
        }
        // SAFETY: See above.
        unsafe {
            self.device.destroy_descriptor_set_layout(self.set_layout);
        }
    }
}

/// Builds pre-pass programs once per key.
#[derive(Debug)]
pub(crate) struct PrepassCache {
    device: Arc<dyn GpuavDevice>,
    programs: OnceCache<PrepassKey, Arc<SharedValidationResources>, GpuavError>,
}

impl PrepassCache {
    pub(crate) fn new(device: Arc<dyn GpuavDevice>) -> Self {
        PrepassCache {
            device,
            programs: OnceCache::new(),
        }
    }

    /// Returns the program for `key`, building it if needed. A failed build is remembered, and
    /// returned again to every later caller.
    pub(crate) fn get_or_build(
        &self,
        key: &PrepassKey,
    ) -> Result<Arc<SharedValidationResources>, GpuavError> {
        self.programs.get_or_try_build(key, || {
            log::debug!("building the {:?} validation pre-pass", key.kind);

            let resources = build(&self.device, key)?;

            Ok(Arc::new(resources))
        })
    }
}

fn build(
    device: &Arc<dyn GpuavDevice>,
    key: &PrepassKey,
) -> Result<SharedValidationResources, GpuavError> {
    let kind = key.kind;
    let build_failure = |reason: &str| GpuavError::BuildFailure {
        kind,
        reason: reason.into(),
    };

    let target = match (kind.is_graphics(), key.shader_object, &key.rendering) {
        (true, true, _) => {
            return Err(build_failure(
                "graphics pre-passes can't be built as shader objects",
            ));
        }
        (true, false, Some(rendering)) => ProgramTarget::GraphicsPipeline(rendering),
        (true, false, None) => return Err(build_failure("no render pass was given")),
        (false, true, _) => ProgramTarget::ShaderObject,
        (false, false, _) => ProgramTarget::ComputePipeline,
    };

    let limits = device.limits();

    if kind.is_graphics() && !limits.vertex_pipeline_stores_and_atomics {
        return Err(build_failure(
            "the `vertexPipelineStoresAndAtomics` feature is not enabled",
        ));
    }

    let code = compile(&wgsl_source(kind, limits)).map_err(|reason| build_failure(&reason))?;

    let stages = kind.stage();
    let bindings = [0, 1, 2].map(|binding| StorageBinding { binding, stages });
    let set_layout = device.create_descriptor_set_layout(&bindings)?;

    let pipeline_layout = match device.create_pipeline_layout(&[set_layout], PARAMS_SIZE, stages) {
        Ok(layout) => layout,
        Err(err) => {
            // SAFETY: The layout was never used.
            unsafe { device.destroy_descriptor_set_layout(set_layout) };

            return Err(err.into());
        }
    };

    let create_info = ValidationProgramCreateInfo {
        target,
        stage: stages,
        code: &code,
        entry_point: c"main",
        set_layouts: &[set_layout],
        pipeline_layout,
        push_constant_size: PARAMS_SIZE,
    };

    let program = match device.create_validation_program(&create_info) {
        Ok(program) => program,
        Err(err) => {
            // SAFETY: The layouts were never used.
            unsafe { device.destroy_pipeline_layout(pipeline_layout) };
            // SAFETY: Same as above.
            unsafe { device.destroy_descriptor_set_layout(set_layout) };

            return Err(match err {
                VulkanError::InvalidShader | VulkanError::FeatureNotPresent => {
                    build_failure(&err.to_string())
                }
                err => err.into(),
            });
        }
    };

    Ok(SharedValidationResources {
        device: device.clone(),
        kind,
        program,
        set_layout,
        pipeline_layout,
    })
}

/// Compiles WGSL source to SPIR-V.
fn compile(source: &str) -> Result<Vec<u32>, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|err| err.emit_to_string(source))?;
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::PUSH_CONSTANT,
    )
    .validate(&module)
    .map_err(|err| err.to_string())?;

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        ..Default::default()
    };

    naga::back::spv::write_vec(&module, &info, &options, None).map_err(|err| err.to_string())
}

/// Returns the WGSL source of a pre-pass. Device limits are baked in.
pub(crate) fn wgsl_source(kind: PrepassKind, limits: &DeviceLimits) -> String {
    let mut src = String::new();

    // Writing to a `String` can't fail.
    let _ = write!(
        src,
        "
        struct ErrorLog {{
            written: atomic<u32>,
            reserved: array<u32, {reserved}>,
            records: array<u32>,
        }}

        struct Params {{
            input_offset: u32,
            stride: u32,
            draw_count: u32,
            count_offset: u32,
            draw_capacity: u32,
            limit_x: u32,
            limit_y: u32,
            limit_z: u32,
            limit_total: u32,
        }}

        @group(0) @binding(0)
        var<storage, read_write> error_log: ErrorLog;
        @group(0) @binding(1)
        var<storage, read> input: array<u32>;
        @group(0) @binding(2)
        var<storage, read> counts: array<u32>;
        var<push_constant> params: Params;

        fn report(kind: u32, index: u32, operands: array<u32, 8>) {{
            let slot = atomicAdd(&error_log.written, 1u);

            if (slot >= arrayLength(&error_log.records) / {record_words}u) {{
                return;
            }}

            let base = slot * {record_words}u;
            error_log.records[base + 0u] = {shader_id}u;
            error_log.records[base + 1u] = kind;
            error_log.records[base + 2u] = 0u;
            error_log.records[base + 3u] = {stage}u;
            error_log.records[base + 4u] = index;
            error_log.records[base + 5u] = 0u;
            error_log.records[base + 6u] = 0u;
            error_log.records[base + 7u] = 0u;
            error_log.records[base + 8u] = operands[0];
            error_log.records[base + 9u] = operands[1];
            error_log.records[base + 10u] = operands[2];
            error_log.records[base + 11u] = operands[3];
            error_log.records[base + 12u] = operands[4];
            error_log.records[base + 13u] = operands[5];
            error_log.records[base + 14u] = operands[6];
            error_log.records[base + 15u] = operands[7];
        }}

        // Whether `x * y * z` exceeds `limit`, without overflowing.
        fn product_exceeds(x: u32, y: u32, z: u32, limit: u32) -> bool {{
            if (x == 0u || y == 0u || z == 0u) {{
                return false;
            }}
            if (y > limit / x) {{
                return true;
            }}
            return z > limit / (x * y);
        }}
        ",
        reserved = LOG_HEADER_WORDS - 1,
        record_words = RECORD_WORDS,
        shader_id = PREPASS_SHADER_ID,
        stage = STAGE_UNKNOWN,
    );

    match kind {
        PrepassKind::DispatchIndirect => {
            let [lx, ly, lz] = limits.max_compute_work_group_count;
            let _ = write!(
                src,
                "
                @compute @workgroup_size(1)
                fn main() {{
                    let x = input[params.input_offset];
                    let y = input[params.input_offset + 1u];
                    let z = input[params.input_offset + 2u];

                    if (x > {lx}u || y > {ly}u || z > {lz}u) {{
                        report({kind}u, 0u, array<u32, 8>(x, y, z, {lx}u, {ly}u, {lz}u, 0u, 0u));
                    }}
                }}
                ",
                kind = ErrorKind::DispatchGroupCountExceeded as u32,
            );
        }
        PrepassKind::DrawIndirect | PrepassKind::DrawIndexedIndirect => {
            // `VkDrawIndirectCommand` and `VkDrawIndexedIndirectCommand`.
            let first_instance_word = if kind == PrepassKind::DrawIndirect { 3 } else { 4 };
            let first_instance_check = if limits.draw_indirect_first_instance {
                String::new()
            } else {
                format!(
                    "
                    let first_instance = input[base + {first_instance_word}u];

                    if (first_instance != 0u) {{
                        report({kind}u, draw, array<u32, 8>(draw, first_instance, 0u, 0u, 0u, 0u, 0u, 0u));
                    }}
                    ",
                    kind = ErrorKind::DrawFirstInstanceNonZero as u32,
                )
            };
            let _ = write!(
                src,
                "
                @vertex
                fn main(@builtin(vertex_index) draw: u32) -> @builtin(position) vec4<f32> {{
                    var count = params.draw_count;

                    if (params.count_offset != {no_count}u) {{
                        let actual = counts[params.count_offset];

                        if (draw == 0u) {{
                            if (actual > {max_count}u) {{
                                report({exceeds_limit}u, 0u, array<u32, 8>(actual, {max_count}u, 0u, 0u, 0u, 0u, 0u, 0u));
                            }}
                            if (min(actual, params.draw_count) > params.draw_capacity) {{
                                report({exceeds_buffer}u, 0u, array<u32, 8>(actual, params.draw_capacity, 0u, 0u, 0u, 0u, 0u, 0u));
                            }}
                        }}

                        count = min(actual, params.draw_count);
                    }}

                    if (draw < count && draw < params.draw_capacity) {{
                        let base = params.input_offset + draw * params.stride;
                        {first_instance_check}
                    }}

                    return vec4<f32>(0.0, 0.0, 0.0, 1.0);
                }}
                ",
                no_count = NO_COUNT_BUFFER,
                max_count = limits.max_draw_indirect_count,
                exceeds_limit = ErrorKind::DrawCountExceedsLimit as u32,
                exceeds_buffer = ErrorKind::DrawCountExceedsBuffer as u32,
            );
        }
        PrepassKind::DrawMeshTasksIndirect => {
            let _ = write!(
                src,
                "
                @vertex
                fn main(@builtin(vertex_index) draw: u32) -> @builtin(position) vec4<f32> {{
                    var count = params.draw_count;

                    if (params.count_offset != {no_count}u) {{
                        count = min(counts[params.count_offset], params.draw_count);
                    }}

                    if (draw < count && draw < params.draw_capacity) {{
                        let base = params.input_offset + draw * params.stride;
                        let x = input[base];
                        let y = input[base + 1u];
                        let z = input[base + 2u];

                        if (
                            x > params.limit_x ||
                            y > params.limit_y ||
                            z > params.limit_z ||
                            product_exceeds(x, y, z, params.limit_total)
                        ) {{
                            report({kind}u, draw, array<u32, 8>(
                                draw, x, y, z,
                                params.limit_x, params.limit_y, params.limit_z, params.limit_total,
                            ));
                        }}
                    }}

                    return vec4<f32>(0.0, 0.0, 0.0, 1.0);
                }}
                ",
                no_count = NO_COUNT_BUFFER,
                kind = ErrorKind::MeshTaskCountExceeded as u32,
            );
        }
        PrepassKind::TraceRaysIndirect => {
            let [lw, lh, ld] = [0, 1, 2].map(|i| {
                limits.max_compute_work_group_count[i]
                    .saturating_mul(limits.max_compute_work_group_size[i])
            });
            let _ = write!(
                src,
                "
                @compute @workgroup_size(1)
                fn main() {{
                    let width = input[params.input_offset];
                    let height = input[params.input_offset + 1u];
                    let depth = input[params.input_offset + 2u];

                    if (
                        width > {lw}u ||
                        height > {lh}u ||
                        depth > {ld}u ||
                        product_exceeds(width, height, depth, {total}u)
                    ) {{
                        report({kind}u, 0u, array<u32, 8>(width, height, depth, {lw}u, {lh}u, {ld}u, {total}u, 0u));
                    }}
                }}
                ",
                total = limits.max_ray_dispatch_invocation_count,
                kind = ErrorKind::TraceRaysDimensionsExceeded as u32,
            );
        }
        PrepassKind::CopyBufferToImageDepth => {
            let _ = write!(
                src,
                "
                @compute @workgroup_size({COPY_WORKGROUP_SIZE})
                fn main(@builtin(global_invocation_id) id: vec3<u32>) {{
                    let texel = id.x;

                    if (texel >= params.draw_count) {{
                        return;
                    }}

                    let bits = input[params.input_offset + texel];
                    let depth = bitcast<f32>(bits);

                    // NaN fails both comparisons.
                    if (!(depth >= 0.0 && depth <= 1.0)) {{
                        report({kind}u, texel, array<u32, 8>(texel, bits, 0u, 0u, 0u, 0u, 0u, 0u));
                    }}
                }}
                ",
                kind = ErrorKind::CopyDepthOutOfRange as u32,
            );
        }
    }

    src
}

/// A buffer range a pre-pass reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: DeviceSize,
}

/// Everything needed to record one pre-pass.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PrepassDispatch<'a> {
    pub(crate) command_buffer: vk::CommandBuffer,
    pub(crate) error_log: vk::Buffer,
    pub(crate) descriptor_set: vk::DescriptorSet,
    pub(crate) input: BufferRange,
    pub(crate) count: Option<BufferRange>,
    pub(crate) params: PrepassParams,
    /// Number of vertices or workgroups to launch.
    pub(crate) launch: u32,
    pub(crate) inside_render_pass: bool,
    pub(crate) restore: &'a CommandBufferState,
}

/// Splits a buffer offset into a binding offset aligned to `alignment` and a remainder in
/// words.
pub(crate) fn align_binding(offset: DeviceSize, alignment: DeviceSize) -> (DeviceSize, u32) {
    let alignment = alignment.max(4);
    let aligned = offset - offset % alignment;

    (aligned, ((offset - aligned) / 4) as u32)
}

/// Returns the number of workgroups a copy pre-pass over `texel_count` texels launches.
pub(crate) fn copy_workgroups(texel_count: u32, limits: &DeviceLimits) -> u32 {
    texel_count
        .div_ceil(COPY_WORKGROUP_SIZE)
        .min(limits.max_compute_work_group_count[0])
}

/// Records `resources` into the command buffer, surrounded by the barriers that order it after
/// the application's writes of its inputs and before the real operation. Afterwards, the
/// application's state on the pre-pass's bind point is restored.
///
/// # Safety
///
/// - The command buffer must be recording, and `dispatch.descriptor_set` must have been
///   allocated with the set layout of `resources` and stay alive until the command buffer
///   completes.
pub(crate) unsafe fn record(
    device: &dyn GpuavDevice,
    resources: &SharedValidationResources,
    dispatch: &PrepassDispatch<'_>,
) {
    let cb = dispatch.command_buffer;
    let kind = resources.kind;
    let limits = device.limits();

    let (input_offset, input_remainder) =
        align_binding(dispatch.input.offset, limits.min_storage_buffer_offset_alignment);
    let count = dispatch.count.unwrap_or(dispatch.input);
    let (count_offset, count_remainder) =
        align_binding(count.offset, limits.min_storage_buffer_offset_alignment);

    let writes = [
        StorageBufferWrite {
            binding: 0,
            buffer: dispatch.error_log,
            offset: 0,
            range: vk::WHOLE_SIZE,
        },
        StorageBufferWrite {
            binding: 1,
            buffer: dispatch.input.buffer,
            offset: input_offset,
            range: vk::WHOLE_SIZE,
        },
        StorageBufferWrite {
            binding: 2,
            buffer: count.buffer,
            offset: count_offset,
            range: vk::WHOLE_SIZE,
        },
    ];

    // SAFETY: The caller must ensure that the set isn't in use.
    unsafe { device.write_storage_buffers(dispatch.descriptor_set, &writes) };

    let params = PrepassParams {
        input_offset: input_remainder,
        count_offset: if dispatch.count.is_some() {
            count_remainder
        } else {
            NO_COUNT_BUFFER
        },
        ..dispatch.params
    };

    // Barriers are not allowed in a render pass without a self-dependency.
    if !dispatch.inside_render_pass {
        let before = MemoryBarrier {
            src_stages: vk::PipelineStageFlags::ALL_COMMANDS,
            src_access: vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE,
            dst_stages: kind.pipeline_stage(),
            dst_access: vk::AccessFlags::SHADER_READ,
        };

        // SAFETY: The caller must ensure that the command buffer is recording.
        unsafe { device.cmd_pipeline_barrier(cb, &before) };
    }

    let bind_point = kind.bind_point();

    match resources.program {
        ValidationProgram::Pipeline(pipeline) => {
            // SAFETY: Same as above.
            unsafe { device.cmd_bind_pipeline(cb, bind_point, pipeline) };
        }
        ValidationProgram::ShaderObject(shader) => {
            // SAFETY: Same as above.
            unsafe { device.cmd_bind_shaders(cb, &[vk::ShaderStageFlags::COMPUTE], &[shader]) };
        }
    }

    // SAFETY: Same as above.
    unsafe {
        device.cmd_bind_descriptor_sets(
            cb,
            bind_point,
            resources.pipeline_layout,
            0,
            &[dispatch.descriptor_set],
            &[],
        )
    };
    // SAFETY: Same as above.
    unsafe {
        device.cmd_push_constants(
            cb,
            resources.pipeline_layout,
            kind.stage(),
            0,
            bytemuck::bytes_of(&params),
        )
    };

    if kind.is_graphics() {
        // SAFETY: Same as above.
        unsafe { device.cmd_draw(cb, dispatch.launch) };
    } else {
        // SAFETY: Same as above.
        unsafe { device.cmd_dispatch(cb, [dispatch.launch, 1, 1]) };
    }

    if !dispatch.inside_render_pass {
        let after = MemoryBarrier {
            src_stages: kind.pipeline_stage(),
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_stages: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_access: vk::AccessFlags::empty(),
        };

        // SAFETY: Same as above.
        unsafe { device.cmd_pipeline_barrier(cb, &after) };
    }

    let state = match bind_point {
        vk::PipelineBindPoint::GRAPHICS => &dispatch.restore.graphics,
        _ => &dispatch.restore.compute,
    };

    // SAFETY: Same as above.
    unsafe { restore(device, cb, bind_point, state, dispatch.restore) };
}

/// Rebinds the application's pipeline, descriptor sets and push constants on `bind_point`.
///
/// Dynamic state set by the application is not touched, since no pre-pass sets any.
unsafe fn restore(
    device: &dyn GpuavDevice,
    cb: vk::CommandBuffer,
    bind_point: vk::PipelineBindPoint,
    state: &BindPointState,
    command_buffer: &CommandBufferState,
) {
    let Some(pipeline) = &state.pipeline else {
        return;
    };

    if pipeline.shader_objects.is_empty() {
        // SAFETY: The caller must ensure that the command buffer is recording.
        unsafe { device.cmd_bind_pipeline(cb, bind_point, pipeline.handle) };
    } else {
        let (stages, shaders): (Vec<_>, Vec<_>) = pipeline.shader_objects.iter().copied().unzip();

        // SAFETY: Same as above.
        unsafe { device.cmd_bind_shaders(cb, &stages, &shaders) };
    }

    for (index, bound) in state.descriptor_sets.iter().enumerate() {
        let Some(bound) = bound else {
            continue;
        };

        // SAFETY: Same as above.
        unsafe {
            device.cmd_bind_descriptor_sets(
                cb,
                bind_point,
                bound.layout,
                index as u32,
                &[bound.set],
                &bound.dynamic_offsets,
            )
        };
    }

    if let Some(push_constants) = &command_buffer.push_constants {
        if !push_constants.data.is_empty() {
            // SAFETY: Same as above.
            unsafe {
                device.cmd_push_constants(
                    cb,
                    push_constants.layout,
                    push_constants.stages,
                    push_constants.offset,
                    &push_constants.data,
                )
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockDevice;
    use std::sync::Barrier;

    fn compute_key(kind: PrepassKind) -> PrepassKey {
        PrepassKey {
            kind,
            rendering: None,
            shader_object: false,
        }
    }

    #[test]
    fn every_program_compiles() {
        let limits = DeviceLimits {
            max_ray_dispatch_invocation_count: 1 << 30,
            ..Default::default()
        };

        for kind in [
            PrepassKind::DispatchIndirect,
            PrepassKind::DrawIndirect,
            PrepassKind::DrawIndexedIndirect,
            PrepassKind::DrawMeshTasksIndirect,
            PrepassKind::TraceRaysIndirect,
            PrepassKind::CopyBufferToImageDepth,
        ] {
            let source = wgsl_source(kind, &limits);

            if let Err(err) = compile(&source) {
                panic!("{:?} failed to compile:\n{}", kind, err);
            }
        }
    }

    #[test]
    fn limits_are_baked_in() {
        let limits = DeviceLimits {
            max_compute_work_group_count: [1000, 2000, 3000],
            ..Default::default()
        };
        let source = wgsl_source(PrepassKind::DispatchIndirect, &limits);

        assert!(source.contains("x > 1000u || y > 2000u || z > 3000u"));
    }

    #[test]
    fn builds_once_across_threads() {
        let device = Arc::new(MockDevice::new());
        let cache = Arc::new(PrepassCache::new(device.clone()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();

                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_build(&compute_key(PrepassKind::DispatchIndirect))
                        .unwrap()
                })
            })
            .collect();

        let built: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(built.iter().all(|r| Arc::ptr_eq(r, &built[0])));
        assert_eq!(device.programs_created(), 1);
    }

    #[test]
    fn graphics_prepass_needs_vertex_stores() {
        let device = Arc::new(MockDevice::new());
        let cache = PrepassCache::new(device.clone());
        let key = PrepassKey {
            kind: PrepassKind::DrawIndirect,
            rendering: Some(RenderingInfo::RenderPass {
                render_pass: vk::RenderPass::null(),
                subpass: 0,
            }),
            shader_object: false,
        };

        let err = cache.get_or_build(&key).unwrap_err();
        assert!(matches!(
            err,
            GpuavError::BuildFailure {
                kind: PrepassKind::DrawIndirect,
                ..
            },
        ));

        // Failures are sticky.
        assert_eq!(cache.get_or_build(&key).unwrap_err(), err);
        assert_eq!(device.programs_created(), 0);
    }

    #[test]
    fn binding_offsets_are_aligned() {
        assert_eq!(align_binding(0, 256), (0, 0));
        assert_eq!(align_binding(260, 256), (256, 1));
        assert_eq!(align_binding(12, 1), (12, 0));
    }
}
