//! The device the validator allocates from and records into.
//!
//! The validator never calls the driver directly. Everything goes through [`GpuavDevice`], which
//! the layer implements on top of the dispatch table of the device being validated. [`AshDevice`]
//! is an implementation on top of an [`ash::Device`].

pub use self::vulkan::AshDevice;
use crate::{vk, DeviceSize, VulkanError};
use smallvec::SmallVec;
use std::{ffi::CStr, fmt, ptr::NonNull};

mod vulkan;

/// Properties and features of the device that decide what can be validated, and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_bound_descriptor_sets: u32,
    pub max_storage_buffer_range: u32,
    pub min_storage_buffer_offset_alignment: DeviceSize,
    pub max_push_constants_size: u32,
    pub max_compute_work_group_count: [u32; 3],
    pub max_compute_work_group_size: [u32; 3],
    pub max_draw_indirect_count: u32,
    pub max_task_work_group_count: [u32; 3],
    pub max_task_work_group_total_count: u32,
    pub max_mesh_work_group_count: [u32; 3],
    pub max_mesh_work_group_total_count: u32,
    pub max_ray_dispatch_invocation_count: u32,

    /// The `drawIndirectFirstInstance` feature is enabled.
    pub draw_indirect_first_instance: bool,
    /// The `vertexPipelineStoresAndAtomics` feature is enabled.
    pub vertex_pipeline_stores_and_atomics: bool,
    /// The `fragmentStoresAndAtomics` feature is enabled.
    pub fragment_stores_and_atomics: bool,
    /// The `shaderInt64` feature is enabled.
    pub shader_int64: bool,
    /// The `bufferDeviceAddress` feature is enabled.
    pub buffer_device_address: bool,
    /// The `shaderObject` feature is enabled.
    pub shader_object: bool,
}

impl DeviceLimits {
    /// Fills in the core limits and features. Mesh and ray tracing limits are left at zero,
    /// which disables the pre-passes that need them, until the caller fills them in from the
    /// extension property structs.
    pub fn from_vk(limits: &vk::PhysicalDeviceLimits, features: &vk::PhysicalDeviceFeatures) -> Self {
        DeviceLimits {
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            max_storage_buffer_range: limits.max_storage_buffer_range,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            max_push_constants_size: limits.max_push_constants_size,
            max_compute_work_group_count: limits.max_compute_work_group_count,
            max_compute_work_group_size: limits.max_compute_work_group_size,
            max_draw_indirect_count: limits.max_draw_indirect_count,
            max_task_work_group_count: [0; 3],
            max_task_work_group_total_count: 0,
            max_mesh_work_group_count: [0; 3],
            max_mesh_work_group_total_count: 0,
            max_ray_dispatch_invocation_count: 0,
            draw_indirect_first_instance: features.draw_indirect_first_instance != vk::FALSE,
            vertex_pipeline_stores_and_atomics: features.vertex_pipeline_stores_and_atomics
                != vk::FALSE,
            fragment_stores_and_atomics: features.fragment_stores_and_atomics != vk::FALSE,
            shader_int64: features.shader_int64 != vk::FALSE,
            buffer_device_address: false,
            shader_object: false,
        }
    }

    /// Index of the descriptor set the validator binds.
    #[inline]
    pub fn reserved_set_index(&self) -> u32 {
        self.max_bound_descriptor_sets.saturating_sub(1)
    }
}

impl Default for DeviceLimits {
    /// The minimum limits the Vulkan specification requires, with every optional feature
    /// disabled.
    fn default() -> Self {
        DeviceLimits {
            max_bound_descriptor_sets: 4,
            max_storage_buffer_range: 1 << 27,
            min_storage_buffer_offset_alignment: 256,
            max_push_constants_size: 128,
            max_compute_work_group_count: [65535; 3],
            max_compute_work_group_size: [128, 128, 64],
            max_draw_indirect_count: 1,
            max_task_work_group_count: [0; 3],
            max_task_work_group_total_count: 0,
            max_mesh_work_group_count: [0; 3],
            max_mesh_work_group_total_count: 0,
            max_ray_dispatch_invocation_count: 0,
            draw_indirect_first_instance: false,
            vertex_pipeline_stores_and_atomics: false,
            fragment_stores_and_atomics: false,
            shader_int64: false,
            buffer_device_address: false,
            shader_object: false,
        }
    }
}

/// A host-visible, host-coherent buffer that stays mapped for its whole lifetime.
pub struct DeviceBuffer {
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: DeviceSize,
    mapped: NonNull<u32>,
}

// SAFETY: The mapping belongs to the buffer alone, and every access through it goes through the
// bounds-checked methods below.
unsafe impl Send for DeviceBuffer {}
// SAFETY: See above.
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    /// Wraps a buffer whose memory is mapped at `mapped`.
    ///
    /// # Safety
    ///
    /// - `mapped` must point to at least `size` bytes that stay mapped and host coherent until
    ///   the buffer is passed to [`GpuavDevice::destroy_buffer`].
    /// - `mapped` must be aligned to 4 bytes.
    #[inline]
    pub unsafe fn from_raw_parts(
        handle: vk::Buffer,
        memory: vk::DeviceMemory,
        size: DeviceSize,
        mapped: NonNull<u8>,
    ) -> Self {
        DeviceBuffer {
            handle,
            memory,
            size,
            mapped: mapped.cast(),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the number of whole words in the buffer.
    #[inline]
    pub fn len_words(&self) -> usize {
        (self.size / 4) as usize
    }

    /// Copies words starting at word `offset` into `out`.
    ///
    /// # Panics
    ///
    /// - Panics if the range is out of bounds of the buffer.
    pub fn read_words(&self, offset: usize, out: &mut [u32]) {
        assert!(offset.checked_add(out.len()).is_some_and(|end| end <= self.len_words()));

        // SAFETY: We checked that the range is in bounds of the mapping.
        let src = unsafe { self.mapped.as_ptr().add(offset) };
        // SAFETY: `out` can't alias the mapping, which the validator never hands out.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
    }

    /// Reads the word at `offset`.
    ///
    /// # Panics
    ///
    /// - Panics if `offset` is out of bounds of the buffer.
    #[inline]
    pub fn read_word(&self, offset: usize) -> u32 {
        let mut word = [0];
        self.read_words(offset, &mut word);

        word[0]
    }

    /// Copies `words` into the buffer starting at word `offset`.
    ///
    /// # Panics
    ///
    /// - Panics if the range is out of bounds of the buffer.
    pub fn write_words(&self, offset: usize, words: &[u32]) {
        assert!(offset.checked_add(words.len()).is_some_and(|end| end <= self.len_words()));

        // SAFETY: We checked that the range is in bounds of the mapping.
        let dst = unsafe { self.mapped.as_ptr().add(offset) };
        // SAFETY: `words` can't alias the mapping, which the validator never hands out.
        unsafe { std::ptr::copy_nonoverlapping(words.as_ptr(), dst, words.len()) };
    }

    /// Zeroes the whole buffer.
    pub fn fill_zero(&self) {
        // SAFETY: The mapping is `len_words` words long.
        unsafe { std::ptr::write_bytes(self.mapped.as_ptr(), 0, self.len_words()) };
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A storage buffer binding of a descriptor set layout the validator creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageBinding {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Points a storage buffer binding of a validator descriptor set at a buffer range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageBufferWrite {
    pub binding: u32,
    pub buffer: vk::Buffer,
    pub offset: DeviceSize,
    pub range: DeviceSize,
}

/// A global memory barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stages: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stages: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

/// Describes the render pass a graphics pre-pass pipeline must be compatible with.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RenderingInfo {
    RenderPass {
        render_pass: vk::RenderPass,
        subpass: u32,
    },
    Dynamic {
        view_mask: u32,
        color_formats: SmallVec<[vk::Format; 4]>,
        depth_format: vk::Format,
        stencil_format: vk::Format,
    },
}

/// The kind of object a validation program is built as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramTarget<'a> {
    /// A compute pipeline.
    ComputePipeline,

    /// A graphics pipeline made of a vertex shader only, with rasterizer discard enabled.
    GraphicsPipeline(&'a RenderingInfo),

    /// A compute shader object.
    ShaderObject,
}

/// Parameters to create a validation program.
#[derive(Clone, Copy, Debug)]
pub struct ValidationProgramCreateInfo<'a> {
    pub target: ProgramTarget<'a>,
    pub stage: vk::ShaderStageFlags,
    pub code: &'a [u32],
    pub entry_point: &'a CStr,
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    pub pipeline_layout: vk::PipelineLayout,
    pub push_constant_size: u32,
}

/// A compiled validation program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValidationProgram {
    Pipeline(vk::Pipeline),
    ShaderObject(vk::ShaderEXT),
}

/// The device the validator allocates from and records into.
///
/// # Safety
///
/// - Buffers returned by `create_buffer` must satisfy the requirements of
///   [`DeviceBuffer::from_raw_parts`].
/// - Objects must be created on the device whose commands the validator records into.
pub unsafe trait GpuavDevice: Send + Sync + fmt::Debug {
    fn limits(&self) -> &DeviceLimits;

    /// Creates a host-visible, host-coherent buffer of `size` bytes, mapped and zeroed.
    fn create_buffer(
        &self,
        size: DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<DeviceBuffer, VulkanError>;

    /// # Safety
    ///
    /// - No pending submission may access `buffer`.
    unsafe fn destroy_buffer(&self, buffer: DeviceBuffer);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[StorageBinding],
    ) -> Result<vk::DescriptorSetLayout, VulkanError>;

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
        push_constant_stages: vk::ShaderStageFlags,
    ) -> Result<vk::PipelineLayout, VulkanError>;

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_validation_program(
        &self,
        create_info: &ValidationProgramCreateInfo<'_>,
    ) -> Result<ValidationProgram, VulkanError>;

    unsafe fn destroy_validation_program(&self, program: ValidationProgram);

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError>;

    /// # Safety
    ///
    /// - No pending submission may use `set`.
    unsafe fn free_descriptor_set(&self, set: vk::DescriptorSet);

    /// # Safety
    ///
    /// - No pending submission may use `set`.
    unsafe fn write_storage_buffers(&self, set: vk::DescriptorSet, writes: &[StorageBufferWrite]);

    /// # Safety
    ///
    /// - `command_buffer` must be in the recording state.
    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    unsafe fn cmd_bind_shaders(
        &self,
        command_buffer: vk::CommandBuffer,
        stages: &[vk::ShaderStageFlags],
        shaders: &[vk::ShaderEXT],
    );

    unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, group_counts: [u32; 3]);

    unsafe fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32);

    unsafe fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &MemoryBarrier);
}
