use super::{
    DeviceBuffer, DeviceLimits, GpuavDevice, MemoryBarrier, ProgramTarget, RenderingInfo,
    StorageBinding, StorageBufferWrite, ValidationProgram, ValidationProgramCreateInfo,
};
use crate::{vk, DeviceSize, VulkanError};
use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{fmt, ptr::NonNull};

const SETS_PER_POOL: u32 = 256;

/// [`GpuavDevice`] implemented on top of an [`ash::Device`].
pub struct AshDevice {
    device: ash::Device,
    shader_object: Option<ash::ext::shader_object::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    descriptor_pools: Mutex<DescriptorPools>,
}

#[derive(Default)]
struct DescriptorPools {
    pools: Vec<vk::DescriptorPool>,
    owners: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
}

impl AshDevice {
    /// Wraps `device`, which must have been created from `physical_device` with the features
    /// `limits` reports as enabled.
    ///
    /// # Safety
    ///
    /// - `device` must outlive the returned object.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        limits: DeviceLimits,
    ) -> Self {
        // SAFETY: The caller must ensure that `physical_device` belongs to `instance`.
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let shader_object = limits
            .shader_object
            .then(|| ash::ext::shader_object::Device::new(instance, &device));

        AshDevice {
            device,
            shader_object,
            memory_properties,
            limits,
            descriptor_pools: Mutex::new(DescriptorPools::default()),
        }
    }

    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn memory_type_index(&self, type_bits: u32) -> Option<u32> {
        let required =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let count = self.memory_properties.memory_type_count as usize;

        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|&(index, memory_type)| {
                type_bits & (1 << index) != 0 && memory_type.property_flags.contains(required)
            })
            .map(|(index, _)| index as u32)
    }

    fn create_descriptor_pool(&self) -> Result<vk::DescriptorPool, VulkanError> {
        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(SETS_PER_POOL * crate::record::binding::COUNT)];
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&pool_sizes);

        // SAFETY: The create info is valid.
        unsafe { self.device.create_descriptor_pool(&create_info, None) }.map_err(Into::into)
    }

    fn create_pipeline(
        &self,
        create_info: &ValidationProgramCreateInfo<'_>,
    ) -> Result<vk::Pipeline, VulkanError> {
        let module_info = vk::ShaderModuleCreateInfo::default().code(create_info.code);
        // SAFETY: The code was produced by the SPIR-V backend of naga.
        let module = unsafe { self.device.create_shader_module(&module_info, None) }?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(create_info.stage)
            .module(module)
            .name(create_info.entry_point);

        let result = match create_info.target {
            ProgramTarget::GraphicsPipeline(rendering) => {
                self.create_graphics_pipeline(stage, create_info.pipeline_layout, rendering)
            }
            _ => {
                let pipeline_info = vk::ComputePipelineCreateInfo::default()
                    .stage(stage)
                    .layout(create_info.pipeline_layout);

                // SAFETY: The create info is valid.
                unsafe {
                    self.device.create_compute_pipelines(
                        vk::PipelineCache::null(),
                        &[pipeline_info],
                        None,
                    )
                }
                .map_err(|(_, err)| VulkanError::from(err))
                .map(|pipelines| pipelines[0])
            }
        };

        // SAFETY: The module is no longer needed once the pipeline is created.
        unsafe { self.device.destroy_shader_module(module, None) };

        result
    }

    fn create_graphics_pipeline(
        &self,
        stage: vk::PipelineShaderStageCreateInfo<'_>,
        layout: vk::PipelineLayout,
        rendering: &RenderingInfo,
    ) -> Result<vk::Pipeline, VulkanError> {
        let stages = [stage];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::POINT_LIST);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .rasterizer_discard_enable(true)
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .line_width(1.0);

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .rasterization_state(&rasterization)
            .layout(layout);

        let color_formats: SmallVec<[vk::Format; 4]>;
        let mut rendering_info;

        match rendering {
            &RenderingInfo::RenderPass {
                render_pass,
                subpass,
            } => {
                pipeline_info = pipeline_info.render_pass(render_pass).subpass(subpass);
            }
            RenderingInfo::Dynamic {
                view_mask,
                color_formats: formats,
                depth_format,
                stencil_format,
            } => {
                color_formats = formats.clone();
                rendering_info = vk::PipelineRenderingCreateInfo::default()
                    .view_mask(*view_mask)
                    .color_attachment_formats(&color_formats)
                    .depth_attachment_format(*depth_format)
                    .stencil_attachment_format(*stencil_format);
                pipeline_info = pipeline_info.push_next(&mut rendering_info);
            }
        }

        // SAFETY: The create info is valid; with rasterizer discard enabled, no fragment,
        // viewport, multisample or blend state is needed.
        unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, err)| VulkanError::from(err))
        .map(|pipelines| pipelines[0])
    }

    fn create_shader_object(
        &self,
        create_info: &ValidationProgramCreateInfo<'_>,
    ) -> Result<vk::ShaderEXT, VulkanError> {
        let shader_object = self
            .shader_object
            .as_ref()
            .ok_or(VulkanError::FeatureNotPresent)?;
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(create_info.stage)
            .offset(0)
            .size(create_info.push_constant_size)];
        let shader_info = vk::ShaderCreateInfoEXT::default()
            .stage(create_info.stage)
            .code_type(vk::ShaderCodeTypeEXT::SPIRV)
            .code(bytemuck::cast_slice(create_info.code))
            .name(create_info.entry_point)
            .set_layouts(create_info.set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let mut shader = vk::ShaderEXT::null();

        // SAFETY: The create info is valid and `shader` has room for one handle.
        unsafe {
            (shader_object.fp().create_shaders_ext)(
                self.device.handle(),
                1,
                &shader_info,
                std::ptr::null(),
                &mut shader,
            )
        }
        .result()?;

        Ok(shader)
    }
}

impl fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AshDevice")
            .field("handle", &self.device.handle())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        for pool in self.descriptor_pools.get_mut().pools.drain(..) {
            // SAFETY: Sets allocated from the pool are owned by command resources, which hold a
            // reference to the device and have been dropped by now.
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
    }
}

unsafe impl GpuavDevice for AshDevice {
    #[inline]
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(
        &self,
        size: DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<DeviceBuffer, VulkanError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: The create info is valid.
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        // SAFETY: `buffer` was just created.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocate = || -> Result<(vk::DeviceMemory, NonNull<u8>), VulkanError> {
            let memory_type_index = self
                .memory_type_index(requirements.memory_type_bits)
                .ok_or(VulkanError::OutOfDeviceMemory)?;
            let allocate_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type_index);

            // SAFETY: The allocate info is valid.
            let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }?;

            let bind_and_map = || -> Result<NonNull<u8>, VulkanError> {
                // SAFETY: The memory was allocated for the buffer's requirements.
                unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }?;
                // SAFETY: The memory is host visible and not mapped yet.
                let ptr = unsafe {
                    self.device
                        .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                }?;

                NonNull::new(ptr.cast::<u8>()).ok_or(VulkanError::MemoryMapFailed)
            };

            match bind_and_map() {
                Ok(ptr) => Ok((memory, ptr)),
                Err(err) => {
                    // SAFETY: Nothing uses the memory.
                    unsafe { self.device.free_memory(memory, None) };
                    Err(err)
                }
            }
        };

        match allocate() {
            Ok((memory, ptr)) => {
                // SAFETY: The whole allocation is mapped, host coherent, and the mapping is
                // aligned to `minMemoryMapAlignment`, which is at least 64 bytes.
                let buffer = unsafe { DeviceBuffer::from_raw_parts(buffer, memory, size, ptr) };
                buffer.fill_zero();

                Ok(buffer)
            }
            Err(err) => {
                // SAFETY: Nothing uses the buffer.
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(err)
            }
        }
    }

    unsafe fn destroy_buffer(&self, buffer: DeviceBuffer) {
        // SAFETY: The caller must ensure that no pending submission accesses the buffer.
        unsafe { self.device.destroy_buffer(buffer.handle(), None) };
        // SAFETY: Freeing the memory also unmaps it.
        unsafe { self.device.free_memory(buffer.memory(), None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[StorageBinding],
    ) -> Result<vk::DescriptorSetLayout, VulkanError> {
        let bindings: SmallVec<[_; 4]> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(binding.stages)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        // SAFETY: The create info is valid.
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }.map_err(Into::into)
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: Enforced by the caller.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
        push_constant_stages: vk::ShaderStageFlags,
    ) -> Result<vk::PipelineLayout, VulkanError> {
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(push_constant_stages)
            .offset(0)
            .size(push_constant_size)];
        let mut create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);

        if push_constant_size != 0 {
            create_info = create_info.push_constant_ranges(&push_constant_ranges);
        }

        // SAFETY: The create info is valid.
        unsafe { self.device.create_pipeline_layout(&create_info, None) }.map_err(Into::into)
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: Enforced by the caller.
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_validation_program(
        &self,
        create_info: &ValidationProgramCreateInfo<'_>,
    ) -> Result<ValidationProgram, VulkanError> {
        match create_info.target {
            ProgramTarget::ShaderObject => self
                .create_shader_object(create_info)
                .map(ValidationProgram::ShaderObject),
            _ => self
                .create_pipeline(create_info)
                .map(ValidationProgram::Pipeline),
        }
    }

    unsafe fn destroy_validation_program(&self, program: ValidationProgram) {
        match program {
            // SAFETY: Enforced by the caller.
            ValidationProgram::Pipeline(pipeline) => unsafe {
                self.device.destroy_pipeline(pipeline, None)
            },
            ValidationProgram::ShaderObject(shader) => {
                if let Some(shader_object) = &self.shader_object {
                    // SAFETY: Enforced by the caller.
                    unsafe { shader_object.destroy_shader(shader, None) };
                }
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError> {
        let mut pools = self.descriptor_pools.lock();
        let layouts = [layout];

        for attempt in 0..2 {
            let pool = match pools.pools.last() {
                Some(&pool) if attempt == 0 => pool,
                _ => {
                    let pool = self.create_descriptor_pool()?;
                    pools.pools.push(pool);
                    pool
                }
            };

            let allocate_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);

            // SAFETY: The allocate info is valid and the pool is externally synchronized by the
            // mutex.
            match unsafe { self.device.allocate_descriptor_sets(&allocate_info) } {
                Ok(sets) => {
                    pools.owners.insert(sets[0], pool);
                    return Ok(sets[0]);
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)
                    if attempt == 0 => {}
                Err(err) => return Err(err.into()),
            }
        }

        Err(VulkanError::OutOfPoolMemory)
    }

    unsafe fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        let mut pools = self.descriptor_pools.lock();

        if let Some(pool) = pools.owners.remove(&set) {
            // SAFETY: The pool was created with `FREE_DESCRIPTOR_SET` and the caller must ensure
            // that no pending submission uses the set.
            let _ = unsafe { self.device.free_descriptor_sets(pool, &[set]) };
        }
    }

    unsafe fn write_storage_buffers(&self, set: vk::DescriptorSet, writes: &[StorageBufferWrite]) {
        let buffer_infos: SmallVec<[_; 4]> = writes
            .iter()
            .map(|write| {
                [vk::DescriptorBufferInfo::default()
                    .buffer(write.buffer)
                    .offset(write.offset)
                    .range(write.range)]
            })
            .collect();
        let descriptor_writes: SmallVec<[_; 4]> = writes
            .iter()
            .zip(&buffer_infos)
            .map(|(write, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(info)
            })
            .collect();

        // SAFETY: Enforced by the caller.
        unsafe { self.device.update_descriptor_sets(&descriptor_writes, &[]) };
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        // SAFETY: Enforced by the caller.
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            )
        };
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: Enforced by the caller.
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        };
    }

    unsafe fn cmd_bind_shaders(
        &self,
        command_buffer: vk::CommandBuffer,
        stages: &[vk::ShaderStageFlags],
        shaders: &[vk::ShaderEXT],
    ) {
        if let Some(shader_object) = &self.shader_object {
            // SAFETY: Enforced by the caller.
            unsafe { shader_object.cmd_bind_shaders(command_buffer, stages, shaders) };
        }
    }

    unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        // SAFETY: Enforced by the caller.
        unsafe {
            self.device
                .cmd_push_constants(command_buffer, layout, stages, offset, data)
        };
    }

    unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, group_counts: [u32; 3]) {
        let [x, y, z] = group_counts;

        // SAFETY: Enforced by the caller.
        unsafe { self.device.cmd_dispatch(command_buffer, x, y, z) };
    }

    unsafe fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32) {
        // SAFETY: Enforced by the caller.
        unsafe { self.device.cmd_draw(command_buffer, vertex_count, 1, 0, 0) };
    }

    unsafe fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barrier: &MemoryBarrier) {
        let memory_barriers = [vk::MemoryBarrier::default()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)];

        // SAFETY: Enforced by the caller.
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                barrier.src_stages,
                barrier.dst_stages,
                vk::DependencyFlags::empty(),
                &memory_barriers,
                &[],
                &[],
            )
        };
    }
}
