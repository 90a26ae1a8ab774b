//! Helpers shared by the unit tests of the crate.

use crate::{
    decode::{Diagnostic, DiagnosticSink},
    device::{
        DeviceBuffer, DeviceLimits, GpuavDevice, MemoryBarrier, StorageBinding,
        StorageBufferWrite, ValidationProgram, ValidationProgramCreateInfo, ProgramTarget,
    },
    instrument::module::{encode_string, MAGIC},
    vk, DeviceSize, Location, VulkanError,
};
use ash::vk::Handle;
use foldhash::HashMap;
use parking_lot::Mutex;
use spirv::{
    AddressingModel, BuiltIn, Capability, Decoration, Dim, ExecutionMode, ExecutionModel,
    FunctionControl, ImageFormat, MemoryAccess, MemoryModel, Op, StorageClass,
};
use std::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

/// Builds small SPIR-V modules by hand.
///
/// Instructions are sorted into the logical layout sections as they are added, so fixtures can
/// declare things in whichever order reads best. Everything from the first `OpFunction` on goes
/// to the function section.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    bound: u32,
    sections: [Vec<u32>; 10],
    in_function: bool,
}

/// Ids every compute fixture declares in [`Assembler::compute_prologue`].
struct Compute {
    main: u32,
    gid: u32,
    void: u32,
    void_fn: u32,
    uint: u32,
    uvec3: u32,
}

const VERSION_1_0: u32 = 0x0001_0000;

impl Assembler {
    fn id(&mut self) -> u32 {
        self.bound += 1;

        self.bound
    }

    fn inst(&mut self, op: Op, operands: &[u32]) {
        if op == Op::Function {
            self.in_function = true;
        }

        let section = match op {
            _ if self.in_function => 9,
            Op::Capability => 0,
            Op::Extension => 1,
            Op::ExtInstImport => 2,
            Op::MemoryModel => 3,
            Op::EntryPoint => 4,
            Op::ExecutionMode => 5,
            Op::String | Op::Name | Op::MemberName => 6,
            Op::Decorate | Op::MemberDecorate => 7,
            _ => 8,
        };
        let words = &mut self.sections[section];
        words.push(((operands.len() as u32 + 1) << 16) | op as u32);
        words.extend_from_slice(operands);
    }

    fn finish(self) -> Vec<u32> {
        self.finish_version(VERSION_1_0)
    }

    fn finish_version(self, version: u32) -> Vec<u32> {
        let mut words = vec![MAGIC, version, 0, self.bound + 1, 0];
        words.extend(self.sections.into_iter().flatten());

        words
    }

    fn string(&mut self, id: u32, string: &str) {
        let mut operands = vec![id];
        operands.extend(encode_string(string));
        self.inst(Op::String, &operands);
    }

    fn name(&mut self, target: u32, name: &str) {
        let mut operands = vec![target];
        operands.extend(encode_string(name));
        self.inst(Op::Name, &operands);
    }

    fn binding(&mut self, variable: u32, set: u32, binding: u32) {
        self.inst(Op::Decorate, &[variable, Decoration::DescriptorSet as u32, set]);
        self.inst(Op::Decorate, &[variable, Decoration::Binding as u32, binding]);
    }

    /// Declares the capabilities and memory model, plus `main` with a `LocalSize` of 64 and the
    /// `GlobalInvocationId` input it reads.
    fn compute_prologue(
        &mut self,
        capabilities: &[Capability],
        addressing_model: AddressingModel,
    ) -> Compute {
        let c = Compute {
            main: self.id(),
            gid: self.id(),
            void: self.id(),
            void_fn: self.id(),
            uint: self.id(),
            uvec3: self.id(),
        };
        let ptr_input_uvec3 = self.id();

        for &capability in capabilities {
            self.inst(Op::Capability, &[capability as u32]);
        }
        self.inst(
            Op::MemoryModel,
            &[addressing_model as u32, MemoryModel::GLSL450 as u32],
        );
        self.inst(
            Op::ExecutionMode,
            &[c.main, ExecutionMode::LocalSize as u32, 64, 1, 1],
        );
        self.name(c.main, "main");
        self.inst(
            Op::Decorate,
            &[
                c.gid,
                Decoration::BuiltIn as u32,
                BuiltIn::GlobalInvocationId as u32,
            ],
        );
        self.inst(Op::TypeVoid, &[c.void]);
        self.inst(Op::TypeFunction, &[c.void_fn, c.void]);
        self.inst(Op::TypeInt, &[c.uint, 32, 0]);
        self.inst(Op::TypeVector, &[c.uvec3, c.uint, 3]);
        self.inst(
            Op::TypePointer,
            &[ptr_input_uvec3, StorageClass::Input as u32, c.uvec3],
        );
        self.inst(
            Op::Variable,
            &[ptr_input_uvec3, c.gid, StorageClass::Input as u32],
        );

        c
    }

    fn entry_point(&mut self, c: &Compute, interface: &[u32]) {
        let mut operands = vec![ExecutionModel::GLCompute as u32, c.main];
        operands.extend(encode_string("main"));
        operands.push(c.gid);
        operands.extend_from_slice(interface);
        self.inst(Op::EntryPoint, &operands);
    }

    fn begin_main(&mut self, c: &Compute) {
        let label = self.id();
        self.inst(
            Op::Function,
            &[c.void, c.main, FunctionControl::NONE.bits(), c.void_fn],
        );
        self.inst(Op::Label, &[label]);
    }

    /// Loads `gl_GlobalInvocationID.x`.
    fn invocation_x(&mut self, c: &Compute) -> u32 {
        let gid = self.id();
        let x = self.id();
        self.inst(Op::Load, &[c.uvec3, gid, c.gid]);
        self.inst(Op::CompositeExtract, &[c.uint, x, gid, 0]);

        x
    }

    fn end_main(&mut self) {
        self.inst(Op::Return, &[]);
        self.inst(Op::FunctionEnd, &[]);
    }

    /// A compute shader with a `LocalSize` of 64 whose only function stores 0 to element `index`
    /// of the runtime array `data`, a buffer block at set 0, binding 0. The store is at line 7,
    /// column 5 of `store.comp`.
    pub(crate) fn compute_store_shader(index: u32) -> Vec<u32> {
        let mut asm = Assembler::default();

        let main = asm.id();
        let gid = asm.id();
        let file = asm.id();
        let data = asm.id();
        let void = asm.id();
        let void_fn = asm.id();
        let uint = asm.id();
        let uvec3 = asm.id();
        let ptr_input_uvec3 = asm.id();
        let runtime_array = asm.id();
        let block = asm.id();
        let ptr_uniform_block = asm.id();
        let ptr_uniform_uint = asm.id();
        let zero = asm.id();
        let constant_index = asm.id();
        let label = asm.id();
        let element = asm.id();

        asm.inst(Op::Capability, &[Capability::Shader as u32]);
        asm.inst(
            Op::MemoryModel,
            &[AddressingModel::Logical as u32, MemoryModel::GLSL450 as u32],
        );

        let mut entry_point = vec![ExecutionModel::GLCompute as u32, main];
        entry_point.extend(encode_string("main"));
        entry_point.push(gid);
        asm.inst(Op::EntryPoint, &entry_point);
        asm.inst(
            Op::ExecutionMode,
            &[main, ExecutionMode::LocalSize as u32, 64, 1, 1],
        );

        let mut string = vec![file];
        string.extend(encode_string("store.comp"));
        asm.inst(Op::String, &string);

        for (target, name) in [(main, "main"), (data, "data")] {
            let mut operands = vec![target];
            operands.extend(encode_string(name));
            asm.inst(Op::Name, &operands);
        }

        asm.inst(
            Op::Decorate,
            &[
                gid,
                Decoration::BuiltIn as u32,
                BuiltIn::GlobalInvocationId as u32,
            ],
        );
        asm.inst(
            Op::Decorate,
            &[runtime_array, Decoration::ArrayStride as u32, 4],
        );
        asm.inst(
            Op::MemberDecorate,
            &[block, 0, Decoration::Offset as u32, 0],
        );
        asm.inst(Op::Decorate, &[block, Decoration::BufferBlock as u32]);
        asm.inst(Op::Decorate, &[data, Decoration::DescriptorSet as u32, 0]);
        asm.inst(Op::Decorate, &[data, Decoration::Binding as u32, 0]);

        asm.inst(Op::TypeVoid, &[void]);
        asm.inst(Op::TypeFunction, &[void_fn, void]);
        asm.inst(Op::TypeInt, &[uint, 32, 0]);
        asm.inst(Op::TypeVector, &[uvec3, uint, 3]);
        asm.inst(
            Op::TypePointer,
            &[ptr_input_uvec3, StorageClass::Input as u32, uvec3],
        );
        asm.inst(
            Op::Variable,
            &[ptr_input_uvec3, gid, StorageClass::Input as u32],
        );
        asm.inst(Op::TypeRuntimeArray, &[runtime_array, uint]);
        asm.inst(Op::TypeStruct, &[block, runtime_array]);
        asm.inst(
            Op::TypePointer,
            &[ptr_uniform_block, StorageClass::Uniform as u32, block],
        );
        asm.inst(
            Op::Variable,
            &[ptr_uniform_block, data, StorageClass::Uniform as u32],
        );
        asm.inst(
            Op::TypePointer,
            &[ptr_uniform_uint, StorageClass::Uniform as u32, uint],
        );
        asm.inst(Op::Constant, &[uint, zero, 0]);
        asm.inst(Op::Constant, &[uint, constant_index, index]);

        asm.inst(
            Op::Function,
            &[void, main, FunctionControl::NONE.bits(), void_fn],
        );
        asm.inst(Op::Label, &[label]);
        asm.inst(Op::Line, &[file, 7, 5]);
        asm.inst(
            Op::AccessChain,
            &[ptr_uniform_uint, element, data, zero, constant_index],
        );
        asm.inst(Op::Store, &[element, zero]);
        asm.inst(Op::Return, &[]);
        asm.inst(Op::FunctionEnd, &[]);

        asm.finish()
    }

    /// Like [`compute_store_shader`], but stores 0 to element `gl_GlobalInvocationID.x` of
    /// `data` at line 7, then loads element 25 at line 8, both in `indexed.comp`.
    ///
    /// [`compute_store_shader`]: Self::compute_store_shader
    pub(crate) fn compute_indexed_store_shader() -> Vec<u32> {
        let mut asm = Assembler::default();
        let c = asm.compute_prologue(&[Capability::Shader], AddressingModel::Logical);

        let file = asm.id();
        let data = asm.id();
        let runtime_array = asm.id();
        let block = asm.id();
        let ptr_uniform_block = asm.id();
        let ptr_uniform_uint = asm.id();
        let zero = asm.id();
        let twenty_five = asm.id();

        asm.string(file, "indexed.comp");
        asm.name(data, "data");
        asm.inst(
            Op::Decorate,
            &[runtime_array, Decoration::ArrayStride as u32, 4],
        );
        asm.inst(
            Op::MemberDecorate,
            &[block, 0, Decoration::Offset as u32, 0],
        );
        asm.inst(Op::Decorate, &[block, Decoration::BufferBlock as u32]);
        asm.binding(data, 0, 0);
        asm.inst(Op::TypeRuntimeArray, &[runtime_array, c.uint]);
        asm.inst(Op::TypeStruct, &[block, runtime_array]);
        asm.inst(
            Op::TypePointer,
            &[ptr_uniform_block, StorageClass::Uniform as u32, block],
        );
        asm.inst(
            Op::Variable,
            &[ptr_uniform_block, data, StorageClass::Uniform as u32],
        );
        asm.inst(
            Op::TypePointer,
            &[ptr_uniform_uint, StorageClass::Uniform as u32, c.uint],
        );
        asm.inst(Op::Constant, &[c.uint, zero, 0]);
        asm.inst(Op::Constant, &[c.uint, twenty_five, 25]);
        asm.entry_point(&c, &[]);

        asm.begin_main(&c);
        let x = asm.invocation_x(&c);
        let element = asm.id();
        asm.inst(Op::Line, &[file, 7, 5]);
        asm.inst(
            Op::AccessChain,
            &[ptr_uniform_uint, element, data, zero, x],
        );
        asm.inst(Op::Store, &[element, zero]);
        let fixed = asm.id();
        let value = asm.id();
        asm.inst(Op::Line, &[file, 8, 5]);
        asm.inst(
            Op::AccessChain,
            &[ptr_uniform_uint, fixed, data, zero, twenty_five],
        );
        asm.inst(Op::Load, &[c.uint, value, fixed]);
        asm.end_main();

        asm.finish()
    }

    /// Fetches texel `gl_GlobalInvocationID.x` of the uniform texel buffer `samples` (binding 0),
    /// reads the same texel of the storage texel buffer `pixels` (binding 1) and writes it to
    /// texel 3 of `pixels`, then loads the sampler `nearest` (binding 2). All bindings are in
    /// set 0.
    pub(crate) fn texel_buffer_shader() -> Vec<u32> {
        let mut asm = Assembler::default();
        let c = asm.compute_prologue(
            &[
                Capability::Shader,
                Capability::SampledBuffer,
                Capability::ImageBuffer,
            ],
            AddressingModel::Logical,
        );

        let uvec4 = asm.id();
        let sampled_buffer = asm.id();
        let storage_buffer = asm.id();
        let sampler = asm.id();
        let ptr_sampled_buffer = asm.id();
        let ptr_storage_buffer = asm.id();
        let ptr_sampler = asm.id();
        let samples = asm.id();
        let pixels = asm.id();
        let nearest = asm.id();
        let three = asm.id();

        for (variable, name, binding) in [
            (samples, "samples", 0),
            (pixels, "pixels", 1),
            (nearest, "nearest", 2),
        ] {
            asm.name(variable, name);
            asm.binding(variable, 0, binding);
        }
        asm.inst(Op::TypeVector, &[uvec4, c.uint, 4]);
        asm.inst(
            Op::TypeImage,
            &[
                sampled_buffer,
                c.uint,
                Dim::DimBuffer as u32,
                0,
                0,
                0,
                1,
                ImageFormat::Unknown as u32,
            ],
        );
        asm.inst(
            Op::TypeImage,
            &[
                storage_buffer,
                c.uint,
                Dim::DimBuffer as u32,
                0,
                0,
                0,
                2,
                ImageFormat::R32ui as u32,
            ],
        );
        asm.inst(Op::TypeSampler, &[sampler]);
        for (pointer, variable, ty) in [
            (ptr_sampled_buffer, samples, sampled_buffer),
            (ptr_storage_buffer, pixels, storage_buffer),
            (ptr_sampler, nearest, sampler),
        ] {
            asm.inst(
                Op::TypePointer,
                &[pointer, StorageClass::UniformConstant as u32, ty],
            );
            asm.inst(
                Op::Variable,
                &[pointer, variable, StorageClass::UniformConstant as u32],
            );
        }
        asm.inst(Op::Constant, &[c.uint, three, 3]);
        asm.entry_point(&c, &[]);

        asm.begin_main(&c);
        let x = asm.invocation_x(&c);
        let [sampled_image, fetched, storage_image, read, loaded_sampler] =
            [(); 5].map(|()| asm.id());
        asm.inst(Op::Load, &[sampled_buffer, sampled_image, samples]);
        asm.inst(Op::ImageFetch, &[uvec4, fetched, sampled_image, x]);
        asm.inst(Op::Load, &[storage_buffer, storage_image, pixels]);
        asm.inst(Op::ImageRead, &[uvec4, read, storage_image, x]);
        asm.inst(Op::ImageWrite, &[storage_image, three, read]);
        asm.inst(Op::Load, &[sampler, loaded_sampler, nearest]);
        asm.end_main();

        asm.finish()
    }

    /// A SPIR-V 1.5 shader that loads a `uint` through a `PhysicalStorageBuffer` pointer made
    /// from the address 0x1000 and stores it back.
    pub(crate) fn buffer_address_shader() -> Vec<u32> {
        let mut asm = Assembler::default();
        let c = asm.compute_prologue(
            &[
                Capability::Shader,
                Capability::Int64,
                Capability::PhysicalStorageBufferAddresses,
            ],
            AddressingModel::PhysicalStorageBuffer64,
        );

        let ulong = asm.id();
        let ptr_address_uint = asm.id();
        let address = asm.id();

        asm.inst(Op::TypeInt, &[ulong, 64, 0]);
        asm.inst(
            Op::TypePointer,
            &[
                ptr_address_uint,
                StorageClass::PhysicalStorageBuffer as u32,
                c.uint,
            ],
        );
        asm.inst(Op::Constant, &[ulong, address, 0x1000, 0]);
        asm.entry_point(&c, &[]);

        asm.begin_main(&c);
        let pointer = asm.id();
        let value = asm.id();
        let aligned = MemoryAccess::ALIGNED.bits();
        asm.inst(Op::ConvertUToPtr, &[ptr_address_uint, pointer, address]);
        asm.inst(Op::Load, &[c.uint, value, pointer, aligned, 4]);
        asm.inst(Op::Store, &[pointer, value, aligned, 4]);
        asm.end_main();

        asm.finish_version(0x0001_0500)
    }

    /// A SPIR-V 1.4 shader that initializes a ray query against the acceleration structure
    /// `scene` at set 0, binding 0, with a ray from the origin along +z with a `t_min` of 0 and
    /// a `t_max` of 1000.
    pub(crate) fn ray_query_shader() -> Vec<u32> {
        let mut asm = Assembler::default();
        let c = asm.compute_prologue(
            &[Capability::Shader, Capability::RayQueryKHR],
            AddressingModel::Logical,
        );

        let [float, vec3, acceleration_structure, ptr_acceleration_structure, scene] =
            [(); 5].map(|()| asm.id());
        let [ray_query, ptr_function_ray_query, flags, cull_mask] = [(); 4].map(|()| asm.id());
        let [zero, one, t_max, origin, direction] = [(); 5].map(|()| asm.id());

        asm.inst(Op::Extension, &encode_string("SPV_KHR_ray_query"));
        asm.name(scene, "scene");
        asm.binding(scene, 0, 0);
        asm.inst(Op::TypeFloat, &[float, 32]);
        asm.inst(Op::TypeVector, &[vec3, float, 3]);
        asm.inst(Op::TypeAccelerationStructureKHR, &[acceleration_structure]);
        asm.inst(
            Op::TypePointer,
            &[
                ptr_acceleration_structure,
                StorageClass::UniformConstant as u32,
                acceleration_structure,
            ],
        );
        asm.inst(
            Op::Variable,
            &[
                ptr_acceleration_structure,
                scene,
                StorageClass::UniformConstant as u32,
            ],
        );
        asm.inst(Op::TypeRayQueryKHR, &[ray_query]);
        asm.inst(
            Op::TypePointer,
            &[
                ptr_function_ray_query,
                StorageClass::Function as u32,
                ray_query,
            ],
        );
        asm.inst(Op::Constant, &[c.uint, flags, 0]);
        asm.inst(Op::Constant, &[c.uint, cull_mask, 0xFF]);
        asm.inst(Op::Constant, &[float, zero, 0.0f32.to_bits()]);
        asm.inst(Op::Constant, &[float, one, 1.0f32.to_bits()]);
        asm.inst(Op::Constant, &[float, t_max, 1000.0f32.to_bits()]);
        asm.inst(Op::ConstantComposite, &[vec3, origin, zero, zero, zero]);
        asm.inst(Op::ConstantComposite, &[vec3, direction, zero, zero, one]);
        asm.entry_point(&c, &[scene]);

        asm.begin_main(&c);
        let query = asm.id();
        let loaded = asm.id();
        asm.inst(
            Op::Variable,
            &[ptr_function_ray_query, query, StorageClass::Function as u32],
        );
        asm.inst(Op::Load, &[acceleration_structure, loaded, scene]);
        asm.inst(
            Op::RayQueryInitializeKHR,
            &[query, loaded, flags, cull_mask, origin, zero, direction, t_max],
        );
        asm.end_main();

        asm.finish_version(0x0001_0400)
    }
}

/// Host memory standing in for a mapped allocation.
struct MockAllocation(NonNull<[u32]>);

// SAFETY: The allocation is only accessed through the `DeviceBuffer` it backs.
unsafe impl Send for MockAllocation {}
// SAFETY: See above.
unsafe impl Sync for MockAllocation {}

impl MockAllocation {
    fn new(words: usize) -> Self {
        let boxed = vec![0u32; words.max(1)].into_boxed_slice();

        MockAllocation(NonNull::from(Box::leak(boxed)))
    }

    fn as_ptr(&self) -> NonNull<u8> {
        self.0.cast()
    }
}

impl Drop for MockAllocation {
    fn drop(&mut self) {
        // SAFETY: The pointer comes from `Box::leak`, and the buffer using it was destroyed.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

/// A command the validator recorded into a command buffer of a [`MockDevice`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MockCommand {
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindShaders(Vec<vk::ShaderEXT>),
    PushConstants {
        layout: vk::PipelineLayout,
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch([u32; 3]),
    Draw(u32),
    Barrier(MemoryBarrier),
}

/// A device whose buffers live in host memory and whose command buffers only remember what was
/// recorded into them.
pub(crate) struct MockDevice {
    limits: DeviceLimits,
    next_handle: AtomicU64,
    allocations: Mutex<HashMap<u64, MockAllocation>>,
    storage_writes: Mutex<HashMap<vk::DescriptorSet, Vec<StorageBufferWrite>>>,
    commands: Mutex<Vec<MockCommand>>,
    buffers_created: AtomicU32,
    programs_created: AtomicU32,
    fail_allocations: AtomicBool,
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        MockDevice::with_limits(DeviceLimits::default())
    }

    pub(crate) fn with_limits(limits: DeviceLimits) -> Self {
        MockDevice {
            limits,
            next_handle: AtomicU64::new(0x1000),
            allocations: Mutex::default(),
            storage_writes: Mutex::default(),
            commands: Mutex::default(),
            buffers_created: AtomicU32::new(0),
            programs_created: AtomicU32::new(0),
            fail_allocations: AtomicBool::new(false),
        }
    }

    fn handle<T: Handle>(&self) -> T {
        T::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Makes every later buffer creation fail with `OutOfDeviceMemory`.
    pub(crate) fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Relaxed);
    }

    pub(crate) fn buffers_created(&self) -> u32 {
        self.buffers_created.load(Ordering::Relaxed)
    }

    pub(crate) fn programs_created(&self) -> u32 {
        self.programs_created.load(Ordering::Relaxed)
    }

    /// Returns every command recorded so far, in order.
    pub(crate) fn commands(&self) -> Vec<MockCommand> {
        self.commands.lock().clone()
    }

    /// Returns the buffers bound to `set`, ordered by binding.
    pub(crate) fn storage_writes(&self, set: vk::DescriptorSet) -> Vec<StorageBufferWrite> {
        let mut writes = self
            .storage_writes
            .lock()
            .get(&set)
            .cloned()
            .unwrap_or_default();
        writes.sort_by_key(|write| write.binding);

        writes
    }

    fn push(&self, command: MockCommand) {
        self.commands.lock().push(command);
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("buffers", &self.allocations.lock().len())
            .finish_non_exhaustive()
    }
}

unsafe impl GpuavDevice for MockDevice {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_buffer(
        &self,
        size: DeviceSize,
        _usage: vk::BufferUsageFlags,
    ) -> Result<DeviceBuffer, VulkanError> {
        if self.fail_allocations.load(Ordering::Relaxed) {
            return Err(VulkanError::OutOfDeviceMemory);
        }

        let handle: vk::Buffer = self.handle();
        let allocation = MockAllocation::new(size.div_ceil(4) as usize);
        let mapped = allocation.as_ptr();
        self.allocations.lock().insert(handle.as_raw(), allocation);
        self.buffers_created.fetch_add(1, Ordering::Relaxed);

        // SAFETY: The allocation is at least `size` bytes, aligned to 4 bytes, and lives until
        // the buffer is destroyed.
        Ok(unsafe { DeviceBuffer::from_raw_parts(handle, self.handle(), size, mapped) })
    }

    unsafe fn destroy_buffer(&self, buffer: DeviceBuffer) {
        let allocation = self.allocations.lock().remove(&buffer.handle().as_raw());
        drop(buffer);
        drop(allocation);
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[StorageBinding],
    ) -> Result<vk::DescriptorSetLayout, VulkanError> {
        Ok(self.handle())
    }

    unsafe fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {}

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_size: u32,
        _push_constant_stages: vk::ShaderStageFlags,
    ) -> Result<vk::PipelineLayout, VulkanError> {
        Ok(self.handle())
    }

    unsafe fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {}

    fn create_validation_program(
        &self,
        create_info: &ValidationProgramCreateInfo<'_>,
    ) -> Result<ValidationProgram, VulkanError> {
        if create_info.code.first() != Some(&MAGIC) {
            return Err(VulkanError::InvalidShader);
        }

        self.programs_created.fetch_add(1, Ordering::Relaxed);

        Ok(match create_info.target {
            ProgramTarget::ShaderObject => ValidationProgram::ShaderObject(self.handle()),
            ProgramTarget::ComputePipeline | ProgramTarget::GraphicsPipeline(_) => {
                ValidationProgram::Pipeline(self.handle())
            }
        })
    }

    unsafe fn destroy_validation_program(&self, _program: ValidationProgram) {}

    fn allocate_descriptor_set(
        &self,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError> {
        Ok(self.handle())
    }

    unsafe fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        self.storage_writes.lock().remove(&set);
    }

    unsafe fn write_storage_buffers(&self, set: vk::DescriptorSet, writes: &[StorageBufferWrite]) {
        let mut sets = self.storage_writes.lock();
        let bound = sets.entry(set).or_default();

        for write in writes {
            bound.retain(|existing| existing.binding != write.binding);
            bound.push(*write);
        }
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        _command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.push(MockCommand::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        _command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.push(MockCommand::BindPipeline {
            bind_point,
            pipeline,
        });
    }

    unsafe fn cmd_bind_shaders(
        &self,
        _command_buffer: vk::CommandBuffer,
        _stages: &[vk::ShaderStageFlags],
        shaders: &[vk::ShaderEXT],
    ) {
        self.push(MockCommand::BindShaders(shaders.to_vec()));
    }

    unsafe fn cmd_push_constants(
        &self,
        _command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.push(MockCommand::PushConstants {
            layout,
            offset,
            data: data.to_vec(),
        });
    }

    unsafe fn cmd_dispatch(&self, _command_buffer: vk::CommandBuffer, group_counts: [u32; 3]) {
        self.push(MockCommand::Dispatch(group_counts));
    }

    unsafe fn cmd_draw(&self, _command_buffer: vk::CommandBuffer, vertex_count: u32) {
        self.push(MockCommand::Draw(vertex_count));
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        _command_buffer: vk::CommandBuffer,
        barrier: &MemoryBarrier,
    ) {
        self.push(MockCommand::Barrier(*barrier));
    }
}

/// A [`DiagnosticSink`] that keeps everything it receives.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
    warnings: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub(crate) fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    pub(crate) fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().push(diagnostic.clone());
    }

    fn warn(&self, location: Location, message: &str) {
        self.warnings.lock().push(format!("{}: {}", location, message));
    }
}
