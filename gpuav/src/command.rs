//! Per-command state: what the front end tells the validator about a command buffer, and the
//! resources the validator allocates for every validated operation recorded into it.

use crate::{
    descriptor_heap::DescriptorSetSnapshot,
    device::{DeviceBuffer, GpuavDevice, RenderingInfo},
    prepass::PrepassKind,
    record::{LOG_HEADER_WORDS, LOG_WRITTEN_COUNT, RECORD_WORDS},
    shader::ShaderRecord,
    vk, DeviceSize, ExhaustedResource, GpuavError, Location, NonExhaustive, VulkanError,
};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// The kind of a validated operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum OperationKind {
    Draw,
    DrawIndexed,
    DrawIndirect,
    DrawIndexedIndirect,
    DrawIndirectCount,
    DrawIndexedIndirectCount,
    DrawMeshTasks,
    DrawMeshTasksIndirect,
    DrawMeshTasksIndirectCount,
    Dispatch,
    DispatchBase,
    DispatchIndirect,
    TraceRays,
    TraceRaysIndirect,
    TraceRaysIndirect2,
    CopyBufferToImage,
}

/// What the validator does for one [`OperationKind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationInfo {
    /// Name of the API command.
    pub function: &'static str,

    /// The bind point whose pipeline executes the operation, if any.
    pub bind_point: Option<vk::PipelineBindPoint>,

    /// The pre-pass that checks the operation's parameters, if any.
    pub prepass: Option<PrepassKind>,

    /// Size of one indirect parameter struct in bytes.
    pub indirect_struct_size: u32,
}

macro_rules! operation_kinds {
    ($($kind:ident => $function:literal, $bind_point:ident, $prepass:expr, $size:expr;)+) => {
        impl OperationKind {
            /// Returns how the operation is validated.
            pub const fn info(self) -> OperationInfo {
                match self {
                    $(
                        OperationKind::$kind => OperationInfo {
                            function: $function,
                            bind_point: operation_kinds!(@bind_point $bind_point),
                            prepass: $prepass,
                            indirect_struct_size: $size,
                        },
                    )+
                }
            }
        }
    };
    (@bind_point None) => { None };
    (@bind_point $bind_point:ident) => { Some(vk::PipelineBindPoint::$bind_point) };
}

operation_kinds! {
    Draw => "vkCmdDraw", GRAPHICS, None, 0;
    DrawIndexed => "vkCmdDrawIndexed", GRAPHICS, None, 0;
    DrawIndirect => "vkCmdDrawIndirect", GRAPHICS, Some(PrepassKind::DrawIndirect), 16;
    DrawIndexedIndirect =>
        "vkCmdDrawIndexedIndirect", GRAPHICS, Some(PrepassKind::DrawIndexedIndirect), 20;
    DrawIndirectCount =>
        "vkCmdDrawIndirectCount", GRAPHICS, Some(PrepassKind::DrawIndirect), 16;
    DrawIndexedIndirectCount =>
        "vkCmdDrawIndexedIndirectCount", GRAPHICS, Some(PrepassKind::DrawIndexedIndirect), 20;
    DrawMeshTasks => "vkCmdDrawMeshTasksEXT", GRAPHICS, None, 0;
    DrawMeshTasksIndirect =>
        "vkCmdDrawMeshTasksIndirectEXT", GRAPHICS, Some(PrepassKind::DrawMeshTasksIndirect), 12;
    DrawMeshTasksIndirectCount =>
        "vkCmdDrawMeshTasksIndirectCountEXT",
        GRAPHICS,
        Some(PrepassKind::DrawMeshTasksIndirect),
        12;
    Dispatch => "vkCmdDispatch", COMPUTE, None, 0;
    DispatchBase => "vkCmdDispatchBase", COMPUTE, None, 0;
    DispatchIndirect =>
        "vkCmdDispatchIndirect", COMPUTE, Some(PrepassKind::DispatchIndirect), 12;
    TraceRays => "vkCmdTraceRaysKHR", RAY_TRACING_KHR, None, 0;
    TraceRaysIndirect =>
        "vkCmdTraceRaysIndirectKHR", RAY_TRACING_KHR, Some(PrepassKind::TraceRaysIndirect), 12;
    TraceRaysIndirect2 =>
        "vkCmdTraceRaysIndirect2KHR", RAY_TRACING_KHR, None, 0;
    CopyBufferToImage =>
        "vkCmdCopyBufferToImage", None, Some(PrepassKind::CopyBufferToImageDepth), 0;
}

/// The indirect parameters of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectParams {
    pub buffer: vk::Buffer,
    pub offset: DeviceSize,

    /// Size of `buffer`, used to find how many parameter structs fit in it.
    pub buffer_size: DeviceSize,

    /// Stride between parameter structs, for multi-draw operations.
    pub stride: u32,

    /// Number of draws, or the maximum number of draws for count variants.
    pub draw_count: u32,

    /// The buffer holding the draw count, for count variants.
    pub count_buffer: Option<(vk::Buffer, DeviceSize)>,
}

impl IndirectParams {
    /// Returns how many parameter structs of `struct_size` bytes fit in the buffer.
    pub fn capacity(&self, struct_size: u32) -> u32 {
        let struct_size = DeviceSize::from(struct_size);
        let stride = DeviceSize::from(self.stride).max(struct_size).max(1);

        match self.buffer_size.checked_sub(self.offset) {
            Some(available) if available >= struct_size => {
                u32::try_from((available - struct_size) / stride + 1).unwrap_or(u32::MAX)
            }
            _ => 0,
        }
    }
}

/// A buffer to image copy whose depth values are checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthCopyParams {
    pub buffer: vk::Buffer,
    pub offset: DeviceSize,
    pub texel_count: u32,
}

/// One operation being recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,

    /// Group counts of direct dispatches. Together with the `LocalSize` of the bound compute
    /// shader, these bound the number of invocations.
    pub group_counts: Option<[u32; 3]>,

    /// Bound on the number of invocations of direct draws and trace rays, when known.
    pub invocation_count: Option<u64>,

    pub indirect: Option<IndirectParams>,

    pub depth_copy: Option<DepthCopyParams>,

    pub _ne: NonExhaustive,
}

impl Operation {
    #[inline]
    pub fn new(kind: OperationKind) -> Self {
        Operation {
            kind,
            group_counts: None,
            invocation_count: None,
            indirect: None,
            depth_copy: None,
            _ne: NonExhaustive(()),
        }
    }

    /// Returns the host-known bound on the number of invocations, given the `LocalSize` of the
    /// bound compute shader.
    pub fn invocation_bound(&self, local_size: Option<[u32; 3]>) -> Option<u64> {
        if let (Some(groups), Some(size)) = (self.group_counts, local_size) {
            return Some(
                groups
                    .iter()
                    .chain(&size)
                    .fold(1u64, |acc, &n| acc.saturating_mul(u64::from(n))),
            );
        }

        self.invocation_count
    }
}

/// A shader of a bound pipeline.
#[derive(Clone, Debug)]
pub struct PipelineShader {
    pub record: Arc<ShaderRecord>,
    pub entry_point: String,
}

/// The pipeline, or shader objects, bound on a bind point.
#[derive(Clone, Debug, Default)]
pub struct BoundPipeline {
    /// The pipeline, or a null handle if shader objects are bound.
    pub handle: vk::Pipeline,

    /// The layout the pipeline was created with, or the layout of the last descriptor set
    /// binding for shader objects.
    pub layout: vk::PipelineLayout,

    /// Number of descriptor set layouts in `layout`.
    pub set_layout_count: u32,

    pub shader_objects: SmallVec<[(vk::ShaderStageFlags, vk::ShaderEXT); 2]>,

    pub shaders: SmallVec<[PipelineShader; 2]>,
}

impl BoundPipeline {
    /// Whether any shader of the pipeline has checks injected.
    pub fn is_instrumented(&self) -> bool {
        self.shaders
            .iter()
            .any(|shader| !shader.record.debug_symbols().is_empty())
    }

    /// Returns the `LocalSize` of the pipeline's compute shader.
    pub fn local_size(&self) -> Option<[u32; 3]> {
        self.shaders.iter().find_map(|shader| {
            shader
                .record
                .entry_point(&shader.entry_point)
                .and_then(|entry_point| entry_point.local_size)
        })
    }
}

/// A descriptor set bound by the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundDescriptorSet {
    pub set: vk::DescriptorSet,
    pub layout: vk::PipelineLayout,
    pub dynamic_offsets: SmallVec<[u32; 4]>,
}

/// The state of one bind point.
#[derive(Clone, Debug, Default)]
pub struct BindPointState {
    pub pipeline: Option<BoundPipeline>,

    /// Bound descriptor sets, by set index.
    pub descriptor_sets: Vec<Option<BoundDescriptorSet>>,
}

/// The last push constants the application set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushConstantsState {
    pub layout: vk::PipelineLayout,
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub data: Vec<u8>,
}

/// What the front end tracks about a command buffer being recorded.
#[derive(Clone, Debug)]
pub struct CommandBufferState {
    pub handle: vk::CommandBuffer,

    /// Whether the command buffer is in the recording state.
    pub recording: bool,

    pub graphics: BindPointState,
    pub compute: BindPointState,
    pub ray_tracing: BindPointState,

    /// The render pass being recorded, if any.
    pub rendering: Option<RenderingInfo>,

    pub push_constants: Option<PushConstantsState>,

    pub _ne: NonExhaustive,
}

impl CommandBufferState {
    #[inline]
    pub fn new(handle: vk::CommandBuffer) -> Self {
        CommandBufferState {
            handle,
            recording: true,
            graphics: BindPointState::default(),
            compute: BindPointState::default(),
            ray_tracing: BindPointState::default(),
            rendering: None,
            push_constants: None,
            _ne: NonExhaustive(()),
        }
    }

    /// Returns the state of `bind_point`.
    pub fn bind_point(&self, bind_point: vk::PipelineBindPoint) -> Option<&BindPointState> {
        match bind_point {
            vk::PipelineBindPoint::GRAPHICS => Some(&self.graphics),
            vk::PipelineBindPoint::COMPUTE => Some(&self.compute),
            vk::PipelineBindPoint::RAY_TRACING_KHR => Some(&self.ray_tracing),
            _ => None,
        }
    }
}

/// Buffers of power-of-two sizes, recycled once the command using them is done.
#[derive(Debug)]
pub(crate) struct BufferPool {
    device: Arc<dyn GpuavDevice>,
    classes: Vec<SegQueue<DeviceBuffer>>,
    /// Bytes of every buffer allocated by the pool, recycled ones included.
    allocated: AtomicU64,
    budget: DeviceSize,
}

const MIN_SIZE_CLASS: u32 = 8;

impl BufferPool {
    pub(crate) fn new(device: Arc<dyn GpuavDevice>, budget: DeviceSize) -> Arc<Self> {
        Arc::new(BufferPool {
            device,
            classes: (MIN_SIZE_CLASS..DeviceSize::BITS).map(|_| SegQueue::new()).collect(),
            allocated: AtomicU64::new(0),
            budget,
        })
    }

    /// Returns a zeroed buffer of at least `size` bytes.
    pub(crate) fn allocate(self: &Arc<Self>, size: DeviceSize) -> Result<PooledBuffer, GpuavError> {
        let exhausted = GpuavError::ResourceExhausted {
            resource: ExhaustedResource::ErrorLogMemory,
        };
        let class = size
            .max(1 << MIN_SIZE_CLASS)
            .checked_next_power_of_two()
            .ok_or(exhausted.clone())?;
        let index = (class.trailing_zeros() - MIN_SIZE_CLASS) as usize;
        let queue = self.classes.get(index).ok_or(exhausted.clone())?;

        if let Some(buffer) = queue.pop() {
            buffer.fill_zero();

            return Ok(PooledBuffer {
                inner: ManuallyDrop::new(buffer),
                pool: self.clone(),
                class: index,
            });
        }

        let reserved = self
            .allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |allocated| {
                allocated
                    .checked_add(class)
                    .filter(|&total| total <= self.budget)
            });

        if reserved.is_err() {
            return Err(exhausted);
        }

        match self
            .device
            .create_buffer(class, vk::BufferUsageFlags::STORAGE_BUFFER)
        {
            Ok(buffer) => Ok(PooledBuffer {
                inner: ManuallyDrop::new(buffer),
                pool: self.clone(),
                class: index,
            }),
            Err(err) => {
                self.allocated.fetch_sub(class, Ordering::Relaxed);

                Err(match err {
                    VulkanError::OutOfDeviceMemory | VulkanError::OutOfHostMemory => {
                        GpuavError::ResourceExhausted {
                            resource: ExhaustedResource::DeviceMemory,
                        }
                    }
                    err => err.into(),
                })
            }
        }
    }

    /// Returns the number of bytes allocated from the device.
    pub(crate) fn allocated(&self) -> DeviceSize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for queue in &self.classes {
            while let Some(buffer) = queue.pop() {
                // SAFETY: Buffers only go back to the pool once their command is done.
                unsafe { self.device.destroy_buffer(buffer) };
            }
        }
    }
}

/// A buffer from a [`BufferPool`], returned to it on drop.
#[derive(Debug)]
pub(crate) struct PooledBuffer {
    inner: ManuallyDrop<DeviceBuffer>,
    pool: Arc<BufferPool>,
    class: usize,
}

impl std::ops::Deref for PooledBuffer {
    type Target = DeviceBuffer;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // SAFETY: `inner` is never used again.
        let inner = unsafe { ManuallyDrop::take(&mut self.inner) };
        self.pool.classes[self.class].push(inner);
    }
}

/// A descriptor set the validator allocated, freed on drop.
#[derive(Debug)]
pub(crate) struct OwnedDescriptorSet {
    device: Arc<dyn GpuavDevice>,
    set: vk::DescriptorSet,
}

impl OwnedDescriptorSet {
    pub(crate) fn new(
        device: &Arc<dyn GpuavDevice>,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Self, VulkanError> {
        let set = device.allocate_descriptor_set(layout)?;

        Ok(OwnedDescriptorSet {
            device: device.clone(),
            set,
        })
    }

    #[inline]
    pub(crate) fn handle(&self) -> vk::DescriptorSet {
        self.set
    }
}

impl Drop for OwnedDescriptorSet {
    fn drop(&mut self) {
        // SAFETY: Sets are owned by command resources, which are only dropped once their
        // command buffer is reset, freed or done executing.
        unsafe { self.device.free_descriptor_set(self.set) };
    }
}

/// Tracks where a command buffer is in its submission lifecycle. Shared by every
/// [`CommandResources`] recorded into it until the command buffer is reset.
#[derive(Debug, Default)]
pub(crate) struct CommandBufferStatus {
    state: Mutex<SubmissionState>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum SubmissionState {
    #[default]
    Recorded,
    Submitted(u64),
    Completed,
}

impl CommandBufferStatus {
    pub(crate) fn submitted(&self, serial: u64) {
        *self.state.lock() = SubmissionState::Submitted(serial);
    }

    /// Marks the command buffer completed, if its last submission is `serial`.
    pub(crate) fn completed(&self, serial: u64) {
        let mut state = self.state.lock();

        if *state == SubmissionState::Submitted(serial) {
            *state = SubmissionState::Completed;
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        *self.state.lock() == SubmissionState::Completed
    }
}

/// The resources of one validated operation.
///
/// Holds the error log the operation's injected code and pre-pass write into, and keeps alive
/// everything the decoder needs to attribute records: the shaders of the bound pipeline and
/// snapshots of the bound descriptor sets.
#[derive(Debug)]
pub struct CommandResources {
    location: Location,
    kind: OperationKind,
    bind_point: Option<vk::PipelineBindPoint>,
    pub(crate) error_log: PooledBuffer,
    pub(crate) log_capacity: u32,
    pub(crate) binding_table: Option<PooledBuffer>,
    pub(crate) descriptor_sets: SmallVec<[OwnedDescriptorSet; 2]>,
    pub(crate) snapshots: Vec<(u32, DescriptorSetSnapshot)>,
    pub(crate) shaders: SmallVec<[PipelineShader; 2]>,
    pub(crate) prepass: Option<PrepassKind>,
    pub(crate) status: Arc<CommandBufferStatus>,
    pub(crate) consumed: bool,
}

impl CommandResources {
    pub(crate) fn new(
        location: Location,
        kind: OperationKind,
        error_log: PooledBuffer,
        log_capacity: u32,
        status: Arc<CommandBufferStatus>,
    ) -> Self {
        CommandResources {
            location,
            kind,
            bind_point: kind.info().bind_point,
            error_log,
            log_capacity,
            binding_table: None,
            descriptor_sets: SmallVec::new(),
            snapshots: Vec::new(),
            shaders: SmallVec::new(),
            prepass: None,
            status,
            consumed: false,
        }
    }

    /// Returns the API call that recorded the operation.
    #[inline]
    pub fn location(&self) -> Location {
        self.location
    }

    #[inline]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    #[inline]
    pub fn bind_point(&self) -> Option<vk::PipelineBindPoint> {
        self.bind_point
    }

    /// Returns the number of records the error log has room for.
    #[inline]
    pub fn log_capacity(&self) -> u32 {
        self.log_capacity
    }

    /// Returns the error log buffer.
    #[inline]
    pub fn error_log(&self) -> &DeviceBuffer {
        &self.error_log
    }

    /// Returns the pre-pass recorded before the operation, if any.
    #[inline]
    pub fn prepass(&self) -> Option<PrepassKind> {
        self.prepass
    }

    /// Whether the submission that executes the operation has completed.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// Whether the resources have been decoded already.
    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Returns the snapshot of the descriptor set bound at `set_index`.
    pub fn snapshot(&self, set_index: u32) -> Option<&DescriptorSetSnapshot> {
        self.snapshots
            .iter()
            .find(|(index, _)| *index == set_index)
            .map(|(_, snapshot)| snapshot)
    }

    /// Returns the shader of the bound pipeline whose id is `shader_id`.
    pub fn shader(&self, shader_id: u32) -> Option<&PipelineShader> {
        self.shaders
            .iter()
            .find(|shader| shader.record.unique_id() == shader_id)
    }

    /// Reads the error log: the number of attempted records, and every record that was
    /// written.
    pub(crate) fn read_log(&self) -> (u32, Vec<u32>) {
        let written = self.error_log.read_word(LOG_WRITTEN_COUNT as usize);
        let stored = written.min(self.log_capacity) as usize * RECORD_WORDS as usize;
        let mut words = vec![0; stored];
        self.error_log
            .read_words(LOG_HEADER_WORDS as usize, &mut words);

        (written, words)
    }
}

/// Returns the number of bytes of an error log with room for `records` records.
#[inline]
pub(crate) fn log_size(records: u32) -> DeviceSize {
    (DeviceSize::from(LOG_HEADER_WORDS) + DeviceSize::from(records) * DeviceSize::from(RECORD_WORDS))
        * 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockDevice;

    #[test]
    fn operation_table() {
        let info = OperationKind::DrawIndexedIndirectCount.info();
        assert_eq!(info.function, "vkCmdDrawIndexedIndirectCount");
        assert_eq!(info.bind_point, Some(vk::PipelineBindPoint::GRAPHICS));
        assert_eq!(info.prepass, Some(PrepassKind::DrawIndexedIndirect));
        assert_eq!(info.indirect_struct_size, 20);

        let info = OperationKind::CopyBufferToImage.info();
        assert_eq!(info.bind_point, None);
        assert_eq!(info.prepass, Some(PrepassKind::CopyBufferToImageDepth));

        assert_eq!(OperationKind::Dispatch.info().prepass, None);
    }

    #[test]
    fn invocation_bound() {
        let mut operation = Operation::new(OperationKind::Dispatch);
        operation.group_counts = Some([4, 2, 1]);
        assert_eq!(operation.invocation_bound(Some([64, 1, 1])), Some(512));
        assert_eq!(operation.invocation_bound(None), None);

        let mut operation = Operation::new(OperationKind::Draw);
        operation.invocation_count = Some(3);
        assert_eq!(operation.invocation_bound(None), Some(3));
    }

    #[test]
    fn indirect_capacity() {
        let params = IndirectParams {
            buffer: vk::Buffer::null(),
            offset: 16,
            buffer_size: 16 + 20 * 3 + 8,
            stride: 20,
            draw_count: 10,
            count_buffer: None,
        };
        assert_eq!(params.capacity(20), 3);

        let params = IndirectParams {
            offset: 64,
            buffer_size: 64,
            ..params
        };
        assert_eq!(params.capacity(20), 0);
    }

    #[test]
    fn pool_recycles_and_enforces_budget() {
        let device = Arc::new(MockDevice::new());
        let pool = BufferPool::new(device.clone(), 1024);

        let first = pool.allocate(300).unwrap();
        assert_eq!(first.size(), 512);
        first.write_words(0, &[7]);
        let handle = first.handle();
        drop(first);

        // The recycled buffer comes back zeroed.
        let second = pool.allocate(400).unwrap();
        assert_eq!(second.handle(), handle);
        assert_eq!(second.read_word(0), 0);

        let _third = pool.allocate(512).unwrap();
        assert_eq!(pool.allocated(), 1024);
        assert!(matches!(
            pool.allocate(1),
            Err(GpuavError::ResourceExhausted {
                resource: ExhaustedResource::ErrorLogMemory,
            }),
        ));
        assert_eq!(device.buffers_created(), 2);
    }

    #[test]
    fn log_sizes() {
        assert_eq!(log_size(0), 16);
        assert_eq!(log_size(2), 16 + 2 * 64);
    }
}
