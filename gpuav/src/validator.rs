//! The entry point of the validation front end.
//!
//! A [`Validator`] owns every registry of the crate: the instrumented shaders, the descriptor
//! heap, the pre-pass programs, the error log pool and the per-command-buffer resources. The
//! front end calls its hooks as the application calls the API, and receives diagnostics and
//! warnings through the [`DiagnosticSink`] it was created with.
//!
//! None of the hooks fail. Whatever can't be validated is reported as a warning, once per
//! cause, and left to execute as the application recorded it.

use crate::{
    command::{
        log_size, BoundPipeline, CommandBufferState, CommandBufferStatus, CommandResources,
        Operation, OperationKind, OwnedDescriptorSet, PooledBuffer, BufferPool,
    },
    decode::{self, DecodeContext, Diagnostic, DiagnosticSink},
    descriptor_heap::{
        BindingTable, DescriptorBinding, DescriptorBounds, DescriptorHeap, DescriptorSetSnapshot,
    },
    device::{DeviceBuffer, GpuavDevice, RenderingInfo, StorageBinding, StorageBufferWrite},
    instrument::{self, CheckCategories, InstrumentOptions},
    prepass::{
        self, BufferRange, PrepassCache, PrepassDispatch, PrepassKey, PrepassKind,
        PrepassParams, SharedValidationResources,
    },
    record::{binding, LOG_HEADER_WORDS, RECORD_WORDS},
    shader::{ShaderRecord, ShaderRegistry, ShaderStage},
    vk, DeviceSize, ExhaustedResource, GpuavError, Location, NonExhaustive, VulkanError,
};
use foldhash::{HashMap, HashSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    collections::BTreeMap,
    fmt,
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Parameters to create a new `Validator`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct ValidatorCreateInfo {
    /// The checks injected into shaders.
    ///
    /// The default value is [`CheckCategories::all()`].
    pub checks: CheckCategories,

    /// The maximum number of records the error log of one command has room for.
    ///
    /// The default value is `1024`.
    pub max_records_per_command: u32,

    /// The number of records of the error log of commands whose number of invocations is not
    /// known on the host, like indirect dispatches and draws.
    ///
    /// The default value is `256`.
    pub unbounded_log_records: u32,

    /// The maximum number of distinct diagnostics decoded from one error log.
    ///
    /// The default value is `64`.
    pub max_diagnostics_per_decode: u32,

    /// The number of slots of the descriptor heap.
    ///
    /// The default value is `65536`.
    pub max_descriptor_heap_slots: u32,

    /// The number of entries of the buffer device address table.
    ///
    /// The default value is `4096`.
    pub max_address_ranges: u32,

    /// The maximum number of bytes of error logs and binding tables allocated at once.
    ///
    /// The default value is 64 MiB.
    pub error_log_memory_budget: DeviceSize,

    /// The maximum size of the binding table of one command, in words. Commands with more
    /// bound descriptors are not validated.
    ///
    /// The default value is `65536`.
    pub max_binding_table_words: u32,

    #[cfg_attr(feature = "serde", serde(skip))]
    pub _ne: NonExhaustive,
}

impl Default for ValidatorCreateInfo {
    #[inline]
    fn default() -> Self {
        ValidatorCreateInfo {
            checks: CheckCategories::all(),
            max_records_per_command: 1024,
            unbounded_log_records: 256,
            max_diagnostics_per_decode: 64,
            max_descriptor_heap_slots: 1 << 16,
            max_address_ranges: 4096,
            error_log_memory_budget: 64 << 20,
            max_binding_table_words: 1 << 16,
            _ne: NonExhaustive(()),
        }
    }
}

/// Identifies one submission made through [`Validator::on_submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(u64);

impl SubmissionId {
    /// Returns the serial of the submission. Serials increase with every submission.
    #[inline]
    pub fn serial(self) -> u64 {
        self.0
    }
}

/// GPU-assisted validation of one device.
pub struct Validator {
    device: Arc<dyn GpuavDevice>,
    sink: Arc<dyn DiagnosticSink>,
    create_info: ValidatorCreateInfo,
    instrument_options: InstrumentOptions,
    reserved_set: u32,
    set_layout: vk::DescriptorSetLayout,
    fallback: ManuallyDrop<FallbackSet>,

    shaders: ShaderRegistry,
    heap: Arc<DescriptorHeap>,
    prepasses: PrepassCache,
    buffers: Arc<BufferPool>,

    command_buffers: Mutex<HashMap<vk::CommandBuffer, CommandBufferEntry>>,
    submissions: Mutex<Submissions>,
    device_lost: AtomicBool,
    warned: WarnOnce,
}

#[derive(Debug, Default)]
struct CommandBufferEntry {
    status: Arc<CommandBufferStatus>,
    resources: Vec<CommandResources>,
    /// Number of validated operations recorded so far, used to number commands in locations.
    commands: u32,
}

#[derive(Debug, Default)]
struct Submissions {
    /// The command buffers of every submission that hasn't completed, by serial.
    pending: BTreeMap<u64, SmallVec<[vk::CommandBuffer; 4]>>,
    last: u64,
}

impl Validator {
    /// Creates a validator for `device`, reporting to `sink`.
    pub fn new(
        device: Arc<dyn GpuavDevice>,
        sink: Arc<dyn DiagnosticSink>,
        create_info: ValidatorCreateInfo,
    ) -> Result<Self, GpuavError> {
        let limits = device.limits();
        let reserved_set = limits.reserved_set_index();
        let mut checks = create_info.checks;

        if !limits.buffer_device_address || !limits.shader_int64 {
            checks = checks - CheckCategories::BUFFER_ADDRESS;
        }

        let instrument_options = InstrumentOptions::from_limits(checks, limits);

        let heap = DescriptorHeap::new(
            device.clone(),
            create_info.max_descriptor_heap_slots,
            create_info.max_address_ranges,
        )?;

        let bindings = [
            binding::ERROR_LOG,
            binding::DESCRIPTOR_HEAP,
            binding::BINDING_TABLE,
            binding::ADDRESS_TABLE,
        ]
        .map(|binding| StorageBinding {
            binding,
            stages: vk::ShaderStageFlags::ALL,
        });
        let set_layout = device.create_descriptor_set_layout(&bindings)?;

        let fallback = match FallbackSet::new(&device, set_layout, &heap) {
            Ok(fallback) => fallback,
            Err(err) => {
                // SAFETY: No set was allocated with the layout.
                unsafe { device.destroy_descriptor_set_layout(set_layout) };

                return Err(err);
            }
        };

        log::debug!(
            "GPU-assisted validation enabled: checks {:?}, reserved descriptor set {}",
            checks,
            reserved_set,
        );

        Ok(Validator {
            prepasses: PrepassCache::new(device.clone()),
            buffers: BufferPool::new(device.clone(), create_info.error_log_memory_budget),
            device,
            sink,
            create_info,
            instrument_options,
            reserved_set,
            set_layout,
            fallback: ManuallyDrop::new(fallback),
            shaders: ShaderRegistry::default(),
            heap,
            command_buffers: Mutex::default(),
            submissions: Mutex::default(),
            device_lost: AtomicBool::new(false),
            warned: WarnOnce::default(),
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuavDevice> {
        &self.device
    }

    #[inline]
    pub fn create_info(&self) -> &ValidatorCreateInfo {
        &self.create_info
    }

    /// Returns the descriptor set layout of the validator's descriptor set. Pipeline layouts of
    /// instrumented pipelines must have it at [`reserved_set_index`].
    ///
    /// [`reserved_set_index`]: Self::reserved_set_index
    #[inline]
    pub fn instrumentation_set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    /// Returns the descriptor set index the validator binds its set at.
    #[inline]
    pub fn reserved_set_index(&self) -> u32 {
        self.reserved_set
    }

    #[inline]
    pub fn descriptor_heap(&self) -> &Arc<DescriptorHeap> {
        &self.heap
    }

    /// Returns the live shader whose id is `unique_id`.
    #[inline]
    pub fn shader(&self, unique_id: u32) -> Option<Arc<ShaderRecord>> {
        self.shaders.get(unique_id)
    }

    /// Instruments a shader module with `checks`, restricted to the checks the validator was
    /// created with.
    ///
    /// Returns `None` if the module can't be instrumented, in which case the original module
    /// should be used. A warning is reported once per module.
    pub fn instrument_shader(
        &self,
        words: &[u32],
        checks: CheckCategories,
        loc: Location,
    ) -> Option<Arc<ShaderRecord>> {
        let options = InstrumentOptions {
            checks: checks & self.instrument_options.checks,
            ..self.instrument_options.clone()
        };

        match self.shaders.get_or_instrument(words, &options) {
            Ok(record) => Some(record),
            Err(err) => {
                let (_, content_hash) = instrument::shader_id(words, &options);

                self.warn_once(WarningKey::Instrumentation(content_hash), loc, || {
                    format!("{}; the original module is used without validation", err)
                });

                None
            }
        }
    }

    /// Returns the pre-pass program of `kind`, building it on first use.
    ///
    /// Returns `None` if the program can't be built, in which case operations of that kind
    /// can't be validated. A warning is reported once per kind.
    pub fn get_shared_validation_pipeline(
        &self,
        kind: PrepassKind,
        rendering: Option<&RenderingInfo>,
        shader_object: bool,
        loc: Location,
    ) -> Option<Arc<SharedValidationResources>> {
        let key = PrepassKey {
            kind,
            rendering: if kind.is_graphics() {
                rendering.cloned()
            } else {
                None
            },
            shader_object,
        };

        match self.prepasses.get_or_build(&key) {
            Ok(resources) => Some(resources),
            Err(err) => {
                self.warn_once(WarningKey::Prepass(kind), loc, || {
                    format!("{}; these operations are not validated", err)
                });

                None
            }
        }
    }

    /// Prepares validation of `operation`, about to be recorded into the command buffer of
    /// `state`: allocates its error log, records its pre-pass and binds the validator's
    /// descriptor set.
    ///
    /// Returns whether the operation is validated. The front end records the operation itself
    /// either way.
    pub fn allocate_command_resources(
        &self,
        state: &CommandBufferState,
        operation: &Operation,
        loc: Location,
    ) -> bool {
        if !state.recording || self.device_lost.load(Ordering::Relaxed) {
            return false;
        }

        let (status, index) = {
            let mut command_buffers = self.command_buffers.lock();
            let entry = command_buffers.entry(state.handle).or_default();
            entry.commands += 1;

            (entry.status.clone(), entry.commands - 1)
        };
        let loc = match loc.index {
            Some(_) => loc,
            None => loc.with_index(index),
        };

        match self.allocate(state, operation, status, loc) {
            Ok(Some(resources)) => {
                self.command_buffers
                    .lock()
                    .entry(state.handle)
                    .or_default()
                    .resources
                    .push(resources);

                true
            }
            Ok(None) => false,
            Err(err) => {
                self.warn_skipped(&err, loc);

                false
            }
        }
    }

    fn allocate(
        &self,
        state: &CommandBufferState,
        operation: &Operation,
        status: Arc<CommandBufferStatus>,
        loc: Location,
    ) -> Result<Option<CommandResources>, GpuavError> {
        let info = operation.kind.info();
        let bound = info.bind_point.and_then(|bind_point| {
            let pipeline = state.bind_point(bind_point)?.pipeline.as_ref()?;

            Some((bind_point, pipeline))
        });

        let mut instrumented = bound.filter(|(_, pipeline)| pipeline.is_instrumented());

        if let Some((_, pipeline)) = instrumented {
            if pipeline.set_layout_count > self.reserved_set {
                self.warn_once(WarningKey::ReservedSet, loc, || {
                    format!(
                        "the pipeline layout uses descriptor set {}, which the validator \
                        reserves; its shaders are not validated",
                        self.reserved_set,
                    )
                });
                instrumented = None;
            }
        }

        let prepass = info
            .prepass
            .filter(|&kind| self.prepass_applies(kind, operation))
            .and_then(|kind| {
                let shader_object =
                    bound.is_some_and(|(_, pipeline)| !pipeline.shader_objects.is_empty());

                self.get_shared_validation_pipeline(
                    kind,
                    state.rendering.as_ref(),
                    shader_object,
                    loc,
                )
            });

        // Instrumented shaders run whether or not the command is validated. Those that aren't
        // validated write to the fallback set, never to the log of an earlier command.
        let mut validated = None;
        let mut unvalidated = None;

        if let Some((bind_point, pipeline)) = instrumented {
            match self.binding_table(state, bind_point, loc) {
                Some(table) => validated = Some((bind_point, pipeline, table)),
                None => unvalidated = Some((bind_point, pipeline)),
            }
        }

        if validated.is_none() && prepass.is_none() {
            if let Some((bind_point, pipeline)) = unvalidated {
                self.bind_fallback_set(state.handle, bind_point, pipeline);
            }

            return Ok(None);
        }

        let prepared = self.prepare(
            state,
            operation,
            validated.as_ref().map(|(_, pipeline, table)| (*pipeline, &table.table)),
            prepass,
            status,
            loc,
        );

        // Nothing was recorded so far, so whatever `prepare` allocated was dropped unused.
        let Prepared {
            mut resources,
            prepass,
            instrumentation,
        } = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                if let Some((bind_point, pipeline)) = instrumented {
                    self.bind_fallback_set(state.handle, bind_point, pipeline);
                }

                return Err(err);
            }
        };

        // The pre-pass disturbs the sets bound on its bind point, so it goes first.
        if let Some(prepass) = prepass {
            self.record_prepass(state, &prepass, &resources);
            resources.prepass = Some(prepass.resources.kind());
            resources.descriptor_sets.push(prepass.set);
        }

        if let (Some((bind_point, pipeline, table)), Some(instrumentation)) =
            (validated, instrumentation)
        {
            self.bind_instrumentation_set(
                state.handle,
                bind_point,
                pipeline,
                instrumentation,
                table.snapshots,
                &mut resources,
            );
        }

        if let Some((bind_point, pipeline)) = unvalidated {
            self.bind_fallback_set(state.handle, bind_point, pipeline);
        }

        log::trace!(
            "{}: validated with a log of {} records",
            loc,
            resources.log_capacity(),
        );

        Ok(Some(resources))
    }

    /// Allocates everything the command needs, without recording anything into its command
    /// buffer.
    fn prepare(
        &self,
        state: &CommandBufferState,
        operation: &Operation,
        validated: Option<(&BoundPipeline, &BindingTable)>,
        prepass: Option<Arc<SharedValidationResources>>,
        status: Arc<CommandBufferStatus>,
        loc: Location,
    ) -> Result<Prepared, GpuavError> {
        let limits = self.device.limits();
        let shader_records = validated.map_or(0, |(pipeline, _)| {
            operation
                .invocation_bound(pipeline.local_size())
                .map_or(self.create_info.unbounded_log_records, |bound| {
                    u32::try_from(bound).unwrap_or(u32::MAX)
                })
        });
        let prepass_records = prepass
            .as_ref()
            .map_or(0, |resources| prepass_record_bound(resources.kind(), operation));
        let range_records = (limits.max_storage_buffer_range / 4).saturating_sub(LOG_HEADER_WORDS)
            / RECORD_WORDS;
        let records = shader_records
            .saturating_add(prepass_records)
            .min(self.create_info.max_records_per_command)
            .min(range_records)
            .max(1);

        let error_log = self.buffers.allocate(log_size(records))?;
        let log_capacity = log_records(error_log.size());
        let resources =
            CommandResources::new(loc, operation.kind, error_log, log_capacity, status);

        let prepass = match prepass {
            Some(prepass) => Some(PreparedPrepass {
                launch: self.prepass_launch(state, operation, prepass.kind())?,
                set: self.allocate_set(prepass.set_layout())?,
                resources: prepass,
            }),
            None => None,
        };

        let instrumentation = match validated {
            Some((_, table)) => Some(self.instrumentation_set(table, &resources)?),
            None => None,
        };

        Ok(Prepared {
            resources,
            prepass,
            instrumentation,
        })
    }

    /// Whether the pre-pass of `kind` has anything to check for `operation`.
    fn prepass_applies(&self, kind: PrepassKind, operation: &Operation) -> bool {
        let limits = self.device.limits();

        match kind {
            PrepassKind::DispatchIndirect => operation.indirect.is_some(),
            PrepassKind::DrawIndirect | PrepassKind::DrawIndexedIndirect => {
                operation.indirect.is_some_and(|indirect| {
                    indirect.count_buffer.is_some() || !limits.draw_indirect_first_instance
                })
            }
            PrepassKind::DrawMeshTasksIndirect => {
                operation.indirect.is_some()
                    && (limits.max_task_work_group_total_count != 0
                        || limits.max_mesh_work_group_total_count != 0)
            }
            PrepassKind::TraceRaysIndirect => {
                operation.indirect.is_some() && limits.max_ray_dispatch_invocation_count != 0
            }
            PrepassKind::CopyBufferToImageDepth => operation
                .depth_copy
                .is_some_and(|copy| copy.texel_count != 0),
        }
    }

    /// Computes what the pre-pass of `kind` reads, and how many times it is launched.
    fn prepass_launch(
        &self,
        state: &CommandBufferState,
        operation: &Operation,
        kind: PrepassKind,
    ) -> Result<PrepassLaunch, GpuavError> {
        let limits = self.device.limits();
        let struct_size = operation.kind.info().indirect_struct_size;

        let mut launch = match (operation.indirect, operation.depth_copy) {
            (Some(indirect), _) => PrepassLaunch {
                input: BufferRange {
                    buffer: indirect.buffer,
                    offset: indirect.offset,
                },
                count: indirect
                    .count_buffer
                    .map(|(buffer, offset)| BufferRange { buffer, offset }),
                params: PrepassParams {
                    stride: indirect.stride.max(struct_size) / 4,
                    draw_count: indirect.draw_count,
                    draw_capacity: indirect.capacity(struct_size),
                    ..Default::default()
                },
                launch: if kind.is_graphics() {
                    indirect.draw_count.max(1)
                } else {
                    1
                },
            },
            (None, Some(copy)) => PrepassLaunch {
                input: BufferRange {
                    buffer: copy.buffer,
                    offset: copy.offset,
                },
                count: None,
                params: PrepassParams {
                    draw_count: copy.texel_count,
                    ..Default::default()
                },
                launch: prepass::copy_workgroups(copy.texel_count, limits),
            },
            (None, None) => {
                return Err(GpuavError::BuildFailure {
                    kind,
                    reason: "the operation has no parameters to check".into(),
                });
            }
        };

        if kind == PrepassKind::DrawMeshTasksIndirect {
            let has_task_shader = state.graphics.pipeline.as_ref().is_some_and(|pipeline| {
                pipeline
                    .shaders
                    .iter()
                    .any(|shader| shader.record.stage() == Some(ShaderStage::Task))
            });

            (launch.params.limit, launch.params.limit_total) = if has_task_shader {
                (
                    limits.max_task_work_group_count,
                    limits.max_task_work_group_total_count,
                )
            } else {
                (
                    limits.max_mesh_work_group_count,
                    limits.max_mesh_work_group_total_count,
                )
            };
        }

        Ok(launch)
    }

    fn record_prepass(
        &self,
        state: &CommandBufferState,
        prepass: &PreparedPrepass,
        resources: &CommandResources,
    ) {
        let launch = prepass.launch;
        let dispatch = PrepassDispatch {
            command_buffer: state.handle,
            error_log: resources.error_log.handle(),
            descriptor_set: prepass.set.handle(),
            input: launch.input,
            count: launch.count,
            params: launch.params,
            launch: launch.launch,
            inside_render_pass: state.rendering.is_some(),
            restore: state,
        };

        // SAFETY: The command buffer is recording, and the set is moved into the resources of
        // the command, which outlive its execution.
        unsafe { prepass::record(&*self.device, &prepass.resources, &dispatch) };
    }

    /// Snapshots the descriptor sets bound below the reserved index and flattens them into a
    /// binding table. Returns `None` if the table would be too large.
    fn binding_table(
        &self,
        state: &CommandBufferState,
        bind_point: vk::PipelineBindPoint,
        loc: Location,
    ) -> Option<SnapshotTable> {
        let bound_sets = state
            .bind_point(bind_point)
            .map_or(&[][..], |bind_point_state| bind_point_state.descriptor_sets.as_slice());
        let snapshots: Vec<_> = bound_sets
            .iter()
            .enumerate()
            .take(self.reserved_set as usize)
            .filter_map(|(index, bound)| {
                bound
                    .as_ref()
                    .map(|bound| (index as u32, self.heap.snapshot_for(bound.set)))
            })
            .collect();

        let table = {
            let borrowed: Vec<_> = snapshots
                .iter()
                .map(|(index, snapshot)| (*index, snapshot))
                .collect();

            BindingTable::build(&borrowed, self.create_info.max_binding_table_words as usize)
        };

        match table {
            Some(table) => Some(SnapshotTable { snapshots, table }),
            None => {
                self.warn_once(WarningKey::BindingTable, loc, || {
                    format!(
                        "more descriptors are bound than the binding table can describe ({} \
                        words); shaders are not validated for such commands",
                        self.create_info.max_binding_table_words,
                    )
                });

                None
            }
        }
    }

    /// Uploads `table` and allocates the validator's set pointing at it and at the error log
    /// of `resources`.
    fn instrumentation_set(
        &self,
        table: &BindingTable,
        resources: &CommandResources,
    ) -> Result<InstrumentationSet, GpuavError> {
        let binding_table = self.write_binding_table(table)?;
        let set = self.allocate_set(self.set_layout)?;

        let writes = [
            (binding::ERROR_LOG, resources.error_log.handle()),
            (binding::DESCRIPTOR_HEAP, self.heap.entries().handle()),
            (binding::BINDING_TABLE, binding_table.handle()),
            (binding::ADDRESS_TABLE, self.heap.address_table().handle()),
        ]
        .map(|(binding, buffer)| StorageBufferWrite {
            binding,
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        });

        // SAFETY: The set was just allocated, nothing uses it yet.
        unsafe { self.device.write_storage_buffers(set.handle(), &writes) };

        Ok(InstrumentationSet { set, binding_table })
    }

    fn bind_instrumentation_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: &BoundPipeline,
        instrumentation: InstrumentationSet,
        snapshots: Vec<(u32, DescriptorSetSnapshot)>,
        resources: &mut CommandResources,
    ) {
        // SAFETY: The command buffer is recording. The pipeline layout has the validator's set
        // layout at the reserved index.
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                pipeline.layout,
                self.reserved_set,
                &[instrumentation.set.handle()],
                &[],
            )
        };

        resources.descriptor_sets.push(instrumentation.set);
        resources.binding_table = Some(instrumentation.binding_table);
        resources.snapshots = snapshots;
        resources.shaders = pipeline.shaders.clone();
    }

    /// Binds the fallback set for an instrumented pipeline whose command is not validated.
    fn bind_fallback_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: &BoundPipeline,
    ) {
        // SAFETY: The command buffer is recording. The pipeline layout has the validator's set
        // layout at the reserved index, and the fallback set lives as long as the validator.
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                pipeline.layout,
                self.reserved_set,
                &[self.fallback.set.handle()],
                &[],
            )
        };
    }

    fn write_binding_table(&self, table: &BindingTable) -> Result<PooledBuffer, GpuavError> {
        let words = table.words();
        let buffer = self
            .buffers
            .allocate(DeviceSize::try_from(words.len().max(1) * 4).unwrap_or(DeviceSize::MAX))?;
        buffer.write_words(0, words);

        Ok(buffer)
    }

    fn allocate_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<OwnedDescriptorSet, GpuavError> {
        OwnedDescriptorSet::new(&self.device, layout).map_err(set_allocation_error)
    }

    /// Decodes one error record of `resources` and reports it to the sink. Returns whether a
    /// diagnostic was reported.
    pub fn analyze_and_generate_message(
        &self,
        resources: &CommandResources,
        raw_words: &[u32],
        loc: Location,
    ) -> bool {
        decode::analyze_and_generate_message(
            resources,
            raw_words,
            &self.shaders,
            &*self.sink,
            loc,
        )
    }

    /// Decodes the error log of `resources`, taken out of the validator with
    /// [`take_command_resources`]. The submission executing them must have completed.
    ///
    /// [`take_command_resources`]: Self::take_command_resources
    pub fn decode(
        &self,
        resources: &mut CommandResources,
        loc: Location,
    ) -> Result<Vec<Diagnostic>, GpuavError> {
        decode::decode(resources, &self.decode_context(), loc)
    }

    fn decode_context(&self) -> DecodeContext<'_> {
        DecodeContext {
            shaders: &self.shaders,
            max_diagnostics: self.create_info.max_diagnostics_per_decode,
            device_lost: self.device_lost.load(Ordering::Relaxed),
        }
    }

    /// Takes the resources of every operation recorded into `command_buffer` out of the
    /// validator, so that the front end decodes them itself.
    pub fn take_command_resources(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Vec<CommandResources> {
        self.command_buffers
            .lock()
            .get_mut(&command_buffer)
            .map(|entry| std::mem::take(&mut entry.resources))
            .unwrap_or_default()
    }

    /// Records the layout of a newly allocated descriptor set: `(binding, descriptor count)`
    /// pairs.
    pub fn on_descriptor_set_allocated(&self, set: vk::DescriptorSet, bindings: &[(u32, u32)]) {
        self.heap.register_set(set, bindings);
    }

    /// Mirrors a descriptor write into the descriptor heap.
    pub fn on_descriptor_write(
        &self,
        binding: DescriptorBinding,
        bounds: DescriptorBounds,
        loc: Location,
    ) {
        if let Err(err) = self.heap.upsert(binding, bounds) {
            self.warn_skipped(&err, loc);
        }
    }

    pub fn on_descriptor_set_destroyed(&self, set: vk::DescriptorSet) {
        self.heap.on_set_destroyed(set);
    }

    /// Marks every descriptor referring to the buffer, view or acceleration structure whose
    /// raw handle is `resource` as destroyed.
    pub fn on_resource_destroyed(&self, resource: u64) {
        self.heap.invalidate_resource(resource);
    }

    /// Registers the device address range of a buffer created with
    /// `SHADER_DEVICE_ADDRESS` usage.
    pub fn on_buffer_address_created(&self, address: u64, size: DeviceSize, loc: Location) {
        if let Err(err) = self.heap.register_address_range(address, size) {
            self.warn_skipped(&err, loc);
        }
    }

    pub fn on_buffer_address_destroyed(&self, address: u64) {
        self.heap.unregister_address_range(address);
    }

    /// Called when `command_buffers` are submitted.
    ///
    /// Resources of command buffers submitted again after being decoded are cleared, so that
    /// the new execution is decoded on its own.
    pub fn on_submit(&self, command_buffers: &[vk::CommandBuffer]) -> SubmissionId {
        let mut submissions = self.submissions.lock();
        let serial = self.heap.advance_serial();
        submissions.last = serial;
        submissions
            .pending
            .insert(serial, SmallVec::from_slice(command_buffers));

        let mut entries = self.command_buffers.lock();

        for command_buffer in command_buffers {
            let Some(entry) = entries.get_mut(command_buffer) else {
                continue;
            };

            for resources in &mut entry.resources {
                if resources.consumed {
                    resources.error_log.fill_zero();
                    resources.consumed = false;
                }
            }

            entry.status.submitted(serial);
        }

        SubmissionId(serial)
    }

    /// Called once the host has observed the completion of `submission`, through a fence or a
    /// timeline semaphore. Decodes the error logs of the submission and reports what they
    /// contain.
    pub fn on_submission_complete(&self, submission: SubmissionId, loc: Location) {
        let (command_buffers, completed) = {
            let mut submissions = self.submissions.lock();
            let Some(command_buffers) = submissions.pending.remove(&submission.0) else {
                return;
            };
            // Every submission before the oldest pending one has completed.
            let completed = submissions
                .pending
                .keys()
                .next()
                .map_or(submissions.last, |&oldest| oldest - 1);

            (command_buffers, completed)
        };

        for command_buffer in command_buffers {
            let (status, mut taken) = {
                let mut entries = self.command_buffers.lock();
                let Some(entry) = entries.get_mut(&command_buffer) else {
                    continue;
                };
                entry.status.completed(submission.0);

                (entry.status.clone(), std::mem::take(&mut entry.resources))
            };

            let context = self.decode_context();

            for resources in &mut taken {
                if resources.is_consumed() {
                    continue;
                }

                match decode::decode(resources, &context, loc) {
                    Ok(diagnostics) => {
                        for diagnostic in &diagnostics {
                            self.sink.report(diagnostic);
                        }
                    }
                    Err(err) => log::debug!("{}: {}", resources.location(), err),
                }
            }

            // The command buffer may have been reset meanwhile.
            let mut entries = self.command_buffers.lock();

            if let Some(entry) = entries.get_mut(&command_buffer) {
                if Arc::ptr_eq(&entry.status, &status) {
                    taken.append(&mut entry.resources);
                    entry.resources = taken;
                }
            }
        }

        self.heap.retire_completed(completed);
    }

    /// Called when the device is lost. Error logs can't be trusted anymore: every later decode
    /// returns nothing, and nothing is validated anymore.
    pub fn on_device_lost(&self) {
        if !self.device_lost.swap(true, Ordering::Relaxed) {
            log::warn!("the device was lost, GPU-assisted validation is disabled");
        }
    }

    /// Called when `command_buffer` is reset. Its resources are recycled without being decoded.
    pub fn on_command_buffer_reset(&self, command_buffer: vk::CommandBuffer) {
        let entry = self.command_buffers.lock().remove(&command_buffer);
        drop(entry);
    }

    /// Called when `command_buffer` is freed.
    #[inline]
    pub fn on_command_buffer_freed(&self, command_buffer: vk::CommandBuffer) {
        self.on_command_buffer_reset(command_buffer);
    }

    fn warn_skipped(&self, err: &GpuavError, loc: Location) {
        log::debug!("{}: {}", loc, err);

        let key = match err {
            GpuavError::ResourceExhausted { resource } => WarningKey::Exhausted(*resource),
            GpuavError::BuildFailure { kind, .. } => WarningKey::Prepass(*kind),
            _ => WarningKey::Other,
        };

        self.warn_once(key, loc, || {
            format!("{}; the command is not validated", err)
        });
    }

    fn warn_once(&self, key: WarningKey, loc: Location, message: impl FnOnce() -> String) {
        if self.warned.first(key) {
            self.sink.warn(loc, &message());
        }
    }
}

impl Drop for Validator {
    fn drop(&mut self) {
        // Descriptor sets go back to the device before their layout is destroyed.
        self.command_buffers.get_mut().clear();

        // SAFETY: The fallback set is only used by command buffers, which must not be pending
        // anymore when the validator is dropped.
        unsafe { ManuallyDrop::drop(&mut self.fallback) };

        // SAFETY: The layout is only used by sets owned by the validator, which are gone.
        unsafe { self.device.destroy_descriptor_set_layout(self.set_layout) };
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("device", &self.device)
            .field("create_info", &self.create_info)
            .field("reserved_set", &self.reserved_set)
            .field("live_shaders", &self.shaders.live_count())
            .field("error_log_bytes", &self.buffers.allocated())
            .finish_non_exhaustive()
    }
}

/// Everything a validated command needs, allocated before anything is recorded.
struct Prepared {
    resources: CommandResources,
    prepass: Option<PreparedPrepass>,
    instrumentation: Option<InstrumentationSet>,
}

struct PreparedPrepass {
    resources: Arc<SharedValidationResources>,
    set: OwnedDescriptorSet,
    launch: PrepassLaunch,
}

#[derive(Clone, Copy, Debug)]
struct PrepassLaunch {
    input: BufferRange,
    count: Option<BufferRange>,
    params: PrepassParams,
    launch: u32,
}

/// The descriptor sets bound below the reserved index, captured when the command was recorded.
struct SnapshotTable {
    snapshots: Vec<(u32, DescriptorSetSnapshot)>,
    table: BindingTable,
}

struct InstrumentationSet {
    set: OwnedDescriptorSet,
    binding_table: PooledBuffer,
}

/// The set bound at the reserved index for commands whose instrumented shaders are not
/// validated. Its error log is only a header, so it has room for no record, and its binding
/// table describes no set.
struct FallbackSet {
    device: Arc<dyn GpuavDevice>,
    set: ManuallyDrop<OwnedDescriptorSet>,
    error_log: ManuallyDrop<DeviceBuffer>,
    binding_table: ManuallyDrop<DeviceBuffer>,
}

impl FallbackSet {
    fn new(
        device: &Arc<dyn GpuavDevice>,
        layout: vk::DescriptorSetLayout,
        heap: &DescriptorHeap,
    ) -> Result<Self, GpuavError> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let header_size = DeviceSize::from(LOG_HEADER_WORDS) * 4;

        let error_log = device.create_buffer(header_size, usage)?;

        let binding_table = match device.create_buffer(4, usage) {
            Ok(buffer) => buffer,
            Err(err) => {
                // SAFETY: The buffer was never used.
                unsafe { device.destroy_buffer(error_log) };

                return Err(err.into());
            }
        };

        let set = match OwnedDescriptorSet::new(device, layout) {
            Ok(set) => set,
            Err(err) => {
                // SAFETY: The buffers were never used.
                unsafe { device.destroy_buffer(error_log) };
                // SAFETY: Same as above.
                unsafe { device.destroy_buffer(binding_table) };

                return Err(set_allocation_error(err));
            }
        };

        // A zero `set_count` and a log with room for no records.
        error_log.fill_zero();
        binding_table.fill_zero();

        let writes = [
            (binding::ERROR_LOG, error_log.handle(), header_size),
            (binding::DESCRIPTOR_HEAP, heap.entries().handle(), vk::WHOLE_SIZE),
            (binding::BINDING_TABLE, binding_table.handle(), vk::WHOLE_SIZE),
            (binding::ADDRESS_TABLE, heap.address_table().handle(), vk::WHOLE_SIZE),
        ]
        .map(|(binding, buffer, range)| StorageBufferWrite {
            binding,
            buffer,
            offset: 0,
            range,
        });

        // SAFETY: The set was just allocated, nothing uses it yet.
        unsafe { device.write_storage_buffers(set.handle(), &writes) };

        Ok(FallbackSet {
            device: device.clone(),
            set: ManuallyDrop::new(set),
            error_log: ManuallyDrop::new(error_log),
            binding_table: ManuallyDrop::new(binding_table),
        })
    }
}

impl Drop for FallbackSet {
    fn drop(&mut self) {
        // SAFETY: The set is dropped with the validator, once no command buffer using it can
        // be pending.
        unsafe { ManuallyDrop::drop(&mut self.set) };

        // SAFETY: Same as above, for the buffers the set points at.
        let error_log = unsafe { ManuallyDrop::take(&mut self.error_log) };
        // SAFETY: Same as above.
        let binding_table = unsafe { ManuallyDrop::take(&mut self.binding_table) };

        // SAFETY: See above.
        unsafe { self.device.destroy_buffer(error_log) };
        // SAFETY: See above.
        unsafe { self.device.destroy_buffer(binding_table) };
    }
}

fn set_allocation_error(err: VulkanError) -> GpuavError {
    match err {
        VulkanError::OutOfPoolMemory | VulkanError::FragmentedPool => {
            GpuavError::ResourceExhausted {
                resource: ExhaustedResource::DescriptorSets,
            }
        }
        VulkanError::OutOfDeviceMemory | VulkanError::OutOfHostMemory => {
            GpuavError::ResourceExhausted {
                resource: ExhaustedResource::DeviceMemory,
            }
        }
        err => err.into(),
    }
}

/// Returns the number of records a log buffer of `size` bytes has room for.
fn log_records(size: DeviceSize) -> u32 {
    let words = size / 4;
    let records = words.saturating_sub(DeviceSize::from(LOG_HEADER_WORDS))
        / DeviceSize::from(RECORD_WORDS);

    u32::try_from(records).unwrap_or(u32::MAX)
}

/// Returns how many records the pre-pass of `kind` may write for `operation`.
fn prepass_record_bound(kind: PrepassKind, operation: &Operation) -> u32 {
    let draw_count = operation.indirect.map_or(0, |indirect| indirect.draw_count);

    match kind {
        PrepassKind::DispatchIndirect | PrepassKind::TraceRaysIndirect => 1,
        // One record per draw, plus the two count checks.
        PrepassKind::DrawIndirect | PrepassKind::DrawIndexedIndirect => {
            draw_count.saturating_add(2)
        }
        PrepassKind::DrawMeshTasksIndirect => draw_count.max(1),
        PrepassKind::CopyBufferToImageDepth => {
            operation.depth_copy.map_or(0, |copy| copy.texel_count)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum WarningKey {
    Instrumentation(u64),
    Prepass(PrepassKind),
    Exhausted(ExhaustedResource),
    ReservedSet,
    BindingTable,
    Other,
}

/// Remembers which warnings were already reported.
#[derive(Debug, Default)]
struct WarnOnce {
    seen: Mutex<HashSet<WarningKey>>,
}

impl WarnOnce {
    /// Returns `true` the first time it is called with `key`.
    fn first(&self, key: WarningKey) -> bool {
        self.seen.lock().insert(key)
    }
}
