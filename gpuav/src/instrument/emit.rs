//! Generation of the injected helper functions and of the calls to them.
//!
//! Injected code only ever calls one of these helpers:
//!
//! - `report(site, kind, flags, o0..o6)` writes one record to the error log, unless the
//!   invocation already wrote one.
//! - `lookup(site, set, binding, index) -> uint` finds the descriptor heap slot of a descriptor
//!   through the binding table, reporting invalid descriptors. It returns the slot plus one, or
//!   zero if the descriptor can't be checked further.
//! - `check_buffer`, `check_texel`, `check_address` and `check_ray_query` compare the operands
//!   of one access against what the host knows about the accessed resource.
//!
//! Inside the helpers, every check follows the same pattern: a selection whose merge block
//! continues the function and whose other branch reports and returns. This keeps the control
//! flow structured without ever touching the blocks of the original functions.

use super::{
    analysis::{AccessLayout, IntValue, ModuleInfo, Type},
    module::{decode_string, defines_type, encode_string, Function, Instruction, Module},
    sites::{DescriptorRef, Site, SiteAction},
    CheckCategories, InstrumentOptions,
};
use crate::record::{
    binding, heap_word, ErrorKind, ADDRESS_ENTRY_WORDS, FLAG_OUT_OF_BOUNDS,
    HEAP_ENTRY_WORDS, LOG_HEADER_WORDS, RECORD_OPERANDS, RECORD_WORDS, STAGE_UNKNOWN,
};
use foldhash::{HashMap, HashSet};
use smallvec::{smallvec, SmallVec};
use spirv::{BuiltIn, Capability, Decoration, ExecutionModel, MemoryModel, Op, Scope, StorageClass};

const VERSION_1_3: u32 = 0x0001_0300;
const VERSION_1_4: u32 = 0x0001_0400;
const STORAGE_BUFFER_EXTENSION: &str = "SPV_KHR_storage_buffer_storage_class";

/// Number of operands `report` takes. The last operand word of a record is always zero.
const REPORT_OPERANDS: usize = RECORD_OPERANDS - 1;

/// Instructions being generated for one function body, or for one call site.
#[derive(Default)]
struct Code {
    instructions: Vec<Instruction>,
}

impl Code {
    #[inline]
    fn push(&mut self, op: Op, operands: &[u32]) {
        self.instructions.push(Instruction::new(op, operands));
    }
}

/// How the invocation id of the writing invocation is obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InvocationSource {
    /// A 3-component built-in, like `GlobalInvocationId`.
    Vector(BuiltIn),
    /// `VertexIndex` and `InstanceIndex`.
    Vertex,
    /// `FragCoord`, truncated to integers.
    Fragment,
    /// Mixed execution models, or a stage without a meaningful invocation id.
    None,
}

#[derive(Clone, Copy)]
enum Scalar {
    Unsigned,
    Signed,
    Float,
}

#[derive(Default)]
struct Helpers {
    report: Option<u32>,
    lookup: Option<u32>,
    check_buffer: Option<u32>,
    check_texel: Option<u32>,
    check_address: Option<u32>,
    check_ray_query: Option<u32>,
}

pub(super) struct Emitter<'a> {
    info: &'a ModuleInfo,
    checks: CheckCategories,
    reserved_set: u32,
    shader_id: u32,
    version: u32,
    stage: u32,
    invocation: InvocationSource,
    bound: u32,
    existing_capabilities: HashSet<u32>,
    existing_extensions: HashSet<String>,
    type_ids: HashMap<(u16, SmallVec<[u32; 4]>), u32>,
    constant_ids: HashMap<(u32, u64), u32>,
    capabilities: Vec<u32>,
    annotations: Vec<Instruction>,
    globals: Vec<Instruction>,
    functions: Vec<Function>,
    /// Variables to add to the interface of every entry point.
    interface: Vec<u32>,
    helpers: Helpers,
    buffers: [Option<u32>; binding::COUNT as usize],
    buffer_pointer: Option<u32>,
    reported: Option<u32>,
}

impl<'a> Emitter<'a> {
    pub(super) fn new(
        module: &Module,
        info: &'a ModuleInfo,
        options: &InstrumentOptions,
        shader_id: u32,
    ) -> Self {
        let mut type_ids = HashMap::default();

        for inst in &module.globals {
            let Some(op) = inst.op() else {
                continue;
            };

            // Aggregates may be declared more than once, and carry decorations that make them
            // differ, so only the others are shared.
            if defines_type(op)
                && !matches!(op, Op::TypeStruct | Op::TypeArray | Op::TypeRuntimeArray)
            {
                if let Some((&id, operands)) = inst.operands.split_first() {
                    type_ids
                        .entry((inst.opcode, SmallVec::from_slice(operands)))
                        .or_insert(id);
                }
            }
        }

        let mut models = info.entry_points.iter().map(|entry_point| entry_point.execution_model);
        let first = models.next();
        let model = first.filter(|&first| models.all(|model| model == first));

        let invocation = match model.and_then(ExecutionModel::from_u32) {
            Some(
                ExecutionModel::GLCompute
                | ExecutionModel::TaskNV
                | ExecutionModel::MeshNV
                | ExecutionModel::TaskEXT
                | ExecutionModel::MeshEXT,
            ) => InvocationSource::Vector(BuiltIn::GlobalInvocationId),
            Some(
                ExecutionModel::RayGenerationKHR
                | ExecutionModel::IntersectionKHR
                | ExecutionModel::AnyHitKHR
                | ExecutionModel::ClosestHitKHR
                | ExecutionModel::MissKHR
                | ExecutionModel::CallableKHR,
            ) => InvocationSource::Vector(BuiltIn::LaunchIdKHR),
            Some(ExecutionModel::Vertex) => InvocationSource::Vertex,
            Some(ExecutionModel::Fragment) => InvocationSource::Fragment,
            _ => InvocationSource::None,
        };

        Emitter {
            info,
            checks: options.checks,
            reserved_set: options.reserved_set,
            shader_id,
            version: module.header.version,
            stage: model.unwrap_or(STAGE_UNKNOWN),
            invocation,
            bound: module.header.bound,
            existing_capabilities: module
                .capabilities
                .iter()
                .filter_map(|inst| inst.operand(0))
                .collect(),
            existing_extensions: module
                .extensions
                .iter()
                .filter_map(|inst| decode_string(&inst.operands))
                .map(|(name, _)| name)
                .collect(),
            type_ids,
            constant_ids: HashMap::default(),
            capabilities: Vec::new(),
            annotations: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            interface: Vec::new(),
            helpers: Helpers::default(),
            buffers: [None; binding::COUNT as usize],
            buffer_pointer: None,
            reported: None,
        }
    }

    /// Inserts the checks for `sites` into the functions of `module`.
    pub(super) fn instrument(&mut self, module: &mut Module, sites: Vec<Site>) {
        // Splicing from the back keeps the indices of the sites not yet processed valid.
        for site in sites.iter().rev() {
            let code = self.emit_site(site);

            if let Some(function) = module.functions.get_mut(site.function) {
                function
                    .instructions
                    .splice(site.instruction..site.instruction, code.instructions);
            }
        }
    }

    /// Adds everything the inserted calls need to `module`.
    pub(super) fn finish(mut self, module: &mut Module) {
        if self.version < VERSION_1_3 && !self.existing_extensions.contains(STORAGE_BUFFER_EXTENSION)
        {
            module.extensions.push(Instruction::new(
                Op::Extension,
                &encode_string(STORAGE_BUFFER_EXTENSION),
            ));
        }

        for capability in self.capabilities.drain(..) {
            module
                .capabilities
                .push(Instruction::new(Op::Capability, &[capability]));
        }

        for inst in &mut module.entry_points {
            let Some((_, name_words)) = inst.operands.get(2..).and_then(decode_string) else {
                continue;
            };
            let interface_start = 2 + name_words;

            for &variable in &self.interface {
                if !inst.operands[interface_start..].contains(&variable) {
                    inst.operands.push(variable);
                }
            }
        }

        module.annotations.append(&mut self.annotations);
        module.globals.append(&mut self.globals);
        module.functions.append(&mut self.functions);
        module.header.bound = self.bound;
    }

    fn emit_site(&mut self, site: &Site) -> Code {
        let mut code = Code::default();
        let site_id = self.uint_constant(site.id);

        match &site.action {
            SiteAction::Buffer {
                descriptor,
                layout: Some(layout),
                access,
            } => {
                let [set, binding, index] = self.descriptor_args(&mut code, descriptor);
                let offset = self.byte_offset(&mut code, layout);
                let size = self.uint_constant(layout.size.unwrap_or(0));
                let access = self.uint_constant(*access as u32);
                let function = self.check_buffer();
                self.call(
                    &mut code,
                    function,
                    &[site_id, set, binding, index, offset, size, access],
                );
            }
            SiteAction::Buffer {
                descriptor,
                layout: None,
                ..
            }
            | SiteAction::Descriptor { descriptor } => {
                let [set, binding, index] = self.descriptor_args(&mut code, descriptor);
                let function = self.lookup();
                let uint = self.uint();
                self.value(
                    &mut code,
                    Op::FunctionCall,
                    uint,
                    &[function, site_id, set, binding, index],
                );
            }
            SiteAction::Texel {
                descriptor,
                texel,
                access,
            } => {
                let [set, binding, index] = self.descriptor_args(&mut code, descriptor);
                let texel = self.to_uint(&mut code, *texel);
                let access = self.uint_constant(*access as u32);
                let function = self.check_texel();
                self.call(
                    &mut code,
                    function,
                    &[site_id, set, binding, index, texel, access],
                );
            }
            SiteAction::Address {
                pointer,
                size,
                access,
            } => {
                let ulong = self.ulong();
                let address = self.value(&mut code, Op::ConvertPtrToU, ulong, &[*pointer]);
                let size = self.uint_constant(*size);
                let access = self.uint_constant(*access as u32);
                let function = self.check_address();
                self.call(&mut code, function, &[site_id, address, size, access]);
            }
            &SiteAction::RayQuery {
                flags,
                origin,
                t_min,
                direction,
                t_max,
            } => {
                let flags = self.info.int_value(flags);
                let flags = self.to_uint(&mut code, flags);
                let function = self.check_ray_query();
                self.call(
                    &mut code,
                    function,
                    &[site_id, flags, origin, t_min, direction, t_max],
                );
            }
        }

        code
    }

    fn descriptor_args(&mut self, code: &mut Code, descriptor: &DescriptorRef) -> [u32; 3] {
        let set = self.uint_constant(descriptor.set);
        let binding = self.uint_constant(descriptor.binding);
        let index = self.to_uint(code, descriptor.index);

        [set, binding, index]
    }

    /// Computes the byte offset of an access as a 32-bit unsigned value. Offsets that do not fit
    /// saturate to `u32::MAX`, which no buffer range contains.
    fn byte_offset(&mut self, code: &mut Code, layout: &AccessLayout) -> u32 {
        let uint = self.uint();
        let bool = self.bool();
        let saturated = self.uint_constant(u32::MAX);
        let mut offset = self.uint_constant(layout.constant_offset);

        for &(index, stride) in &layout.runtime_terms {
            let index = self.to_uint(code, index);
            let max_index = self.uint_constant(u32::MAX / stride.max(1));
            let stride = self.uint_constant(stride);
            let term = self.value(code, Op::IMul, uint, &[index, stride]);
            let sum = self.value(code, Op::IAdd, uint, &[offset, term]);
            let term_overflows = self.value(code, Op::UGreaterThan, bool, &[index, max_index]);
            let sum_overflows = self.value(code, Op::ULessThan, bool, &[sum, offset]);
            let overflows =
                self.value(code, Op::LogicalOr, bool, &[term_overflows, sum_overflows]);
            offset = self.value(code, Op::Select, uint, &[overflows, saturated, sum]);
        }

        offset
    }

    /// Brings `value` to 32 bits. 64-bit values with any of the upper bits set saturate to
    /// `u32::MAX`.
    fn to_uint(&mut self, code: &mut Code, value: IntValue) -> u32 {
        let uint = self.uint();

        match value {
            IntValue::Constant(value) => self.uint_constant(value),
            IntValue::Id {
                id,
                width: 32,
                signed: false,
            } => id,
            IntValue::Id {
                id,
                width: 32,
                signed: true,
            } => self.value(code, Op::Bitcast, uint, &[id]),
            IntValue::Id {
                id,
                width: 64,
                signed,
            } => {
                let long = self.ty(Op::TypeInt, &[64, signed.into()]);
                let bool = self.bool();
                let shift = self.uint_constant(32);
                let zero = self.uint_constant(0);
                let saturated = self.uint_constant(u32::MAX);
                let high = self.value(code, Op::ShiftRightLogical, long, &[id, shift]);
                let high = self.value(code, Op::UConvert, uint, &[high]);
                let low = self.value(code, Op::UConvert, uint, &[id]);
                let truncated = self.value(code, Op::INotEqual, bool, &[high, zero]);

                self.value(code, Op::Select, uint, &[truncated, saturated, low])
            }
            IntValue::Id { id, .. } => self.value(code, Op::UConvert, uint, &[id]),
        }
    }

    // Ids, types and constants.

    #[inline]
    fn fresh(&mut self) -> u32 {
        let id = self.bound;
        self.bound += 1;

        id
    }

    fn value(&mut self, code: &mut Code, op: Op, ty: u32, operands: &[u32]) -> u32 {
        let id = self.fresh();
        let mut all = SmallVec::with_capacity(operands.len() + 2);
        all.push(ty);
        all.push(id);
        all.extend_from_slice(operands);
        code.instructions.push(Instruction {
            opcode: op as u16,
            operands: all,
            offset: None,
        });

        id
    }

    fn call(&mut self, code: &mut Code, function: u32, arguments: &[u32]) {
        let void = self.void();
        let mut operands: SmallVec<[u32; 12]> = smallvec![function];
        operands.extend_from_slice(arguments);
        self.value(code, Op::FunctionCall, void, &operands);
    }

    fn ty(&mut self, op: Op, operands: &[u32]) -> u32 {
        let key = (op as u16, SmallVec::from_slice(operands));

        if let Some(&id) = self.type_ids.get(&key) {
            return id;
        }

        let id = self.fresh();
        let mut all = SmallVec::with_capacity(operands.len() + 1);
        all.push(id);
        all.extend_from_slice(operands);
        self.globals.push(Instruction {
            opcode: op as u16,
            operands: all,
            offset: None,
        });
        self.type_ids.insert(key, id);

        id
    }

    fn void(&mut self) -> u32 {
        self.ty(Op::TypeVoid, &[])
    }

    fn bool(&mut self) -> u32 {
        self.ty(Op::TypeBool, &[])
    }

    fn uint(&mut self) -> u32 {
        self.ty(Op::TypeInt, &[32, 0])
    }

    fn ulong(&mut self) -> u32 {
        self.require_capability(Capability::Int64);
        self.ty(Op::TypeInt, &[64, 0])
    }

    fn float(&mut self) -> u32 {
        self.ty(Op::TypeFloat, &[32])
    }

    fn vector(&mut self, component: u32, count: u32) -> u32 {
        self.ty(Op::TypeVector, &[component, count])
    }

    fn pointer(&mut self, storage_class: StorageClass, pointee: u32) -> u32 {
        self.ty(Op::TypePointer, &[storage_class as u32, pointee])
    }

    fn constant(&mut self, ty: u32, value: u64, words: &[u32]) -> u32 {
        if let Some(&id) = self.constant_ids.get(&(ty, value)) {
            return id;
        }

        let id = self.fresh();
        let mut operands: SmallVec<[u32; 4]> = smallvec![ty, id];
        operands.extend_from_slice(words);
        self.globals.push(Instruction::new(Op::Constant, &operands));
        self.constant_ids.insert((ty, value), id);

        id
    }

    fn uint_constant(&mut self, value: u32) -> u32 {
        let uint = self.uint();
        self.constant(uint, value.into(), &[value])
    }

    fn float_constant(&mut self, value: f32) -> u32 {
        let float = self.float();
        let bits = value.to_bits();
        self.constant(float, bits.into(), &[bits])
    }

    fn bool_constant(&mut self, value: bool) -> u32 {
        let ty = self.bool();

        if let Some(&id) = self.constant_ids.get(&(ty, value.into())) {
            return id;
        }

        let id = self.fresh();
        let op = if value { Op::ConstantTrue } else { Op::ConstantFalse };
        self.globals.push(Instruction::new(op, &[ty, id]));
        self.constant_ids.insert((ty, value.into()), id);

        id
    }

    fn require_capability(&mut self, capability: Capability) {
        let capability = capability as u32;

        if !self.existing_capabilities.contains(&capability) && !self.capabilities.contains(&capability)
        {
            self.capabilities.push(capability);
        }
    }

    fn decorate(&mut self, target: u32, decoration: Decoration, operands: &[u32]) {
        let mut all: SmallVec<[u32; 4]> = smallvec![target, decoration as u32];
        all.extend_from_slice(operands);
        self.annotations.push(Instruction::new(Op::Decorate, &all));
    }

    // Globals.

    /// Returns the pointer type of the validator's buffers, `struct { uint words[]; }`.
    fn buffer_pointer(&mut self) -> u32 {
        if let Some(pointer) = self.buffer_pointer {
            return pointer;
        }

        let uint = self.uint();
        let words = self.fresh();
        self.globals
            .push(Instruction::new(Op::TypeRuntimeArray, &[words, uint]));
        self.decorate(words, Decoration::ArrayStride, &[4]);

        let block = self.fresh();
        self.globals.push(Instruction::new(Op::TypeStruct, &[block, words]));
        self.decorate(block, Decoration::Block, &[]);
        self.annotations.push(Instruction::new(
            Op::MemberDecorate,
            &[block, 0, Decoration::Offset as u32, 0],
        ));

        let pointer = self.pointer(StorageClass::StorageBuffer, block);
        self.buffer_pointer = Some(pointer);

        pointer
    }

    /// Returns the variable of the validator's buffer at `binding`.
    fn buffer(&mut self, binding: u32) -> u32 {
        if let Some(variable) = self.buffers[binding as usize] {
            return variable;
        }

        let pointer = self.buffer_pointer();
        let variable = self.fresh();
        self.globals.push(Instruction::new(
            Op::Variable,
            &[pointer, variable, StorageClass::StorageBuffer as u32],
        ));
        self.decorate(variable, Decoration::DescriptorSet, &[self.reserved_set]);
        self.decorate(variable, Decoration::Binding, &[binding]);

        if self.version >= VERSION_1_4 {
            self.interface.push(variable);
        }

        self.buffers[binding as usize] = Some(variable);

        variable
    }

    /// Returns the `Private` flag that records whether the invocation already reported.
    fn reported(&mut self) -> u32 {
        if let Some(variable) = self.reported {
            return variable;
        }

        let bool = self.bool();
        let pointer = self.pointer(StorageClass::Private, bool);
        let initializer = self.bool_constant(false);
        let variable = self.fresh();
        self.globals.push(Instruction::new(
            Op::Variable,
            &[pointer, variable, StorageClass::Private as u32, initializer],
        ));

        if self.version >= VERSION_1_4 {
            self.interface.push(variable);
        }

        self.reported = Some(variable);

        variable
    }

    /// Loads the built-in input `builtin` and returns its components converted to `uint`.
    /// The variable is declared, as `count` components of `scalar`, if the module doesn't
    /// already have one.
    fn builtin_components(
        &mut self,
        code: &mut Code,
        builtin: BuiltIn,
        scalar: Scalar,
        count: u32,
    ) -> SmallVec<[u32; 4]> {
        let info = self.info;
        let existing = info
            .decorations
            .builtin
            .iter()
            .filter(|&(target, &value)| {
                value == builtin as u32
                    && info.globals.get(target).is_some_and(|global| {
                        global.storage_class == StorageClass::Input as u32
                    })
            })
            .map(|(&target, _)| target)
            .min();

        let (variable, pointee, component, scalar, count) = match existing {
            Some(variable) => {
                let pointee = info.globals[&variable].pointee;
                let (component, count) = match info.ty(pointee) {
                    Some(&Type::Vector { component, count }) => (component, count),
                    _ => (pointee, 1),
                };
                let scalar = match info.ty(component) {
                    Some(&Type::Int { signed: true, .. }) => Scalar::Signed,
                    Some(Type::Int { .. }) => Scalar::Unsigned,
                    Some(Type::Float { .. }) => Scalar::Float,
                    _ => return SmallVec::new(),
                };

                (variable, pointee, component, scalar, count)
            }
            None => {
                let component = match scalar {
                    Scalar::Unsigned => self.uint(),
                    Scalar::Signed => self.ty(Op::TypeInt, &[32, 1]),
                    Scalar::Float => self.float(),
                };
                let pointee = if count > 1 {
                    self.vector(component, count)
                } else {
                    component
                };
                let pointer = self.pointer(StorageClass::Input, pointee);
                let variable = self.fresh();
                self.globals.push(Instruction::new(
                    Op::Variable,
                    &[pointer, variable, StorageClass::Input as u32],
                ));
                self.decorate(variable, Decoration::BuiltIn, &[builtin as u32]);

                (variable, pointee, component, scalar, count)
            }
        };

        // Inputs belong in the interface whatever the version.
        if !self.interface.contains(&variable) {
            self.interface.push(variable);
        }

        let uint = self.uint();
        let value = self.value(code, Op::Load, pointee, &[variable]);

        (0..count)
            .map(|index| {
                let component_value = if count > 1 {
                    self.value(code, Op::CompositeExtract, component, &[value, index])
                } else {
                    value
                };

                match scalar {
                    Scalar::Unsigned => component_value,
                    Scalar::Signed => self.value(code, Op::Bitcast, uint, &[component_value]),
                    Scalar::Float => self.value(code, Op::ConvertFToU, uint, &[component_value]),
                }
            })
            .collect()
    }

    fn invocation_words(&mut self, code: &mut Code) -> [u32; 3] {
        let zero = self.uint_constant(0);

        let components = match self.invocation {
            InvocationSource::Vector(builtin) => {
                self.builtin_components(code, builtin, Scalar::Unsigned, 3)
            }
            InvocationSource::Vertex => {
                let mut components =
                    self.builtin_components(code, BuiltIn::VertexIndex, Scalar::Unsigned, 1);
                components.extend(self.builtin_components(
                    code,
                    BuiltIn::InstanceIndex,
                    Scalar::Unsigned,
                    1,
                ));
                components
            }
            InvocationSource::Fragment => {
                let mut components =
                    self.builtin_components(code, BuiltIn::FragCoord, Scalar::Float, 4);
                components.truncate(2);
                components
            }
            InvocationSource::None => SmallVec::new(),
        };

        let mut words = [zero; 3];

        for (word, component) in words.iter_mut().zip(components) {
            *word = component;
        }

        words
    }

    // Helper functions.

    /// Starts a function, returning its id and the ids of its parameters.
    fn begin_function(
        &mut self,
        code: &mut Code,
        return_type: u32,
        parameters: &[u32],
    ) -> (u32, SmallVec<[u32; 12]>) {
        let mut signature: SmallVec<[u32; 12]> = smallvec![return_type];
        signature.extend_from_slice(parameters);
        let function_type = self.ty(Op::TypeFunction, &signature);

        let function = self.fresh();
        code.push(Op::Function, &[return_type, function, 0, function_type]);
        let parameters = parameters
            .iter()
            .map(|&ty| self.value(code, Op::FunctionParameter, ty, &[]))
            .collect();
        let entry = self.fresh();
        code.push(Op::Label, &[entry]);

        (function, parameters)
    }

    fn end_function(&mut self, mut code: Code) {
        code.push(Op::FunctionEnd, &[]);
        self.functions.push(Function {
            instructions: code.instructions,
        });
    }

    /// Continues in a new block if `condition` holds. Otherwise runs `bail`, which must end the
    /// block with a return.
    fn guard(&mut self, code: &mut Code, condition: u32, bail: impl FnOnce(&mut Self, &mut Code)) {
        let merge = self.fresh();
        let fail = self.fresh();
        code.push(Op::SelectionMerge, &[merge, 0]);
        code.push(Op::BranchConditional, &[condition, merge, fail]);
        code.push(Op::Label, &[fail]);
        bail(self, code);
        code.push(Op::Label, &[merge]);
    }

    fn load_word(&mut self, code: &mut Code, buffer: u32, index: u32) -> u32 {
        let uint = self.uint();
        let pointer = self.word_pointer(code, buffer, index);

        self.value(code, Op::Load, uint, &[pointer])
    }

    fn word_pointer(&mut self, code: &mut Code, buffer: u32, index: u32) -> u32 {
        let uint = self.uint();
        let pointer = self.pointer(StorageClass::StorageBuffer, uint);
        let zero = self.uint_constant(0);

        self.value(code, Op::AccessChain, pointer, &[buffer, zero, index])
    }

    fn report_call(
        &mut self,
        code: &mut Code,
        site: u32,
        kind: ErrorKind,
        flags: u32,
        operands: &[u32],
    ) {
        let report = self.report();
        let kind = self.uint_constant(kind as u32);
        let flags = self.uint_constant(flags);
        let zero = self.uint_constant(0);

        let mut arguments: SmallVec<[u32; 12]> = smallvec![site, kind, flags];
        arguments.extend(
            operands
                .iter()
                .copied()
                .chain(std::iter::repeat(zero))
                .take(REPORT_OPERANDS),
        );
        self.call(code, report, &arguments);
    }

    /// `void report(uint site, uint kind, uint flags, uint o0, .., uint o6)`
    fn report(&mut self) -> u32 {
        if let Some(function) = self.helpers.report {
            return function;
        }

        let mut code = Code::default();
        let void = self.void();
        let uint = self.uint();
        let bool = self.bool();
        let parameter_types = [uint; 3 + REPORT_OPERANDS];
        let (function, parameters) = self.begin_function(&mut code, void, &parameter_types);
        self.helpers.report = Some(function);

        let [site, kind, flags] = [parameters[0], parameters[1], parameters[2]];
        let operands = &parameters[3..];

        let reported = self.reported();
        let log = self.buffer(binding::ERROR_LOG);
        let zero = self.uint_constant(0);
        let one = self.uint_constant(1);
        let header_words = self.uint_constant(LOG_HEADER_WORDS);
        let record_words = self.uint_constant(RECORD_WORDS);
        let true_ = self.bool_constant(true);
        let scope = if self.info.memory_model == MemoryModel::Vulkan as u32 {
            Scope::QueueFamily
        } else {
            Scope::Device
        };
        let scope = self.uint_constant(scope as u32);

        let done = self.fresh();
        let write = self.fresh();
        let already = self.value(&mut code, Op::Load, bool, &[reported]);
        code.push(Op::SelectionMerge, &[done, 0]);
        code.push(Op::BranchConditional, &[already, done, write]);

        code.push(Op::Label, &[write]);
        code.push(Op::Store, &[reported, true_]);
        let count = self.word_pointer(&mut code, log, zero);
        let slot = self.value(&mut code, Op::AtomicIAdd, uint, &[count, scope, zero, one]);
        let length = self.value(&mut code, Op::ArrayLength, uint, &[log, 0]);
        let record_space = self.value(&mut code, Op::ISub, uint, &[length, header_words]);
        let capacity = self.value(&mut code, Op::UDiv, uint, &[record_space, record_words]);
        let fits = self.value(&mut code, Op::ULessThan, bool, &[slot, capacity]);
        let written = self.fresh();
        let store = self.fresh();
        code.push(Op::SelectionMerge, &[written, 0]);
        code.push(Op::BranchConditional, &[fits, store, written]);

        code.push(Op::Label, &[store]);
        let record_offset = self.value(&mut code, Op::IMul, uint, &[slot, record_words]);
        let base = self.value(&mut code, Op::IAdd, uint, &[header_words, record_offset]);
        let shader_id = self.uint_constant(self.shader_id);
        let stage = self.uint_constant(self.stage);
        let [x, y, z] = self.invocation_words(&mut code);

        let mut words: SmallVec<[u32; 16]> = smallvec![shader_id, kind, site, stage, x, y, z, flags];
        words.extend_from_slice(operands);
        words.push(zero);

        for (index, word) in words.into_iter().enumerate() {
            let index = self.uint_constant(index as u32);
            let word_index = self.value(&mut code, Op::IAdd, uint, &[base, index]);
            let pointer = self.word_pointer(&mut code, log, word_index);
            code.push(Op::Store, &[pointer, word]);
        }

        code.push(Op::Branch, &[written]);
        code.push(Op::Label, &[written]);
        code.push(Op::Branch, &[done]);
        code.push(Op::Label, &[done]);
        code.push(Op::Return, &[]);
        self.end_function(code);

        function
    }

    /// `uint lookup(uint site, uint set, uint binding, uint index)`
    fn lookup(&mut self) -> u32 {
        if let Some(function) = self.helpers.lookup {
            return function;
        }

        let mut code = Code::default();
        let uint = self.uint();
        let bool = self.bool();
        let (function, parameters) = self.begin_function(&mut code, uint, &[uint; 4]);
        self.helpers.lookup = Some(function);

        let [site, set, binding, index] = [parameters[0], parameters[1], parameters[2], parameters[3]];
        let table = self.buffer(binding::BINDING_TABLE);
        let heap = self.buffer(binding::DESCRIPTOR_HEAP);
        let zero = self.uint_constant(0);
        let one = self.uint_constant(1);
        let two = self.uint_constant(2);
        let entry_words = self.uint_constant(HEAP_ENTRY_WORDS);
        let report_invalid = self.checks.intersects(CheckCategories::DESCRIPTOR_VALIDITY);

        let untracked = |_: &mut Self, code: &mut Code| {
            code.push(Op::ReturnValue, &[zero]);
        };
        let invalid = |kind: ErrorKind, flags: u32, extra: Option<u32>| {
            move |emitter: &mut Self, code: &mut Code| {
                if report_invalid {
                    let mut operands: SmallVec<[u32; 4]> = smallvec![set, binding, index];
                    operands.extend(extra);
                    emitter.report_call(code, site, kind, flags, &operands);
                }

                code.push(Op::ReturnValue, &[zero]);
            }
        };

        let set_count = self.load_word(&mut code, table, zero);
        let in_range = self.value(&mut code, Op::ULessThan, bool, &[set, set_count]);
        self.guard(&mut code, in_range, untracked);

        let set_entry = self.value(&mut code, Op::IAdd, uint, &[set, one]);
        let set_offset = self.load_word(&mut code, table, set_entry);
        let tracked = self.value(&mut code, Op::INotEqual, bool, &[set_offset, zero]);
        self.guard(&mut code, tracked, untracked);

        let binding_count = self.load_word(&mut code, table, set_offset);
        let in_range = self.value(&mut code, Op::ULessThan, bool, &[binding, binding_count]);
        self.guard(&mut code, in_range, untracked);

        let bindings = self.value(&mut code, Op::IAdd, uint, &[set_offset, one]);
        let binding_entry = self.value(&mut code, Op::IAdd, uint, &[bindings, binding]);
        let array_offset = self.load_word(&mut code, table, binding_entry);
        let tracked = self.value(&mut code, Op::INotEqual, bool, &[array_offset, zero]);
        self.guard(&mut code, tracked, untracked);

        let descriptor_count = self.load_word(&mut code, table, array_offset);
        let in_range = self.value(&mut code, Op::ULessThan, bool, &[index, descriptor_count]);
        self.guard(
            &mut code,
            in_range,
            invalid(
                ErrorKind::DescriptorIndexOutOfBounds,
                FLAG_OUT_OF_BOUNDS,
                Some(descriptor_count),
            ),
        );

        let element_offset = self.value(&mut code, Op::IMul, uint, &[index, two]);
        let element_offset = self.value(&mut code, Op::IAdd, uint, &[element_offset, one]);
        let element = self.value(&mut code, Op::IAdd, uint, &[array_offset, element_offset]);
        let slot = self.load_word(&mut code, table, element);
        let tag_index = self.value(&mut code, Op::IAdd, uint, &[element, one]);
        let tag = self.load_word(&mut code, table, tag_index);
        let written = self.value(&mut code, Op::INotEqual, bool, &[slot, zero]);
        self.guard(
            &mut code,
            written,
            invalid(ErrorKind::DescriptorUninitialized, 0, None),
        );

        let slot_index = self.value(&mut code, Op::ISub, uint, &[slot, one]);
        let entry = self.value(&mut code, Op::IMul, uint, &[slot_index, entry_words]);
        let state = self.load_word(&mut code, heap, entry);
        let valid_bit = self.value(&mut code, Op::BitwiseAnd, uint, &[state, one]);
        let valid = self.value(&mut code, Op::INotEqual, bool, &[valid_bit, zero]);
        self.guard(
            &mut code,
            valid,
            invalid(ErrorKind::DescriptorDestroyed, 0, None),
        );

        let generation = self.value(&mut code, Op::ShiftRightLogical, uint, &[state, one]);
        let current = self.value(&mut code, Op::IEqual, bool, &[generation, tag]);
        self.guard(
            &mut code,
            current,
            invalid(ErrorKind::DescriptorStale, 0, None),
        );

        code.push(Op::ReturnValue, &[slot]);
        self.end_function(code);

        function
    }

    /// Calls `lookup` and returns the word offset of the heap entry it found. Returns from the
    /// function being generated if there is none.
    fn lookup_entry(&mut self, code: &mut Code, arguments: [u32; 4]) -> u32 {
        let uint = self.uint();
        let bool = self.bool();
        let zero = self.uint_constant(0);
        let one = self.uint_constant(1);
        let entry_words = self.uint_constant(HEAP_ENTRY_WORDS);
        let lookup = self.lookup();

        let [site, set, binding, index] = arguments;
        let slot = self.value(code, Op::FunctionCall, uint, &[lookup, site, set, binding, index]);
        let found = self.value(code, Op::INotEqual, bool, &[slot, zero]);
        self.guard(code, found, |_, code| code.push(Op::Return, &[]));

        let slot_index = self.value(code, Op::ISub, uint, &[slot, one]);

        self.value(code, Op::IMul, uint, &[slot_index, entry_words])
    }

    /// `void check_buffer(uint site, uint set, uint binding, uint index, uint offset,
    /// uint size, uint access)`
    fn check_buffer(&mut self) -> u32 {
        if let Some(function) = self.helpers.check_buffer {
            return function;
        }

        let mut code = Code::default();
        let void = self.void();
        let uint = self.uint();
        let bool = self.bool();
        let (function, parameters) = self.begin_function(&mut code, void, &[uint; 7]);
        self.helpers.check_buffer = Some(function);

        let [site, set, binding, index, offset, size, access] = [
            parameters[0],
            parameters[1],
            parameters[2],
            parameters[3],
            parameters[4],
            parameters[5],
            parameters[6],
        ];
        let heap = self.buffer(binding::DESCRIPTOR_HEAP);
        let size_word = self.uint_constant(heap_word::SIZE);

        let entry = self.lookup_entry(&mut code, [site, set, binding, index]);
        let bound_index = self.value(&mut code, Op::IAdd, uint, &[entry, size_word]);
        let bound = self.load_word(&mut code, heap, bound_index);

        // `offset + size > bound`, without overflowing.
        let past_end = self.value(&mut code, Op::UGreaterThan, bool, &[offset, bound]);
        let room = self.value(&mut code, Op::ISub, uint, &[bound, offset]);
        let too_large = self.value(&mut code, Op::UGreaterThan, bool, &[size, room]);
        let out_of_bounds = self.value(&mut code, Op::LogicalOr, bool, &[past_end, too_large]);
        let in_bounds = self.value(&mut code, Op::LogicalNot, bool, &[out_of_bounds]);
        self.guard(&mut code, in_bounds, |emitter, code| {
            emitter.report_call(
                code,
                site,
                ErrorKind::BufferOutOfBounds,
                FLAG_OUT_OF_BOUNDS,
                &[set, binding, index, offset, size, bound, access],
            );
            code.push(Op::Return, &[]);
        });

        code.push(Op::Return, &[]);
        self.end_function(code);

        function
    }

    /// `void check_texel(uint site, uint set, uint binding, uint index, uint texel,
    /// uint access)`
    fn check_texel(&mut self) -> u32 {
        if let Some(function) = self.helpers.check_texel {
            return function;
        }

        let mut code = Code::default();
        let void = self.void();
        let uint = self.uint();
        let bool = self.bool();
        let (function, parameters) = self.begin_function(&mut code, void, &[uint; 6]);
        self.helpers.check_texel = Some(function);

        let [site, set, binding, index, texel, access] = [
            parameters[0],
            parameters[1],
            parameters[2],
            parameters[3],
            parameters[4],
            parameters[5],
        ];
        let heap = self.buffer(binding::DESCRIPTOR_HEAP);
        let size_word = self.uint_constant(heap_word::SIZE);

        let entry = self.lookup_entry(&mut code, [site, set, binding, index]);
        let count_index = self.value(&mut code, Op::IAdd, uint, &[entry, size_word]);
        let texel_count = self.load_word(&mut code, heap, count_index);
        let in_bounds = self.value(&mut code, Op::ULessThan, bool, &[texel, texel_count]);
        self.guard(&mut code, in_bounds, |emitter, code| {
            emitter.report_call(
                code,
                site,
                ErrorKind::TexelBufferOutOfBounds,
                FLAG_OUT_OF_BOUNDS,
                &[set, binding, index, texel, texel_count, access],
            );
            code.push(Op::Return, &[]);
        });

        code.push(Op::Return, &[]);
        self.end_function(code);

        function
    }

    /// `void check_address(uint site, ulong address, uint size, uint access)`
    fn check_address(&mut self) -> u32 {
        if let Some(function) = self.helpers.check_address {
            return function;
        }

        let mut code = Code::default();
        let void = self.void();
        let uint = self.uint();
        let ulong = self.ulong();
        let bool = self.bool();
        let (function, parameters) =
            self.begin_function(&mut code, void, &[uint, ulong, uint, uint]);
        self.helpers.check_address = Some(function);

        let [site, address, size, access] = [parameters[0], parameters[1], parameters[2], parameters[3]];
        let table = self.buffer(binding::ADDRESS_TABLE);
        let zero = self.uint_constant(0);
        let one = self.uint_constant(1);
        let thirty_two = self.uint_constant(32);
        let entry_words = self.uint_constant(ADDRESS_ENTRY_WORDS);
        let false_ = self.bool_constant(false);
        let entry_label = code
            .instructions
            .last()
            .and_then(|inst| inst.operand(0))
            .unwrap_or_default();

        let count = self.load_word(&mut code, table, zero);
        let size_long = self.value(&mut code, Op::UConvert, ulong, &[size]);
        let end = self.value(&mut code, Op::IAdd, ulong, &[address, size_long]);

        let header = self.fresh();
        let condition = self.fresh();
        let body = self.fresh();
        let continue_ = self.fresh();
        let merge = self.fresh();
        let index = self.fresh();
        let found = self.fresh();
        let next_index = self.fresh();
        let next_found = self.fresh();
        code.push(Op::Branch, &[header]);

        code.push(Op::Label, &[header]);
        code.push(Op::Phi, &[uint, index, zero, entry_label, next_index, continue_]);
        code.push(Op::Phi, &[bool, found, false_, entry_label, next_found, continue_]);
        code.push(Op::LoopMerge, &[merge, continue_, 0]);
        code.push(Op::Branch, &[condition]);

        code.push(Op::Label, &[condition]);
        let more = self.value(&mut code, Op::ULessThan, bool, &[index, count]);
        code.push(Op::BranchConditional, &[more, body, merge]);

        code.push(Op::Label, &[body]);
        let entry_offset = self.value(&mut code, Op::IMul, uint, &[index, entry_words]);
        let entry = self.value(&mut code, Op::IAdd, uint, &[entry_offset, one]);
        let mut words = [0; 4];

        for (word, offset) in words.iter_mut().zip(0..) {
            let offset = self.uint_constant(offset);
            let word_index = self.value(&mut code, Op::IAdd, uint, &[entry, offset]);
            let value = self.load_word(&mut code, table, word_index);
            *word = self.value(&mut code, Op::UConvert, ulong, &[value]);
        }

        let [start_low, start_high, end_low, end_high] = words;
        let start_high = self.value(&mut code, Op::ShiftLeftLogical, ulong, &[start_high, thirty_two]);
        let start = self.value(&mut code, Op::BitwiseOr, ulong, &[start_low, start_high]);
        let end_high = self.value(&mut code, Op::ShiftLeftLogical, ulong, &[end_high, thirty_two]);
        let range_end = self.value(&mut code, Op::BitwiseOr, ulong, &[end_low, end_high]);
        let after_start = self.value(&mut code, Op::UGreaterThanEqual, bool, &[address, start]);
        let before_end = self.value(&mut code, Op::ULessThanEqual, bool, &[end, range_end]);
        let hit = self.value(&mut code, Op::LogicalAnd, bool, &[after_start, before_end]);
        code.push(Op::LogicalOr, &[bool, next_found, found, hit]);
        code.push(Op::Branch, &[continue_]);

        code.push(Op::Label, &[continue_]);
        code.push(Op::IAdd, &[uint, next_index, index, one]);
        code.push(Op::Branch, &[header]);

        code.push(Op::Label, &[merge]);
        self.guard(&mut code, found, |emitter, code| {
            let low = emitter.value(code, Op::UConvert, uint, &[address]);
            let shifted = emitter.value(code, Op::ShiftRightLogical, ulong, &[address, thirty_two]);
            let high = emitter.value(code, Op::UConvert, uint, &[shifted]);
            emitter.report_call(
                code,
                site,
                ErrorKind::BufferAddressOutOfBounds,
                FLAG_OUT_OF_BOUNDS,
                &[low, high, size, access],
            );
            code.push(Op::Return, &[]);
        });

        code.push(Op::Return, &[]);
        self.end_function(code);

        function
    }

    /// `void check_ray_query(uint site, uint flags, vec3 origin, float t_min, vec3 direction,
    /// float t_max)`
    fn check_ray_query(&mut self) -> u32 {
        if let Some(function) = self.helpers.check_ray_query {
            return function;
        }

        let mut code = Code::default();
        let void = self.void();
        let uint = self.uint();
        let bool = self.bool();
        let float = self.float();
        let vec3 = self.vector(float, 3);
        let bvec3 = self.vector(bool, 3);
        let (function, parameters) =
            self.begin_function(&mut code, void, &[uint, uint, vec3, float, vec3, float]);
        self.helpers.check_ray_query = Some(function);

        let [site, flags, origin, t_min, direction, t_max] = [
            parameters[0],
            parameters[1],
            parameters[2],
            parameters[3],
            parameters[4],
            parameters[5],
        ];
        let zero = self.float_constant(0.0);
        let one = self.uint_constant(1);

        let reject = |emitter: &mut Self, code: &mut Code, bad: u32, kind: ErrorKind, operands: &[u32]| {
            let good = emitter.value(code, Op::LogicalNot, bool, &[bad]);
            emitter.guard(code, good, |emitter, code| {
                emitter.report_call(code, site, kind, 0, operands);
                code.push(Op::Return, &[]);
            });
        };

        for (vector, kind) in [
            (origin, ErrorKind::RayQueryNonFiniteOrigin),
            (direction, ErrorKind::RayQueryNonFiniteDirection),
        ] {
            let nan = self.value(&mut code, Op::IsNan, bvec3, &[vector]);
            let inf = self.value(&mut code, Op::IsInf, bvec3, &[vector]);
            let non_finite = self.value(&mut code, Op::LogicalOr, bvec3, &[nan, inf]);
            let any = self.value(&mut code, Op::Any, bool, &[non_finite]);
            reject(self, &mut code, any, kind, &[flags]);
        }

        let t_min_bits = self.value(&mut code, Op::Bitcast, uint, &[t_min]);
        let negative = self.value(&mut code, Op::FOrdLessThan, bool, &[t_min, zero]);
        reject(self, &mut code, negative, ErrorKind::RayQueryNegativeTMin, &[t_min_bits]);

        let t_max_bits = self.value(&mut code, Op::Bitcast, uint, &[t_max]);
        let reversed = self.value(&mut code, Op::FOrdLessThan, bool, &[t_max, t_min]);
        reject(
            self,
            &mut code,
            reversed,
            ErrorKind::RayQueryTMaxLessThanTMin,
            &[t_min_bits, t_max_bits],
        );

        // At most one of the opaque flags, and not both flags of a culling or skipping pair.
        let opaque_mask = self.uint_constant(0xC3);
        let cull_mask = self.uint_constant(0x30);
        let skip_mask = self.uint_constant(0x300);
        let opaque = self.value(&mut code, Op::BitwiseAnd, uint, &[flags, opaque_mask]);
        let opaque_count = self.value(&mut code, Op::BitCount, uint, &[opaque]);
        let many_opaque = self.value(&mut code, Op::UGreaterThan, bool, &[opaque_count, one]);
        let cull = self.value(&mut code, Op::BitwiseAnd, uint, &[flags, cull_mask]);
        let both_cull = self.value(&mut code, Op::IEqual, bool, &[cull, cull_mask]);
        let skip = self.value(&mut code, Op::BitwiseAnd, uint, &[flags, skip_mask]);
        let both_skip = self.value(&mut code, Op::IEqual, bool, &[skip, skip_mask]);
        let pairs = self.value(&mut code, Op::LogicalOr, bool, &[both_cull, both_skip]);
        let conflict = self.value(&mut code, Op::LogicalOr, bool, &[many_opaque, pairs]);
        reject(self, &mut code, conflict, ErrorKind::RayQueryConflictingFlags, &[flags]);

        code.push(Op::Return, &[]);
        self.end_function(code);

        function
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instrument::{instrument, module::Module},
        tests::Assembler,
    };

    fn instrumented(checks: CheckCategories) -> Module {
        let words = Assembler::compute_store_shader(25);
        let options = InstrumentOptions {
            checks,
            ..Default::default()
        };

        Module::parse(&instrument(&words, &options).unwrap().binary).unwrap()
    }

    fn decorated_bindings(module: &Module, set: u32) -> Vec<u32> {
        let in_set: Vec<u32> = module
            .annotations
            .iter()
            .filter(|inst| {
                inst.is(Op::Decorate)
                    && inst.operand(1) == Some(Decoration::DescriptorSet as u32)
                    && inst.operand(2) == Some(set)
            })
            .filter_map(|inst| inst.operand(0))
            .collect();

        let mut bindings: Vec<u32> = module
            .annotations
            .iter()
            .filter(|inst| {
                inst.is(Op::Decorate)
                    && inst.operand(1) == Some(Decoration::Binding as u32)
                    && inst.operand(0).is_some_and(|target| in_set.contains(&target))
            })
            .filter_map(|inst| inst.operand(2))
            .collect();
        bindings.sort_unstable();

        bindings
    }

    #[test]
    fn binds_validator_buffers_at_reserved_set() {
        let module = instrumented(CheckCategories::all());

        assert_eq!(
            decorated_bindings(&module, 3),
            [binding::ERROR_LOG, binding::DESCRIPTOR_HEAP, binding::BINDING_TABLE],
        );

        // SPIR-V 1.0 needs the extension for the `StorageBuffer` storage class.
        assert!(module.extensions.iter().any(|inst| {
            decode_string(&inst.operands)
                .is_some_and(|(name, _)| name == STORAGE_BUFFER_EXTENSION)
        }));
    }

    #[test]
    fn inserts_one_call_before_the_store() {
        let module = instrumented(CheckCategories::all());
        let main = &module.functions[0];
        let store = main
            .instructions
            .iter()
            .position(|inst| inst.is(Op::Store) && inst.offset.is_some())
            .unwrap();
        let calls: Vec<_> = main.instructions[..store]
            .iter()
            .filter(|inst| inst.is(Op::FunctionCall))
            .collect();

        assert_eq!(calls.len(), 1);
        // Nothing but the call and its operands were added: no new blocks.
        assert_eq!(
            main.instructions
                .iter()
                .filter(|inst| inst.is(Op::Label))
                .count(),
            1,
        );
    }

    #[test]
    fn shares_existing_types() {
        let module = instrumented(CheckCategories::all());
        let uint_count = module
            .globals
            .iter()
            .filter(|inst| inst.is(Op::TypeInt) && inst.operands[1..] == [32, 0])
            .count();

        assert_eq!(uint_count, 1);
    }

    #[test]
    fn invocation_id_is_read_from_existing_builtin() {
        let module = instrumented(CheckCategories::all());
        let builtins = module
            .annotations
            .iter()
            .filter(|inst| {
                inst.is(Op::Decorate) && inst.operand(1) == Some(Decoration::BuiltIn as u32)
            })
            .count();

        assert_eq!(builtins, 1);
    }

    fn instrumented_with(words: &[u32], options: &InstrumentOptions) -> Module {
        Module::parse(&instrument(words, options).unwrap().binary).unwrap()
    }

    fn calls_in_main(module: &Module) -> usize {
        module.functions[0]
            .instructions
            .iter()
            .filter(|inst| inst.is(Op::FunctionCall))
            .count()
    }

    #[test]
    fn runtime_offsets_saturate() {
        let words = Assembler::compute_indexed_store_shader();
        let module = instrumented_with(&words, &InstrumentOptions::default());
        let main = &module.functions[0];
        let store = main
            .instructions
            .iter()
            .position(|inst| inst.is(Op::Store) && inst.offset.is_some())
            .unwrap();
        let before = &main.instructions[..store];

        for op in [Op::IMul, Op::UGreaterThan, Op::ULessThan, Op::Select] {
            assert!(before.iter().any(|inst| inst.is(op)), "no {op:?} before the store");
        }

        // The largest index that does not overflow a stride of 4.
        let max_index = module
            .globals
            .iter()
            .filter(|inst| inst.is(Op::Constant))
            .any(|inst| inst.operands[2..] == [u32::MAX / 4]);
        assert!(max_index);
    }

    #[test]
    fn wide_indices_saturate() {
        let words = Assembler::compute_store_shader(25);
        let module = Module::parse(&words).unwrap();
        let info = ModuleInfo::analyze(&module);
        let options = InstrumentOptions::default();
        let mut emitter = Emitter::new(&module, &info, &options, 1);
        let mut code = Code::default();
        let index = IntValue::Id {
            id: 1000,
            width: 64,
            signed: false,
        };

        let result = emitter.to_uint(&mut code, index);

        let ops: Vec<_> = code.instructions.iter().filter_map(Instruction::op).collect();
        assert_eq!(
            ops,
            [
                Op::ShiftRightLogical,
                Op::UConvert,
                Op::UConvert,
                Op::INotEqual,
                Op::Select,
            ],
        );
        let select = code.instructions.last().unwrap();
        assert_eq!(select.result_id(), Some(result));
        let low = code.instructions[2].result_id().unwrap();
        assert_eq!(select.operand(4), Some(low));

        // Narrower indices are converted directly.
        let mut code = Code::default();
        let index = IntValue::Id {
            id: 1000,
            width: 16,
            signed: false,
        };
        emitter.to_uint(&mut code, index);
        assert_eq!(code.instructions.len(), 1);
        assert!(code.instructions[0].is(Op::UConvert));
    }

    #[test]
    fn texel_and_descriptor_sites_get_one_call_each() {
        let words = Assembler::texel_buffer_shader();
        let module = instrumented_with(&words, &InstrumentOptions::default());

        assert_eq!(calls_in_main(&module), 6);
        assert_eq!(
            decorated_bindings(&module, 3),
            [binding::ERROR_LOG, binding::DESCRIPTOR_HEAP, binding::BINDING_TABLE],
        );
    }

    #[test]
    fn buffer_addresses_are_checked_as_64_bit_values() {
        let words = Assembler::buffer_address_shader();
        let options = InstrumentOptions {
            shader_int64: true,
            ..Default::default()
        };
        let module = instrumented_with(&words, &options);

        assert_eq!(calls_in_main(&module), 2);
        let conversions = module.functions[0]
            .instructions
            .iter()
            .filter(|inst| inst.is(Op::ConvertPtrToU))
            .count();
        assert_eq!(conversions, 2);
        assert!(decorated_bindings(&module, 3).contains(&binding::ADDRESS_TABLE));
        // SPIR-V 1.5 has the `StorageBuffer` storage class in core.
        assert!(!module.extensions.iter().any(|inst| {
            decode_string(&inst.operands)
                .is_some_and(|(name, _)| name == STORAGE_BUFFER_EXTENSION)
        }));
    }

    #[test]
    fn ray_query_is_checked_before_initialization() {
        let words = Assembler::ray_query_shader();
        let module = instrumented_with(&words, &InstrumentOptions::default());
        let main = &module.functions[0];
        let initialize = main
            .instructions
            .iter()
            .position(|inst| inst.is(Op::RayQueryInitializeKHR))
            .unwrap();
        let call = main.instructions[..initialize]
            .iter()
            .rposition(|inst| inst.is(Op::FunctionCall))
            .unwrap();

        assert_eq!(calls_in_main(&module), 2);
        // The arguments after the site id are the ray's parameters, passed as they are.
        let original = Module::parse(&words).unwrap();
        let ray = &original.functions[0]
            .instructions
            .iter()
            .find(|inst| inst.is(Op::RayQueryInitializeKHR))
            .unwrap()
            .operands;
        let arguments = &main.instructions[call].operands;
        assert_eq!(arguments[arguments.len() - 4..], [ray[4], ray[5], ray[6], ray[7]]);
    }
}
