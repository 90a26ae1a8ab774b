use super::module::{decode_string, defines_type, Instruction, Module};
use crate::shader::{EntryPointInfo, ShaderStage};
use foldhash::{HashMap, HashSet};
use smallvec::SmallVec;
use spirv::{Decoration, Op, StorageClass};

/// A type, as far as the rewriter needs to know it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum Type {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, count: u32 },
    Image { dim: u32 },
    Sampler,
    SampledImage { image: u32 },
    Array { element: u32, length: Option<u64> },
    RuntimeArray { element: u32 },
    Struct { members: SmallVec<[u32; 8]> },
    Pointer { storage_class: u32, pointee: u32 },
    AccelerationStructure,
    Other,
}

/// How a matrix, or a vector taken out of one, is laid out in memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) struct MatrixLayout {
    pub(super) stride: Option<u32>,
    pub(super) row_major: bool,
}

#[derive(Debug, Default)]
pub(super) struct Decorations {
    pub(super) descriptor_set: HashMap<u32, u32>,
    pub(super) binding: HashMap<u32, u32>,
    pub(super) builtin: HashMap<u32, u32>,
    pub(super) array_stride: HashMap<u32, u32>,
    pub(super) block: HashSet<u32>,
    pub(super) buffer_block: HashSet<u32>,
    pub(super) member_offset: HashMap<(u32, u32), u32>,
    pub(super) member_matrix: HashMap<(u32, u32), MatrixLayout>,
    pub(super) has_groups: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct GlobalVariable {
    pub(super) storage_class: u32,
    pub(super) pointee: u32,
}

/// A runtime integer the rewriter can feed into its arithmetic, with what is needed to bring it
/// to a 32-bit unsigned value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum IntValue {
    Constant(u32),
    Id { id: u32, width: u32, signed: bool },
}

/// A byte range of a buffer access, relative to the start of the descriptor's range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(super) struct AccessLayout {
    pub(super) constant_offset: u32,
    /// `(index, stride)` pairs that add `index * stride` to the offset.
    pub(super) runtime_terms: SmallVec<[(IntValue, u32); 4]>,
    /// Size of the accessed value, `None` if it has no host-known size.
    pub(super) size: Option<u32>,
}

/// Everything the rewriter learns about a module before modifying it.
#[derive(Debug)]
pub(super) struct ModuleInfo {
    pub(super) types: HashMap<u32, Type>,
    pub(super) constants: HashMap<u32, u64>,
    pub(super) decorations: Decorations,
    pub(super) names: HashMap<u32, String>,
    pub(super) strings: HashMap<u32, String>,
    pub(super) globals: HashMap<u32, GlobalVariable>,
    pub(super) value_types: HashMap<u32, u32>,
    /// `(function index, instruction index)` of every instruction defining an `<id>` inside a
    /// function body.
    pub(super) local_defs: HashMap<u32, (usize, usize)>,
    pub(super) entry_points: Vec<EntryPointInfo>,
    pub(super) memory_model: u32,
    pub(super) addressing_model: u32,
}

impl ModuleInfo {
    pub(super) fn analyze(module: &Module) -> Self {
        let mut info = ModuleInfo {
            types: HashMap::default(),
            constants: HashMap::default(),
            decorations: Decorations::default(),
            names: HashMap::default(),
            strings: HashMap::default(),
            globals: HashMap::default(),
            value_types: HashMap::default(),
            local_defs: HashMap::default(),
            entry_points: Vec::new(),
            memory_model: 0,
            addressing_model: 0,
        };

        for inst in &module.memory_model {
            info.addressing_model = inst.operand(0).unwrap_or_default();
            info.memory_model = inst.operand(1).unwrap_or_default();
        }

        for inst in &module.debug {
            info.record_debug(inst);
        }

        for inst in &module.annotations {
            info.record_decoration(inst);
        }

        for inst in &module.globals {
            info.record_global(inst);
        }

        for (function_index, function) in module.functions.iter().enumerate() {
            for (index, inst) in function.instructions.iter().enumerate() {
                if let Some(op) = inst.op() {
                    if let (Some(ty), Some(id)) = (inst.result_type(), inst.result_id()) {
                        if op != Op::Function {
                            info.value_types.insert(id, ty);
                        }
                    }
                }

                if let Some(id) = inst.result_id() {
                    info.local_defs.insert(id, (function_index, index));
                }
            }
        }

        info.entry_points = info.collect_entry_points(module);

        info
    }

    fn record_debug(&mut self, inst: &Instruction) {
        match inst.op() {
            Some(Op::Name) => {
                if let (Some(target), Some((name, _))) =
                    (inst.operand(0), decode_string(&inst.operands[1..]))
                {
                    self.names.insert(target, name);
                }
            }
            Some(Op::String) => {
                if let (Some(id), Some((string, _))) = (
                    inst.operand(0),
                    inst.operands.get(1..).and_then(decode_string),
                ) {
                    self.strings.insert(id, string);
                }
            }
            _ => {}
        }
    }

    fn record_decoration(&mut self, inst: &Instruction) {
        let decorations = &mut self.decorations;

        match inst.op() {
            Some(Op::Decorate) => {
                let (Some(target), Some(decoration)) = (inst.operand(0), inst.operand(1)) else {
                    return;
                };
                let value = inst.operand(2);

                match decoration {
                    d if d == Decoration::DescriptorSet as u32 => {
                        decorations
                            .descriptor_set
                            .insert(target, value.unwrap_or_default());
                    }
                    d if d == Decoration::Binding as u32 => {
                        decorations.binding.insert(target, value.unwrap_or_default());
                    }
                    d if d == Decoration::BuiltIn as u32 => {
                        decorations.builtin.insert(target, value.unwrap_or_default());
                    }
                    d if d == Decoration::ArrayStride as u32 => {
                        decorations
                            .array_stride
                            .insert(target, value.unwrap_or_default());
                    }
                    d if d == Decoration::Block as u32 => {
                        decorations.block.insert(target);
                    }
                    d if d == Decoration::BufferBlock as u32 => {
                        decorations.buffer_block.insert(target);
                    }
                    _ => {}
                }
            }
            Some(Op::MemberDecorate) => {
                let (Some(target), Some(member), Some(decoration)) =
                    (inst.operand(0), inst.operand(1), inst.operand(2))
                else {
                    return;
                };
                let value = inst.operand(3);
                let key = (target, member);

                match decoration {
                    d if d == Decoration::Offset as u32 => {
                        decorations
                            .member_offset
                            .insert(key, value.unwrap_or_default());
                    }
                    d if d == Decoration::MatrixStride as u32 => {
                        decorations.member_matrix.entry(key).or_default().stride = value;
                    }
                    d if d == Decoration::RowMajor as u32 => {
                        decorations.member_matrix.entry(key).or_default().row_major = true;
                    }
                    _ => {}
                }
            }
            Some(Op::DecorationGroup | Op::GroupDecorate | Op::GroupMemberDecorate) => {
                decorations.has_groups = true;
            }
            _ => {}
        }
    }

    fn record_global(&mut self, inst: &Instruction) {
        let Some(op) = inst.op() else {
            return;
        };

        if defines_type(op) {
            if let Some(id) = inst.operand(0) {
                let ty = self.parse_type(op, &inst.operands[1..]);
                self.types.insert(id, ty);
            }

            return;
        }

        if let (Some(ty), Some(id)) = (inst.result_type(), inst.result_id()) {
            self.value_types.insert(id, ty);
        }

        match op {
            Op::Constant => {
                // Only integer constants of up to 64 bits matter, for indices and array lengths.
                if let (Some(id), Some(Type::Int { width, .. })) = (
                    inst.operand(1),
                    inst.operand(0).and_then(|ty| self.types.get(&ty)),
                ) {
                    let low = u64::from(inst.operand(2).unwrap_or_default());
                    let value = if *width > 32 {
                        low | u64::from(inst.operand(3).unwrap_or_default()) << 32
                    } else {
                        low
                    };
                    self.constants.insert(id, value);
                }
            }
            Op::Variable => {
                let (Some(pointer_type), Some(id), Some(storage_class)) =
                    (inst.operand(0), inst.operand(1), inst.operand(2))
                else {
                    return;
                };

                if let Some(&Type::Pointer { pointee, .. }) = self.types.get(&pointer_type) {
                    self.globals.insert(
                        id,
                        GlobalVariable {
                            storage_class,
                            pointee,
                        },
                    );
                }
            }
            _ => {}
        }
    }

    fn parse_type(&self, op: Op, operands: &[u32]) -> Type {
        let operand = |index: usize| operands.get(index).copied().unwrap_or_default();

        match op {
            Op::TypeVoid => Type::Void,
            Op::TypeBool => Type::Bool,
            Op::TypeInt => Type::Int {
                width: operand(0),
                signed: operand(1) != 0,
            },
            Op::TypeFloat => Type::Float { width: operand(0) },
            Op::TypeVector => Type::Vector {
                component: operand(0),
                count: operand(1),
            },
            Op::TypeMatrix => Type::Matrix {
                column: operand(0),
                count: operand(1),
            },
            Op::TypeImage => Type::Image { dim: operand(1) },
            Op::TypeSampler => Type::Sampler,
            Op::TypeSampledImage => Type::SampledImage { image: operand(0) },
            Op::TypeArray => Type::Array {
                element: operand(0),
                length: self.constants.get(&operand(1)).copied(),
            },
            Op::TypeRuntimeArray => Type::RuntimeArray {
                element: operand(0),
            },
            Op::TypeStruct => Type::Struct {
                members: SmallVec::from_slice(operands),
            },
            Op::TypePointer => Type::Pointer {
                storage_class: operand(0),
                pointee: operand(1),
            },
            Op::TypeAccelerationStructureKHR => Type::AccelerationStructure,
            _ => Type::Other,
        }
    }

    fn collect_entry_points(&self, module: &Module) -> Vec<EntryPointInfo> {
        module
            .entry_points
            .iter()
            .filter_map(|inst| {
                let execution_model = inst.operand(0)?;
                let function = inst.operand(1)?;
                let (name, _) = decode_string(inst.operands.get(2..)?)?;

                let local_size = module.execution_modes.iter().find_map(|mode| {
                    (mode.is(Op::ExecutionMode)
                        && mode.operand(0) == Some(function)
                        && mode.operand(1) == Some(spirv::ExecutionMode::LocalSize as u32))
                    .then(|| Some([mode.operand(2)?, mode.operand(3)?, mode.operand(4)?]))
                    .flatten()
                });

                Some(EntryPointInfo {
                    name,
                    stage: ShaderStage::from_execution_model(execution_model),
                    execution_model,
                    function,
                    local_size,
                })
            })
            .collect()
    }

    #[inline]
    pub(super) fn ty(&self, id: u32) -> Option<&Type> {
        self.types.get(&id)
    }

    /// Returns the pointee type and storage class of a pointer-typed value.
    pub(super) fn pointer_info(&self, pointer: u32) -> Option<(u32, u32)> {
        let ty = self.value_types.get(&pointer)?;

        match self.ty(*ty)? {
            &Type::Pointer {
                storage_class,
                pointee,
            } => Some((storage_class, pointee)),
            _ => None,
        }
    }

    /// Returns how to obtain `id` as a 32-bit unsigned integer.
    pub(super) fn int_value(&self, id: u32) -> IntValue {
        if let Some(&value) = self.constants.get(&id) {
            if value <= u64::from(u32::MAX) {
                return IntValue::Constant(value as u32);
            }
        }

        match self.value_types.get(&id).and_then(|ty| self.ty(*ty)) {
            Some(&Type::Int { width, signed }) => IntValue::Id { id, width, signed },
            // Every integer operand the rewriter traces is 32 bits wide in practice.
            _ => IntValue::Id {
                id,
                width: 32,
                signed: true,
            },
        }
    }

    /// Whether `ty` is a struct decorated as a uniform or storage buffer block.
    pub(super) fn is_block(&self, ty: u32) -> bool {
        self.decorations.block.contains(&ty) || self.decorations.buffer_block.contains(&ty)
    }

    /// Whether `ty` is a texel buffer image, or a sampled image of one.
    pub(super) fn is_texel_buffer(&self, ty: u32) -> bool {
        match self.ty(ty) {
            Some(&Type::Image { dim }) => dim == spirv::Dim::DimBuffer as u32,
            Some(&Type::SampledImage { image }) => self.is_texel_buffer(image),
            _ => false,
        }
    }

    /// Whether `ty` is an opaque type a descriptor of `UniformConstant` storage can hold.
    pub(super) fn is_descriptor_type(&self, ty: u32) -> bool {
        matches!(
            self.ty(ty),
            Some(
                Type::Image { .. }
                    | Type::Sampler
                    | Type::SampledImage { .. }
                    | Type::AccelerationStructure
            )
        )
    }

    /// Returns the size in bytes `ty` occupies in a buffer, if it is known on the host.
    pub(super) fn size_of(&self, ty: u32, matrix: MatrixLayout) -> Option<u32> {
        match self.ty(ty)? {
            Type::Int { width, .. } | Type::Float { width } => Some(width / 8),
            Type::Vector { component, count } => Some(self.size_of(*component, matrix)? * count),
            &Type::Matrix { column, count } => {
                let Some(&Type::Vector {
                    component,
                    count: rows,
                }) = self.ty(column)
                else {
                    return None;
                };
                let component_size = self.size_of(component, matrix)?;
                let stride = matrix.stride?;

                // Row-major matrices store `rows` strided rows of `count` components each.
                let (strided, contiguous) = if matrix.row_major {
                    (rows, count)
                } else {
                    (count, rows)
                };

                Some(stride * (strided - 1) + component_size * contiguous)
            }
            &Type::Array {
                element,
                length: Some(length),
            } => {
                let stride = *self.decorations.array_stride.get(&ty)?;
                let length = u32::try_from(length).ok().filter(|&l| l != 0)?;

                Some(stride * (length - 1) + self.size_of(element, matrix)?)
            }
            Type::Struct { members } => {
                let mut size = 0;

                for (index, &member) in members.iter().enumerate() {
                    let key = (ty, index as u32);
                    let offset = *self.decorations.member_offset.get(&key)?;
                    let layout = self
                        .decorations
                        .member_matrix
                        .get(&key)
                        .copied()
                        .unwrap_or_default();
                    size = size.max(offset + self.size_of(member, layout)?);
                }

                Some(size)
            }
            &Type::Pointer { storage_class, .. }
                if storage_class == StorageClass::PhysicalStorageBuffer as u32 =>
            {
                Some(8)
            }
            _ => None,
        }
    }

    /// Walks `indices` starting from a value of type `base`, accumulating the byte offset of the
    /// element the indices select.
    pub(super) fn walk_access_chain(&self, base: u32, indices: &[u32]) -> Option<AccessLayout> {
        let mut layout = AccessLayout::default();
        let mut ty = base;
        let mut matrix = MatrixLayout::default();
        // Stride between the components of a vector taken out of a row-major matrix.
        let mut vector_stride = None;

        for &index in indices {
            let index_value = self.int_value(index);

            let (element, stride) = match self.ty(ty)? {
                Type::Struct { members } => {
                    let IntValue::Constant(member) = index_value else {
                        return None;
                    };
                    let key = (ty, member);
                    let offset = *self.decorations.member_offset.get(&key)?;
                    matrix = self
                        .decorations
                        .member_matrix
                        .get(&key)
                        .copied()
                        .unwrap_or_default();
                    layout.constant_offset = layout.constant_offset.checked_add(offset)?;
                    ty = *members.get(member as usize)?;
                    continue;
                }
                &Type::Array { element, .. } | &Type::RuntimeArray { element } => {
                    (element, *self.decorations.array_stride.get(&ty)?)
                }
                &Type::Matrix { column, .. } => {
                    let Some(&Type::Vector { component, .. }) = self.ty(column) else {
                        return None;
                    };

                    if matrix.row_major {
                        vector_stride = matrix.stride;
                        (column, self.size_of(component, matrix)?)
                    } else {
                        (column, matrix.stride?)
                    }
                }
                &Type::Vector { component, .. } => {
                    let stride = match vector_stride.take() {
                        Some(stride) => stride,
                        None => self.size_of(component, matrix)?,
                    };

                    (component, stride)
                }
                _ => return None,
            };

            match index_value {
                IntValue::Constant(value) => {
                    let offset = value.checked_mul(stride)?;
                    layout.constant_offset = layout.constant_offset.checked_add(offset)?;
                }
                value => layout.runtime_terms.push((value, stride)),
            }

            ty = element;
        }

        layout.size = match (self.ty(ty), vector_stride) {
            (Some(&Type::Vector { component, count }), Some(stride)) => {
                Some(stride * (count - 1) + self.size_of(component, matrix)?)
            }
            _ => self.size_of(ty, matrix),
        };

        Some(layout)
    }

    /// Finds the instruction defining `id` inside a function body.
    pub(super) fn local_def<'m>(&self, module: &'m Module, id: u32) -> Option<&'m Instruction> {
        let &(function, index) = self.local_defs.get(&id)?;

        module.functions.get(function)?.instructions.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Assembler;

    #[test]
    fn constant_index_offsets() {
        let words = Assembler::compute_store_shader(25);
        let module = Module::parse(&words).unwrap();
        let info = ModuleInfo::analyze(&module);

        let (&buffer, variable) = info
            .globals
            .iter()
            .find(|(_, var)| var.storage_class == StorageClass::Uniform as u32)
            .unwrap();
        assert_eq!(info.decorations.binding.get(&buffer), Some(&0));
        assert!(info.is_block(variable.pointee));

        // Member 0, element 25 of a `uint[]` with a stride of 4.
        let zero = *info.constants.iter().find(|(_, &v)| v == 0).unwrap().0;
        let twenty_five = *info.constants.iter().find(|(_, &v)| v == 25).unwrap().0;
        let layout = info
            .walk_access_chain(variable.pointee, &[zero, twenty_five])
            .unwrap();

        assert_eq!(layout.constant_offset, 100);
        assert!(layout.runtime_terms.is_empty());
        assert_eq!(layout.size, Some(4));
    }

    #[test]
    fn entry_points() {
        let words = Assembler::compute_store_shader(1);
        let module = Module::parse(&words).unwrap();
        let info = ModuleInfo::analyze(&module);

        assert_eq!(info.entry_points.len(), 1);
        assert_eq!(info.entry_points[0].name, "main");
        assert_eq!(info.entry_points[0].stage, ShaderStage::Compute);
        assert_eq!(info.entry_points[0].local_size, Some([64, 1, 1]));
    }
}
