//! A word-level view of a SPIR-V module, split into its logical layout sections.
//!
//! Parsing and writing back a module without modifying it reproduces the input exactly, as long
//! as the input follows the logical layout rules, which every valid module does.

use super::InstrumentError;
use smallvec::SmallVec;
use spirv::Op;

pub(crate) const MAGIC: u32 = 0x0723_0203;

pub(crate) const HEADER_WORDS: usize = 5;

/// One instruction, without its leading word-count/opcode word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Instruction {
    pub(crate) opcode: u16,
    pub(crate) operands: SmallVec<[u32; 8]>,
    /// Word offset of the instruction in the parsed binary, `None` for injected instructions.
    pub(crate) offset: Option<u32>,
}

impl Instruction {
    #[inline]
    pub(crate) fn new(op: Op, operands: &[u32]) -> Self {
        Instruction {
            opcode: op as u16,
            operands: SmallVec::from_slice(operands),
            offset: None,
        }
    }

    #[inline]
    pub(crate) fn op(&self) -> Option<Op> {
        Op::from_u32(u32::from(self.opcode))
    }

    #[inline]
    pub(crate) fn is(&self, op: Op) -> bool {
        self.opcode == op as u16
    }

    #[inline]
    pub(crate) fn operand(&self, index: usize) -> Option<u32> {
        self.operands.get(index).copied()
    }

    /// Returns the `<id>` the instruction defines, for the opcodes the rewriter looks at.
    pub(crate) fn result_id(&self) -> Option<u32> {
        let op = self.op()?;

        if defines_type(op) || matches!(op, Op::String | Op::ExtInstImport | Op::Label) {
            self.operand(0)
        } else if has_result_type(op) {
            self.operand(1)
        } else {
            None
        }
    }

    /// Returns the `<id>` of the result type, for the opcodes the rewriter looks at.
    pub(crate) fn result_type(&self) -> Option<u32> {
        let op = self.op()?;

        has_result_type(op).then(|| self.operand(0)).flatten()
    }

    fn write(&self, out: &mut Vec<u32>) {
        let word_count = self.operands.len() as u32 + 1;
        out.push(word_count << 16 | u32::from(self.opcode));
        out.extend_from_slice(&self.operands);
    }
}

/// Whether `op` declares a type, with the result `<id>` as its first operand.
pub(crate) fn defines_type(op: Op) -> bool {
    matches!(
        op,
        Op::TypeVoid
            | Op::TypeBool
            | Op::TypeInt
            | Op::TypeFloat
            | Op::TypeVector
            | Op::TypeMatrix
            | Op::TypeImage
            | Op::TypeSampler
            | Op::TypeSampledImage
            | Op::TypeArray
            | Op::TypeRuntimeArray
            | Op::TypeStruct
            | Op::TypeOpaque
            | Op::TypePointer
            | Op::TypeFunction
            | Op::TypeEvent
            | Op::TypeDeviceEvent
            | Op::TypeReserveId
            | Op::TypeQueue
            | Op::TypePipe
            | Op::TypeRayQueryKHR
            | Op::TypeAccelerationStructureKHR
    )
}

/// Whether the operands of `op` start with a result type and a result `<id>`.
///
/// This covers the instructions that can produce pointers, indices, coordinates and ray query
/// parameters, which is all the rewriter needs to trace.
pub(crate) fn has_result_type(op: Op) -> bool {
    matches!(
        op,
        Op::Undef
            | Op::ExtInst
            | Op::ConstantTrue
            | Op::ConstantFalse
            | Op::Constant
            | Op::ConstantComposite
            | Op::ConstantNull
            | Op::SpecConstantTrue
            | Op::SpecConstantFalse
            | Op::SpecConstant
            | Op::SpecConstantComposite
            | Op::SpecConstantOp
            | Op::Function
            | Op::FunctionParameter
            | Op::FunctionCall
            | Op::Variable
            | Op::ImageTexelPointer
            | Op::Load
            | Op::AccessChain
            | Op::InBoundsAccessChain
            | Op::PtrAccessChain
            | Op::InBoundsPtrAccessChain
            | Op::ArrayLength
            | Op::CopyObject
            | Op::CopyLogical
            | Op::VectorExtractDynamic
            | Op::VectorInsertDynamic
            | Op::VectorShuffle
            | Op::CompositeConstruct
            | Op::CompositeExtract
            | Op::CompositeInsert
            | Op::SampledImage
            | Op::Image
            | Op::ImageFetch
            | Op::ImageRead
            | Op::ConvertFToU
            | Op::ConvertFToS
            | Op::ConvertSToF
            | Op::ConvertUToF
            | Op::UConvert
            | Op::SConvert
            | Op::FConvert
            | Op::ConvertPtrToU
            | Op::ConvertUToPtr
            | Op::Bitcast
            | Op::SNegate
            | Op::FNegate
            | Op::IAdd
            | Op::FAdd
            | Op::ISub
            | Op::FSub
            | Op::IMul
            | Op::FMul
            | Op::UDiv
            | Op::SDiv
            | Op::FDiv
            | Op::UMod
            | Op::SRem
            | Op::SMod
            | Op::FRem
            | Op::FMod
            | Op::VectorTimesScalar
            | Op::Dot
            | Op::Any
            | Op::All
            | Op::IsNan
            | Op::IsInf
            | Op::LogicalEqual
            | Op::LogicalNotEqual
            | Op::LogicalOr
            | Op::LogicalAnd
            | Op::LogicalNot
            | Op::Select
            | Op::IEqual
            | Op::INotEqual
            | Op::UGreaterThan
            | Op::SGreaterThan
            | Op::UGreaterThanEqual
            | Op::SGreaterThanEqual
            | Op::ULessThan
            | Op::SLessThan
            | Op::ULessThanEqual
            | Op::SLessThanEqual
            | Op::FOrdEqual
            | Op::FOrdLessThan
            | Op::FOrdGreaterThan
            | Op::ShiftRightLogical
            | Op::ShiftRightArithmetic
            | Op::ShiftLeftLogical
            | Op::BitwiseOr
            | Op::BitwiseXor
            | Op::BitwiseAnd
            | Op::Not
            | Op::BitFieldInsert
            | Op::BitFieldSExtract
            | Op::BitFieldUExtract
            | Op::BitReverse
            | Op::BitCount
            | Op::Phi
            | Op::AtomicLoad
            | Op::AtomicExchange
            | Op::AtomicCompareExchange
            | Op::AtomicIIncrement
            | Op::AtomicIDecrement
            | Op::AtomicIAdd
            | Op::AtomicISub
            | Op::AtomicSMin
            | Op::AtomicUMin
            | Op::AtomicSMax
            | Op::AtomicUMax
            | Op::AtomicAnd
            | Op::AtomicOr
            | Op::AtomicXor
            | Op::GroupNonUniformBroadcast
            | Op::GroupNonUniformBroadcastFirst
            | Op::GroupNonUniformShuffle
            | Op::GroupNonUniformIAdd
            | Op::RayQueryGetIntersectionTypeKHR
    )
}

/// Decodes a literal string operand starting at `words[0]`. Returns the string and the number
/// of words it occupies, including the terminating nul.
pub(crate) fn decode_string(words: &[u32]) -> Option<(String, usize)> {
    let mut bytes = Vec::new();

    for (index, word) in words.iter().enumerate() {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                return Some((String::from_utf8_lossy(&bytes).into_owned(), index + 1));
            }

            bytes.push(byte);
        }
    }

    None
}

/// Encodes `string` as a nul-terminated literal string operand.
pub(crate) fn encode_string(string: &str) -> SmallVec<[u32; 8]> {
    let bytes = string.as_bytes();

    bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [0; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .chain((bytes.len() % 4 == 0).then_some(0))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) version: u32,
    pub(crate) generator: u32,
    pub(crate) bound: u32,
    pub(crate) schema: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Function {
    pub(crate) instructions: Vec<Instruction>,
}

impl Function {
    /// Returns the `<id>` of the function.
    #[inline]
    pub(crate) fn id(&self) -> Option<u32> {
        self.instructions.first().and_then(|inst| inst.operand(1))
    }
}

/// A SPIR-V module split into its logical layout sections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Module {
    pub(crate) header: Header,
    pub(crate) capabilities: Vec<Instruction>,
    pub(crate) extensions: Vec<Instruction>,
    pub(crate) ext_inst_imports: Vec<Instruction>,
    pub(crate) memory_model: Vec<Instruction>,
    pub(crate) entry_points: Vec<Instruction>,
    pub(crate) execution_modes: Vec<Instruction>,
    pub(crate) debug: Vec<Instruction>,
    pub(crate) annotations: Vec<Instruction>,
    pub(crate) globals: Vec<Instruction>,
    pub(crate) functions: Vec<Function>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Functions,
    InFunction,
}

impl Module {
    pub(crate) fn parse(words: &[u32]) -> Result<Self, InstrumentError> {
        if words.len() < HEADER_WORDS {
            return Err(InstrumentError::Truncated { offset: 0 });
        }

        if words[0] != MAGIC {
            return Err(InstrumentError::InvalidMagic { magic: words[0] });
        }

        let mut module = Module {
            header: Header {
                version: words[1],
                generator: words[2],
                bound: words[3],
                schema: words[4],
            },
            capabilities: Vec::new(),
            extensions: Vec::new(),
            ext_inst_imports: Vec::new(),
            memory_model: Vec::new(),
            entry_points: Vec::new(),
            execution_modes: Vec::new(),
            debug: Vec::new(),
            annotations: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
        };

        let mut section = Section::Preamble;
        let mut offset = HEADER_WORDS;

        while offset < words.len() {
            let first = words[offset];
            let word_count = (first >> 16) as usize;
            let opcode = (first & 0xFFFF) as u16;

            if word_count == 0 || offset + word_count > words.len() {
                return Err(InstrumentError::Truncated {
                    offset: offset as u32,
                });
            }

            let instruction = Instruction {
                opcode,
                operands: SmallVec::from_slice(&words[offset + 1..offset + word_count]),
                offset: Some(offset as u32),
            };
            offset += word_count;

            let op = instruction.op();

            if section == Section::InFunction {
                let function = module
                    .functions
                    .last_mut()
                    .ok_or(InstrumentError::Malformed {
                        offset: instruction.offset.unwrap_or_default(),
                    })?;
                let is_end = op == Some(Op::FunctionEnd);
                function.instructions.push(instruction);

                if is_end {
                    section = Section::Functions;
                }

                continue;
            }

            if op == Some(Op::Function) {
                module.functions.push(Function {
                    instructions: vec![instruction],
                });
                section = Section::InFunction;
                continue;
            }

            if section == Section::Functions {
                return Err(InstrumentError::Malformed {
                    offset: instruction.offset.unwrap_or_default(),
                });
            }

            let target = match op {
                Some(Op::Capability) => &mut module.capabilities,
                Some(Op::Extension) => &mut module.extensions,
                Some(Op::ExtInstImport) => &mut module.ext_inst_imports,
                Some(Op::MemoryModel) => &mut module.memory_model,
                Some(Op::EntryPoint) => &mut module.entry_points,
                Some(Op::ExecutionMode | Op::ExecutionModeId) => &mut module.execution_modes,
                Some(
                    Op::String
                    | Op::SourceExtension
                    | Op::Source
                    | Op::SourceContinued
                    | Op::Name
                    | Op::MemberName
                    | Op::ModuleProcessed,
                ) => &mut module.debug,
                Some(
                    Op::Decorate
                    | Op::MemberDecorate
                    | Op::DecorationGroup
                    | Op::GroupDecorate
                    | Op::GroupMemberDecorate
                    | Op::DecorateId
                    | Op::DecorateString
                    | Op::MemberDecorateString,
                ) => &mut module.annotations,
                _ => &mut module.globals,
            };
            target.push(instruction);
        }

        if section == Section::InFunction {
            return Err(InstrumentError::Truncated {
                offset: words.len() as u32,
            });
        }

        Ok(module)
    }

    pub(crate) fn assemble(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.header.bound as usize * 4);
        out.extend_from_slice(&[
            MAGIC,
            self.header.version,
            self.header.generator,
            self.header.bound,
            self.header.schema,
        ]);

        let sections = [
            &self.capabilities,
            &self.extensions,
            &self.ext_inst_imports,
            &self.memory_model,
            &self.entry_points,
            &self.execution_modes,
            &self.debug,
            &self.annotations,
            &self.globals,
        ];

        for instruction in sections.into_iter().flatten() {
            instruction.write(&mut out);
        }

        for function in &self.functions {
            for instruction in &function.instructions {
                instruction.write(&mut out);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Assembler;

    #[test]
    fn round_trip_is_exact() {
        let words = Assembler::compute_store_shader(25);
        let module = Module::parse(&words).unwrap();

        assert_eq!(module.assemble(), words);
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.entry_points.len(), 1);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            Module::parse(&[0xDEADBEEF, 0x10000, 0, 1, 0]),
            Err(InstrumentError::InvalidMagic { .. }),
        ));
        assert!(matches!(
            Module::parse(&[MAGIC, 0x10000]),
            Err(InstrumentError::Truncated { .. }),
        ));

        // An `OpCapability` claiming three words with only one left.
        assert!(matches!(
            Module::parse(&[MAGIC, 0x10000, 0, 1, 0, 3 << 16 | Op::Capability as u32]),
            Err(InstrumentError::Truncated { offset: 5 }),
        ));
    }

    #[test]
    fn strings() {
        let encoded = encode_string("main");
        assert_eq!(encoded.len(), 2);
        assert_eq!(decode_string(&encoded), Some(("main".to_owned(), 2)));

        let encoded = encode_string("abc");
        assert_eq!(encoded.len(), 1);
        assert_eq!(decode_string(&encoded), Some(("abc".to_owned(), 1)));
    }
}
