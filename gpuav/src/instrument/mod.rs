//! Rewriting of SPIR-V modules so that checks run on the device.
//!
//! [`instrument`] parses a module, finds every instruction that accesses a descriptor, a buffer
//! through a descriptor or a buffer device address, or initializes a ray query, and inserts a
//! call to an injected helper function right before it. The helpers compute whether the access
//! is valid and, if it is not, append one [`ErrorRecord`] to the error log bound at the
//! validator's reserved descriptor set. They never modify anything else: original instructions,
//! values and control flow are kept as they are, and no block is split.
//!
//! Every instrumented instruction is identified by its word offset in the original binary, its
//! *site*. The [`DebugSymbolTable`] returned alongside the new binary maps sites back to source
//! locations.
//!
//! Instrumentation is deterministic: the same binary and options always produce the same words,
//! and the same shader id.
//!
//! [`ErrorRecord`]: crate::record::ErrorRecord

pub use self::debug::{DebugSymbolTable, SiteCheck, SiteInfo, SourceLocation};
use self::{
    analysis::ModuleInfo,
    emit::Emitter,
    module::Module,
    sites::collect_sites,
};
use crate::{
    device::DeviceLimits,
    shader::{EntryPointInfo, ShaderStage},
    NonExhaustive,
};
use foldhash::fast::FixedState;
use spirv::AddressingModel;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    hash::BuildHasher,
};

mod analysis;
mod debug;
mod emit;
pub(crate) mod module;
mod sites;

/// Highest SPIR-V version the rewriter understands, 1.6.
const MAX_VERSION: u32 = 0x0001_0600;

/// The rewriter refuses modules whose id bound would reach this value once instrumented.
pub const MAX_ID_BOUND: u32 = 0x0040_0000;

/// Seed of the content hash shader ids are derived from. It must never change between runs, so
/// that the same module always gets the same id.
const SHADER_ID_SEED: u64 = 0x6770_7561_765f_6964;

gpuav_bitflags! {
    /// The categories of checks injected into a module.
    CheckCategories(u32);

    /// Byte ranges of buffer accesses through descriptors, and texel coordinates of texel buffer
    /// accesses.
    BOUNDS = 1 << 0,

    /// Descriptors being written, alive and current when accessed, and descriptor array indices
    /// being in range.
    DESCRIPTOR_VALIDITY = 1 << 1,

    /// Accesses through `PhysicalStorageBuffer` pointers falling inside a live buffer.
    BUFFER_ADDRESS = 1 << 2,

    /// Ray query parameters passed to `OpRayQueryInitializeKHR`.
    RAY_QUERY = 1 << 3,
}

/// Parameters of [`instrument`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstrumentOptions {
    /// The checks to inject.
    ///
    /// The default value is [`CheckCategories::all()`].
    pub checks: CheckCategories,

    /// The descriptor set index the validator binds its buffers at.
    ///
    /// The default value is `3`, the last index every implementation supports.
    pub reserved_set: u32,

    /// Whether the `vertexPipelineStoresAndAtomics` feature is enabled. Without it, modules
    /// with vertex, tessellation or geometry entry points can't be instrumented.
    ///
    /// The default value is `false`.
    pub vertex_pipeline_stores: bool,

    /// Whether the `fragmentStoresAndAtomics` feature is enabled. Without it, modules with
    /// fragment entry points can't be instrumented.
    ///
    /// The default value is `false`.
    pub fragment_stores: bool,

    /// Whether the `shaderInt64` feature is enabled. Buffer device address checks are skipped
    /// without it.
    ///
    /// The default value is `false`.
    pub shader_int64: bool,

    pub _ne: NonExhaustive,
}

impl Default for InstrumentOptions {
    #[inline]
    fn default() -> Self {
        InstrumentOptions {
            checks: CheckCategories::all(),
            reserved_set: 3,
            vertex_pipeline_stores: false,
            fragment_stores: false,
            shader_int64: false,
            _ne: NonExhaustive(()),
        }
    }
}

impl InstrumentOptions {
    /// Returns the options for a device with the given limits.
    pub fn from_limits(checks: CheckCategories, limits: &DeviceLimits) -> Self {
        InstrumentOptions {
            checks,
            reserved_set: limits.reserved_set_index(),
            vertex_pipeline_stores: limits.vertex_pipeline_stores_and_atomics,
            fragment_stores: limits.fragment_stores_and_atomics,
            shader_int64: limits.shader_int64,
            _ne: NonExhaustive(()),
        }
    }
}

/// The result of [`instrument`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrumentedShader {
    /// The id written into every record the module produces. Never 0, which identifies the
    /// pre-pass programs.
    pub shader_id: u32,

    /// Hash of the original binary.
    pub original_hash: u64,

    /// The instrumented binary. Equal to the original when the module contains nothing to
    /// check.
    pub binary: Vec<u32>,

    /// Maps every instrumented site to where it came from.
    pub debug_symbols: DebugSymbolTable,

    /// The entry points of the module.
    pub entry_points: Vec<EntryPointInfo>,
}

/// Instruments `words` with the checks in `options`.
pub fn instrument(
    words: &[u32],
    options: &InstrumentOptions,
) -> Result<InstrumentedShader, InstrumentError> {
    let (shader_id, original_hash) = shader_id(words, options);
    let mut module = Module::parse(words)?;

    if module.header.version > MAX_VERSION {
        return Err(InstrumentError::UnsupportedVersion {
            version: module.header.version,
        });
    }

    let info = ModuleInfo::analyze(&module);

    if matches!(
        AddressingModel::from_u32(info.addressing_model),
        Some(AddressingModel::Physical32 | AddressingModel::Physical64),
    ) {
        return Err(InstrumentError::UnsupportedAddressingModel {
            addressing_model: info.addressing_model,
        });
    }

    if info.decorations.has_groups {
        return Err(InstrumentError::DecorationGroups);
    }

    if let Some((&target, _)) = info
        .decorations
        .descriptor_set
        .iter()
        .filter(|&(_, &set)| set == options.reserved_set)
        .min_by_key(|&(&target, _)| target)
    {
        return Err(InstrumentError::ReservedSetInUse {
            set: options.reserved_set,
            variable: target,
        });
    }

    let sites = collect_sites(&module, &info, options);
    let debug_symbols = DebugSymbolTable::build(&module, &info, &sites);

    if sites.is_empty() {
        log::trace!("shader {:#010x} contains nothing to instrument", shader_id);

        return Ok(InstrumentedShader {
            shader_id,
            original_hash,
            binary: words.to_vec(),
            debug_symbols,
            entry_points: info.entry_points,
        });
    }

    check_stage_stores(&info, options)?;

    let site_count = sites.len();
    let mut emitter = Emitter::new(&module, &info, options, shader_id);
    emitter.instrument(&mut module, sites);
    emitter.finish(&mut module);

    if module.header.bound >= MAX_ID_BOUND {
        return Err(InstrumentError::IdBoundOverflow {
            bound: module.header.bound,
        });
    }

    log::debug!(
        "instrumented shader {:#010x}: {} sites, id bound {}",
        shader_id,
        site_count,
        module.header.bound,
    );

    Ok(InstrumentedShader {
        shader_id,
        original_hash,
        binary: module.assemble(),
        debug_symbols,
        entry_points: info.entry_points,
    })
}

/// Returns the shader id and the content hash of `words` instrumented with `options`.
pub fn shader_id(words: &[u32], options: &InstrumentOptions) -> (u32, u64) {
    let state = FixedState::with_seed(SHADER_ID_SEED);
    let original_hash = state.hash_one(words);
    let hash = state.hash_one((words, options.checks, options.reserved_set));

    // 0 identifies the pre-pass programs.
    let shader_id = match hash as u32 {
        0 => 1,
        id => id,
    };

    (shader_id, original_hash)
}

fn check_stage_stores(info: &ModuleInfo, options: &InstrumentOptions) -> Result<(), InstrumentError> {
    for entry_point in &info.entry_points {
        let supported = match entry_point.stage {
            ShaderStage::Vertex
            | ShaderStage::TessellationControl
            | ShaderStage::TessellationEvaluation
            | ShaderStage::Geometry => options.vertex_pipeline_stores,
            ShaderStage::Fragment => options.fragment_stores,
            _ => true,
        };

        if !supported {
            return Err(InstrumentError::StageStoresUnsupported {
                stage: entry_point.stage,
            });
        }
    }

    Ok(())
}

/// A module the rewriter can't instrument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstrumentError {
    /// The binary doesn't start with the SPIR-V magic number.
    InvalidMagic { magic: u32 },

    /// The binary ends in the middle of an instruction, or of a function.
    Truncated { offset: u32 },

    /// An instruction appears where the logical layout of a module doesn't allow it.
    Malformed { offset: u32 },

    /// The module uses a SPIR-V version newer than the rewriter understands.
    UnsupportedVersion { version: u32 },

    /// The module uses a `Physical32` or `Physical64` addressing model.
    UnsupportedAddressingModel { addressing_model: u32 },

    /// The module uses `OpDecorationGroup`.
    DecorationGroups,

    /// A variable of the module is decorated with the descriptor set the validator reserves.
    ReservedSetInUse { set: u32, variable: u32 },

    /// The instrumented module would need more ids than the rewriter allows.
    IdBoundOverflow { bound: u32 },

    /// The module has an entry point in a stage that can't write to storage buffers on this
    /// device.
    StageStoresUnsupported { stage: ShaderStage },
}

impl Error for InstrumentError {}

impl Display for InstrumentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            InstrumentError::InvalidMagic { magic } => {
                write!(f, "the binary starts with {:#010x} instead of the SPIR-V magic number", magic)
            }
            InstrumentError::Truncated { offset } => {
                write!(f, "the binary is truncated at word {}", offset)
            }
            InstrumentError::Malformed { offset } => write!(
                f,
                "the instruction at word {} is out of the logical layout order",
                offset,
            ),
            InstrumentError::UnsupportedVersion { version } => write!(
                f,
                "SPIR-V version {}.{} is not supported",
                version >> 16 & 0xFF,
                version >> 8 & 0xFF,
            ),
            InstrumentError::UnsupportedAddressingModel { addressing_model } => write!(
                f,
                "addressing model {} is not supported",
                addressing_model,
            ),
            InstrumentError::DecorationGroups => {
                write!(f, "decoration groups are not supported")
            }
            InstrumentError::ReservedSetInUse { set, variable } => write!(
                f,
                "variable %{} uses descriptor set {}, which the validator reserves",
                variable, set,
            ),
            InstrumentError::IdBoundOverflow { bound } => write!(
                f,
                "the instrumented module would need an id bound of {}",
                bound,
            ),
            InstrumentError::StageStoresUnsupported { stage } => write!(
                f,
                "{:?} shaders can't write to storage buffers without the corresponding \
                stores and atomics feature",
                stage,
            ),
        }
    }
}
