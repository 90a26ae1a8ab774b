//! Turning error logs back into diagnostics.
//!
//! Once the submission that executed a validated operation has completed, its error log holds
//! the records that injected code and pre-passes wrote. Each record is resolved against the
//! shaders and descriptor set snapshots the operation's [`CommandResources`] kept alive, and
//! records reporting the same problem at the same place are merged into a single
//! [`Diagnostic`].

use crate::{
    command::CommandResources,
    descriptor_heap::{DescriptorKind, SnapshotEntry},
    instrument::SourceLocation,
    record::{AccessKind, ErrorKind, ErrorRecord, RECORD_WORDS, STAGE_UNKNOWN},
    shader::{ShaderRegistry, ShaderStage},
    GpuavError, Location,
};
use foldhash::HashMap;
use std::{
    borrow::Cow,
    fmt::{Display, Error as FmtError, Formatter},
    sync::Arc,
};

/// How serious a diagnostic is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Severity {
    /// The application did something invalid.
    Error,
    /// The validator could not check everything, or could only report part of what it found.
    Warning,
}

/// The descriptor a diagnostic refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub set: u32,
    pub binding: u32,
    pub index: u32,

    /// The descriptor as it was when the command was recorded, if it had been written.
    pub snapshot: Option<SnapshotEntry>,
}

impl DescriptorInfo {
    /// Returns the kind of the descriptor, if it had been written.
    #[inline]
    pub fn kind(&self) -> Option<DescriptorKind> {
        self.snapshot.map(|entry| entry.bounds.kind)
    }
}

/// What a diagnostic reports, with the values the device recorded.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum DiagnosticDetail {
    BufferOutOfBounds {
        offset: u32,
        size: u32,
        bound: u32,
        access: Option<AccessKind>,
    },
    TexelBufferOutOfBounds {
        texel: u32,
        texel_count: u32,
        access: Option<AccessKind>,
    },
    DescriptorIndexOutOfBounds {
        count: u32,
    },
    DescriptorUninitialized,
    DescriptorDestroyed,
    /// The descriptor was overwritten between the recording and the execution of the command.
    DescriptorStale,
    BufferAddressOutOfBounds {
        address: u64,
        size: u32,
        access: Option<AccessKind>,
    },
    RayQueryNonFiniteOrigin {
        flags: u32,
    },
    RayQueryNonFiniteDirection {
        flags: u32,
    },
    RayQueryNegativeTMin {
        t_min: f32,
    },
    RayQueryTMaxLessThanTMin {
        t_min: f32,
        t_max: f32,
    },
    RayQueryConflictingFlags {
        flags: u32,
    },
    DispatchGroupCountExceeded {
        group_counts: [u32; 3],
        limit: [u32; 3],
    },
    DrawFirstInstanceNonZero {
        draw: u32,
        first_instance: u32,
    },
    DrawCountExceedsLimit {
        count: u32,
        limit: u32,
    },
    DrawCountExceedsBuffer {
        count: u32,
        capacity: u32,
    },
    MeshTaskCountExceeded {
        draw: u32,
        task_counts: [u32; 3],
        limit: [u32; 3],
        total_limit: u32,
    },
    TraceRaysDimensionsExceeded {
        dimensions: [u32; 3],
        limit: [u32; 3],
        total_limit: u32,
    },
    CopyDepthOutOfRange {
        texel: u32,
        depth: f32,
    },
    /// The error log was full, and this many records were dropped.
    LogTruncated {
        dropped: u32,
    },
    /// The record refers to a shader, instruction or descriptor the decoder can't resolve.
    StaleReference {
        problem: Cow<'static, str>,
    },
}

fn access_name(access: Option<AccessKind>) -> &'static str {
    match access {
        Some(AccessKind::Load) => "read",
        Some(AccessKind::Store) => "write",
        Some(AccessKind::Atomic) => "atomic access",
        None => "access",
    }
}

impl Display for DiagnosticDetail {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            DiagnosticDetail::BufferOutOfBounds {
                offset,
                size,
                bound,
                access,
            } => write!(
                f,
                "{} of {} bytes at offset {} is out of bounds of the {} bytes bound to the \
                descriptor",
                access_name(*access),
                size,
                offset,
                bound,
            ),
            DiagnosticDetail::TexelBufferOutOfBounds {
                texel,
                texel_count,
                access,
            } => write!(
                f,
                "{} of texel {} is out of bounds of the {} texels of the texel buffer view",
                access_name(*access),
                texel,
                texel_count,
            ),
            DiagnosticDetail::DescriptorIndexOutOfBounds { count } => write!(
                f,
                "the descriptor array index is out of bounds of the {} descriptors of the binding",
                count,
            ),
            DiagnosticDetail::DescriptorUninitialized => {
                write!(f, "the descriptor was accessed without ever being written")
            }
            DiagnosticDetail::DescriptorDestroyed => write!(
                f,
                "the descriptor was accessed after the resource it refers to was destroyed",
            ),
            DiagnosticDetail::DescriptorStale => write!(
                f,
                "the descriptor was updated after the command was recorded, without \
                `UPDATE_AFTER_BIND`",
            ),
            DiagnosticDetail::BufferAddressOutOfBounds {
                address,
                size,
                access,
            } => write!(
                f,
                "{} of {} bytes at device address {:#x} is not inside any live buffer",
                access_name(*access),
                size,
                address,
            ),
            DiagnosticDetail::RayQueryNonFiniteOrigin { flags } => write!(
                f,
                "the ray origin is not finite (ray flags {:#x})",
                flags,
            ),
            DiagnosticDetail::RayQueryNonFiniteDirection { flags } => write!(
                f,
                "the ray direction is not finite (ray flags {:#x})",
                flags,
            ),
            DiagnosticDetail::RayQueryNegativeTMin { t_min } => {
                write!(f, "the ray t-min {} is negative", t_min)
            }
            DiagnosticDetail::RayQueryTMaxLessThanTMin { t_min, t_max } => write!(
                f,
                "the ray t-max {} is less than its t-min {}",
                t_max, t_min,
            ),
            DiagnosticDetail::RayQueryConflictingFlags { flags } => write!(
                f,
                "the ray flags {:#x} contain mutually exclusive flags",
                flags,
            ),
            DiagnosticDetail::DispatchGroupCountExceeded {
                group_counts,
                limit,
            } => write!(
                f,
                "the indirect group count {:?} exceeds `maxComputeWorkGroupCount` {:?}",
                group_counts, limit,
            ),
            DiagnosticDetail::DrawFirstInstanceNonZero {
                draw,
                first_instance,
            } => write!(
                f,
                "draw {} has a `firstInstance` of {}, but the `drawIndirectFirstInstance` \
                feature is not enabled",
                draw, first_instance,
            ),
            DiagnosticDetail::DrawCountExceedsLimit { count, limit } => write!(
                f,
                "the draw count {} exceeds `maxDrawIndirectCount` {}",
                count, limit,
            ),
            DiagnosticDetail::DrawCountExceedsBuffer { count, capacity } => write!(
                f,
                "the draw count {} exceeds the {} draws that fit in the indirect buffer",
                count, capacity,
            ),
            DiagnosticDetail::MeshTaskCountExceeded {
                draw,
                task_counts,
                limit,
                total_limit,
            } => write!(
                f,
                "draw {} has task counts {:?}, exceeding the limits {:?} or the total limit {}",
                draw, task_counts, limit, total_limit,
            ),
            DiagnosticDetail::TraceRaysDimensionsExceeded {
                dimensions,
                limit,
                total_limit,
            } => write!(
                f,
                "the trace rays dimensions {:?} exceed the limits {:?} or the total limit {}",
                dimensions, limit, total_limit,
            ),
            DiagnosticDetail::CopyDepthOutOfRange { texel, depth } => write!(
                f,
                "texel {} of the copy has a depth of {}, outside of [0, 1]",
                texel, depth,
            ),
            DiagnosticDetail::LogTruncated { dropped } => write!(
                f,
                "the error log was full, {} more errors were not recorded",
                dropped,
            ),
            DiagnosticDetail::StaleReference { problem } => {
                write!(f, "an error was reported by a stale reference: {}", problem)
            }
        }
    }
}

/// One problem found by the device, attributed to where it happened.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,

    /// The kind of record the diagnostic was decoded from. `None` for diagnostics the decoder
    /// adds itself.
    pub kind: Option<ErrorKind>,

    pub detail: DiagnosticDetail,

    /// Id of the shader that wrote the record, `0` for pre-passes.
    pub shader_id: u32,

    pub stage: Option<ShaderStage>,
    pub entry_point: Option<String>,

    /// The instruction site, for records written by injected code.
    pub site: Option<u32>,
    pub function_name: Option<Arc<str>>,
    pub source_location: Option<SourceLocation>,
    /// `OpName` of the variable that was accessed.
    pub variable: Option<Arc<str>>,

    pub descriptor: Option<DescriptorInfo>,

    /// The first invocation, in ascending order, that wrote the record.
    pub invocation: [u32; 3],

    pub flags: u32,
    pub operands: [u32; 8],

    /// Number of records merged into this diagnostic.
    pub occurrences: u32,

    /// The command that executed the operation.
    pub command: Location,

    /// The call that decoded the log.
    pub decoded_at: Location,
}

impl Diagnostic {
    /// Returns the message describing the problem.
    #[inline]
    pub fn message(&self) -> String {
        self.detail.to_string()
    }

    fn new(
        severity: Severity,
        detail: DiagnosticDetail,
        command: Location,
        decoded_at: Location,
    ) -> Self {
        Diagnostic {
            severity,
            kind: None,
            detail,
            shader_id: 0,
            stage: None,
            entry_point: None,
            site: None,
            function_name: None,
            source_location: None,
            variable: None,
            descriptor: None,
            invocation: [0; 3],
            flags: 0,
            operands: [0; 8],
            occurrences: 1,
            command,
            decoded_at,
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}: {}", self.command, self.detail)?;

        if let Some(descriptor) = &self.descriptor {
            write!(
                f,
                " (descriptor set {}, binding {}, index {})",
                descriptor.set, descriptor.binding, descriptor.index,
            )?;
        }

        if let Some(variable) = &self.variable {
            write!(f, ", accessing `{}`", variable)?;
        }

        match (&self.entry_point, self.stage) {
            (Some(entry_point), Some(stage)) => {
                write!(f, ", in {:?} shader entry point `{}`", stage, entry_point)?;
            }
            (None, Some(stage)) => write!(f, ", in {:?} shader", stage)?,
            _ => {}
        }

        if let Some(location) = &self.source_location {
            write!(f, " at {}", location)?;
        }

        if self.occurrences > 1 {
            write!(f, " ({} occurrences)", self.occurrences)?;
        }

        Ok(())
    }
}

/// Receives the diagnostics and warnings of a validator.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: &Diagnostic);

    /// Receives a warning about something that could not be validated.
    fn warn(&self, location: Location, message: &str) {
        log::warn!("{}: {}", location, message);
    }
}

/// A [`DiagnosticSink`] that forwards everything to the `log` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, diagnostic: &Diagnostic) {
        match diagnostic.severity {
            Severity::Error => log::error!("{}", diagnostic),
            Severity::Warning => log::warn!("{}", diagnostic),
        }
    }
}

/// What the decoder needs besides the resources being decoded.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DecodeContext<'a> {
    pub(crate) shaders: &'a ShaderRegistry,
    pub(crate) max_diagnostics: u32,
    pub(crate) device_lost: bool,
}

/// Decodes the error log of `resources`. The resources can only be decoded once, after their
/// submission has completed.
pub(crate) fn decode(
    resources: &mut CommandResources,
    context: &DecodeContext<'_>,
    loc: Location,
) -> Result<Vec<Diagnostic>, GpuavError> {
    if resources.consumed {
        return Err(GpuavError::AlreadyConsumed);
    }

    if !resources.is_completed() {
        return Err(GpuavError::NotCompleted);
    }

    resources.consumed = true;

    // Logs may hold anything after a device loss.
    if context.device_lost {
        return Ok(Vec::new());
    }

    let (written, words) = resources.read_log();
    let mut records: Vec<ErrorRecord> = words
        .chunks_exact(RECORD_WORDS as usize)
        .filter_map(ErrorRecord::from_words)
        .filter(|record| !record.is_empty())
        .collect();
    records.sort_by_key(ErrorRecord::invocation_key);

    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let mut merged: HashMap<(u32, u32, u32), usize> = HashMap::default();
    let mut suppressed = 0;

    for record in &records {
        let key = (record.shader_id, record.kind, record.site);

        if let Some(&index) = merged.get(&key) {
            diagnostics[index].occurrences += 1;
            continue;
        }

        if diagnostics.len() >= context.max_diagnostics as usize {
            suppressed += 1;
            continue;
        }

        merged.insert(key, diagnostics.len());
        diagnostics.push(analyze(resources, record, context.shaders, loc));
    }

    if suppressed != 0 {
        log::debug!(
            "{}: {} distinct errors were not reported, the per-decode limit is {}",
            resources.location(),
            suppressed,
            context.max_diagnostics,
        );
    }

    let capacity = resources.log_capacity();

    if written > capacity {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            DiagnosticDetail::LogTruncated {
                dropped: written - capacity,
            },
            resources.location(),
            loc,
        ));
    }

    Ok(diagnostics)
}

/// Decodes the record in `raw_words`, and hands the result to `sink`. Returns whether a
/// diagnostic was generated.
pub(crate) fn analyze_and_generate_message(
    resources: &CommandResources,
    raw_words: &[u32],
    shaders: &ShaderRegistry,
    sink: &dyn DiagnosticSink,
    loc: Location,
) -> bool {
    let Some(record) = raw_words
        .get(..RECORD_WORDS as usize)
        .and_then(ErrorRecord::from_words)
    else {
        return false;
    };

    if record.is_empty() {
        return false;
    }

    sink.report(&analyze(resources, &record, shaders, loc));

    true
}

/// Resolves one record into a diagnostic. Records that can't be resolved become a
/// [`DiagnosticDetail::StaleReference`].
fn analyze(
    resources: &CommandResources,
    record: &ErrorRecord,
    shaders: &ShaderRegistry,
    loc: Location,
) -> Diagnostic {
    match try_analyze(resources, record, shaders, loc) {
        Ok(diagnostic) => diagnostic,
        Err(err) => {
            log::debug!("{}: {}", resources.location(), err);

            let problem = match err {
                GpuavError::DecodeInconsistency { problem } => problem,
                err => err.to_string().into(),
            };
            let mut diagnostic = Diagnostic::new(
                Severity::Error,
                DiagnosticDetail::StaleReference { problem },
                resources.location(),
                loc,
            );
            diagnostic.kind = record.error_kind();
            diagnostic.shader_id = record.shader_id;
            diagnostic.site = Some(record.site);
            diagnostic.invocation = record.invocation;
            diagnostic.flags = record.flags;
            diagnostic.operands = record.operands;

            diagnostic
        }
    }
}

fn inconsistency(problem: impl Into<Cow<'static, str>>) -> GpuavError {
    GpuavError::DecodeInconsistency {
        problem: problem.into(),
    }
}

fn try_analyze(
    resources: &CommandResources,
    record: &ErrorRecord,
    shaders: &ShaderRegistry,
    loc: Location,
) -> Result<Diagnostic, GpuavError> {
    let kind = record
        .error_kind()
        .ok_or_else(|| inconsistency(format!("unknown error kind {}", record.kind)))?;
    let o = record.operands;
    let access = |word: u32| AccessKind::from_u32(word);

    let detail = match kind {
        ErrorKind::BufferOutOfBounds => DiagnosticDetail::BufferOutOfBounds {
            offset: o[3],
            size: o[4],
            bound: o[5],
            access: access(o[6]),
        },
        ErrorKind::TexelBufferOutOfBounds => DiagnosticDetail::TexelBufferOutOfBounds {
            texel: o[3],
            texel_count: o[4],
            access: access(o[5]),
        },
        ErrorKind::DescriptorIndexOutOfBounds => {
            DiagnosticDetail::DescriptorIndexOutOfBounds { count: o[3] }
        }
        ErrorKind::DescriptorUninitialized => DiagnosticDetail::DescriptorUninitialized,
        ErrorKind::DescriptorDestroyed => DiagnosticDetail::DescriptorDestroyed,
        ErrorKind::DescriptorStale => DiagnosticDetail::DescriptorStale,
        ErrorKind::BufferAddressOutOfBounds => DiagnosticDetail::BufferAddressOutOfBounds {
            address: u64::from(o[0]) | u64::from(o[1]) << 32,
            size: o[2],
            access: access(o[3]),
        },
        ErrorKind::RayQueryNonFiniteOrigin => {
            DiagnosticDetail::RayQueryNonFiniteOrigin { flags: o[0] }
        }
        ErrorKind::RayQueryNonFiniteDirection => {
            DiagnosticDetail::RayQueryNonFiniteDirection { flags: o[0] }
        }
        ErrorKind::RayQueryNegativeTMin => DiagnosticDetail::RayQueryNegativeTMin {
            t_min: f32::from_bits(o[0]),
        },
        ErrorKind::RayQueryTMaxLessThanTMin => DiagnosticDetail::RayQueryTMaxLessThanTMin {
            t_min: f32::from_bits(o[0]),
            t_max: f32::from_bits(o[1]),
        },
        ErrorKind::RayQueryConflictingFlags => {
            DiagnosticDetail::RayQueryConflictingFlags { flags: o[0] }
        }
        ErrorKind::DispatchGroupCountExceeded => DiagnosticDetail::DispatchGroupCountExceeded {
            group_counts: [o[0], o[1], o[2]],
            limit: [o[3], o[4], o[5]],
        },
        ErrorKind::DrawFirstInstanceNonZero => DiagnosticDetail::DrawFirstInstanceNonZero {
            draw: o[0],
            first_instance: o[1],
        },
        ErrorKind::DrawCountExceedsLimit => DiagnosticDetail::DrawCountExceedsLimit {
            count: o[0],
            limit: o[1],
        },
        ErrorKind::DrawCountExceedsBuffer => DiagnosticDetail::DrawCountExceedsBuffer {
            count: o[0],
            capacity: o[1],
        },
        ErrorKind::MeshTaskCountExceeded => DiagnosticDetail::MeshTaskCountExceeded {
            draw: o[0],
            task_counts: [o[1], o[2], o[3]],
            limit: [o[4], o[5], o[6]],
            total_limit: o[7],
        },
        ErrorKind::TraceRaysDimensionsExceeded => DiagnosticDetail::TraceRaysDimensionsExceeded {
            dimensions: [o[0], o[1], o[2]],
            limit: [o[3], o[4], o[5]],
            total_limit: o[6],
        },
        ErrorKind::CopyDepthOutOfRange => DiagnosticDetail::CopyDepthOutOfRange {
            texel: o[0],
            depth: f32::from_bits(o[1]),
        },
    };

    let mut diagnostic = Diagnostic::new(Severity::Error, detail, resources.location(), loc);
    diagnostic.kind = Some(kind);
    diagnostic.shader_id = record.shader_id;
    diagnostic.invocation = record.invocation;
    diagnostic.flags = record.flags;
    diagnostic.operands = record.operands;

    if kind.is_prepass() {
        return Ok(diagnostic);
    }

    // Prefer the shaders the command kept alive, then any live shader with the id.
    let (shader, entry_point) = match resources.shader(record.shader_id) {
        Some(shader) => (shader.record.clone(), Some(shader.entry_point.clone())),
        None => {
            let shader = shaders.get(record.shader_id).ok_or_else(|| {
                inconsistency(format!("unknown shader id {:#010x}", record.shader_id))
            })?;

            (shader, None)
        }
    };
    let site = shader.debug_symbols().get(record.site).ok_or_else(|| {
        inconsistency(format!(
            "shader {:#010x} has no instruction site {}",
            record.shader_id, record.site,
        ))
    })?;

    diagnostic.site = Some(record.site);
    diagnostic.function_name = site.function_name.clone();
    diagnostic.source_location = site.location.clone();
    diagnostic.variable = site.variable.clone();
    diagnostic.stage = (record.stage != STAGE_UNKNOWN)
        .then(|| ShaderStage::from_execution_model(record.stage));
    diagnostic.entry_point = entry_point.or_else(|| {
        let stage = diagnostic.stage?;

        shader
            .entry_points()
            .iter()
            .find(|entry_point| entry_point.stage == stage)
            .map(|entry_point| entry_point.name.clone())
    });

    if matches!(
        kind,
        ErrorKind::BufferOutOfBounds
            | ErrorKind::TexelBufferOutOfBounds
            | ErrorKind::DescriptorIndexOutOfBounds
            | ErrorKind::DescriptorUninitialized
            | ErrorKind::DescriptorDestroyed
            | ErrorKind::DescriptorStale
    ) {
        let (set, binding, index) = (o[0], o[1], o[2]);
        let snapshot = resources.snapshot(set).ok_or_else(|| {
            inconsistency(format!("descriptor set {} was not bound", set))
        })?;

        if snapshot.binding(binding).is_none() {
            return Err(inconsistency(format!(
                "descriptor set {} has no binding {}",
                set, binding,
            )));
        }

        diagnostic.descriptor = Some(DescriptorInfo {
            set,
            binding,
            index,
            snapshot: snapshot.descriptor(binding, index).copied(),
        });
    }

    Ok(diagnostic)
}
