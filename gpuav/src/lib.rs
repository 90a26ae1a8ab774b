//! GPU-assisted validation for Vulkan.
//!
//! This crate is the device-side half of a Vulkan validation layer. It rewrites the SPIR-V the
//! application hands to the driver so that checks run on the device while the application's
//! shaders execute, provisions the buffers and auxiliary pipelines those checks write into, and
//! after the device has finished turns the packed records it finds there back into structured
//! diagnostics.
//!
//! # Overview
//!
//! Everything goes through a [`Validator`], which owns every registry. The validation front end
//! (the part of the layer that intercepts API calls) drives it like this:
//!
//! - At shader module or pipeline creation, [`Validator::instrument_shader`] returns an
//!   [`Arc<ShaderRecord>`] holding the instrumented binary that should be handed to the driver
//!   instead of the original. When a module can't be instrumented, the original is used and a
//!   one-time warning is reported.
//! - Descriptor updates are mirrored into the [`DescriptorHeap`] through the `on_descriptor_*`
//!   hooks, so that the device knows which descriptors are live and how large they are.
//! - For every validated draw, dispatch, trace or copy,
//!   [`Validator::allocate_command_resources`] allocates a zeroed error log, binds the
//!   validator's descriptor set and, for indirect variants, records a pre-pass that checks the
//!   indirect parameters before the real operation executes.
//! - Once a submission is known to have completed, [`Validator::on_submission_complete`]
//!   decodes every error log of that submission and hands the resulting [`Diagnostic`]s to the
//!   configured [`DiagnosticSink`].
//!
//! Nothing that happens in here is fatal to the application: failures to instrument, to
//! allocate or to build a pre-pass leave the affected object unvalidated and are reported as
//! warnings.
//!
//! [`Arc<ShaderRecord>`]: ShaderRecord
//! [`DescriptorHeap`]: descriptor_heap::DescriptorHeap

#![allow(clippy::missing_safety_doc)]

pub use ash::vk;
pub use crate::{
    command::{
        BindPointState, BoundDescriptorSet, BoundPipeline, CommandBufferState, CommandResources,
        Operation, OperationKind, PipelineShader, PushConstantsState,
    },
    decode::{Diagnostic, DiagnosticDetail, DiagnosticSink, LogSink, Severity},
    device::{DeviceBuffer, DeviceLimits, GpuavDevice},
    instrument::CheckCategories,
    shader::{ShaderRecord, ShaderStage},
    validator::{SubmissionId, Validator, ValidatorCreateInfo},
};
use std::{
    borrow::Cow,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    sync::Arc,
};

#[macro_use]
mod macros;
mod cache;
pub mod command;
pub mod decode;
pub mod descriptor_heap;
pub mod device;
pub mod instrument;
pub mod prepass;
pub mod record;
pub mod shader;
mod slotmap;
#[cfg(test)]
mod tests;
pub mod validator;

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub type DeviceSize = u64;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());

/// Identifies the API call on whose behalf the validator is doing something.
///
/// Locations are carried into diagnostics so that a message can name the command that triggered
/// it, for example the third `vkCmdDispatchIndirect` recorded into a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    /// Name of the API entry point, for example `"vkCmdDraw"`.
    pub function: &'static str,

    /// Index of the command within its command buffer, if the call records a command.
    pub index: Option<u32>,
}

impl Location {
    #[inline]
    pub const fn new(function: &'static str) -> Self {
        Location {
            function,
            index: None,
        }
    }

    #[inline]
    pub const fn with_index(self, index: u32) -> Self {
        Location {
            index: Some(index),
            ..self
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self.index {
            Some(index) => write!(f, "{} (command {})", self.function, index),
            None => f.write_str(self.function),
        }
    }
}

/// Error that can happen inside the validator.
///
/// None of these are fatal to the application: every variant describes a piece of work that was
/// skipped or downgraded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GpuavError {
    /// A shader module uses a construct the rewriter cannot instrument. The original module is
    /// used instead.
    UnsupportedConstruct(instrument::InstrumentError),

    /// A bounded resource ran out. The command being recorded is left unvalidated.
    ResourceExhausted { resource: ExhaustedResource },

    /// Building a pre-pass program failed. The operation kind stays unvalidated for the lifetime
    /// of the validator.
    BuildFailure {
        kind: prepass::PrepassKind,
        reason: Arc<str>,
    },

    /// A record referenced a shader or descriptor the decoder could not resolve.
    DecodeInconsistency { problem: Cow<'static, str> },

    /// The command resources were already decoded.
    AlreadyConsumed,

    /// The command resources were decoded before their submission was known to have completed.
    NotCompleted,

    /// A Vulkan call made on behalf of the validator failed.
    Vulkan(VulkanError),
}

impl Error for GpuavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GpuavError::UnsupportedConstruct(err) => Some(err),
            GpuavError::Vulkan(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for GpuavError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            GpuavError::UnsupportedConstruct(_) => {
                write!(f, "the shader module could not be instrumented")
            }
            GpuavError::ResourceExhausted { resource } => {
                write!(f, "the validator ran out of {}", resource)
            }
            GpuavError::BuildFailure { kind, reason } => write!(
                f,
                "the validation pre-pass for {:?} could not be built: {}",
                kind, reason,
            ),
            GpuavError::DecodeInconsistency { problem } => {
                write!(f, "an error record could not be resolved: {}", problem)
            }
            GpuavError::AlreadyConsumed => {
                write!(f, "the command resources have already been decoded")
            }
            GpuavError::NotCompleted => write!(
                f,
                "the submission that uses the command resources has not completed yet",
            ),
            GpuavError::Vulkan(_) => write!(f, "a runtime error occurred"),
        }
    }
}

impl From<VulkanError> for GpuavError {
    #[inline]
    fn from(err: VulkanError) -> Self {
        GpuavError::Vulkan(err)
    }
}

impl From<instrument::InstrumentError> for GpuavError {
    #[inline]
    fn from(err: instrument::InstrumentError) -> Self {
        GpuavError::UnsupportedConstruct(err)
    }
}

/// A bounded resource that [`GpuavError::ResourceExhausted`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExhaustedResource {
    /// The error-log memory budget of the validator.
    ErrorLogMemory,

    /// Device memory, as reported by the driver.
    DeviceMemory,

    /// Slots of the descriptor metadata heap.
    DescriptorHeapSlots,

    /// Entries of the buffer device address table.
    AddressTableEntries,

    /// The descriptor set index reserved for the validator is used by the pipeline layout.
    DescriptorSetIndex,

    /// Descriptor sets the validator binds for each command.
    DescriptorSets,
}

impl Display for ExhaustedResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(match self {
            ExhaustedResource::ErrorLogMemory => "its error log memory budget",
            ExhaustedResource::DeviceMemory => "device memory",
            ExhaustedResource::DescriptorHeapSlots => "descriptor heap slots",
            ExhaustedResource::AddressTableEntries => "buffer device address table entries",
            ExhaustedResource::DescriptorSetIndex => "free descriptor set indices",
            ExhaustedResource::DescriptorSets => "descriptor sets",
        })
    }
}

/// Error type returned by the Vulkan functions the validator calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VulkanError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    MemoryMapFailed,
    FeatureNotPresent,
    TooManyObjects,
    FragmentedPool,
    OutOfPoolMemory,
    InvalidShader,
    Unknown,
    /// The error is not covered by one of the other variants.
    Unnamed(vk::Result),
}

impl From<vk::Result> for VulkanError {
    fn from(val: vk::Result) -> VulkanError {
        match val {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => VulkanError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => VulkanError::OutOfDeviceMemory,
            vk::Result::ERROR_INITIALIZATION_FAILED => VulkanError::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => VulkanError::DeviceLost,
            vk::Result::ERROR_MEMORY_MAP_FAILED => VulkanError::MemoryMapFailed,
            vk::Result::ERROR_FEATURE_NOT_PRESENT => VulkanError::FeatureNotPresent,
            vk::Result::ERROR_TOO_MANY_OBJECTS => VulkanError::TooManyObjects,
            vk::Result::ERROR_FRAGMENTED_POOL => VulkanError::FragmentedPool,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => VulkanError::OutOfPoolMemory,
            vk::Result::ERROR_INVALID_SHADER_NV => VulkanError::InvalidShader,
            vk::Result::ERROR_UNKNOWN => VulkanError::Unknown,
            result => VulkanError::Unnamed(result),
        }
    }
}

impl Error for VulkanError {}

impl Display for VulkanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            VulkanError::OutOfHostMemory => write!(f, "A host memory allocation has failed."),
            VulkanError::OutOfDeviceMemory => {
                write!(f, "A device memory allocation has failed.")
            }
            VulkanError::InitializationFailed => write!(
                f,
                "Initialization of an object could not be completed for implementation-specific \
                reasons.",
            ),
            VulkanError::DeviceLost => {
                write!(f, "The logical or physical device has been lost.")
            }
            VulkanError::MemoryMapFailed => write!(f, "Mapping of a memory object has failed."),
            VulkanError::FeatureNotPresent => write!(f, "A requested feature is not supported."),
            VulkanError::TooManyObjects => write!(
                f,
                "Too many objects of the type have already been created.",
            ),
            VulkanError::FragmentedPool => write!(
                f,
                "A pool allocation has failed due to fragmentation of the pool's memory.",
            ),
            VulkanError::OutOfPoolMemory => write!(f, "A pool memory allocation has failed."),
            VulkanError::InvalidShader => {
                write!(f, "One or more shaders failed to compile or link.")
            }
            VulkanError::Unknown => write!(
                f,
                "An unknown error has occurred; either the application has provided invalid \
                input, or an implementation failure has occurred.",
            ),
            VulkanError::Unnamed(result) => {
                write!(f, "Unnamed error, VkResult value {}", result.as_raw())
            }
        }
    }
}
