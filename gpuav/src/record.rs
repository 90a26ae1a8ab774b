//! Layout of the buffers that injected code and pre-pass programs write, and that the host reads
//! back.
//!
//! Host and device agree on these layouts through the constants in this module alone: the
//! rewriter emits them as SPIR-V constants, the pre-pass programs bake them into their WGSL
//! source, and the decoder reads words at the same offsets.
//!
//! # Error log
//!
//! ```text
//! word 0       written_count (incremented for every attempted record)
//! words 1..4   reserved
//! words 4..    records, RECORD_WORDS each
//! ```
//!
//! # Error record
//!
//! | word  | meaning                                          |
//! |-------|--------------------------------------------------|
//! | 0     | shader id, or [`PREPASS_SHADER_ID`]              |
//! | 1     | [`ErrorKind`]                                    |
//! | 2     | instruction site id                              |
//! | 3     | execution model of the writing stage             |
//! | 4..7  | stage-specific invocation id                     |
//! | 7     | flags ([`FLAG_OUT_OF_BOUNDS`])                   |
//! | 8..16 | operands, meaning depends on the kind            |

use bytemuck::{Pod, Zeroable};

/// Number of words before the first record of an error log.
pub const LOG_HEADER_WORDS: u32 = 4;

/// Word of the log header holding the number of attempted records.
pub const LOG_WRITTEN_COUNT: u32 = 0;

/// Number of words per error record.
pub const RECORD_WORDS: u32 = 16;

/// Number of operand words per error record.
pub const RECORD_OPERANDS: usize = 8;

/// The shader id the pre-pass programs write.
pub const PREPASS_SHADER_ID: u32 = 0;

/// The stage word of records whose module has entry points of more than one execution model.
pub const STAGE_UNKNOWN: u32 = u32::MAX;

/// Record flag set for accesses outside the bounds of a resource.
pub const FLAG_OUT_OF_BOUNDS: u32 = 1;

/// Word offsets inside a record.
pub mod word {
    pub const SHADER_ID: u32 = 0;
    pub const KIND: u32 = 1;
    pub const SITE: u32 = 2;
    pub const STAGE: u32 = 3;
    pub const INVOCATION: u32 = 4;
    pub const FLAGS: u32 = 7;
    pub const OPERANDS: u32 = 8;
}

/// Number of words per descriptor heap entry: `{generation << 1 | valid, kind, offset, size}`.
pub const HEAP_ENTRY_WORDS: u32 = 4;

/// Word offsets inside a descriptor heap entry.
pub mod heap_word {
    pub const STATE: u32 = 0;
    pub const KIND: u32 = 1;
    pub const OFFSET: u32 = 2;
    pub const SIZE: u32 = 3;
}

/// Number of words per buffer device address table entry: `{start_lo, start_hi, end_lo, end_hi}`.
/// The table starts with one word holding the entry count.
pub const ADDRESS_ENTRY_WORDS: u32 = 4;

/// Bindings of the validator's descriptor set.
pub mod binding {
    pub const ERROR_LOG: u32 = 0;
    pub const DESCRIPTOR_HEAP: u32 = 1;
    pub const BINDING_TABLE: u32 = 2;
    pub const ADDRESS_TABLE: u32 = 3;
    pub const COUNT: u32 = 4;
}

/// How an instrumented instruction accesses memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AccessKind {
    Load = 0,
    Store = 1,
    Atomic = 2,
}

impl AccessKind {
    #[inline]
    pub fn from_u32(val: u32) -> Option<Self> {
        Some(match val {
            0 => AccessKind::Load,
            1 => AccessKind::Store,
            2 => AccessKind::Atomic,
            _ => return None,
        })
    }
}

macro_rules! error_kinds {
    (
        $(
            $(#[doc = $doc:literal])*
            $name:ident = $value:literal,
        )+
    ) => {
        /// What a record reports. The operands of each kind are listed in its documentation.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum ErrorKind {
            $(
                $(#[doc = $doc])*
                $name = $value,
            )+
        }

        impl ErrorKind {
            #[inline]
            pub fn from_u32(val: u32) -> Option<Self> {
                match val {
                    $($value => Some(ErrorKind::$name),)+
                    _ => None,
                }
            }
        }
    };
}

error_kinds! {
    /// `set, binding, index, offset, access size, bound size, access kind`
    BufferOutOfBounds = 1,
    /// `set, binding, index, texel, texel count, access kind`
    TexelBufferOutOfBounds = 2,
    /// `set, binding, index, descriptor count`
    DescriptorIndexOutOfBounds = 3,
    /// `set, binding, index`
    DescriptorUninitialized = 4,
    /// `set, binding, index`
    DescriptorDestroyed = 5,
    /// `set, binding, index`
    DescriptorStale = 6,
    /// `address low, address high, access size, access kind`
    BufferAddressOutOfBounds = 7,
    /// `ray flags`
    RayQueryNonFiniteOrigin = 8,
    /// `ray flags`
    RayQueryNonFiniteDirection = 9,
    /// `t-min bits`
    RayQueryNegativeTMin = 10,
    /// `t-min bits, t-max bits`
    RayQueryTMaxLessThanTMin = 11,
    /// `ray flags`
    RayQueryConflictingFlags = 12,
    /// `x, y, z, limit x, limit y, limit z`
    DispatchGroupCountExceeded = 32,
    /// `draw index, first instance`
    DrawFirstInstanceNonZero = 33,
    /// `count, limit`
    DrawCountExceedsLimit = 34,
    /// `count, draws that fit in the buffer`
    DrawCountExceedsBuffer = 35,
    /// `draw index, x, y, z, limit x, limit y, limit z, total limit`
    MeshTaskCountExceeded = 36,
    /// `width, height, depth, limit width, limit height, limit depth, total limit`
    TraceRaysDimensionsExceeded = 37,
    /// `texel index, depth bits`
    CopyDepthOutOfRange = 38,
}

impl ErrorKind {
    /// Whether the kind is written by a pre-pass program rather than by instrumented code.
    #[inline]
    pub fn is_prepass(self) -> bool {
        self as u32 >= ErrorKind::DispatchGroupCountExceeded as u32
    }
}

/// One error record, exactly as the device wrote it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct ErrorRecord {
    pub shader_id: u32,
    pub kind: u32,
    pub site: u32,
    pub stage: u32,
    pub invocation: [u32; 3],
    pub flags: u32,
    pub operands: [u32; RECORD_OPERANDS],
}

impl ErrorRecord {
    /// Reinterprets `words`, which must be exactly one record long.
    #[inline]
    pub fn from_words(words: &[u32]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytemuck::cast_slice(words)).ok()
    }

    /// Returns the record as words.
    #[inline]
    pub fn as_words(&self) -> &[u32] {
        bytemuck::cast_ref::<_, [u32; RECORD_WORDS as usize]>(self)
    }

    /// Whether the record was never written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kind == 0
    }

    #[inline]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_u32(self.kind)
    }

    /// Key that orders records by invocation, slowest-varying dimension first.
    #[inline]
    pub fn invocation_key(&self) -> (u32, u32, u32) {
        let [x, y, z] = self.invocation;

        (z, y, x)
    }
}

const _: () = assert!(std::mem::size_of::<ErrorRecord>() == RECORD_WORDS as usize * 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_words_match_layout() {
        let record = ErrorRecord {
            shader_id: 9,
            kind: ErrorKind::BufferOutOfBounds as u32,
            site: 40,
            stage: 5,
            invocation: [1, 2, 3],
            flags: FLAG_OUT_OF_BOUNDS,
            operands: [0, 1, 2, 3, 4, 5, 6, 7],
        };
        let words = record.as_words();

        assert_eq!(words[word::SHADER_ID as usize], 9);
        assert_eq!(words[word::SITE as usize], 40);
        assert_eq!(words[word::INVOCATION as usize + 2], 3);
        assert_eq!(words[word::FLAGS as usize], FLAG_OUT_OF_BOUNDS);
        assert_eq!(words[word::OPERANDS as usize + 7], 7);
        assert_eq!(ErrorRecord::from_words(words), Some(record));
        assert_eq!(ErrorRecord::from_words(&words[1..]), None);
    }

    #[test]
    fn prepass_kinds() {
        assert!(!ErrorKind::RayQueryConflictingFlags.is_prepass());
        assert!(ErrorKind::DispatchGroupCountExceeded.is_prepass());
        assert_eq!(ErrorKind::from_u32(38), Some(ErrorKind::CopyDepthOutOfRange));
        assert_eq!(ErrorKind::from_u32(0), None);
    }
}
