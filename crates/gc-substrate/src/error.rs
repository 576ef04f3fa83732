//! Error types shared by every component.
//!
//! Allocation-path failures are plain values so collector code can keep
//! running while memory is exhausted. Programmer errors (double destroy,
//! leaving a lock you don't own, dereferencing a dead handle) are not
//! represented here: they panic in debug builds and are unchecked in release.

use thiserror::Error;

/// Invalid collector configuration. Fatal: reported once, at startup.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The soft limit is larger than the hard ceiling.
    #[error("soft heap limit ({soft} bytes) exceeds max heap size ({max} bytes)")]
    SoftLimitAboveMax {
        /// Configured hard ceiling.
        max: usize,
        /// Configured soft ceiling.
        soft: usize,
    },

    /// The hard ceiling cannot hold the minimum number of nurseries.
    #[error("max heap size ({max} bytes) must be at least {required} bytes ({multiple}x the {nursery}-byte nursery)")]
    MaxBelowNurseryMultiple {
        /// Configured hard ceiling.
        max: usize,
        /// Configured nursery size.
        nursery: usize,
        /// Required multiple of the nursery size.
        multiple: usize,
        /// `nursery * multiple`.
        required: usize,
    },

    /// The nursery size is zero or not a power of two.
    #[error("nursery size ({0} bytes) must be a non-zero power of two")]
    NurseryNotPowerOfTwo(usize),

    /// A ratio option is outside its accepted interval.
    #[error("`{name}` must be between {min:.2} and {max:.2}, got {value}")]
    RatioOutOfRange {
        /// Option name.
        name: &'static str,
        /// Rejected value.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },

    /// A size or ratio option could not be parsed.
    #[error("`{name}` has an invalid value `{value}`")]
    InvalidNumber {
        /// Option name.
        name: String,
        /// Raw value text.
        value: String,
    },

    /// The parameter string names an option this crate does not know.
    #[error("unknown option `{0}`")]
    UnknownOption(String),
}

/// Which layer ran out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomSource {
    /// The heap governor denied the reservation.
    Governor,
    /// The bulk memory source could not supply a region.
    BulkMemory,
    /// The handle table could not grow its slot storage.
    HandleTable,
}

impl std::fmt::Display for OomSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Governor => "heap governor",
            Self::BulkMemory => "bulk memory source",
            Self::HandleTable => "handle table",
        })
    }
}

/// Recoverable allocation failure.
///
/// Callers decide whether to collect and retry or to surface the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of memory: {layer} could not provide {requested} bytes")]
pub struct OutOfMemory {
    /// Bytes (or slots, for the handle table) that were requested.
    pub requested: usize,
    /// Layer that failed.
    pub layer: OomSource,
}

impl OutOfMemory {
    /// Creates a new out-of-memory value.
    #[must_use]
    pub const fn new(requested: usize, layer: OomSource) -> Self {
        Self { requested, layer }
    }
}

/// Failure creating a synchronization primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The platform could not provide the primitive.
    #[error("failed to create {0}")]
    CreateFailed(&'static str),
}

/// Umbrella error for [`GcContext`](crate::GcContext) operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GcError {
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Memory was exhausted.
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
    /// A primitive could not be created.
    #[error(transparent)]
    Sync(#[from] SyncError),
}
