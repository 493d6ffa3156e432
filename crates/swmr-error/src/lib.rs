#![forbid(unsafe_code)]
//! Error types for the SWMR tick engine.
//!
//! Defines `SwmrError` and a `Result<T>` alias used throughout the
//! workspace. Variants are grouped by the policy the engine applies to
//! them: fatal to the file handle, retried locally on the reader side, or
//! logged best-effort during close.

use swmr_types::ConfigError;
use swmr_types::cx::Cancelled;
use thiserror::Error;

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum SwmrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid metadata-file record: {0}")]
    Format(String),

    /// Reader observed a checksum or tick mismatch mid-publication.
    /// Retried locally up to a bounded budget.
    #[error("torn read of the metadata file: {detail}")]
    TornRead { detail: String },

    #[error("metadata file still torn after {attempts} read attempts")]
    ReadRetriesExhausted { attempts: u32 },

    /// The fixed-capacity index cannot take another entry. Fatal for the
    /// tick and the handle.
    #[error("metadata-file index is full ({capacity} entries)")]
    IndexFull { capacity: usize },

    /// No metadata-file region large enough for an allocation request.
    #[error("no space left in the metadata file")]
    NoSpace,

    /// A delay-write computation fell outside `[tick, tick + max_lag]`.
    /// Indicates an internal logic error.
    #[error(
        "write delay for page {page} out of range: got tick {delay}, \
         current tick {tick}, max lag {max_lag}"
    )]
    DelayOutOfRange {
        page: u64,
        delay: u64,
        tick: u64,
        max_lag: u32,
    },

    /// A publication write failed earlier; the metadata file no longer
    /// reflects a committed tick and the handle refuses further work.
    #[error("metadata file is unusable after a failed publication")]
    FileUnusable,

    #[error("operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for SwmrError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Result alias using `SwmrError`.
pub type Result<T> = std::result::Result<T, SwmrError>;
