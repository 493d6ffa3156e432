#![forbid(unsafe_code)]
//! Value types shared across the SWMR tick-coordination workspace.
//!
//! Everything here is a small, unit-carrying wrapper: page coordinates in
//! the data file and the metadata file are distinct types so byte/page and
//! data/metadata confusions are compile errors.

pub mod cx;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Smallest minimum lag the protocol can tolerate: a reader may hold a page
/// image across one full fetch cycle plus the tick being published.
pub const MIN_MAX_LAG: u32 = 3;

/// Page index into the data file (units of `PageSize`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageOffset(pub u64);

impl fmt::Display for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Page index into the metadata file (units of `PageSize`).
///
/// Page 0 of the metadata file holds the header and index records, so 0 is
/// never a valid image location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MdPageOffset(pub u64);

impl fmt::Display for MdPageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical publication interval counter.
///
/// Tick 0 is "nothing observed yet"; the writer's first publication is
/// tick 1.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    pub const ZERO: Self = Self(0);

    /// The tick that follows this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// `self + lag`, saturating.
    #[must_use]
    pub fn plus_lag(self, lag: u32) -> Self {
        Self(self.0.saturating_add(u64::from(lag)))
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-owning handle to a page image living in the host page buffer.
///
/// The page buffer owns the image; the index only carries the slot and the
/// page buffer re-validates it on every dereference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSlot(pub u32);

/// The wire-visible part of one index entry: where a data-file page's
/// current image lives in the metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEntry {
    /// Page in the data file this image belongs to.
    pub data_page: PageOffset,
    /// Page in the metadata file where the image currently lives.
    pub md_page: MdPageOffset,
    /// Image length in bytes (one page, or several for large entries).
    pub length: u32,
    /// CRC32C over the image bytes.
    pub chksum: u32,
}

/// Validated page size (power of two in 512..=1 MiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageSize(u32);

impl PageSize {
    /// Create a `PageSize` if `value` is a power of two in [512, 1 MiB].
    pub fn new(value: u32) -> Result<Self, ConfigError> {
        if !value.is_power_of_two() || !(512..=1 << 20).contains(&value) {
            return Err(ConfigError::InvalidPageSize { value });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Byte offset of data-file page `page`, `None` on overflow.
    #[must_use]
    pub fn byte_of_page(self, page: PageOffset) -> Option<u64> {
        page.0.checked_mul(u64::from(self.0))
    }

    /// Byte offset of metadata-file page `page`, `None` on overflow.
    #[must_use]
    pub fn byte_of_md_page(self, page: MdPageOffset) -> Option<u64> {
        page.0.checked_mul(u64::from(self.0))
    }

    /// Number of whole pages needed to hold `len` bytes.
    #[must_use]
    pub fn pages_spanned(self, len: u32) -> u64 {
        u64::from(len.div_ceil(self.0))
    }
}

/// Per-file configuration, fixed at init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwmrConfig {
    /// This handle is the single writer for the file.
    pub writer: bool,
    /// Tick duration in tenths of a second; must be positive.
    pub tick_len: u32,
    /// Minimum ticks an invalidated page image stays observable; >= 3.
    pub max_lag: u32,
    /// Metadata-file capacity in pages.
    pub md_pages_reserved: u32,
    /// Filesystem path of the metadata file.
    pub md_file_path: PathBuf,
}

impl SwmrConfig {
    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_len == 0 {
            return Err(ConfigError::InvalidTickLen);
        }
        if self.max_lag < MIN_MAX_LAG {
            return Err(ConfigError::MaxLagTooSmall {
                max_lag: self.max_lag,
            });
        }
        if self.md_pages_reserved == 0 {
            return Err(ConfigError::NoPagesReserved);
        }
        if self.md_file_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        Ok(())
    }

    /// Tick length as a wall duration (`tick_len` is in tenths of a second).
    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.tick_len) * 100)
    }
}

/// Configuration validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("page size {value} is not a power of two in 512..=1048576")]
    InvalidPageSize { value: u32 },
    #[error("tick_len must be positive")]
    InvalidTickLen,
    #[error("max_lag {max_lag} is below the minimum of {MIN_MAX_LAG}")]
    MaxLagTooSmall { max_lag: u32 },
    #[error("md_pages_reserved must be positive")]
    NoPagesReserved,
    #[error("md_file_path must not be empty")]
    EmptyPath,
    #[error("config role does not match the handle being opened")]
    RoleMismatch,
}
