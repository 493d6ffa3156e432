#![forbid(unsafe_code)]
//! Umbrella crate for the SWMR tick-coordination engine.
//!
//! A writer process publishes a consistent snapshot of its modified data
//! pages once per tick through a small metadata file; reader processes
//! poll that file and invalidate superseded pages in their caches. See
//! `swmr-engine` for the tick controllers and scheduler, `swmr-mdf` for
//! the on-disk format.

pub use swmr_engine::{
    DelayedWrite, DelayedWriteLedger, EotHandle, EotScheduler, IndexDelta, IndexEntry,
    ManualClock, MdIndex, MetadataCache, MonotonicClock, PageBuffer, Role, SwmrReader,
    SwmrWriter, TickClock, TickListStats,
};
pub use swmr_error::{Result, SwmrError};
pub use swmr_mdf::{MdFreeSpace, MetadataFile, codec};
pub use swmr_types::cx::Cx;
pub use swmr_types::{
    ConfigError, ImageSlot, MdPageOffset, PageOffset, PageSize, PublishedEntry, SwmrConfig, Tick,
};
