#![forbid(unsafe_code)]
//! Single-writer/multiple-reader tick coordination engine.
//!
//! One process mutates a paged data file while independent reader
//! processes observe a consistent view lagging by a bounded number of
//! ticks. Coordination runs entirely through a small metadata file the
//! writer republishes each tick (see `swmr-mdf`); this crate holds the
//! moving parts around it:
//!
//! - [`MdIndex`] — the sorted table of modified data pages and where
//!   their current images live in the metadata file.
//! - [`DelayedWriteLedger`] — previous images of reused metadata-file
//!   regions, retained until no lagging reader can reference them.
//! - [`SwmrWriter`] / [`SwmrReader`] — the per-file tick controllers.
//! - [`EotScheduler`] — the process-wide end-of-tick queue that fires
//!   controllers from the host library's API entry/exit hooks.

pub mod clock;
pub mod collab;
pub mod eot;
pub mod index;
pub mod ledger;
pub mod reader;
#[cfg(test)]
pub(crate) mod testutil;
pub mod writer;

pub use clock::{ManualClock, MonotonicClock, TickClock};
pub use collab::{MetadataCache, PageBuffer, TickListStats};
pub use eot::{EotHandle, EotScheduler, Role};
pub use index::{EntryUpdate, IndexDelta, IndexEntry, MdIndex, index_capacity};
pub use ledger::{DelayedWrite, DelayedWriteLedger};
pub use reader::SwmrReader;
pub use writer::SwmrWriter;
