//! Collaborator interfaces the engine consumes from the host library.
//!
//! The engine never touches data-file pages itself: the host page buffer
//! owns every page image and the host metadata cache owns the parsed
//! entries living inside those pages. The index holds [`ImageSlot`]
//! handles into the page buffer, which the page buffer must validate on
//! every dereference and clear before releasing an image.

use crate::index::MdIndex;
use serde::{Deserialize, Serialize};
use swmr_error::Result;
use swmr_types::cx::Cx;
use swmr_types::{ImageSlot, PageOffset, Tick};

/// Counts reported by [`PageBuffer::update_index`] for one tick-list merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickListStats {
    /// Pages that entered the index this tick.
    pub added: u32,
    /// Pages already in the index whose image was replaced this tick.
    pub modified: u32,
    /// Index entries with no counterpart in the tick list.
    pub not_in_tick_list: u32,
    /// Of those, entries that already have a published image.
    pub not_in_tick_list_flushed: u32,
}

/// Host page buffer, as seen from the tick controllers.
pub trait PageBuffer: Send {
    /// Tell the buffer which tick is now accumulating.
    fn set_tick(&mut self, cx: &Cx, tick: Tick) -> Result<()>;

    /// Merge the current tick list into `index`: attach a fresh image to
    /// every entry whose page was modified this tick, inserting entries
    /// for pages the index has not seen.
    fn update_index(&mut self, cx: &Cx, tick: Tick, index: &mut MdIndex) -> Result<TickListStats>;

    /// The image bytes behind `slot`. Implementations must reject slots
    /// that no longer name a live image.
    fn image(&self, cx: &Cx, slot: ImageSlot) -> Result<Vec<u8>>;

    /// Drop the tick list so the next tick starts clean.
    fn release_tick_list(&mut self, cx: &Cx) -> Result<()>;

    /// Release delayed writes whose delay expired at `tick`.
    fn release_delayed_writes(&mut self, cx: &Cx, tick: Tick) -> Result<()>;

    /// Number of writes still waiting out their delay.
    fn delayed_write_list_len(&self) -> usize;

    /// Reader side: invalidate the cached copy of `page`.
    fn remove_entry(&mut self, cx: &Cx, page: PageOffset) -> Result<()>;
}

/// Host metadata cache, as seen from the tick controllers.
pub trait MetadataCache: Send {
    /// Writer side: flush dirty entries down into the page buffer.
    fn flush(&mut self, cx: &Cx) -> Result<()>;

    /// Reader side: evict or re-read every cached entry contained in
    /// `page`. Runs strictly after the page buffer invalidation pass —
    /// a refresh reads through the page buffer and must find fresh bytes.
    fn evict_or_refresh_all_entries_in_page(
        &mut self,
        cx: &Cx,
        page: PageOffset,
        new_tick: Tick,
    ) -> Result<()>;

    /// Whether the cache currently holds no dirty entries.
    fn is_clean(&self) -> bool;
}
