#![forbid(unsafe_code)]
//! In-memory collaborator fakes for exercising the tick engine end to end.
//!
//! `FakePageBuffer` models the host page buffer: it owns page images in a
//! slot arena, tracks the tick list of pages dirtied since the last
//! end-of-tick, and logs reader-side invalidations. `FakeMetadataCache`
//! records flush and evict-or-refresh traffic. Both hand out cloneable
//! handles over shared state so a test can keep observing after the
//! engine takes ownership of the boxed collaborator.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use swmr_engine::{MdIndex, MetadataCache, PageBuffer, TickListStats};
use swmr_error::{Result, SwmrError};
use swmr_types::cx::Cx;
use swmr_types::{ImageSlot, PageOffset, Tick};

#[derive(Debug, Default)]
struct PageBufferState {
    images: Vec<Option<Vec<u8>>>,
    tick: Tick,
    tick_list: BTreeMap<PageOffset, ImageSlot>,
    delayed: Vec<(PageOffset, Tick)>,
    removed: Vec<PageOffset>,
    release_calls: u32,
}

/// Slot-validated in-memory page buffer.
#[derive(Debug, Clone, Default)]
pub struct FakePageBuffer {
    state: Arc<Mutex<PageBufferState>>,
}

impl FakePageBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dirty page image for the current tick. Dirtying the same
    /// page twice in one tick replaces its image.
    pub fn dirty_page(&self, page: PageOffset, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        let slot = ImageSlot(u32::try_from(state.images.len()).expect("slot fits u32"));
        state.images.push(Some(bytes));
        state.tick_list.insert(page, slot);
    }

    /// Register a delayed write that releases once the tick reaches
    /// `until`.
    pub fn delay_write(&self, page: PageOffset, until: Tick) {
        self.state.lock().delayed.push((page, until));
    }

    /// Pages invalidated via `remove_entry`, in call order.
    #[must_use]
    pub fn removed(&self) -> Vec<PageOffset> {
        self.state.lock().removed.clone()
    }

    /// The tick most recently announced via `set_tick`.
    #[must_use]
    pub fn current_tick(&self) -> Tick {
        self.state.lock().tick
    }

    /// How many times the tick list was released.
    #[must_use]
    pub fn release_calls(&self) -> u32 {
        self.state.lock().release_calls
    }
}

impl PageBuffer for FakePageBuffer {
    fn set_tick(&mut self, _cx: &Cx, tick: Tick) -> Result<()> {
        self.state.lock().tick = tick;
        Ok(())
    }

    fn update_index(&mut self, _cx: &Cx, tick: Tick, index: &mut MdIndex) -> Result<TickListStats> {
        let state = self.state.lock();
        let mut stats = TickListStats::default();
        for (&page, &slot) in &state.tick_list {
            let length = state.images[slot.0 as usize]
                .as_ref()
                .map(|b| u32::try_from(b.len()).expect("image fits u32"))
                .ok_or_else(|| SwmrError::Format(format!("slot {} already released", slot.0)))?;
            match index.insert_or_update(page, slot, length, tick)? {
                swmr_engine::EntryUpdate::Inserted => stats.added += 1,
                swmr_engine::EntryUpdate::Updated => stats.modified += 1,
            }
        }
        for entry in index.iter() {
            if !state.tick_list.contains_key(&entry.data_page) {
                stats.not_in_tick_list += 1;
                if entry.md_page.is_some() {
                    stats.not_in_tick_list_flushed += 1;
                }
            }
        }
        Ok(stats)
    }

    fn image(&self, _cx: &Cx, slot: ImageSlot) -> Result<Vec<u8>> {
        self.state
            .lock()
            .images
            .get(slot.0 as usize)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or_else(|| SwmrError::Format(format!("invalid image slot {}", slot.0)))
    }

    fn release_tick_list(&mut self, _cx: &Cx) -> Result<()> {
        let mut state = self.state.lock();
        let slots: Vec<ImageSlot> = state.tick_list.values().copied().collect();
        for slot in slots {
            state.images[slot.0 as usize] = None;
        }
        state.tick_list.clear();
        state.release_calls += 1;
        Ok(())
    }

    fn release_delayed_writes(&mut self, _cx: &Cx, tick: Tick) -> Result<()> {
        self.state.lock().delayed.retain(|&(_, until)| until > tick);
        Ok(())
    }

    fn delayed_write_list_len(&self) -> usize {
        self.state.lock().delayed.len()
    }

    fn remove_entry(&mut self, _cx: &Cx, page: PageOffset) -> Result<()> {
        self.state.lock().removed.push(page);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MetadataCacheState {
    flush_calls: u32,
    refreshed: Vec<(PageOffset, Tick)>,
    dirty: bool,
}

/// Event-logging metadata cache.
#[derive(Debug, Clone, Default)]
pub struct FakeMetadataCache {
    state: Arc<Mutex<MetadataCacheState>>,
}

impl FakeMetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn flush_calls(&self) -> u32 {
        self.state.lock().flush_calls
    }

    /// Pages refreshed via `evict_or_refresh_all_entries_in_page`.
    #[must_use]
    pub fn refreshed(&self) -> Vec<(PageOffset, Tick)> {
        self.state.lock().refreshed.clone()
    }

    /// Mark the cache dirty so `is_clean` reports false.
    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }
}

impl MetadataCache for FakeMetadataCache {
    fn flush(&mut self, _cx: &Cx) -> Result<()> {
        let mut state = self.state.lock();
        state.flush_calls += 1;
        state.dirty = false;
        Ok(())
    }

    fn evict_or_refresh_all_entries_in_page(
        &mut self,
        _cx: &Cx,
        page: PageOffset,
        new_tick: Tick,
    ) -> Result<()> {
        self.state.lock().refreshed.push((page, new_tick));
        Ok(())
    }

    fn is_clean(&self) -> bool {
        !self.state.lock().dirty
    }
}
