//! In-memory collaborator fakes shared by the unit tests.

use crate::collab::{MetadataCache, PageBuffer, TickListStats};
use crate::index::MdIndex;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
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
}

/// Slot-validated in-memory page buffer. Clones share state so a test can
/// keep a handle while the writer owns the boxed collaborator.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakePageBuffer {
    state: Arc<Mutex<PageBufferState>>,
}

impl FakePageBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a dirty page image for the current tick.
    pub(crate) fn dirty_page(&self, page: PageOffset, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        let slot = ImageSlot(u32::try_from(state.images.len()).expect("slot fits u32"));
        state.images.push(Some(bytes));
        state.tick_list.insert(page, slot);
    }

    /// Register a delayed write that releases once the tick reaches
    /// `until`.
    pub(crate) fn delay_write(&self, page: PageOffset, until: Tick) {
        self.state.lock().delayed.push((page, until));
    }

    /// Pages invalidated via `remove_entry`, in call order.
    pub(crate) fn removed(&self) -> Vec<PageOffset> {
        self.state.lock().removed.clone()
    }

    pub(crate) fn current_tick(&self) -> Tick {
        self.state.lock().tick
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
                crate::index::EntryUpdate::Inserted => stats.added += 1,
                crate::index::EntryUpdate::Updated => stats.modified += 1,
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
    clean: bool,
}

/// Event-logging metadata cache fake.
#[derive(Debug, Clone)]
pub(crate) struct FakeMetadataCache {
    state: Arc<Mutex<MetadataCacheState>>,
}

impl FakeMetadataCache {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MetadataCacheState {
                flush_calls: 0,
                refreshed: Vec::new(),
                clean: true,
            })),
        }
    }

    pub(crate) fn flush_calls(&self) -> u32 {
        self.state.lock().flush_calls
    }

    /// Pages refreshed via `evict_or_refresh_all_entries_in_page`.
    pub(crate) fn refreshed(&self) -> Vec<(PageOffset, Tick)> {
        self.state.lock().refreshed.clone()
    }
}

impl MetadataCache for FakeMetadataCache {
    fn flush(&mut self, _cx: &Cx) -> Result<()> {
        self.state.lock().flush_calls += 1;
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
        self.state.lock().clean
    }
}
