//! Reader-side tick controller.
//!
//! A reader polls the metadata file's header; when the tick advances it
//! fetches the new index, diffs it against the previous snapshot, and
//! invalidates every superseded page — page buffer first, metadata cache
//! second. The pass order is the central correctness constraint: the
//! metadata cache may refresh (re-read) instead of evicting, and a refresh
//! must find fresh page-buffer contents.

use crate::clock::TickClock;
use crate::collab::{MetadataCache, PageBuffer};
use crate::index::{IndexDelta, MdIndex, index_capacity};
use std::sync::Arc;
use std::time::Duration;
use swmr_error::{Result, SwmrError};
use swmr_mdf::MetadataFile;
use swmr_types::cx::Cx;
use swmr_types::{ConfigError, PageSize, SwmrConfig, Tick};
use tracing::{debug, info};

/// Per-file reader state machine.
pub struct SwmrReader {
    config: SwmrConfig,
    /// Learned from the first observed header and pinned thereafter.
    page_size: Option<PageSize>,
    tick_num: Tick,
    end_of_tick: Duration,
    current: MdIndex,
    old: MdIndex,
    md: MetadataFile,
    clock: Arc<dyn TickClock>,
    page_buffer: Box<dyn PageBuffer>,
    metadata_cache: Box<dyn MetadataCache>,
}

impl std::fmt::Debug for SwmrReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwmrReader")
            .field("tick_num", &self.tick_num)
            .field("index_len", &self.current.len())
            .finish_non_exhaustive()
    }
}

impl SwmrReader {
    /// Open the metadata file read-only. The index is not loaded here;
    /// the first end-of-tick observes the writer's published state and
    /// reports the whole index as added.
    pub fn open(
        cx: &Cx,
        config: SwmrConfig,
        clock: Arc<dyn TickClock>,
        page_buffer: Box<dyn PageBuffer>,
        metadata_cache: Box<dyn MetadataCache>,
    ) -> Result<Self> {
        config.validate()?;
        if config.writer {
            return Err(ConfigError::RoleMismatch.into());
        }

        let md = MetadataFile::open_readonly(cx, &config.md_file_path)?;
        let end_of_tick = clock.now() + config.tick_duration();
        info!(
            target: "swmr::tick",
            event = "reader_open",
            path = %config.md_file_path.display(),
        );
        Ok(Self {
            config,
            page_size: None,
            tick_num: Tick::ZERO,
            end_of_tick,
            current: MdIndex::with_capacity(0),
            old: MdIndex::with_capacity(0),
            md,
            clock,
            page_buffer,
            metadata_cache,
        })
    }

    /// The most recently observed tick.
    #[must_use]
    pub fn tick_num(&self) -> Tick {
        self.tick_num
    }

    /// Deadline at which the next end-of-tick is due.
    #[must_use]
    pub fn end_of_tick_deadline(&self) -> Duration {
        self.end_of_tick
    }

    /// The index snapshot as of the last observed tick.
    #[must_use]
    pub fn current_index(&self) -> &MdIndex {
        &self.current
    }

    fn bump_deadline(&mut self) {
        self.end_of_tick = self.clock.now() + self.config.tick_duration();
    }

    /// Run one reader end-of-tick cycle. Returns `None` when the writer
    /// has not published a new tick since the last observation.
    pub fn end_of_tick(&mut self, cx: &Cx) -> Result<Option<IndexDelta>> {
        cx.checkpoint()?;

        let header = self.md.load_header(cx)?;
        if header.tick_num == self.tick_num {
            self.bump_deadline();
            return Ok(None);
        }

        let (header, entries) = self.md.load_published(cx)?;
        let observed = header.tick_num;
        let page_size = PageSize::new(header.page_size)?;
        match self.page_size {
            None => {
                // First observation: size both index buffers from the
                // file geometry.
                let capacity = index_capacity(page_size, self.config.md_pages_reserved);
                self.current = MdIndex::with_capacity(capacity);
                self.old = MdIndex::with_capacity(capacity);
                self.page_size = Some(page_size);
            }
            Some(existing) if existing != page_size => {
                return Err(SwmrError::Format(format!(
                    "metadata-file page size changed from {} to {}",
                    existing.get(),
                    page_size.get()
                )));
            }
            Some(_) => {}
        }

        // Swap the buffers so the diff runs against the prior snapshot
        // without copying.
        std::mem::swap(&mut self.current, &mut self.old);
        self.current.apply_published(&entries);

        let delta = MdIndex::diff(&self.old, &self.current);
        let stale = delta.stale_pages();

        // Pass 0: drop superseded pages from the page buffer.
        for &page in &stale {
            self.page_buffer.remove_entry(cx, page)?;
        }
        // Pass 1: evict or refresh metadata-cache entries living in those
        // pages. Must run after pass 0 so refreshes read fresh bytes.
        for &page in &stale {
            self.metadata_cache
                .evict_or_refresh_all_entries_in_page(cx, page, observed)?;
        }

        debug!(
            target: "swmr::tick",
            event = "reader_eot",
            tick = observed.0,
            added = delta.added.len(),
            removed = delta.removed.len(),
            changed = delta.changed.len(),
        );

        self.tick_num = observed;
        self.bump_deadline();
        Ok(Some(delta))
    }
}
