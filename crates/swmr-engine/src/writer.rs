//! Writer-side tick controller.
//!
//! The writer owns the metadata file exclusively. Each end-of-tick it
//! merges the page buffer's tick list into the index, writes every fresh
//! image into newly allocated metadata-file regions, republishes the
//! index and header (index first — the header's tick number commits the
//! tick), then prunes the delayed-write ledger and advances the tick.

use crate::clock::TickClock;
use crate::collab::{MetadataCache, PageBuffer, TickListStats};
use crate::index::MdIndex;
use crate::ledger::{DelayedWrite, DelayedWriteLedger};
use std::sync::Arc;
use std::time::Duration;
use swmr_error::{Result, SwmrError};
use swmr_mdf::{MdFreeSpace, MetadataFile, codec};
use swmr_types::cx::Cx;
use swmr_types::{ConfigError, PageOffset, PageSize, SwmrConfig, Tick};
use tracing::{debug, info, warn};

/// Per-file writer state machine.
pub struct SwmrWriter {
    config: SwmrConfig,
    page_size: PageSize,
    tick_num: Tick,
    end_of_tick: Duration,
    index: Option<MdIndex>,
    index_capacity: usize,
    ledger: DelayedWriteLedger,
    md: Option<MetadataFile>,
    space: MdFreeSpace,
    clock: Arc<dyn TickClock>,
    page_buffer: Box<dyn PageBuffer>,
    metadata_cache: Option<Box<dyn MetadataCache>>,
}

impl std::fmt::Debug for SwmrWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwmrWriter")
            .field("tick_num", &self.tick_num)
            .field("index_len", &self.index.as_ref().map_or(0, MdIndex::len))
            .field("ledger_len", &self.ledger.len())
            .finish_non_exhaustive()
    }
}

impl SwmrWriter {
    /// Create the metadata file and publish the empty tick-1 state.
    pub fn open(
        cx: &Cx,
        config: SwmrConfig,
        page_size: PageSize,
        clock: Arc<dyn TickClock>,
        page_buffer: Box<dyn PageBuffer>,
        metadata_cache: Box<dyn MetadataCache>,
    ) -> Result<Self> {
        config.validate()?;
        if !config.writer {
            return Err(ConfigError::RoleMismatch.into());
        }

        let md_len = u64::from(config.md_pages_reserved) * u64::from(page_size.get());
        let md = MetadataFile::create(cx, &config.md_file_path, page_size, md_len)?;
        // Page 0 holds the header and index records; images start at 1.
        let space = MdFreeSpace::new(u64::from(config.md_pages_reserved), 1);

        let mut writer = Self {
            index_capacity: crate::index::index_capacity(page_size, config.md_pages_reserved),
            end_of_tick: clock.now() + config.tick_duration(),
            config,
            page_size,
            tick_num: Tick(1),
            index: None,
            ledger: DelayedWriteLedger::new(),
            md: Some(md),
            space,
            clock,
            page_buffer,
            metadata_cache: Some(metadata_cache),
        };

        writer.publish_record(cx, Tick(1), true)?;
        writer.page_buffer.set_tick(cx, Tick(1))?;
        info!(
            target: "swmr::tick",
            event = "writer_open",
            path = %writer.config.md_file_path.display(),
            page_size = page_size.get(),
            md_pages = writer.config.md_pages_reserved,
            max_lag = writer.config.max_lag,
        );
        Ok(writer)
    }

    /// The most recently published tick.
    #[must_use]
    pub fn tick_num(&self) -> Tick {
        self.tick_num
    }

    /// Deadline at which the next end-of-tick is due.
    #[must_use]
    pub fn end_of_tick_deadline(&self) -> Duration {
        self.end_of_tick
    }

    #[must_use]
    pub fn index(&self) -> Option<&MdIndex> {
        self.index.as_ref()
    }

    #[must_use]
    pub fn ledger(&self) -> &DelayedWriteLedger {
        &self.ledger
    }

    /// Drop the metadata-cache collaborator; later ticks skip the cache
    /// flush. Models cache destruction late in close.
    pub fn detach_metadata_cache(&mut self) -> Option<Box<dyn MetadataCache>> {
        self.metadata_cache.take()
    }

    /// Run one full writer end-of-tick cycle, publishing `tick_num + 1`.
    pub fn end_of_tick(&mut self, cx: &Cx) -> Result<TickListStats> {
        cx.checkpoint()?;
        let new_tick = self.tick_num.next();

        // Raw-data flush policy is owned by the host library and runs
        // before the engine is entered; nothing to do here.

        // Flush the metadata cache down into the page buffer so every
        // page modified this tick is resident in the tick list. The
        // cache may already be gone late in close.
        if let Some(cache) = self.metadata_cache.as_mut() {
            cache.flush(cx)?;
        }

        // Lazy-init the index on the first tick.
        if self.index.is_none() {
            self.index = Some(MdIndex::with_capacity(self.index_capacity));
        }
        let Some(index) = self.index.as_mut() else {
            return Err(SwmrError::Format("writer index missing".to_owned()));
        };

        // Merge the tick list into the index.
        let stats = self.page_buffer.update_index(cx, new_tick, index)?;

        self.commit_entries(cx, new_tick)?;
        self.publish_record(cx, new_tick, false)?;

        // The tick list and expired delayed writes are dead weight once
        // the tick is committed.
        self.page_buffer.release_tick_list(cx)?;
        self.page_buffer.release_delayed_writes(cx, new_tick)?;

        let space = &mut self.space;
        let page_size = self.page_size;
        let released = self.ledger.prune(new_tick, self.config.max_lag, |dw| {
            space.free(dw.md_page, page_size.pages_spanned(dw.length))
        })?;

        self.tick_num = new_tick;
        self.page_buffer.set_tick(cx, new_tick)?;
        self.end_of_tick = self.clock.now() + self.config.tick_duration();

        debug!(
            target: "swmr::tick",
            event = "writer_eot",
            tick = new_tick.0,
            added = stats.added,
            modified = stats.modified,
            index_len = self.index.as_ref().map_or(0, MdIndex::len),
            ledger_len = self.ledger.len(),
            ledger_released = released,
        );
        Ok(stats)
    }

    /// Commit every index entry holding a live image: retire the previous
    /// image to the ledger, allocate a fresh region, checksum and write
    /// the bytes, then clear the image handle.
    fn commit_entries(&mut self, cx: &Cx, new_tick: Tick) -> Result<()> {
        let Some(index) = self.index.as_mut() else {
            return Ok(());
        };

        for i in 0..index.len() {
            let (data_page, old_md, length, slot) = {
                let entry = &index.entries()[i];
                (entry.data_page, entry.md_page, entry.length, entry.image)
            };
            let Some(slot) = slot else {
                continue;
            };

            // Retire the previous image; its region stays reserved until
            // lagging readers cannot reference it.
            if let Some(md_page) = old_md {
                self.ledger.push(DelayedWrite {
                    data_page,
                    md_page,
                    length,
                    tick_num: new_tick,
                });
            }

            let npages = self.page_size.pages_spanned(length);
            let new_md = self.space.alloc(npages)?;

            let bytes = self.page_buffer.image(cx, slot)?;
            if bytes.len() != length as usize {
                return Err(SwmrError::Format(format!(
                    "image for page {data_page} is {} bytes, entry says {length}",
                    bytes.len()
                )));
            }
            let chksum = crc32c::crc32c(&bytes);
            self.md
                .as_ref()
                .ok_or(SwmrError::FileUnusable)?
                .write_image(cx, new_md, &bytes)?;

            let Some(entry) = index.entry_mut(i) else {
                return Err(SwmrError::Format("index entry vanished mid-commit".to_owned()));
            };
            entry.md_page = Some(new_md);
            entry.chksum = chksum;
            entry.tick_last_flush = new_tick;
            entry.image = None;
        }

        index.sort_entries();
        debug_assert!(index.is_sorted());
        Ok(())
    }

    /// Encode and write the index record then the header, in that order.
    /// `empty` publishes a zero-entry index regardless of in-memory state
    /// (init, flush, and close paths).
    fn publish_record(&mut self, cx: &Cx, tick: Tick, empty: bool) -> Result<()> {
        let entries = if empty {
            Vec::new()
        } else {
            self.index.as_ref().map(MdIndex::published).unwrap_or_default()
        };
        let num_entries = u32::try_from(entries.len())
            .map_err(|_| SwmrError::Format("index entry count does not fit u32".to_owned()))?;
        let index_bytes = codec::encode_index(tick, &entries)?;
        let header_bytes = codec::encode_header(tick, self.page_size, num_entries);
        self.md
            .as_mut()
            .ok_or(SwmrError::FileUnusable)?
            .publish(cx, &index_bytes, &header_bytes)
    }

    /// Earliest tick at which the page buffer may overwrite `page` in the
    /// data file. Always in `[tick_num, tick_num + max_lag]`; a result
    /// outside that range is an internal logic error.
    pub fn delay_write_until(&self, page: PageOffset) -> Result<Tick> {
        let current = self.tick_num;
        let max_lag = self.config.max_lag;

        let entry = self.index.as_ref().and_then(|index| index.lookup(page));
        let delay = match entry {
            // A reader that saw the page's absence may fetch it from the
            // data file for up to max_lag ticks.
            None => current.plus_lag(max_lag),
            Some(e) if e.delayed_flush >= current => e.delayed_flush,
            Some(_) => current,
        };

        if delay < current || delay > current.plus_lag(max_lag) {
            return Err(SwmrError::DelayOutOfRange {
                page: page.0,
                delay: delay.0,
                tick: current.0,
                max_lag,
            });
        }
        Ok(delay)
    }

    /// Sleep one tick, then run end-of-tick. Close-time drain helper.
    fn wait_a_tick(&mut self, cx: &Cx) -> Result<()> {
        self.clock.sleep(self.config.tick_duration());
        self.end_of_tick(cx)?;
        Ok(())
    }

    /// Make the page buffer flushable: force one end-of-tick to clear the
    /// current tick list, then keep ticking until the page buffer's
    /// delayed-write list drains.
    pub fn prep_for_flush_or_close(&mut self, cx: &Cx) -> Result<()> {
        self.end_of_tick(cx)?;
        while self.page_buffer.delayed_write_list_len() > 0 {
            self.wait_a_tick(cx)?;
        }
        Ok(())
    }

    /// Flush: quiesce, publish an empty index at the next tick, and keep
    /// the handle open for further work.
    pub fn flush(&mut self, cx: &Cx) -> Result<()> {
        self.prep_for_flush_or_close(cx)?;
        let new_tick = self.tick_num.next();
        self.publish_record(cx, new_tick, true)?;
        self.tick_num = new_tick;
        self.page_buffer.set_tick(cx, new_tick)?;
        self.end_of_tick = self.clock.now() + self.config.tick_duration();
        info!(target: "swmr::tick", event = "writer_flush", tick = new_tick.0);
        Ok(())
    }

    fn quiesce_for_close(&mut self, cx: &Cx) -> Result<()> {
        self.prep_for_flush_or_close(cx)?;
        let new_tick = self.tick_num.next();
        self.publish_record(cx, new_tick, true)?;
        self.tick_num = new_tick;

        if let Some(cache) = &self.metadata_cache {
            if !cache.is_clean() {
                warn!(
                    target: "swmr::tick",
                    event = "close_with_dirty_cache",
                    tick = new_tick.0,
                );
            }
        }
        Ok(())
    }

    /// Close: quiesce, publish a final empty index, then unlink the
    /// metadata file. The unlink is attempted even when quiescing fails;
    /// unlink and ledger-release failures are logged, not surfaced.
    pub fn close(&mut self, cx: &Cx) -> Result<()> {
        let quiesced = self.quiesce_for_close(cx);
        if let Err(err) = &quiesced {
            warn!(
                target: "swmr::tick",
                event = "close_after_failure",
                error = %err,
            );
        }

        if let Some(md) = self.md.take() {
            md.close_and_unlink(cx)?;
        }
        let dropped = self.ledger.clear();
        if dropped > 0 {
            debug!(
                target: "swmr::tick",
                event = "close_dropped_ledger",
                entries = dropped,
            );
        }
        info!(target: "swmr::tick", event = "writer_close", tick = self.tick_num.0);
        quiesced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testutil::{FakeMetadataCache, FakePageBuffer};
    use swmr_types::MdPageOffset;

    fn config(dir: &tempfile::TempDir) -> SwmrConfig {
        SwmrConfig {
            writer: true,
            tick_len: 1,
            max_lag: 3,
            md_pages_reserved: 8,
            md_file_path: dir.path().join("writer.md"),
        }
    }

    fn open_writer(dir: &tempfile::TempDir) -> (SwmrWriter, FakePageBuffer) {
        let cx = Cx::for_testing();
        let buffer = FakePageBuffer::new();
        let writer = SwmrWriter::open(
            &cx,
            config(dir),
            PageSize::new(4096).unwrap(),
            Arc::new(ManualClock::new()),
            Box::new(buffer.clone()),
            Box::new(FakeMetadataCache::new()),
        )
        .unwrap();
        (writer, buffer)
    }

    #[test]
    fn open_publishes_empty_tick_one() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (writer, buffer) = open_writer(&dir);
        assert_eq!(writer.tick_num(), Tick(1));
        assert_eq!(buffer.current_tick(), Tick(1));
        let header = writer.md.as_ref().unwrap().read_header(&cx).unwrap();
        assert_eq!(header.tick_num, Tick(1));
        assert_eq!(header.index_length, codec::index_record_size(0));
    }

    #[test]
    fn empty_tick_advances_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (mut writer, _buffer) = open_writer(&dir);
        let stats = writer.end_of_tick(&cx).unwrap();
        assert_eq!(stats, TickListStats::default());
        assert_eq!(writer.tick_num(), Tick(2));
        let header = writer.md.as_ref().unwrap().read_header(&cx).unwrap();
        assert_eq!(header.tick_num, Tick(2));
    }

    #[test]
    fn single_page_commit_lands_image_at_page_one() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (mut writer, buffer) = open_writer(&dir);
        buffer.dirty_page(PageOffset(5), vec![0xAB; 4096]);

        let stats = writer.end_of_tick(&cx).unwrap();
        assert_eq!(stats.added, 1);
        assert_eq!(stats.modified, 0);

        let index = writer.index().unwrap();
        let entry = index.lookup(PageOffset(5)).unwrap();
        assert_eq!(entry.md_page, Some(MdPageOffset(1)));
        assert_eq!(entry.length, 4096);
        assert_eq!(entry.chksum, crc32c::crc32c(&[0xAB; 4096]));
        assert!(entry.image.is_none());

        let raw = std::fs::read(dir.path().join("writer.md")).unwrap();
        assert!(raw[4096..8192].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn overwrite_retires_old_image_to_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (mut writer, buffer) = open_writer(&dir);
        buffer.dirty_page(PageOffset(5), vec![0xAB; 4096]);
        writer.end_of_tick(&cx).unwrap();

        buffer.dirty_page(PageOffset(5), vec![0xCD; 4096]);
        // Page 5 is tracked with no flush constraint, so the overwrite is
        // allowed at the current tick.
        assert_eq!(writer.delay_write_until(PageOffset(5)).unwrap(), Tick(2));
        writer.end_of_tick(&cx).unwrap();

        let head = writer.ledger().head().unwrap();
        assert_eq!(head.md_page, MdPageOffset(1));
        assert_eq!(head.tick_num, Tick(3));
        let entry = writer.index().unwrap().lookup(PageOffset(5)).unwrap();
        assert_eq!(entry.md_page, Some(MdPageOffset(2)));

        // Three more empty ticks age the retired image out.
        for _ in 0..3 {
            writer.end_of_tick(&cx).unwrap();
        }
        assert!(writer.ledger().is_empty());
    }

    #[test]
    fn delay_for_untracked_page_is_current_plus_max_lag() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (mut writer, _buffer) = open_writer(&dir);
        writer.end_of_tick(&cx).unwrap();
        let delay = writer.delay_write_until(PageOffset(99)).unwrap();
        assert_eq!(delay, Tick(2 + 3));
    }

    #[test]
    fn delay_honors_delayed_flush_field() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (mut writer, buffer) = open_writer(&dir);
        buffer.dirty_page(PageOffset(7), vec![0x11; 4096]);
        writer.end_of_tick(&cx).unwrap();

        let index = writer.index.as_mut().unwrap();
        index.lookup_mut(PageOffset(7)).unwrap().delayed_flush = Tick(4);
        assert_eq!(writer.delay_write_until(PageOffset(7)).unwrap(), Tick(4));

        // A stale constraint below the current tick means no delay.
        let index = writer.index.as_mut().unwrap();
        index.lookup_mut(PageOffset(7)).unwrap().delayed_flush = Tick(1);
        assert_eq!(writer.delay_write_until(PageOffset(7)).unwrap(), Tick(2));
    }

    #[test]
    fn delay_out_of_range_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (mut writer, buffer) = open_writer(&dir);
        buffer.dirty_page(PageOffset(7), vec![0x11; 4096]);
        writer.end_of_tick(&cx).unwrap();

        let index = writer.index.as_mut().unwrap();
        index.lookup_mut(PageOffset(7)).unwrap().delayed_flush = Tick(100);
        assert!(matches!(
            writer.delay_write_until(PageOffset(7)),
            Err(SwmrError::DelayOutOfRange { page: 7, .. })
        ));
    }

    #[test]
    fn capacity_overflow_aborts_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (mut writer, buffer) = open_writer(&dir);
        writer.end_of_tick(&cx).unwrap();
        assert_eq!(writer.tick_num(), Tick(2));

        // Shrink the index to 4 entries, then dirty 5 pages in one tick.
        writer.index = Some(MdIndex::with_capacity(4));
        for page in 1..=5 {
            buffer.dirty_page(PageOffset(page), vec![0x22; 4096]);
        }
        let err = writer.end_of_tick(&cx).unwrap_err();
        assert!(matches!(err, SwmrError::IndexFull { capacity: 4 }));
        // The tick did not advance and the file still shows the prior one.
        assert_eq!(writer.tick_num(), Tick(2));
        let header = writer.md.as_ref().unwrap().read_header(&cx).unwrap();
        assert_eq!(header.tick_num, Tick(2));
    }

    #[test]
    fn prep_drains_page_buffer_delayed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (mut writer, buffer) = open_writer(&dir);
        buffer.delay_write(PageOffset(3), Tick(4));
        buffer.delay_write(PageOffset(9), Tick(5));

        writer.prep_for_flush_or_close(&cx).unwrap();
        assert_eq!(writer.page_buffer.delayed_write_list_len(), 0);
        assert!(writer.tick_num() >= Tick(5));
    }

    #[test]
    fn close_unlinks_the_metadata_file() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::for_testing();
        let (mut writer, buffer) = open_writer(&dir);
        buffer.dirty_page(PageOffset(2), vec![0x33; 4096]);
        writer.end_of_tick(&cx).unwrap();

        let path = dir.path().join("writer.md");
        assert!(path.exists());
        writer.close(&cx).unwrap();
        assert!(!path.exists());
        // The handle is unusable once closed.
        assert!(matches!(
            writer.end_of_tick(&cx),
            Err(SwmrError::FileUnusable)
        ));
    }
}
