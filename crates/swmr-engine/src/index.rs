//! Sorted, fixed-capacity index of modified data pages.
//!
//! One entry per data page currently visible to readers, kept strictly
//! increasing in `data_page`. Capacity is fixed at init from the
//! metadata-file geometry; overflow is fatal in this cut.

use std::fmt;
use swmr_error::{Result, SwmrError};
use swmr_mdf::{MD_HEADER_SIZE, MD_INDEX_ENTRY_SIZE};
use swmr_types::{ImageSlot, MdPageOffset, PageOffset, PageSize, PublishedEntry, Tick};

/// Index capacity implied by the metadata-file geometry: the bytes left
/// after the header, divided by the on-disk entry size.
#[must_use]
pub fn index_capacity(page_size: PageSize, md_pages_reserved: u32) -> usize {
    let bytes = u64::from(md_pages_reserved) * u64::from(page_size.get());
    let available = bytes.saturating_sub(MD_HEADER_SIZE as u64);
    usize::try_from(available / MD_INDEX_ENTRY_SIZE as u64).unwrap_or(usize::MAX)
}

/// One tracked data page: its current image location plus writer-side
/// bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Page in the data file.
    pub data_page: PageOffset,
    /// Where the published image lives in the metadata file; `None` until
    /// first publication.
    pub md_page: Option<MdPageOffset>,
    /// Image length in bytes.
    pub length: u32,
    /// CRC32C of the published image.
    pub chksum: u32,
    /// Live image waiting to be published; owned by the page buffer.
    pub image: Option<ImageSlot>,
    /// Last tick the page was modified.
    pub tick_last_change: Tick,
    /// Last tick an image of the page was written to the metadata file.
    pub tick_last_flush: Tick,
    /// Whether the data-file copy matches the published image.
    pub clean: bool,
    /// The image has been written back to the data file itself.
    pub moved_to_data_file: bool,
    /// Earliest tick at which the data-file copy may be overwritten;
    /// `Tick::ZERO` when no constraint applies.
    pub delayed_flush: Tick,
}

impl IndexEntry {
    fn new(data_page: PageOffset, image: ImageSlot, length: u32, tick: Tick) -> Self {
        Self {
            data_page,
            md_page: None,
            length,
            chksum: 0,
            image: Some(image),
            tick_last_change: tick,
            tick_last_flush: Tick::ZERO,
            clean: false,
            moved_to_data_file: false,
            delayed_flush: Tick::ZERO,
        }
    }
}

/// Outcome of [`MdIndex::insert_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryUpdate {
    Inserted,
    Updated,
}

/// The sorted page-descriptor table.
#[derive(Debug, Clone)]
pub struct MdIndex {
    entries: Vec<IndexEntry>,
    capacity: usize,
}

impl MdIndex {
    /// Index sized from the metadata-file geometry.
    #[must_use]
    pub fn for_config(page_size: PageSize, md_pages_reserved: u32) -> Self {
        Self::with_capacity(index_capacity(page_size, md_pages_reserved))
    }

    /// Index with an explicit entry capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn entry_mut(&mut self, i: usize) -> Option<&mut IndexEntry> {
        self.entries.get_mut(i)
    }

    fn position(&self, page: PageOffset) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.data_page.cmp(&page))
    }

    /// Attach a fresh image for `page`, inserting a new entry if the page
    /// is not yet tracked. Capacity overflow is fatal.
    pub fn insert_or_update(
        &mut self,
        page: PageOffset,
        image: ImageSlot,
        length: u32,
        tick: Tick,
    ) -> Result<EntryUpdate> {
        match self.position(page) {
            Ok(i) => {
                let entry = &mut self.entries[i];
                entry.image = Some(image);
                entry.length = length;
                entry.tick_last_change = tick;
                entry.clean = false;
                Ok(EntryUpdate::Updated)
            }
            Err(i) => {
                if self.entries.len() >= self.capacity {
                    return Err(SwmrError::IndexFull {
                        capacity: self.capacity,
                    });
                }
                self.entries.insert(i, IndexEntry::new(page, image, length, tick));
                Ok(EntryUpdate::Inserted)
            }
        }
    }

    #[must_use]
    pub fn lookup(&self, page: PageOffset) -> Option<&IndexEntry> {
        self.position(page).ok().map(|i| &self.entries[i])
    }

    pub fn lookup_mut(&mut self, page: PageOffset) -> Option<&mut IndexEntry> {
        match self.position(page) {
            Ok(i) => Some(&mut self.entries[i]),
            Err(_) => None,
        }
    }

    /// Entries in `data_page` order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Restore sort order after bulk mutation during tick commit.
    pub fn sort_entries(&mut self) {
        self.entries.sort_by_key(|e| e.data_page);
    }

    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].data_page < w[1].data_page)
    }

    /// Wire view of every published entry, in `data_page` order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedEntry> {
        self.entries
            .iter()
            .filter_map(|e| {
                e.md_page.map(|md_page| PublishedEntry {
                    data_page: e.data_page,
                    md_page,
                    length: e.length,
                    chksum: e.chksum,
                })
            })
            .collect()
    }

    /// Replace the contents with decoded published entries (reader side).
    pub fn apply_published(&mut self, records: &[PublishedEntry]) {
        self.entries.clear();
        self.entries.extend(records.iter().map(|r| IndexEntry {
            data_page: r.data_page,
            md_page: Some(r.md_page),
            length: r.length,
            chksum: r.chksum,
            image: None,
            tick_last_change: Tick::ZERO,
            tick_last_flush: Tick::ZERO,
            clean: true,
            moved_to_data_file: false,
            delayed_flush: Tick::ZERO,
        }));
        debug_assert!(self.is_sorted());
    }

    /// Two-pointer march over `old` and `new`, classifying every page.
    #[must_use]
    pub fn diff(old: &Self, new: &Self) -> IndexDelta {
        let mut delta = IndexDelta::default();
        let mut i = 0;
        let mut j = 0;
        let old_entries = &old.entries;
        let new_entries = &new.entries;

        while i < old_entries.len() && j < new_entries.len() {
            let o = &old_entries[i];
            let n = &new_entries[j];
            match o.data_page.cmp(&n.data_page) {
                std::cmp::Ordering::Equal => {
                    if o.md_page != n.md_page {
                        delta.changed.push(n.data_page);
                    }
                    i += 1;
                    j += 1;
                }
                std::cmp::Ordering::Less => {
                    delta.removed.push(o.data_page);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    delta.added.push(n.data_page);
                    j += 1;
                }
            }
        }
        delta.removed.extend(old_entries[i..].iter().map(|e| e.data_page));
        delta.added.extend(new_entries[j..].iter().map(|e| e.data_page));
        delta
    }
}

/// Pages that changed between two observed index snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDelta {
    /// Pages present only in the new index. No invalidation needed.
    pub added: Vec<PageOffset>,
    /// Pages present only in the old index.
    pub removed: Vec<PageOffset>,
    /// Pages whose image moved inside the metadata file.
    pub changed: Vec<PageOffset>,
}

impl IndexDelta {
    /// Pages needing invalidation (`changed` and `removed` merged), in
    /// ascending page order.
    #[must_use]
    pub fn stale_pages(&self) -> Vec<PageOffset> {
        let mut stale = Vec::with_capacity(self.changed.len() + self.removed.len());
        let mut c = self.changed.iter().peekable();
        let mut r = self.removed.iter().peekable();
        loop {
            match (c.peek(), r.peek()) {
                (Some(&&a), Some(&&b)) => {
                    if a <= b {
                        stale.push(a);
                        c.next();
                    } else {
                        stale.push(b);
                        r.next();
                    }
                }
                (Some(&&a), None) => {
                    stale.push(a);
                    c.next();
                }
                (None, Some(&&b)) => {
                    stale.push(b);
                    r.next();
                }
                (None, None) => break,
            }
        }
        stale
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl fmt::Display for IndexDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added={} removed={} changed={}",
            self.added.len(),
            self.removed.len(),
            self.changed.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(index: &mut MdIndex, page: u64, tick: u64) {
        index
            .insert_or_update(PageOffset(page), ImageSlot(0), 4096, Tick(tick))
            .unwrap();
    }

    fn published(pages: &[(u64, u64)]) -> Vec<PublishedEntry> {
        pages
            .iter()
            .map(|&(data, md)| PublishedEntry {
                data_page: PageOffset(data),
                md_page: MdPageOffset(md),
                length: 4096,
                chksum: 0,
            })
            .collect()
    }

    #[test]
    fn capacity_formula_matches_geometry() {
        let ps = PageSize::new(4096).unwrap();
        // 8 pages * 4096 - 48 = 32720; / 16 = 2045.
        assert_eq!(index_capacity(ps, 8), 2045);
    }

    #[test]
    fn inserts_keep_sorted_order() {
        let mut index = MdIndex::with_capacity(16);
        for page in [9, 2, 5, 1, 7] {
            insert(&mut index, page, 1);
        }
        assert!(index.is_sorted());
        let pages: Vec<u64> = index.iter().map(|e| e.data_page.0).collect();
        assert_eq!(pages, vec![1, 2, 5, 7, 9]);
    }

    #[test]
    fn update_replaces_image_without_duplicate() {
        let mut index = MdIndex::with_capacity(4);
        insert(&mut index, 5, 1);
        let update = index
            .insert_or_update(PageOffset(5), ImageSlot(7), 8192, Tick(2))
            .unwrap();
        assert_eq!(update, EntryUpdate::Updated);
        assert_eq!(index.len(), 1);
        let entry = index.lookup(PageOffset(5)).unwrap();
        assert_eq!(entry.image, Some(ImageSlot(7)));
        assert_eq!(entry.length, 8192);
        assert_eq!(entry.tick_last_change, Tick(2));
        assert!(!entry.clean);
    }

    #[test]
    fn overflow_is_fatal() {
        let mut index = MdIndex::with_capacity(2);
        insert(&mut index, 1, 1);
        insert(&mut index, 2, 1);
        let err = index
            .insert_or_update(PageOffset(3), ImageSlot(0), 4096, Tick(1))
            .unwrap_err();
        assert!(matches!(err, SwmrError::IndexFull { capacity: 2 }));
        // Updates to tracked pages still succeed at capacity.
        assert!(
            index
                .insert_or_update(PageOffset(2), ImageSlot(1), 4096, Tick(2))
                .is_ok()
        );
    }

    #[test]
    fn lookup_misses_cleanly() {
        let mut index = MdIndex::with_capacity(4);
        insert(&mut index, 3, 1);
        assert!(index.lookup(PageOffset(4)).is_none());
        assert!(index.lookup_mut(PageOffset(2)).is_none());
    }

    #[test]
    fn diff_classifies_changed_removed_added() {
        let mut old = MdIndex::with_capacity(8);
        old.apply_published(&published(&[(1, 1), (3, 2), (5, 3), (9, 4)]));
        let mut new = MdIndex::with_capacity(8);
        new.apply_published(&published(&[(1, 1), (3, 6), (7, 5), (9, 4)]));

        let delta = MdIndex::diff(&old, &new);
        assert_eq!(delta.changed, vec![PageOffset(3)]);
        assert_eq!(delta.removed, vec![PageOffset(5)]);
        assert_eq!(delta.added, vec![PageOffset(7)]);
        assert_eq!(delta.stale_pages(), vec![PageOffset(3), PageOffset(5)]);
    }

    #[test]
    fn diff_against_empty_reports_all_added() {
        let old = MdIndex::with_capacity(8);
        let mut new = MdIndex::with_capacity(8);
        new.apply_published(&published(&[(2, 1), (4, 2)]));
        let delta = MdIndex::diff(&old, &new);
        assert_eq!(delta.added.len(), 2);
        assert!(delta.removed.is_empty());
        assert!(delta.changed.is_empty());
        assert!(delta.stale_pages().is_empty());
    }

    #[test]
    fn published_skips_unpublished_entries() {
        let mut index = MdIndex::with_capacity(4);
        insert(&mut index, 2, 1);
        assert!(index.published().is_empty());
        index.lookup_mut(PageOffset(2)).unwrap().md_page = Some(MdPageOffset(1));
        assert_eq!(index.published().len(), 1);
    }
}
