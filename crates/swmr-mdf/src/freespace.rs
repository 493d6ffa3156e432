//! Free-space manager for page-image regions of the metadata file.
//!
//! The metadata file never grows: images live in pages
//! `1..md_pages_reserved` (page 0 holds the header and index records).
//! Allocation is first-fit over a sorted extent map; freed extents
//! coalesce with their neighbors so long-running writers do not fragment
//! the region.

use std::collections::BTreeMap;
use swmr_error::{Result, SwmrError};
use swmr_types::MdPageOffset;
use tracing::trace;

/// Sorted extent map of free metadata-file pages.
#[derive(Debug)]
pub struct MdFreeSpace {
    /// start page -> run length in pages. Invariant: extents are disjoint
    /// and non-adjacent (adjacent runs are coalesced on free).
    free: BTreeMap<u64, u64>,
    total_pages: u64,
}

impl MdFreeSpace {
    /// Manager over `total_pages` pages with the first
    /// `reserved_head_pages` permanently out of circulation.
    #[must_use]
    pub fn new(total_pages: u64, reserved_head_pages: u64) -> Self {
        let mut free = BTreeMap::new();
        if total_pages > reserved_head_pages {
            free.insert(reserved_head_pages, total_pages - reserved_head_pages);
        }
        Self { free, total_pages }
    }

    /// First-fit allocation of `npages` contiguous pages.
    pub fn alloc(&mut self, npages: u64) -> Result<MdPageOffset> {
        if npages == 0 {
            return Err(SwmrError::Format(
                "zero-length metadata-file allocation".to_owned(),
            ));
        }
        let found = self
            .free
            .iter()
            .find(|(_, &len)| len >= npages)
            .map(|(&start, &len)| (start, len));
        let Some((start, len)) = found else {
            return Err(SwmrError::NoSpace);
        };

        self.free.remove(&start);
        if len > npages {
            self.free.insert(start + npages, len - npages);
        }
        trace!(target: "swmr::mdf", event = "alloc", start, npages);
        Ok(MdPageOffset(start))
    }

    /// Return `npages` starting at `start` to the free map, coalescing
    /// with adjacent extents.
    pub fn free(&mut self, start: MdPageOffset, npages: u64) -> Result<()> {
        let start = start.0;
        let end = start
            .checked_add(npages)
            .ok_or_else(|| SwmrError::Format("freed extent overflows u64".to_owned()))?;
        if npages == 0 || end > self.total_pages {
            return Err(SwmrError::Format(format!(
                "freed extent [{start}, {end}) outside metadata file of {} pages",
                self.total_pages
            )));
        }

        // Overlap with an existing free extent means a double free.
        if let Some((&prev_start, &prev_len)) = self.free.range(..=start).next_back() {
            if prev_start + prev_len > start {
                return Err(SwmrError::Format(format!(
                    "double free of metadata-file pages [{start}, {end})"
                )));
            }
        }
        if let Some((&next_start, _)) = self.free.range(start..).next() {
            if next_start < end {
                return Err(SwmrError::Format(format!(
                    "double free of metadata-file pages [{start}, {end})"
                )));
            }
        }

        let mut new_start = start;
        let mut new_len = npages;

        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                new_start = prev_start;
                new_len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&end) {
            self.free.remove(&end);
            new_len += next_len;
        }

        self.free.insert(new_start, new_len);
        trace!(target: "swmr::mdf", event = "free", start, npages);
        Ok(())
    }

    /// Total free pages (extent lengths summed).
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.free.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_starts_at_first_image_page() {
        let mut space = MdFreeSpace::new(8, 1);
        assert_eq!(space.alloc(1).unwrap(), MdPageOffset(1));
        assert_eq!(space.alloc(2).unwrap(), MdPageOffset(2));
        assert_eq!(space.alloc(1).unwrap(), MdPageOffset(4));
        assert_eq!(space.free_pages(), 3);
    }

    #[test]
    fn alloc_exhausts_then_errors() {
        let mut space = MdFreeSpace::new(4, 1);
        assert!(space.alloc(3).is_ok());
        assert!(matches!(space.alloc(1), Err(SwmrError::NoSpace)));
    }

    #[test]
    fn free_coalesces_both_sides() {
        let mut space = MdFreeSpace::new(16, 1);
        let a = space.alloc(3).unwrap();
        let b = space.alloc(3).unwrap();
        let c = space.alloc(3).unwrap();
        space.free(a, 3).unwrap();
        space.free(c, 3).unwrap();
        space.free(b, 3).unwrap();
        // Everything is back and contiguous: a 9-page run plus the tail.
        assert_eq!(space.free_pages(), 15);
        assert_eq!(space.alloc(9).unwrap(), MdPageOffset(1));
    }

    #[test]
    fn first_fit_reuses_freed_hole() {
        let mut space = MdFreeSpace::new(8, 1);
        let a = space.alloc(2).unwrap();
        let _b = space.alloc(2).unwrap();
        space.free(a, 2).unwrap();
        assert_eq!(space.alloc(1).unwrap(), a);
    }

    #[test]
    fn double_free_is_detected() {
        let mut space = MdFreeSpace::new(8, 1);
        let a = space.alloc(2).unwrap();
        space.free(a, 2).unwrap();
        assert!(space.free(a, 2).is_err());
        assert!(space.free(MdPageOffset(6), 4).is_err());
    }
}
