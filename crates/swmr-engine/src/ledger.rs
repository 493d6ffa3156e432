//! Delayed-write ledger: previous images of reused metadata-file regions.
//!
//! When a tick replaces a page's image, the old metadata-file region must
//! stay untouched until every reader that might still reference it has
//! caught up — `max_lag` ticks. The ledger is a FIFO: new entries enter at
//! the head carrying the publishing tick, so tick numbers are
//! non-increasing toward the tail and the prune scan can stop at the
//! first entry that is too young.

use std::collections::VecDeque;
use swmr_error::Result;
use swmr_types::{MdPageOffset, PageOffset, Tick};
use tracing::trace;

/// One retained previous image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayedWrite {
    pub data_page: PageOffset,
    pub md_page: MdPageOffset,
    pub length: u32,
    /// Tick at which the image was superseded.
    pub tick_num: Tick,
}

/// FIFO of retained previous images. Front is newest, back is oldest.
#[derive(Debug, Default)]
pub struct DelayedWriteLedger {
    entries: VecDeque<DelayedWrite>,
}

impl DelayedWriteLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Head-to-tail (newest-to-oldest) iteration.
    pub fn iter(&self) -> impl Iterator<Item = &DelayedWrite> {
        self.entries.iter()
    }

    #[must_use]
    pub fn head(&self) -> Option<&DelayedWrite> {
        self.entries.front()
    }

    /// Record a superseded image. `entry.tick_num` must be the tick being
    /// published, which keeps the tail-ward monotonicity invariant.
    pub fn push(&mut self, entry: DelayedWrite) {
        debug_assert!(
            self.entries
                .front()
                .is_none_or(|head| head.tick_num <= entry.tick_num),
            "ledger pushes must carry non-decreasing ticks"
        );
        trace!(
            target: "swmr::tick",
            event = "ledger_push",
            data_page = entry.data_page.0,
            md_page = entry.md_page.0,
            tick = entry.tick_num.0,
        );
        self.entries.push_front(entry);
    }

    /// Release every entry that has sat out `max_lag` ticks as of
    /// `current_tick`, oldest first, handing each to `release` (which
    /// returns the region to the free-space manager). Stops at the first
    /// entry that is still too young. Returns how many were released.
    pub fn prune<F>(&mut self, current_tick: Tick, max_lag: u32, mut release: F) -> Result<usize>
    where
        F: FnMut(&DelayedWrite) -> Result<()>,
    {
        let mut released = 0_usize;
        if current_tick.0 <= u64::from(max_lag) {
            return Ok(released);
        }
        let cutoff = current_tick.0 - u64::from(max_lag);

        while let Some(tail) = self.entries.back() {
            if tail.tick_num.0 > cutoff {
                break;
            }
            release(tail)?;
            let entry = self.entries.pop_back();
            debug_assert!(entry.is_some());
            released += 1;
        }
        if released > 0 {
            trace!(
                target: "swmr::tick",
                event = "ledger_prune",
                tick = current_tick.0,
                released,
                remaining = self.entries.len(),
            );
        }
        Ok(released)
    }

    /// Drop everything (close path). Returns how many entries were held.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}
