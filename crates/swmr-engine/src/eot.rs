//! Process-wide end-of-tick queue.
//!
//! One entry per open file, kept sorted by ascending deadline. The host
//! library's API entry/exit guard drives the queue: on the 0->1 and 1->0
//! entry-count transitions it fires every controller whose deadline has
//! passed. A fired controller is popped, run outside the queue lock, and
//! re-inserted at its new deadline, so progress is guaranteed without
//! re-entrant locking.
//!
//! The head's role and deadline are mirrored into atomics so the per-call
//! hooks can decide whether to fire without touching the queue lock.

use crate::clock::{MonotonicClock, TickClock};
use crate::reader::SwmrReader;
use crate::writer::SwmrWriter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use swmr_error::Result;
use swmr_types::Tick;
use swmr_types::cx::Cx;
use tracing::{debug, error, trace};

/// Which tick controller a queue entry drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
}

/// Shared handle to a scheduled file.
#[derive(Clone)]
pub enum EotHandle {
    Writer(Arc<Mutex<SwmrWriter>>),
    Reader(Arc<Mutex<SwmrReader>>),
}

impl EotHandle {
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::Writer(_) => Role::Writer,
            Self::Reader(_) => Role::Reader,
        }
    }

    fn tick_num(&self) -> Tick {
        match self {
            Self::Writer(w) => w.lock().tick_num(),
            Self::Reader(r) => r.lock().tick_num(),
        }
    }

    fn deadline(&self) -> Duration {
        match self {
            Self::Writer(w) => w.lock().end_of_tick_deadline(),
            Self::Reader(r) => r.lock().end_of_tick_deadline(),
        }
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Writer(a), Self::Writer(b)) => Arc::ptr_eq(a, b),
            (Self::Reader(a), Self::Reader(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Run the controller's end-of-tick.
    fn fire(&self, cx: &Cx) -> Result<()> {
        match self {
            Self::Writer(w) => {
                w.lock().end_of_tick(cx)?;
            }
            Self::Reader(r) => {
                r.lock().end_of_tick(cx)?;
            }
        }
        Ok(())
    }
}

struct EotEntry {
    handle: EotHandle,
    role: Role,
    tick_num: Tick,
    end_of_tick: Duration,
}

impl EotEntry {
    fn snapshot(handle: EotHandle) -> Self {
        Self {
            role: handle.role(),
            tick_num: handle.tick_num(),
            end_of_tick: handle.deadline(),
            handle,
        }
    }
}

const NO_DEADLINE: u64 = u64::MAX;

/// Deadline-sorted queue of open files plus the cached head summary.
pub struct EotScheduler {
    queue: Mutex<Vec<EotEntry>>,
    writer_active: AtomicBool,
    next_deadline_nanos: AtomicU64,
    api_entries: AtomicU32,
    clock: Arc<dyn TickClock>,
}

impl EotScheduler {
    #[must_use]
    pub fn new(clock: Arc<dyn TickClock>) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            writer_active: AtomicBool::new(false),
            next_deadline_nanos: AtomicU64::new(NO_DEADLINE),
            api_entries: AtomicU32::new(0),
            clock,
        }
    }

    /// The process-wide scheduler instance, wall-clocked.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<EotScheduler> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(Arc::new(MonotonicClock::new())))
    }

    /// Whether the head entry (earliest deadline) belongs to a writer.
    #[must_use]
    pub fn writer_active(&self) -> bool {
        self.writer_active.load(Ordering::Acquire)
    }

    /// The earliest deadline in the queue, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        match self.next_deadline_nanos.load(Ordering::Acquire) {
            NO_DEADLINE => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn update_summary(&self, queue: &[EotEntry]) {
        match queue.first() {
            Some(head) => {
                self.writer_active
                    .store(head.role == Role::Writer, Ordering::Release);
                let nanos = u64::try_from(head.end_of_tick.as_nanos()).unwrap_or(NO_DEADLINE);
                self.next_deadline_nanos.store(nanos, Ordering::Release);
            }
            None => {
                self.writer_active.store(false, Ordering::Release);
                self.next_deadline_nanos.store(NO_DEADLINE, Ordering::Release);
            }
        }
    }

    fn insert_locked(queue: &mut Vec<EotEntry>, entry: EotEntry) {
        // After every entry whose deadline is not later than ours.
        let pos = queue.partition_point(|e| e.end_of_tick <= entry.end_of_tick);
        queue.insert(pos, entry);
    }

    /// Schedule a file. Re-registering an already-queued handle is a
    /// logic error and is rejected.
    pub fn register(&self, handle: EotHandle) {
        let entry = EotEntry::snapshot(handle);
        let mut queue = self.queue.lock();
        debug_assert!(
            !queue.iter().any(|e| e.handle.ptr_eq(&entry.handle)),
            "handle registered twice"
        );
        trace!(
            target: "swmr::eot",
            event = "register",
            role = ?entry.role,
            tick = entry.tick_num.0,
        );
        Self::insert_locked(&mut queue, entry);
        self.update_summary(&queue);
    }

    /// Drop a file from the queue (close path).
    pub fn deregister(&self, handle: &EotHandle) {
        let mut queue = self.queue.lock();
        queue.retain(|e| !e.handle.ptr_eq(handle));
        self.update_summary(&queue);
    }

    fn head_is_due(&self) -> bool {
        match self.next_deadline_nanos.load(Ordering::Acquire) {
            NO_DEADLINE => false,
            nanos => self.clock.now() >= Duration::from_nanos(nanos),
        }
    }

    /// Library-entry hook. Fires due controllers on the 0->1 transition.
    pub fn enter_api(&self, cx: &Cx) -> Result<()> {
        let prev = self.api_entries.fetch_add(1, Ordering::AcqRel);
        if prev == 0 && self.head_is_due() {
            self.poll(cx)?;
        }
        Ok(())
    }

    /// Library-exit hook. Fires due controllers on the 1->0 transition.
    pub fn exit_api(&self, cx: &Cx) -> Result<()> {
        let prev = self.api_entries.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "exit_api without matching enter_api");
        if prev == 1 && self.head_is_due() {
            self.poll(cx)?;
        }
        Ok(())
    }

    /// Fire every controller whose deadline has passed, earliest first.
    /// Controllers run outside the queue lock and are re-inserted at the
    /// deadline they computed. A failing controller stays out of the
    /// queue — its file handle is no longer trustworthy.
    pub fn poll(&self, cx: &Cx) -> Result<()> {
        loop {
            let due = {
                let mut queue = self.queue.lock();
                let now = self.clock.now();
                let head_due = queue.first().is_some_and(|head| head.end_of_tick <= now);
                let entry = head_due.then(|| queue.remove(0));
                self.update_summary(&queue);
                entry
            };

            let Some(entry) = due else {
                return Ok(());
            };

            debug!(
                target: "swmr::eot",
                event = "fire",
                role = ?entry.role,
                tick = entry.tick_num.0,
            );
            if let Err(err) = entry.handle.fire(cx) {
                error!(
                    target: "swmr::eot",
                    event = "fire_failed",
                    role = ?entry.role,
                    error = %err,
                );
                return Err(err);
            }

            let refreshed = EotEntry::snapshot(entry.handle);
            let mut queue = self.queue.lock();
            Self::insert_locked(&mut queue, refreshed);
            self.update_summary(&queue);
        }
    }
}
