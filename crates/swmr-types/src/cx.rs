//! Capability context threaded through fallible engine operations.
//!
//! A `&Cx` is the first parameter of every operation that can block on I/O.
//! `checkpoint()` is called at I/O boundaries so a host that cancels the
//! handle gets a prompt, clean `Cancelled` error instead of a torn
//! operation. The engine itself never cancels; the capability exists for
//! the embedding library.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Returned by [`Cx::checkpoint`] once cancellation has been requested.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cloneable cancellation context. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for unit tests; never cancelled unless the test says so.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::new()
    }

    /// Request cancellation. Idempotent; observed by all clones.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cooperative cancellation point.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
