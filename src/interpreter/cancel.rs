//! Cooperative cancellation for running scripts
//!
//! The token is shared between the interpreter state, the REPL watcher and
//! `terminate`. The VM polls `check` from its instruction hook.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{CONTEXT_CANCELED, CONTEXT_DEADLINE_EXCEEDED};

/// Why `check` refused to continue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Canceled,
    DeadlineExceeded,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Canceled => f.write_str(CONTEXT_CANCELED),
            Interrupt::DeadlineExceeded => f.write_str(CONTEXT_DEADLINE_EXCEEDED),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    canceled: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

/// Cancellation flag plus an optional deadline
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the flag and arm a new deadline `timeout` from now
    pub fn reset(&self, timeout: Option<Duration>) {
        self.inner.canceled.store(false, Ordering::SeqCst);
        *self.inner.deadline.lock() = timeout.map(|t| Instant::now() + t);
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Interrupt> {
        if self.is_canceled() {
            return Err(Interrupt::Canceled);
        }
        match *self.inner.deadline.lock() {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupt::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}
