//! Cancellation and progress reporting for long-running operations.
use crate::error::{ImageError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Bookkeeping threaded through a single list/extract/create call.
///
/// The `running` flag is owned by the caller; clearing it cancels the
/// operation at the next directory record or cluster boundary.
pub(crate) struct Task<'a> {
    running: &'a AtomicBool,
    on_progress: &'a mut dyn FnMut(u64),
    bytes: u64,
}

impl<'a> Task<'a> {
    pub(crate) fn new(running: &'a AtomicBool, on_progress: &'a mut dyn FnMut(u64)) -> Self {
        Self {
            running,
            on_progress,
            bytes: 0,
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ImageError::Cancelled)
        }
    }

    /// Records `n` more bytes processed.
    pub(crate) fn advance(&mut self, n: u64) {
        self.bytes += n;
        (self.on_progress)(self.bytes);
    }
}

#[cfg(test)]
pub(crate) fn detached<R>(f: impl FnOnce(&mut Task<'_>) -> R) -> R {
    let running = AtomicBool::new(true);
    let mut sink = |_: u64| {};
    let mut task = Task::new(&running, &mut sink);
    f(&mut task)
}
