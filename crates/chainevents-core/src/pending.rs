//! Per-listener buffer for live notifications that arrive while the
//! listener's history is still being replayed.
//!
//! The `closed` flag is the single source of truth for the
//! buffering → direct transition: a push either lands before the flip and is
//! replayed by [`PendingQueue::drain`], or is handed back to the caller for
//! direct delivery.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::sync::lock;
use crate::types::BlockEvents;

struct Inner<B> {
    items: VecDeque<BlockEvents<B>>,
    closed: bool,
    /// Length at which the next growth warning fires.
    warn_at: usize,
}

/// FIFO of pending [`BlockEvents`] with a one-way closed latch.
pub struct PendingQueue<B> {
    inner: Mutex<Inner<B>>,
    warn_threshold: usize,
}

impl<B> PendingQueue<B> {
    /// Create an open queue that logs a warning each time its length passes
    /// another multiple of `warn_threshold`.
    pub fn new(warn_threshold: usize) -> Self {
        let warn_threshold = warn_threshold.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
                warn_at: warn_threshold,
            }),
            warn_threshold,
        }
    }

    /// Append `entry` if the queue is still open.
    ///
    /// Returns the entry back when the queue is closed; the caller must then
    /// deliver it directly.
    pub fn try_push(&self, entry: BlockEvents<B>) -> Result<(), BlockEvents<B>> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(entry);
        }
        inner.items.push_back(entry);
        if inner.items.len() >= inner.warn_at {
            tracing::warn!(
                pending = inner.items.len(),
                "pending queue is growing while backfill runs"
            );
            inner.warn_at += self.warn_threshold;
        }
        Ok(())
    }

    /// Pop the oldest entry, or close the queue if it is empty.
    fn pop_or_close(&self) -> Option<BlockEvents<B>> {
        let mut inner = lock(&self.inner);
        let next = inner.items.pop_front();
        if next.is_none() {
            inner.closed = true;
        }
        next
    }

    /// Replay every buffered entry in push order, then close the queue.
    ///
    /// The lock is not held while `deliver` runs; entries pushed during the
    /// drain are replayed too. Returns the number of entries replayed.
    pub fn drain(&self, mut deliver: impl FnMut(BlockEvents<B>)) -> usize {
        let mut replayed = 0;
        while let Some(entry) = self.pop_or_close() {
            deliver(entry);
            replayed += 1;
        }
        replayed
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
