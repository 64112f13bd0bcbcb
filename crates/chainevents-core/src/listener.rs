//! Per-listener state and the wrapped callback the dispatcher invokes.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ErrorSink, EventsError};
use crate::executor::{panic_message, CallbackExecutor, Lane};
use crate::gate::Gate;
use crate::pending::PendingQueue;
use crate::registry::ListenerRegistry;
use crate::types::{BlockEvents, BlockHash, BlockHeight, ListenerId, ListenerMode};

/// User callback receiving one decoded batch per block.
pub type EventsCallback<B> = Arc<dyn Fn(Arc<B>, BlockHeight, BlockHash) + Send + Sync + 'static>;

/// `live_start` value before the first live notification is observed.
const UNSET: u64 = u64::MAX;

/// One registered listener.
pub struct ListenerSlot<B> {
    id: ListenerId,
    begin: BlockHeight,
    callback: EventsCallback<B>,
    queue: PendingQueue<B>,
    /// Height of the first live notification routed to this listener.
    live_start: AtomicU64,
    observed: Gate,
    cancelled: Gate,
    /// Lowest height the next delivery may carry (last delivered + 1).
    next_height: AtomicU64,
    lane: Arc<Lane>,
    errors: ErrorSink,
}

impl<B> std::fmt::Debug for ListenerSlot<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("id", &self.id)
            .field("begin", &self.begin)
            .finish_non_exhaustive()
    }
}

impl<B> ListenerSlot<B> {
    pub(crate) fn new(
        id: ListenerId,
        begin: BlockHeight,
        callback: EventsCallback<B>,
        pending_warn_threshold: usize,
        errors: ErrorSink,
    ) -> Self {
        Self {
            id,
            begin,
            callback,
            queue: PendingQueue::new(pending_warn_threshold),
            live_start: AtomicU64::new(UNSET),
            observed: Gate::new(),
            cancelled: Gate::new(),
            next_height: AtomicU64::new(0),
            lane: Arc::new(Lane::new()),
            errors,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn begin(&self) -> BlockHeight {
        self.begin
    }

    /// Height at which live coverage began, once observed.
    pub fn live_start(&self) -> Option<BlockHeight> {
        match self.live_start.load(Ordering::Acquire) {
            UNSET => None,
            height => Some(height),
        }
    }

    pub fn mode(&self) -> ListenerMode {
        if self.queue.is_closed() {
            ListenerMode::Direct
        } else {
            ListenerMode::Buffering
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_open()
    }

    pub(crate) fn queue(&self) -> &PendingQueue<B> {
        &self.queue
    }

    pub(crate) async fn wait_observed(&self) {
        self.observed.wait().await
    }

    pub(crate) async fn wait_cancelled(&self) {
        self.cancelled.wait().await
    }

    /// Mark the listener cancelled. Returns `true` for the first call only.
    pub(crate) fn cancel(&self) -> bool {
        self.cancelled.open()
    }

    /// Invoke the user callback, dropping anything at or below the last
    /// delivered height.
    ///
    /// A panicking callback is reported as
    /// [`EventsError::CallbackPanicked`]; the listener keeps receiving later
    /// blocks.
    pub(crate) fn deliver(&self, events: BlockEvents<B>) {
        if self.is_cancelled() {
            return;
        }
        let floor = self
            .next_height
            .fetch_max(events.height.saturating_add(1), Ordering::AcqRel);
        if events.height < floor {
            tracing::debug!(
                listener = %self.id,
                height = events.height,
                "skipping already delivered block"
            );
            return;
        }
        let height = events.height;
        let callback = &self.callback;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            callback(events.batch, events.height, events.hash)
        }));
        if let Err(payload) = outcome {
            self.errors.report(EventsError::CallbackPanicked {
                listener: self.id,
                height,
                message: panic_message(payload.as_ref()),
            });
        }
    }
}

impl<B: Send + Sync + 'static> ListenerSlot<B> {
    /// The wrapped callback: route one live notification.
    ///
    /// The first call captures the live-start height. While the listener is
    /// buffering the entry goes to the pending queue; once the queue is
    /// closed it is delivered through the listener's lane.
    pub(crate) fn route(self: &Arc<Self>, events: BlockEvents<B>, executor: &dyn CallbackExecutor) {
        if self.is_cancelled() {
            return;
        }
        if self
            .live_start
            .compare_exchange(UNSET, events.height, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(listener = %self.id, height = events.height, "live start observed");
            self.observed.open();
        }

        if let Err(events) = self.queue.try_push(events) {
            let slot = Arc::clone(self);
            self.lane.submit(executor, Box::new(move || slot.deliver(events)));
        }
    }
}

/// Handle returned by [`EventsEngine::register`](crate::EventsEngine::register).
///
/// Dropping the handle does not cancel the listener.
#[must_use = "dropping the handle leaves the listener registered with no way to cancel it"]
pub struct ListenerHandle<B> {
    slot: Arc<ListenerSlot<B>>,
    registry: Arc<ListenerRegistry<B>>,
}

impl<B> ListenerHandle<B> {
    pub(crate) fn new(slot: Arc<ListenerSlot<B>>, registry: Arc<ListenerRegistry<B>>) -> Self {
        Self { slot, registry }
    }

    pub fn id(&self) -> ListenerId {
        self.slot.id()
    }

    pub fn mode(&self) -> ListenerMode {
        self.slot.mode()
    }

    /// Height at which live coverage began for this listener, once known.
    pub fn live_start(&self) -> Option<BlockHeight> {
        self.slot.live_start()
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.is_cancelled()
    }

    /// Stop deliveries and remove the listener. Safe to call repeatedly and
    /// concurrently; only the first call has an effect.
    ///
    /// A history fetch already in flight completes, but no further block is
    /// requested.
    pub fn cancel(&self) {
        if self.slot.cancel() {
            self.registry.remove(&self.slot);
            tracing::info!(listener = %self.slot.id(), "events listener cancelled");
        }
    }
}

impl<B> Clone for ListenerHandle<B> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            registry: Arc::clone(&self.registry),
        }
    }
}
