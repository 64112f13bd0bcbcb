//! `EventsEngine`: owns the single live subscription and the listener set.
//!
//! # Lifecycle
//! [`EventsEngine::start`] opens the raw subscription once and spawns the
//! dispatcher. Further calls return the same [`ListeningHandle`] until it is
//! cancelled (or the raw stream ends), after which `start` opens a fresh
//! subscription. A failed `start` leaves the engine inactive.
//!
//! # Listeners
//! [`EventsEngine::register`] may be called before or after `start`. Each
//! listener gets its own backfill task that replays
//! `[begin, live_start)` and then switches the listener to direct delivery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::backfill;
use crate::builder::EngineBuilder;
use crate::config::EngineConfig;
use crate::dispatcher;
use crate::error::{ErrorSink, EventsError, SourceError};
use crate::executor::CallbackExecutor;
use crate::gate::Gate;
use crate::listener::{EventsCallback, ListenerHandle, ListenerSlot};
use crate::registry::ListenerRegistry;
use crate::source::{EventDecoder, RawEventSource};
use crate::sync::lock;
use crate::types::{BlockHash, BlockHeight, StorageKey};

/// State shared by the engine, its dispatcher and every backfill task.
pub(crate) struct Shared<S, D: EventDecoder> {
    pub(crate) source: S,
    pub(crate) decoder: D,
    pub(crate) executor: Arc<dyn CallbackExecutor>,
    pub(crate) registry: Arc<ListenerRegistry<D::Batch>>,
    pub(crate) errors: ErrorSink,
    pub(crate) config: EngineConfig,
    events_key: Mutex<Option<StorageKey>>,
    /// Id of the running subscription, `0` when not listening.
    listening: Arc<AtomicU64>,
    runs: AtomicU64,
    current: tokio::sync::Mutex<Option<ListeningHandle>>,
}

impl<S: RawEventSource, D: EventDecoder> Shared<S, D> {
    /// The events storage key, resolved once and cached.
    pub(crate) async fn events_key(&self) -> Result<StorageKey, SourceError> {
        let cached = lock(&self.events_key).clone();
        if let Some(key) = cached {
            return Ok(key);
        }
        let key = self.source.events_key().await?;
        *lock(&self.events_key) = Some(key.clone());
        Ok(key)
    }
}

/// Shared events subscription with per-listener historical backfill.
pub struct EventsEngine<S, D: EventDecoder> {
    shared: Arc<Shared<S, D>>,
}

impl<S, D: EventDecoder> Clone for EventsEngine<S, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: RawEventSource, D: EventDecoder> EventsEngine<S, D> {
    /// Engine with the default config, running callbacks on tokio's blocking pool.
    pub fn new(source: S, decoder: D) -> Self {
        EngineBuilder::new(source, decoder).build()
    }

    pub fn builder(source: S, decoder: D) -> EngineBuilder<S, D> {
        EngineBuilder::new(source, decoder)
    }

    pub(crate) fn from_parts(
        source: S,
        decoder: D,
        config: EngineConfig,
        executor: Arc<dyn CallbackExecutor>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                decoder,
                executor,
                registry: Arc::new(ListenerRegistry::new(config.max_listeners)),
                errors: ErrorSink::new(config.error_channel_capacity),
                config,
                events_key: Mutex::new(None),
                listening: Arc::new(AtomicU64::new(0)),
                runs: AtomicU64::new(0),
                current: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Open the live subscription if it is not already open.
    ///
    /// Concurrent callers are serialised; all of them receive the same
    /// handle and at most one raw subscription is opened.
    pub async fn start(&self) -> Result<ListeningHandle, EventsError> {
        let shared = &self.shared;
        let mut current = shared.current.lock().await;
        if let Some(handle) = current.as_ref().filter(|h| !h.is_cancelled()) {
            return Ok(handle.clone());
        }

        let key = shared
            .events_key()
            .await
            .map_err(EventsError::KeyResolution)?;
        let stream = shared
            .source
            .subscribe_raw(&key)
            .await
            .map_err(EventsError::Subscribe)?;

        let run = shared.runs.fetch_add(1, Ordering::Relaxed) + 1;
        shared.listening.store(run, Ordering::Release);
        let handle = ListeningHandle::new(run, Arc::clone(&shared.listening), shared.errors.clone());
        tokio::spawn(dispatcher::run(
            Arc::clone(shared),
            key.clone(),
            stream,
            handle.clone(),
        ));
        *current = Some(handle.clone());

        tracing::info!(key = %key, run, listeners = shared.registry.len(), "events listening started");
        Ok(handle)
    }

    /// Register `callback` for events from block `begin` onwards.
    ///
    /// Blocks in `[begin, live_start)` are replayed from history before any
    /// live notification is delivered, where `live_start` is the first live
    /// block this listener observes. A `begin` at or past the live start
    /// skips history entirely.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register<F>(
        &self,
        begin: BlockHeight,
        callback: F,
    ) -> Result<ListenerHandle<D::Batch>, EventsError>
    where
        F: Fn(Arc<D::Batch>, BlockHeight, BlockHash) + Send + Sync + 'static,
    {
        let callback: EventsCallback<D::Batch> = Arc::new(callback);
        let threshold = self.shared.config.pending_warn_threshold;
        let errors = self.shared.errors.clone();
        let slot = self
            .shared
            .registry
            .insert_with(|id| ListenerSlot::new(id, begin, callback, threshold, errors))?;

        tracing::info!(listener = %slot.id(), begin, "events listener registered");
        tokio::spawn(backfill::run(Arc::clone(&self.shared), Arc::clone(&slot)));

        Ok(ListenerHandle::new(slot, Arc::clone(&self.shared.registry)))
    }

    /// A new receiver for asynchronous engine faults.
    pub fn errors(&self) -> broadcast::Receiver<EventsError> {
        self.shared.errors.subscribe()
    }

    /// Returns `true` while a live subscription is open.
    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::Acquire) != 0
    }

    pub fn listener_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

// ─── ListeningHandle ──────────────────────────────────────────────────────────

struct HandleInner {
    run: u64,
    cancelled: AtomicBool,
    stop: Gate,
    listening: Arc<AtomicU64>,
    errors: ErrorSink,
    /// Subscribed before the dispatcher starts; handed out by the first
    /// `errors()` call.
    first: Mutex<Option<broadcast::Receiver<EventsError>>>,
}

/// Handle to one run of the live subscription.
///
/// Clones refer to the same run; cancelling any of them stops it.
#[derive(Clone)]
pub struct ListeningHandle {
    inner: Arc<HandleInner>,
}

impl ListeningHandle {
    fn new(run: u64, listening: Arc<AtomicU64>, errors: ErrorSink) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                run,
                cancelled: AtomicBool::new(false),
                stop: Gate::new(),
                listening,
                first: Mutex::new(Some(errors.subscribe())),
                errors,
            }),
        }
    }

    /// Stop the dispatcher and drop the raw subscription. Only the first
    /// call has an effect. Callbacks already handed to the executor still run.
    pub fn cancel(&self) {
        let inner = &self.inner;
        if inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // A newer run may already own the flag.
        let _ = inner
            .listening
            .compare_exchange(inner.run, 0, Ordering::AcqRel, Ordering::Acquire);
        inner.stop.open();
        tracing::info!(run = inner.run, "events listening stopped");
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// A receiver for the engine's asynchronous faults.
    ///
    /// The first call on a run returns a receiver created before its
    /// dispatcher was spawned, so it sees every fault of that run. Later
    /// calls subscribe at the time of the call.
    pub fn errors(&self) -> broadcast::Receiver<EventsError> {
        match lock(&self.inner.first).take() {
            Some(rx) => rx,
            None => self.inner.errors.subscribe(),
        }
    }

    /// Returns `true` if both handles refer to the same subscription run.
    pub fn same_as(&self, other: &ListeningHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once the handle is cancelled.
    pub async fn stopped(&self) {
        self.inner.stop.wait().await
    }
}

impl std::fmt::Debug for ListeningHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningHandle")
            .field("run", &self.inner.run)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
