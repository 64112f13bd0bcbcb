//! Error types for the events engine.

use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{BlockHash, BlockHeight, ListenerId};

/// Errors returned by a [`RawEventSource`](crate::source::RawEventSource).
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The node answered with a JSON-RPC error.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// WebSocket connect/send/receive failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The requested block or storage entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The connection or subscription is gone.
    #[error("source closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Returns `true` if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Timeout { .. } | Self::Closed)
    }
}

/// A raw events blob could not be decoded.
#[derive(Debug, Clone, Error)]
#[error("decode error: {0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Coarse classification of [`EventsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Returned synchronously by `start`; the engine stays inactive.
    Setup,
    /// Live-path failure; only the affected notification is skipped.
    Transient,
    /// History replay failure for one listener; its remaining backfill is abandoned.
    Backfill,
    /// Listener id space exhausted.
    Capacity,
    /// A listener callback panicked; only that delivery is lost.
    Callback,
}

/// Errors produced by the events engine.
#[derive(Debug, Clone, Error)]
pub enum EventsError {
    #[error("resolve events storage key: {0}")]
    KeyResolution(#[source] SourceError),

    #[error("open live subscription: {0}")]
    Subscribe(#[source] SourceError),

    #[error("get header for block {hash}: {source}")]
    Header {
        hash: BlockHash,
        #[source]
        source: SourceError,
    },

    #[error("get block hash at {height}: {source}")]
    BlockHash {
        height: BlockHeight,
        #[source]
        source: SourceError,
    },

    #[error("query events storage at block {height}: {source}")]
    QueryStorage {
        height: BlockHeight,
        #[source]
        source: SourceError,
    },

    #[error("events decoder at block {height}: {source}")]
    Decode {
        height: BlockHeight,
        hash: BlockHash,
        #[source]
        source: DecodeError,
    },

    #[error("live subscription: {0}")]
    Subscription(#[source] SourceError),

    #[error("live subscription stream ended")]
    SubscriptionClosed,

    #[error("listener {listener} backfill aborted at block {height}: {source}")]
    Backfill {
        listener: ListenerId,
        height: BlockHeight,
        #[source]
        source: Box<EventsError>,
    },

    #[error("too many events listeners (limit {limit})")]
    TooManyListeners { limit: usize },

    #[error("listener {listener} callback panicked at block {height}: {message}")]
    CallbackPanicked {
        listener: ListenerId,
        height: BlockHeight,
        message: String,
    },
}

impl EventsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::KeyResolution(_) | Self::Subscribe(_) => ErrorKind::Setup,
            Self::Backfill { .. } => ErrorKind::Backfill,
            Self::TooManyListeners { .. } => ErrorKind::Capacity,
            Self::CallbackPanicked { .. } => ErrorKind::Callback,
            Self::Header { .. }
            | Self::BlockHash { .. }
            | Self::QueryStorage { .. }
            | Self::Decode { .. }
            | Self::Subscription(_)
            | Self::SubscriptionClosed => ErrorKind::Transient,
        }
    }

    /// Returns `true` if this error abandoned a listener's history replay.
    pub fn is_backfill(&self) -> bool {
        matches!(self, Self::Backfill { .. })
    }

    /// The listener this error belongs to, if any.
    pub fn listener(&self) -> Option<ListenerId> {
        match self {
            Self::Backfill { listener, .. } | Self::CallbackPanicked { listener, .. } => {
                Some(*listener)
            }
            _ => None,
        }
    }
}

/// Fan-out point for asynchronous faults.
///
/// Reporting never blocks: receivers that fall behind observe
/// `RecvError::Lagged` instead of stalling the reporter.
#[derive(Debug, Clone)]
pub(crate) struct ErrorSink {
    tx: broadcast::Sender<EventsError>,
}

impl ErrorSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn report(&self, err: EventsError) {
        tracing::warn!(error = %err, kind = ?err.kind(), "events engine fault");
        if self.tx.send(err).is_err() {
            tracing::debug!("no error receivers attached");
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EventsError> {
        self.tx.subscribe()
    }
}
