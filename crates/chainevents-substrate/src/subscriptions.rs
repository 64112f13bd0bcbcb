//! Live subscription routing.
//!
//! Maps node-assigned subscription ids to the channel feeding the matching
//! [`Subscription`] stream. The table is cleared on disconnect, which ends
//! every stream; callers open a new subscription after reconnect.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::client::WsCommand;

#[derive(Clone, Default)]
pub(crate) struct SubscriptionTable {
    entries: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>>,
}

impl SubscriptionTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Value>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, key: String) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries().insert(key, tx);
        rx
    }

    /// Forward a notification. Unknown ids are dropped.
    pub(crate) fn dispatch(&self, key: &str, message: Value) {
        let mut entries = self.entries();
        let delivered = match entries.get(key) {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                tracing::debug!(subscription = key, "notification for unknown subscription");
                return;
            }
        };
        if !delivered {
            entries.remove(key);
        }
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Drop every sender, ending all streams.
    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries();
        let n = entries.len();
        entries.clear();
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

/// A live subscription. Yields each notification's `result` payload and
/// ends when the connection drops. Dropping it unsubscribes on the node.
pub struct Subscription {
    id: Value,
    rx: mpsc::UnboundedReceiver<Value>,
    unsubscribe: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
}

impl Subscription {
    pub(crate) fn new(
        id: Value,
        rx: mpsc::UnboundedReceiver<Value>,
        unsubscribe: String,
        cmd_tx: mpsc::UnboundedSender<WsCommand>,
    ) -> Self {
        Self { id, rx, unsubscribe, cmd_tx }
    }

    /// The node-assigned subscription id.
    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Unsubscribe {
            method: std::mem::take(&mut self.unsubscribe),
            id: self.id.take(),
        });
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
