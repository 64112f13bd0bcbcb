//! Live dispatch: the sole consumer of the raw subscription.
//!
//! For each change set: resolve the block height, decode each events blob
//! once, then route it to every registered listener. A failed header lookup
//! or decode is reported and skips only that notification. Cancelling the
//! handle interrupts a dispatch that is still waiting on the source.

use std::sync::Arc;

use futures::StreamExt;

use crate::engine::{ListeningHandle, Shared};
use crate::error::EventsError;
use crate::source::{EventDecoder, RawChangeStream, RawEventSource};
use crate::types::{BlockEvents, RawChangeSet, StorageKey};

pub(crate) async fn run<S: RawEventSource, D: EventDecoder>(
    shared: Arc<Shared<S, D>>,
    key: StorageKey,
    mut stream: RawChangeStream,
    handle: ListeningHandle,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = handle.stopped() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(set)) => tokio::select! {
                biased;
                _ = handle.stopped() => break,
                _ = dispatch(&shared, &key, set) => {}
            },
            Some(Err(err)) => shared.errors.report(EventsError::Subscription(err)),
            None => {
                shared.errors.report(EventsError::SubscriptionClosed);
                break;
            }
        }
    }

    // Dropping the stream unsubscribes from the source.
    drop(stream);
    handle.cancel();
    tracing::debug!("events dispatcher exited");
}

async fn dispatch<S: RawEventSource, D: EventDecoder>(
    shared: &Shared<S, D>,
    key: &StorageKey,
    set: RawChangeSet,
) {
    let hash = set.block;
    let height = match shared.source.header_height(&hash).await {
        Ok(height) => height,
        Err(source) => {
            shared.errors.report(EventsError::Header { hash, source });
            return;
        }
    };

    for raw in set.event_blobs(key) {
        let batch = match shared.decoder.decode(raw) {
            Ok(batch) => Arc::new(batch),
            Err(source) => {
                shared.errors.report(EventsError::Decode { height, hash, source });
                continue;
            }
        };

        let listeners = shared.registry.snapshot();
        tracing::debug!(height, hash = %hash, listeners = listeners.len(), "dispatching live events");
        for slot in &listeners {
            slot.route(
                BlockEvents::new(Arc::clone(&batch), height, hash),
                shared.executor.as_ref(),
            );
        }
    }
}
