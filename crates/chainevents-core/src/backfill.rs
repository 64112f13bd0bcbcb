//! Per-listener history replay.
//!
//! # Steps
//! 1. Wait until the listener observes its first live notification; that
//!    height is the live start.
//! 2. Replay `[begin, live_start)` one block at a time, in order, straight
//!    to the callback. Cancellation is checked between blocks.
//! 3. Drain the pending queue and close it, switching the listener to
//!    direct delivery.
//!
//! Any fetch or decode failure in step 2 is reported and abandons the rest
//! of the history; step 3 still runs, leaving a gap in that listener's
//! coverage.

use std::sync::Arc;

use crate::engine::Shared;
use crate::error::EventsError;
use crate::listener::ListenerSlot;
use crate::source::{EventDecoder, RawEventSource};
use crate::types::{BlockEvents, BlockHeight};

enum Replay {
    Complete { delivered: u64 },
    Cancelled,
}

pub(crate) async fn run<S: RawEventSource, D: EventDecoder>(
    shared: Arc<Shared<S, D>>,
    slot: Arc<ListenerSlot<D::Batch>>,
) {
    let id = slot.id();
    tokio::select! {
        _ = slot.wait_observed() => {}
        _ = slot.wait_cancelled() => {
            tracing::debug!(listener = %id, "listener cancelled before live start");
            return;
        }
    }
    let Some(live_start) = slot.live_start() else {
        return;
    };

    let begin = slot.begin();
    if begin < live_start {
        tracing::info!(listener = %id, from = begin, to = live_start - 1, "backfilling events");
        match replay(&shared, &slot, begin, live_start).await {
            Ok(Replay::Complete { delivered }) => {
                tracing::info!(listener = %id, delivered, "backfill complete");
            }
            Ok(Replay::Cancelled) => {
                tracing::debug!(listener = %id, "backfill stopped by cancellation");
                return;
            }
            Err(err) => shared.errors.report(err),
        }
    }

    if slot.is_cancelled() {
        return;
    }
    let replayed = slot.queue().drain(|events| slot.deliver(events));
    tracing::info!(listener = %id, live_start, replayed, "listener switched to direct delivery");
}

async fn replay<S: RawEventSource, D: EventDecoder>(
    shared: &Shared<S, D>,
    slot: &ListenerSlot<D::Batch>,
    begin: BlockHeight,
    live_start: BlockHeight,
) -> Result<Replay, EventsError> {
    let listener = slot.id();
    let abort = |height: BlockHeight, source: EventsError| EventsError::Backfill {
        listener,
        height,
        source: Box::new(source),
    };

    let key = shared
        .events_key()
        .await
        .map_err(|source| abort(begin, EventsError::KeyResolution(source)))?;

    let mut delivered = 0;
    for height in begin..live_start {
        if slot.is_cancelled() {
            return Ok(Replay::Cancelled);
        }

        let hash = shared
            .source
            .block_hash_at(height)
            .await
            .map_err(|source| abort(height, EventsError::BlockHash { height, source }))?;
        let raw = shared
            .source
            .raw_events_at(&key, &hash)
            .await
            .map_err(|source| abort(height, EventsError::QueryStorage { height, source }))?;
        let Some(raw) = raw else {
            tracing::debug!(listener = %listener, height, "no events stored for block");
            continue;
        };
        let batch = shared
            .decoder
            .decode(&raw)
            .map_err(|source| abort(height, EventsError::Decode { height, hash, source }))?;

        if slot.is_cancelled() {
            return Ok(Replay::Cancelled);
        }
        slot.deliver(BlockEvents::new(Arc::new(batch), height, hash));
        delivered += 1;
    }
    Ok(Replay::Complete { delivered })
}
