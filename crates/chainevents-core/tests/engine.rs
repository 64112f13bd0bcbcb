//! End-to-end tests of the events engine against an in-memory chain.
//!
//! Each test drives a `MemoryChain`, registers listeners that forward the
//! delivered heights into a channel, and asserts on the exact sequence seen.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chainevents_core::{
    BlockHash, DecodeError, EventDecoder, EventsEngine, EventsError, ListenerHandle, ListenerId,
    ListenerMode, MemoryChain, SourceError,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

// ─── Helpers ──────────────────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);

/// Hands blobs through, rejecting the literal blob `bad`.
struct Blobs;

impl EventDecoder for Blobs {
    type Batch = Vec<u8>;

    fn decode(&self, raw: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if raw == b"bad" {
            return Err(DecodeError::new("rejected blob"));
        }
        Ok(raw.to_vec())
    }
}

type Engine = EventsEngine<MemoryChain, Blobs>;

fn chain_with(blocks: u64) -> MemoryChain {
    let chain = MemoryChain::new();
    for height in 0..blocks {
        chain.push_block(height.to_be_bytes().to_vec());
    }
    chain
}

fn register(engine: &Engine, begin: u64) -> (ListenerHandle<Vec<u8>>, mpsc::UnboundedReceiver<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = engine
        .register(begin, move |_, height, _| {
            let _ = tx.send(height);
        })
        .expect("register");
    (handle, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<u64>) -> u64 {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("listener channel closed")
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<u64>, n: usize) -> Vec<u64> {
    let mut seen = Vec::with_capacity(n);
    while seen.len() < n {
        seen.push(next(rx).await);
    }
    seen
}

async fn collect_until(rx: &mut mpsc::UnboundedReceiver<u64>, last: u64) -> Vec<u64> {
    let mut seen = vec![];
    loop {
        let height = next(rx).await;
        seen.push(height);
        if height == last {
            return seen;
        }
    }
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<u64>) {
    if let Ok(Some(height)) = timeout(QUIET, rx.recv()).await {
        panic!("unexpected delivery of block {height}");
    }
}

async fn next_error(rx: &mut tokio::sync::broadcast::Receiver<EventsError>) -> EventsError {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for error")
        .expect("error channel")
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

// ─── Backfill + live handoff ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backfill_then_live_without_gaps_or_duplicates() {
    let chain = chain_with(100);
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let (handle, mut rx) = register(&engine, 95);
    assert_eq!(handle.mode(), ListenerMode::Buffering);

    engine.start().await.unwrap();
    chain.push_block(vec![100]);
    chain.push_block(vec![101]);
    chain.push_block(vec![102]);

    assert_eq!(collect(&mut rx, 8).await, (95..=102).collect::<Vec<_>>());
    assert_eq!(handle.live_start(), Some(100));
    eventually(|| handle.mode() == ListenerMode::Direct).await;

    chain.push_block(vec![103]);
    assert_eq!(next(&mut rx).await, 103);
    assert_quiet(&mut rx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backfill_fault_leaves_gap_for_one_listener_only() {
    let chain = chain_with(5);
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let mut errors = engine.errors();

    let (a, mut rx_a) = register(&engine, 0);
    let (b, mut rx_b) = register(&engine, 0);
    chain.fail_block_hash_once(2);

    engine.start().await.unwrap();
    chain.push_block(vec![5]);

    let err = next_error(&mut errors).await;
    assert!(err.is_backfill());
    let gapped = err.listener().unwrap();
    match &err {
        EventsError::Backfill { height, source, .. } => {
            assert_eq!(*height, 2);
            assert!(matches!(**source, EventsError::BlockHash { height: 2, .. }));
        }
        other => panic!("expected backfill error, got {other:?}"),
    }

    chain.push_block(vec![6]);
    let seen_a = collect_until(&mut rx_a, 6).await;
    let seen_b = collect_until(&mut rx_b, 6).await;

    let (gap, full) = if gapped == a.id() {
        (seen_a, seen_b)
    } else {
        assert_eq!(gapped, b.id());
        (seen_b, seen_a)
    };
    assert_eq!(gap, vec![0, 1, 5, 6]);
    assert_eq!(full, vec![0, 1, 2, 3, 4, 5, 6]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_registration_backfills_from_history() {
    let chain = chain_with(3);
    let engine = EventsEngine::new(chain.clone(), Blobs);
    engine.start().await.unwrap();
    for height in 3..10u8 {
        chain.push_block(vec![height]);
    }

    let (_handle, mut rx) = register(&engine, 2);
    chain.push_block(vec![10]);
    chain.push_block(vec![11]);

    assert_eq!(collect(&mut rx, 10).await, (2..=11).collect::<Vec<_>>());
}

#[tokio::test]
async fn begin_beyond_head_gets_only_live_events() {
    let chain = chain_with(3);
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let (_handle, mut rx) = register(&engine, 10);

    engine.start().await.unwrap();
    chain.push_block(vec![3]);
    chain.push_block(vec![4]);

    assert_eq!(collect(&mut rx, 2).await, vec![3, 4]);
}

#[tokio::test]
async fn empty_blocks_are_skipped() {
    let chain = MemoryChain::new();
    chain.push_block(vec![0]);
    chain.push_empty_block();
    chain.push_block(vec![2]);
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let (_handle, mut rx) = register(&engine, 0);

    engine.start().await.unwrap();
    chain.push_block(vec![3]);
    chain.push_empty_block();
    chain.push_block(vec![5]);

    assert_eq!(collect(&mut rx, 4).await, vec![0, 2, 3, 5]);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn backfill_decode_failure_aborts_history() {
    let chain = MemoryChain::new();
    chain.push_block(b"a".to_vec());
    chain.push_block(b"bad".to_vec());
    chain.push_block(b"c".to_vec());
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let mut errors = engine.errors();
    let (_handle, mut rx) = register(&engine, 0);

    engine.start().await.unwrap();
    chain.push_block(b"d".to_vec());

    match next_error(&mut errors).await {
        EventsError::Backfill { height: 1, source, .. } => {
            assert!(matches!(*source, EventsError::Decode { height: 1, .. }));
        }
        other => panic!("expected backfill decode error, got {other:?}"),
    }
    chain.push_block(b"e".to_vec());
    assert_eq!(collect(&mut rx, 3).await, vec![0, 3, 4]);
}

// ─── Live path faults ─────────────────────────────────────────────────────────

#[tokio::test]
async fn header_failure_skips_only_that_block() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let mut errors = engine.errors();
    let (_handle, mut rx) = register(&engine, 0);
    engine.start().await.unwrap();

    chain.push_block(vec![0]);
    chain.fail_header_once(1);
    chain.push_block(vec![1]);
    chain.push_block(vec![2]);

    assert_eq!(collect(&mut rx, 2).await, vec![0, 2]);
    match next_error(&mut errors).await {
        EventsError::Header { hash, .. } => assert_eq!(hash, MemoryChain::hash_for(1)),
        other => panic!("expected header error, got {other:?}"),
    }
}

#[tokio::test]
async fn live_decode_failure_skips_only_that_block() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let mut errors = engine.errors();
    let (_handle, mut rx) = register(&engine, 0);
    engine.start().await.unwrap();

    chain.push_block(b"ok".to_vec());
    chain.push_block(b"bad".to_vec());
    chain.push_block(b"ok".to_vec());

    assert_eq!(collect(&mut rx, 2).await, vec![0, 2]);
    let err = next_error(&mut errors).await;
    assert!(matches!(err, EventsError::Decode { height: 1, .. }));
    assert!(!err.is_backfill());
}

#[tokio::test]
async fn subscription_error_item_does_not_stop_dispatch() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let mut errors = engine.errors();
    let (_handle, mut rx) = register(&engine, 0);
    engine.start().await.unwrap();

    chain.push_block(vec![0]);
    chain.notify_error(SourceError::Rpc("node hiccup".into()));
    chain.push_block(vec![1]);

    assert_eq!(collect(&mut rx, 2).await, vec![0, 1]);
    assert!(matches!(next_error(&mut errors).await, EventsError::Subscription(_)));
    assert!(engine.is_listening());
}

#[tokio::test]
async fn reemitted_block_is_not_delivered_twice() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let (_handle, mut rx) = register(&engine, 0);
    engine.start().await.unwrap();

    chain.push_block(vec![0]);
    chain.push_block(vec![1]);
    chain.push_block(vec![2]);
    assert!(chain.reemit(1));
    chain.push_block(vec![3]);

    assert_eq!(collect(&mut rx, 4).await, vec![0, 1, 2, 3]);
    assert_quiet(&mut rx).await;
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_start_opens_one_subscription() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);

    let starts = (0..8).map(|_| {
        let engine = engine.clone();
        async move { engine.start().await }
    });
    let handles: Vec<_> = futures::future::join_all(starts)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert!(handles.iter().all(|h| h.same_as(&handles[0])));
    assert_eq!(chain.subscription_count(), 1);
    assert!(engine.is_listening());
}

#[tokio::test]
async fn failed_start_leaves_engine_inactive() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);

    chain.fail_events_key(true);
    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, EventsError::KeyResolution(_)));
    assert!(!engine.is_listening());

    chain.fail_events_key(false);
    chain.fail_subscribe(true);
    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, EventsError::Subscribe(_)));
    assert!(!engine.is_listening());
    assert_eq!(chain.subscription_count(), 0);

    chain.fail_subscribe(false);
    engine.start().await.unwrap();
    assert!(engine.is_listening());
    assert_eq!(chain.subscription_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_is_idempotent_and_concurrent_safe() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let (listener, _rx) = register(&engine, 0);
    let listening = engine.start().await.unwrap();

    let mut tasks = vec![];
    for _ in 0..8 {
        let listener = listener.clone();
        let listening = listening.clone();
        tasks.push(tokio::spawn(async move {
            listener.cancel();
            listening.cancel();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    listener.cancel();
    listening.cancel();

    assert!(listener.is_cancelled());
    assert!(listening.is_cancelled());
    assert_eq!(engine.listener_count(), 0);
    assert!(!engine.is_listening());
    eventually(|| chain.active_subscriptions() == 0).await;
}

#[tokio::test]
async fn stream_end_is_reported_and_engine_restarts() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let mut errors = engine.errors();
    let (_handle, mut rx) = register(&engine, 0);
    let first = engine.start().await.unwrap();

    chain.push_block(vec![0]);
    assert_eq!(next(&mut rx).await, 0);

    chain.end_subscriptions();
    assert!(matches!(next_error(&mut errors).await, EventsError::SubscriptionClosed));
    timeout(WAIT, first.stopped()).await.expect("dispatcher should stop");
    assert!(!engine.is_listening());

    let second = engine.start().await.unwrap();
    assert!(!second.same_as(&first));
    assert_eq!(chain.subscription_count(), 2);

    chain.push_block(vec![1]);
    assert_eq!(next(&mut rx).await, 1);
}

#[tokio::test]
async fn cancelled_listening_handle_can_be_restarted() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let first = engine.start().await.unwrap();
    first.cancel();
    assert!(!engine.is_listening());
    eventually(|| chain.active_subscriptions() == 0).await;

    let second = engine.start().await.unwrap();
    assert!(!second.is_cancelled());
    assert_eq!(chain.subscription_count(), 2);
    assert_eq!(chain.active_subscriptions(), 1);
}

#[tokio::test]
async fn engines_are_independent() {
    let left_chain = MemoryChain::new();
    let right_chain = MemoryChain::new();
    let left = EventsEngine::new(left_chain.clone(), Blobs);
    let right = EventsEngine::new(right_chain.clone(), Blobs);

    let left_handle = left.start().await.unwrap();
    right.start().await.unwrap();
    left_handle.cancel();

    assert!(!left.is_listening());
    assert!(right.is_listening());
}

#[tokio::test]
async fn first_errors_receiver_sees_faults_raised_right_after_start() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let listening = engine.start().await.unwrap();

    chain.notify_error(SourceError::Rpc("node hiccup".into()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut errors = listening.errors();
    match next_error(&mut errors).await {
        EventsError::Subscription(SourceError::Rpc(message)) => assert_eq!(message, "node hiccup"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn cancel_interrupts_a_stalled_header_lookup() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let (_handle, mut rx) = register(&engine, 0);
    let listening = engine.start().await.unwrap();

    chain.stall_headers(true);
    chain.push_block(vec![0]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    listening.cancel();
    eventually(|| chain.active_subscriptions() == 0).await;

    chain.stall_headers(false);
    assert_quiet(&mut rx).await;
}

// ─── Listeners ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_listener_receives_nothing_more() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let (handle, mut rx) = register(&engine, 0);
    engine.start().await.unwrap();

    chain.push_block(vec![0]);
    assert_eq!(next(&mut rx).await, 0);

    handle.cancel();
    chain.push_block(vec![1]);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn listener_cancelled_before_live_start_never_fires() {
    let chain = chain_with(3);
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let (handle, mut rx) = register(&engine, 0);
    handle.cancel();

    engine.start().await.unwrap();
    chain.push_block(vec![3]);
    assert_quiet(&mut rx).await;
    assert_eq!(engine.listener_count(), 0);
    assert_eq!(handle.live_start(), None);
}

#[tokio::test]
async fn listener_limit_and_id_reuse() {
    let engine = EventsEngine::builder(MemoryChain::new(), Blobs)
        .max_listeners(2)
        .build();
    let (first, _rx1) = register(&engine, 0);
    let (second, _rx2) = register(&engine, 0);
    assert_eq!(first.id(), ListenerId(0));
    assert_eq!(second.id(), ListenerId(1));

    let err = engine.register(0, |_, _, _| {}).err().expect("limit reached");
    assert!(matches!(err, EventsError::TooManyListeners { limit: 2 }));

    first.cancel();
    let (third, _rx3) = register(&engine, 0);
    assert_eq!(third.id(), ListenerId(0));
    assert_eq!(engine.listener_count(), 2);
}

#[tokio::test]
async fn inline_callbacks_run_in_order() {
    let chain = chain_with(4);
    let engine = EventsEngine::builder(chain.clone(), Blobs)
        .inline_callbacks()
        .build();
    let seen = Arc::new(Mutex::new(vec![]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = Arc::clone(&seen);
    let _handle = engine
        .register(1, move |batch: Arc<Vec<u8>>, height, hash: BlockHash| {
            assert_eq!(hash, MemoryChain::hash_for(height));
            sink.lock().unwrap().push((height, batch.len()));
            let _ = tx.send(height);
        })
        .unwrap();

    engine.start().await.unwrap();
    for height in 4..8u64 {
        chain.push_block(height.to_be_bytes().to_vec());
    }

    assert_eq!(collect(&mut rx, 7).await, (1..8).collect::<Vec<_>>());
    assert!(seen.lock().unwrap().iter().all(|(_, len)| *len == 8));
}

#[tokio::test]
async fn listener_can_cancel_itself_from_callback() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::builder(chain.clone(), Blobs)
        .inline_callbacks()
        .build();
    let own: Arc<OnceLock<ListenerHandle<Vec<u8>>>> = Arc::new(OnceLock::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let me = Arc::clone(&own);
    let handle = engine
        .register(0, move |_, height, _| {
            let _ = tx.send(height);
            if height == 1 {
                if let Some(handle) = me.get() {
                    handle.cancel();
                }
            }
        })
        .unwrap();
    let _ = own.set(handle.clone());

    engine.start().await.unwrap();
    for height in 0..4u8 {
        chain.push_block(vec![height]);
    }

    assert_eq!(collect(&mut rx, 2).await, vec![0, 1]);
    assert_quiet(&mut rx).await;
    assert!(handle.is_cancelled());
    assert_eq!(engine.listener_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_live_callback_is_reported_and_delivery_continues() {
    let chain = MemoryChain::new();
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let mut errors = engine.errors();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = engine
        .register(0, move |_, height, _| {
            if height == 1 {
                panic!("listener failed at block 1");
            }
            let _ = tx.send(height);
        })
        .unwrap();

    engine.start().await.unwrap();
    for height in 0..4u8 {
        chain.push_block(vec![height]);
    }

    assert_eq!(collect(&mut rx, 3).await, vec![0, 2, 3]);
    match next_error(&mut errors).await {
        EventsError::CallbackPanicked { listener, height, message } => {
            assert_eq!(listener, handle.id());
            assert_eq!(height, 1);
            assert_eq!(message, "listener failed at block 1");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(handle.mode(), ListenerMode::Direct);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_backfill_callback_still_switches_to_live() {
    let chain = chain_with(3);
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let mut errors = engine.errors();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = engine
        .register(0, move |_, height, _| {
            if height == 1 {
                panic!("listener failed at block 1");
            }
            let _ = tx.send(height);
        })
        .unwrap();

    engine.start().await.unwrap();
    for height in 3..6u64 {
        chain.push_block(height.to_be_bytes().to_vec());
    }

    assert_eq!(collect(&mut rx, 5).await, vec![0, 2, 3, 4, 5]);
    assert!(matches!(
        next_error(&mut errors).await,
        EventsError::CallbackPanicked { height: 1, .. }
    ));
    eventually(|| handle.mode() == ListenerMode::Direct).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_during_backfill_stops_history_and_skips_the_queue() {
    let chain = chain_with(10);
    let engine = EventsEngine::new(chain.clone(), Blobs);
    let own: Arc<OnceLock<ListenerHandle<Vec<u8>>>> = Arc::new(OnceLock::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let me = Arc::clone(&own);
    let handle = engine
        .register(0, move |_, height, _| {
            let _ = tx.send(height);
            if height == 3 {
                if let Some(handle) = me.get() {
                    handle.cancel();
                }
            }
        })
        .unwrap();
    let _ = own.set(handle.clone());

    engine.start().await.unwrap();
    chain.push_block(vec![10]);
    chain.push_block(vec![11]);

    assert_eq!(collect(&mut rx, 4).await, vec![0, 1, 2, 3]);
    assert_quiet(&mut rx).await;
    assert!(handle.is_cancelled());
    assert_eq!(handle.live_start(), Some(10));
    assert!(chain.hash_requests().iter().all(|height| *height <= 3));
    assert_eq!(handle.mode(), ListenerMode::Buffering);
}
