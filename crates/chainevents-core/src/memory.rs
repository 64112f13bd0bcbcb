//! In-process chain used by tests, demos and embedders.
//!
//! Blocks are appended with [`MemoryChain::push_block`]; every open live
//! subscription is notified synchronously. Hashes are derived from the
//! height, so `hash_for(h)` is stable across runs.
//!
//! Faults can be injected per call site: key resolution, subscribe, and
//! one-shot failures of the block-hash, header and storage lookups for a
//! given height. Header lookups can also be stalled until released.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use tokio::sync::watch;

use crate::error::SourceError;
use crate::source::{RawChangeStream, RawEventSource};
use crate::sync::lock;
use crate::types::{BlockHash, BlockHeight, RawChange, RawChangeSet, StorageKey};

const HASH_TAG: u8 = 0x4d;

type Notification = Result<RawChangeSet, SourceError>;

struct MemoryBlock {
    hash: BlockHash,
    events: Option<Vec<u8>>,
}

#[derive(Default)]
struct Faults {
    events_key: bool,
    subscribe: bool,
    block_hash_once: HashSet<BlockHeight>,
    header_once: HashSet<BlockHeight>,
    query_once: HashSet<BlockHeight>,
}

struct ChainState {
    events_key: StorageKey,
    blocks: Vec<MemoryBlock>,
    subscribers: Vec<(StorageKey, mpsc::UnboundedSender<Notification>)>,
    opened: usize,
    /// Heights passed to `block_hash_at`, in call order.
    hash_requests: Vec<BlockHeight>,
    faults: Faults,
}

impl ChainState {
    fn notify(&mut self, set: RawChangeSet) {
        self.subscribers.retain(|(key, tx)| {
            let mut set = set.clone();
            set.changes.retain(|change| &change.key == key);
            tx.unbounded_send(Ok(set)).is_ok()
        });
    }

    fn change_set(&self, height: BlockHeight) -> Option<RawChangeSet> {
        let block = self.blocks.get(usize::try_from(height).ok()?)?;
        Some(RawChangeSet {
            block: block.hash,
            changes: vec![RawChange {
                key: self.events_key.clone(),
                data: block.events.clone(),
            }],
        })
    }
}

/// A chain held entirely in memory. Clones share the same chain.
#[derive(Clone)]
pub struct MemoryChain {
    state: Arc<Mutex<ChainState>>,
    stall_headers: Arc<watch::Sender<bool>>,
}

impl MemoryChain {
    /// Default events key for in-memory chains.
    pub const EVENTS_KEY: &'static [u8] = b":events";

    pub fn new() -> Self {
        Self::with_events_key(StorageKey(Self::EVENTS_KEY.to_vec()))
    }

    pub fn with_events_key(key: StorageKey) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                events_key: key,
                blocks: Vec::new(),
                subscribers: Vec::new(),
                opened: 0,
                hash_requests: Vec::new(),
                faults: Faults::default(),
            })),
            stall_headers: Arc::new(watch::channel(false).0),
        }
    }

    /// Deterministic hash of the block at `height`.
    pub fn hash_for(height: BlockHeight) -> BlockHash {
        let mut hash = [0u8; 32];
        hash[0] = HASH_TAG;
        hash[24..].copy_from_slice(&height.to_be_bytes());
        BlockHash(hash)
    }

    fn height_of(hash: &BlockHash) -> Option<BlockHeight> {
        let bytes = hash.as_bytes();
        if bytes[0] != HASH_TAG || bytes[1..24].iter().any(|b| *b != 0) {
            return None;
        }
        let mut height = [0u8; 8];
        height.copy_from_slice(&bytes[24..]);
        Some(BlockHeight::from_be_bytes(height))
    }

    /// Append a block carrying `events` and notify live subscribers.
    pub fn push_block(&self, events: impl Into<Vec<u8>>) -> BlockHeight {
        self.append(Some(events.into()))
    }

    /// Append a block with no events stored under the events key.
    pub fn push_empty_block(&self) -> BlockHeight {
        self.append(None)
    }

    fn append(&self, events: Option<Vec<u8>>) -> BlockHeight {
        let mut state = lock(&self.state);
        let height = state.blocks.len() as BlockHeight;
        state.blocks.push(MemoryBlock {
            hash: Self::hash_for(height),
            events,
        });
        if let Some(set) = state.change_set(height) {
            state.notify(set);
        }
        height
    }

    /// Send the notification for an existing block again, as a node may after
    /// a reconnect. Returns `false` if the block does not exist.
    pub fn reemit(&self, height: BlockHeight) -> bool {
        let mut state = lock(&self.state);
        match state.change_set(height) {
            Some(set) => {
                state.notify(set);
                true
            }
            None => false,
        }
    }

    /// Send an arbitrary change set to live subscribers.
    pub fn notify_raw(&self, set: RawChangeSet) {
        lock(&self.state).notify(set);
    }

    /// Push an error item into every live subscription.
    pub fn notify_error(&self, err: SourceError) {
        lock(&self.state)
            .subscribers
            .retain(|(_, tx)| tx.unbounded_send(Err(err.clone())).is_ok());
    }

    /// Close every live subscription stream.
    pub fn end_subscriptions(&self) {
        lock(&self.state).subscribers.clear();
    }

    /// Height of the latest block, if any.
    pub fn head(&self) -> Option<BlockHeight> {
        let len = lock(&self.state).blocks.len() as BlockHeight;
        len.checked_sub(1)
    }

    /// Subscriptions ever opened.
    pub fn subscription_count(&self) -> usize {
        lock(&self.state).opened
    }

    /// Subscriptions whose stream has not been dropped or ended.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.state)
            .subscribers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    /// Heights requested through `block_hash_at` so far, in call order.
    pub fn hash_requests(&self) -> Vec<BlockHeight> {
        lock(&self.state).hash_requests.clone()
    }

    /// While `true`, header lookups wait instead of answering.
    pub fn stall_headers(&self, stall: bool) {
        self.stall_headers.send_replace(stall);
    }

    pub fn fail_events_key(&self, fail: bool) {
        lock(&self.state).faults.events_key = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        lock(&self.state).faults.subscribe = fail;
    }

    /// Fail the next `block_hash_at(height)` call.
    pub fn fail_block_hash_once(&self, height: BlockHeight) {
        lock(&self.state).faults.block_hash_once.insert(height);
    }

    /// Fail the next header lookup of the block at `height`.
    pub fn fail_header_once(&self, height: BlockHeight) {
        lock(&self.state).faults.header_once.insert(height);
    }

    /// Fail the next storage query at the block at `height`.
    pub fn fail_query_once(&self, height: BlockHeight) {
        lock(&self.state).faults.query_once.insert(height);
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(what: &str, height: BlockHeight) -> SourceError {
    SourceError::Rpc(format!("injected {what} failure at block {height}"))
}

#[async_trait]
impl RawEventSource for MemoryChain {
    async fn events_key(&self) -> Result<StorageKey, SourceError> {
        let state = lock(&self.state);
        if state.faults.events_key {
            return Err(SourceError::Rpc("injected metadata failure".into()));
        }
        Ok(state.events_key.clone())
    }

    async fn subscribe_raw(&self, key: &StorageKey) -> Result<RawChangeStream, SourceError> {
        let mut state = lock(&self.state);
        if state.faults.subscribe {
            return Err(SourceError::WebSocket("injected subscribe failure".into()));
        }
        let (tx, rx) = mpsc::unbounded();
        state.subscribers.push((key.clone(), tx));
        state.opened += 1;
        Ok(Box::pin(rx))
    }

    async fn header_height(&self, hash: &BlockHash) -> Result<BlockHeight, SourceError> {
        let mut stalled = self.stall_headers.subscribe();
        // The sender lives as long as `self`.
        let _ = stalled.wait_for(|stall| !*stall).await;

        let mut state = lock(&self.state);
        let height = Self::height_of(hash)
            .filter(|h| *h < state.blocks.len() as BlockHeight)
            .ok_or_else(|| SourceError::NotFound(format!("header {hash}")))?;
        if state.faults.header_once.remove(&height) {
            return Err(injected("header", height));
        }
        Ok(height)
    }

    async fn block_hash_at(&self, height: BlockHeight) -> Result<BlockHash, SourceError> {
        let mut state = lock(&self.state);
        state.hash_requests.push(height);
        if state.faults.block_hash_once.remove(&height) {
            return Err(injected("block hash", height));
        }
        if height >= state.blocks.len() as BlockHeight {
            return Err(SourceError::NotFound(format!("block {height}")));
        }
        Ok(Self::hash_for(height))
    }

    async fn raw_events_at(
        &self,
        key: &StorageKey,
        hash: &BlockHash,
    ) -> Result<Option<Vec<u8>>, SourceError> {
        let mut state = lock(&self.state);
        let block = Self::height_of(hash)
            .and_then(|h| Some((h, state.blocks.get(usize::try_from(h).ok()?)?)))
            .map(|(h, block)| (h, block.events.clone()));
        let Some((height, events)) = block else {
            return Err(SourceError::NotFound(format!("block {hash}")));
        };
        if state.faults.query_once.remove(&height) {
            return Err(injected("storage query", height));
        }
        if key != &state.events_key {
            return Ok(None);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn hashes_round_trip_to_heights() {
        let hash = MemoryChain::hash_for(42);
        assert_eq!(MemoryChain::height_of(&hash), Some(42));
        assert_eq!(MemoryChain::height_of(&BlockHash::default()), None);
    }

    #[tokio::test]
    async fn push_notifies_subscribers() {
        let chain = MemoryChain::new();
        let key = chain.events_key().await.unwrap();
        let mut stream = chain.subscribe_raw(&key).await.unwrap();

        assert_eq!(chain.push_block(vec![1, 2]), 0);
        let set = stream.next().await.unwrap().unwrap();
        assert_eq!(set.block, MemoryChain::hash_for(0));
        assert_eq!(set.event_blobs(&key).collect::<Vec<_>>(), vec![&[1u8, 2][..]]);
        assert_eq!(chain.head(), Some(0));
    }

    #[tokio::test]
    async fn history_lookups() {
        let chain = MemoryChain::new();
        let key = chain.events_key().await.unwrap();
        chain.push_block(b"a".to_vec());
        chain.push_empty_block();

        let hash = chain.block_hash_at(1).await.unwrap();
        assert_eq!(chain.header_height(&hash).await.unwrap(), 1);
        assert_eq!(chain.raw_events_at(&key, &hash).await.unwrap(), None);

        let hash = chain.block_hash_at(0).await.unwrap();
        assert_eq!(chain.raw_events_at(&key, &hash).await.unwrap(), Some(b"a".to_vec()));
        assert!(matches!(chain.block_hash_at(2).await, Err(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn one_shot_faults_fire_once() {
        let chain = MemoryChain::new();
        chain.push_block(vec![0]);
        chain.fail_block_hash_once(0);
        chain.fail_header_once(0);

        assert!(chain.block_hash_at(0).await.is_err());
        let hash = chain.block_hash_at(0).await.unwrap();
        assert!(chain.header_height(&hash).await.is_err());
        assert_eq!(chain.header_height(&hash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn records_hash_requests_and_stalls_headers() {
        let chain = MemoryChain::new();
        chain.push_block(vec![0]);
        chain.push_block(vec![1]);
        chain.block_hash_at(1).await.unwrap();
        let _ = chain.block_hash_at(5).await;
        assert_eq!(chain.hash_requests(), vec![1, 5]);

        chain.stall_headers(true);
        let hash = MemoryChain::hash_for(1);
        let stalled = tokio::time::timeout(Duration::from_millis(50), chain.header_height(&hash)).await;
        assert!(stalled.is_err());

        let waiting = tokio::spawn({
            let chain = chain.clone();
            async move { chain.header_height(&hash).await }
        });
        chain.stall_headers(false);
        assert_eq!(waiting.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn subscription_accounting() {
        let chain = MemoryChain::new();
        let key = chain.events_key().await.unwrap();
        let first = chain.subscribe_raw(&key).await.unwrap();
        let mut second = chain.subscribe_raw(&key).await.unwrap();
        assert_eq!(chain.subscription_count(), 2);
        assert_eq!(chain.active_subscriptions(), 2);

        drop(first);
        assert_eq!(chain.active_subscriptions(), 1);

        chain.end_subscriptions();
        assert!(second.next().await.is_none());
        assert_eq!(chain.active_subscriptions(), 0);
        assert_eq!(chain.subscription_count(), 2);
    }

    #[tokio::test]
    async fn setup_faults() {
        let chain = MemoryChain::new();
        chain.fail_events_key(true);
        assert!(chain.events_key().await.is_err());
        chain.fail_subscribe(true);
        assert!(chain.subscribe_raw(&StorageKey(vec![1])).await.is_err());
        assert_eq!(chain.subscription_count(), 0);
    }
}
