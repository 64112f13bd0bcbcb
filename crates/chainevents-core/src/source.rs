//! Seams to the chain node and the events codec.
//!
//! The engine never talks to a node or decodes SCALE itself; it goes through
//! a [`RawEventSource`] for blocks and storage and an [`EventDecoder`] for
//! turning a raw events blob into a batch.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{DecodeError, SourceError};
use crate::types::{BlockHash, BlockHeight, RawChangeSet, StorageKey};

/// Live storage change notifications. Dropping the stream unsubscribes.
pub type RawChangeStream = Pin<Box<dyn Stream<Item = Result<RawChangeSet, SourceError>> + Send>>;

/// Access to a chain node's blocks and events storage.
#[async_trait]
pub trait RawEventSource: Send + Sync + 'static {
    /// Resolve the storage key the per-block events blob is stored under.
    async fn events_key(&self) -> Result<StorageKey, SourceError>;

    /// Open a live subscription to changes of `key`.
    async fn subscribe_raw(&self, key: &StorageKey) -> Result<RawChangeStream, SourceError>;

    /// Height of the block with the given hash.
    async fn header_height(&self, hash: &BlockHash) -> Result<BlockHeight, SourceError>;

    /// Hash of the canonical block at `height`.
    async fn block_hash_at(&self, height: BlockHeight) -> Result<BlockHash, SourceError>;

    /// Raw events blob stored under `key` at block `hash`; `None` if the
    /// block has no data for the key.
    async fn raw_events_at(
        &self,
        key: &StorageKey,
        hash: &BlockHash,
    ) -> Result<Option<Vec<u8>>, SourceError>;
}

#[async_trait]
impl<T: RawEventSource + ?Sized> RawEventSource for Arc<T> {
    async fn events_key(&self) -> Result<StorageKey, SourceError> {
        (**self).events_key().await
    }

    async fn subscribe_raw(&self, key: &StorageKey) -> Result<RawChangeStream, SourceError> {
        (**self).subscribe_raw(key).await
    }

    async fn header_height(&self, hash: &BlockHash) -> Result<BlockHeight, SourceError> {
        (**self).header_height(hash).await
    }

    async fn block_hash_at(&self, height: BlockHeight) -> Result<BlockHash, SourceError> {
        (**self).block_hash_at(height).await
    }

    async fn raw_events_at(
        &self,
        key: &StorageKey,
        hash: &BlockHash,
    ) -> Result<Option<Vec<u8>>, SourceError> {
        (**self).raw_events_at(key, hash).await
    }
}

/// Turns a raw events blob into an ordered batch of domain events.
pub trait EventDecoder: Send + Sync + 'static {
    /// The decoded batch handed to listeners.
    type Batch: Send + Sync + 'static;

    fn decode(&self, raw: &[u8]) -> Result<Self::Batch, DecodeError>;
}

impl<T: EventDecoder + ?Sized> EventDecoder for Arc<T> {
    type Batch = T::Batch;

    fn decode(&self, raw: &[u8]) -> Result<Self::Batch, DecodeError> {
        (**self).decode(raw)
    }
}

/// The undecoded events blob of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvents(pub Vec<u8>);

impl RawEvents {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decoder that hands the blob through untouched, for callers that decode
/// events themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDecoder;

impl EventDecoder for PassthroughDecoder {
    type Batch = RawEvents;

    fn decode(&self, raw: &[u8]) -> Result<RawEvents, DecodeError> {
        Ok(RawEvents(raw.to_vec()))
    }
}
