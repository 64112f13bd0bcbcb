//! [`RawEventSource`] backed by a Substrate node's JSON-RPC API.
//!
//! | operation        | RPC                                                   |
//! |------------------|-------------------------------------------------------|
//! | `subscribe_raw`  | `state_subscribeStorage` / `state_unsubscribeStorage` |
//! | `header_height`  | `chain_getHeader`                                     |
//! | `block_hash_at`  | `chain_getBlockHash`                                  |
//! | `raw_events_at`  | `state_queryStorageAt`                                |

use async_trait::async_trait;
use chainevents_core::{
    BlockHash, BlockHeight, RawChange, RawChangeSet, RawChangeStream, RawEventSource, SourceError,
    StorageKey,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::WsRpcClient;
use crate::config::SubstrateConfig;
use crate::error::RpcError;

/// Block numbers arrive as hex strings from most nodes, plain integers from some.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberJson {
    Hex(String),
    Int(u64),
}

impl NumberJson {
    fn value(&self) -> Result<u64, RpcError> {
        match self {
            Self::Int(n) => Ok(*n),
            Self::Hex(s) => u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16)
                .map_err(|e| RpcError::InvalidResponse(format!("block number {s}: {e}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HeaderJson {
    number: NumberJson,
}

#[derive(Debug, Deserialize)]
struct StorageChangeSetJson {
    block: String,
    changes: Vec<(String, Option<String>)>,
}

impl StorageChangeSetJson {
    fn into_change_set(self) -> Result<RawChangeSet, RpcError> {
        let block = parse_hash(&self.block)?;
        let changes = self
            .changes
            .into_iter()
            .map(|(key, data)| -> Result<RawChange, RpcError> {
                Ok(RawChange {
                    key: StorageKey(parse_bytes(&key)?),
                    data: data.as_deref().map(parse_bytes).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, RpcError>>()?;
        Ok(RawChangeSet { block, changes })
    }
}

fn parse_hash(s: &str) -> Result<BlockHash, RpcError> {
    BlockHash::from_hex(s).map_err(|e| RpcError::InvalidResponse(format!("block hash {s}: {e}")))
}

fn parse_bytes(s: &str) -> Result<Vec<u8>, RpcError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|e| RpcError::InvalidResponse(format!("hex bytes: {e}")))
}

/// Parse a `state_storage` notification payload.
fn parse_change_set(value: Value) -> Result<RawChangeSet, RpcError> {
    serde_json::from_value::<StorageChangeSetJson>(value)?.into_change_set()
}

/// Pick `key`'s data out of a `state_queryStorageAt` result.
fn find_storage(sets: Vec<StorageChangeSetJson>, key: &StorageKey) -> Result<Option<Vec<u8>>, RpcError> {
    for set in sets {
        for change in set.into_change_set()?.changes {
            if &change.key == key {
                return Ok(change.data);
            }
        }
    }
    Ok(None)
}

/// Events source for a Substrate node.
pub struct SubstrateSource {
    client: WsRpcClient,
    events_key: StorageKey,
}

impl SubstrateSource {
    pub async fn connect(config: &SubstrateConfig) -> Result<Self, RpcError> {
        let client = WsRpcClient::connect(config.url.clone(), config.client_config()).await?;
        Ok(Self::new(client, config.events_key()))
    }

    pub fn new(client: WsRpcClient, events_key: StorageKey) -> Self {
        Self { client, events_key }
    }

    pub fn client(&self) -> &WsRpcClient {
        &self.client
    }

    /// `system_chain`: the chain's display name.
    pub async fn chain_name(&self) -> Result<String, RpcError> {
        self.client.call("system_chain", vec![]).await
    }

    /// Height and hash of the node's best block.
    pub async fn best_block(&self) -> Result<(BlockHeight, BlockHash), SourceError> {
        let hash: Option<String> = self.client.call("chain_getBlockHash", vec![]).await?;
        let hash = parse_hash(&hash.ok_or_else(|| SourceError::NotFound("best block".into()))?)?;
        let height = self.header_height(&hash).await?;
        Ok((height, hash))
    }
}

#[async_trait]
impl RawEventSource for SubstrateSource {
    async fn events_key(&self) -> Result<StorageKey, SourceError> {
        Ok(self.events_key.clone())
    }

    async fn subscribe_raw(&self, key: &StorageKey) -> Result<RawChangeStream, SourceError> {
        let sub = self
            .client
            .subscribe(
                "state_subscribeStorage",
                vec![json!([key.to_hex()])],
                "state_unsubscribeStorage",
            )
            .await?;
        tracing::debug!(subscription = %sub.id(), key = %key, "storage subscription opened");
        Ok(Box::pin(
            sub.map(|value| parse_change_set(value).map_err(SourceError::from)),
        ))
    }

    async fn header_height(&self, hash: &BlockHash) -> Result<BlockHeight, SourceError> {
        let header: Option<HeaderJson> = self
            .client
            .call("chain_getHeader", vec![json!(hash.to_hex())])
            .await?;
        let header = header.ok_or_else(|| SourceError::NotFound(format!("header {hash}")))?;
        Ok(header.number.value()?)
    }

    async fn block_hash_at(&self, height: BlockHeight) -> Result<BlockHash, SourceError> {
        let hash: Option<String> = self
            .client
            .call("chain_getBlockHash", vec![json!(height)])
            .await?;
        let hash = hash.ok_or_else(|| SourceError::NotFound(format!("block {height}")))?;
        Ok(parse_hash(&hash)?)
    }

    async fn raw_events_at(
        &self,
        key: &StorageKey,
        hash: &BlockHash,
    ) -> Result<Option<Vec<u8>>, SourceError> {
        let sets: Vec<StorageChangeSetJson> = self
            .client
            .call(
                "state_queryStorageAt",
                vec![json!([key.to_hex()]), json!(hash.to_hex())],
            )
            .await?;
        Ok(find_storage(sets, key)?)
    }
}
