//! Shared types for the events engine.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Block number as assigned by the chain.
pub type BlockHeight = u64;

// ─── BlockHash ────────────────────────────────────────────────────────────────

/// A 32-byte block hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Parse a hash from hex (with or without `0x`).
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.strip_prefix("0x").unwrap_or(s), &mut out)?;
        Ok(Self(out))
    }

    /// `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// ─── StorageKey ───────────────────────────────────────────────────────────────

/// Raw storage key the events blob lives under.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StorageKey(pub Vec<u8>);

impl StorageKey {
    /// Parse a key from hex (with or without `0x`).
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s.strip_prefix("0x").unwrap_or(s)).map(Self)
    }

    /// `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({})", self.to_hex())
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.to_hex()
    }
}

impl TryFrom<String> for StorageKey {
    type Error = hex::FromHexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

// ─── Raw change sets ──────────────────────────────────────────────────────────

/// One storage change inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub key: StorageKey,
    /// `None` when the key has no storage data at this block.
    pub data: Option<Vec<u8>>,
}

/// All watched storage changes reported for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChangeSet {
    pub block: BlockHash,
    pub changes: Vec<RawChange>,
}

impl RawChangeSet {
    /// Events blobs in this set: changes under `key` that carry data.
    pub fn event_blobs<'a>(&'a self, key: &'a StorageKey) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.changes
            .iter()
            .filter(move |c| &c.key == key)
            .filter_map(|c| c.data.as_deref())
    }
}

// ─── BlockEvents ──────────────────────────────────────────────────────────────

/// A decoded batch bound to the block it was produced in.
///
/// The batch is reference counted so a single decode is shared by every
/// listener the dispatcher fans out to.
#[derive(Debug)]
pub struct BlockEvents<B> {
    pub batch: Arc<B>,
    pub height: BlockHeight,
    pub hash: BlockHash,
}

impl<B> BlockEvents<B> {
    pub fn new(batch: Arc<B>, height: BlockHeight, hash: BlockHash) -> Self {
        Self { batch, height, hash }
    }
}

impl<B> Clone for BlockEvents<B> {
    fn clone(&self) -> Self {
        Self {
            batch: Arc::clone(&self.batch),
            height: self.height,
            hash: self.hash,
        }
    }
}

// ─── Listener identity ────────────────────────────────────────────────────────

/// Stable listener id. Ids are reused only after the listener is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub usize);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a listener currently receives live notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerMode {
    /// Live notifications are queued until backfill finishes.
    Buffering,
    /// Live notifications go straight to the callback.
    Direct,
}

impl fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffering => write!(f, "buffering"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hash_hex() {
        let hex = "0x00000000000000000000000000000000000000000000000000000000000000ff";
        let hash = BlockHash::from_hex(hex).unwrap();
        assert_eq!(hash.0[31], 0xff);
        assert_eq!(hash.to_hex(), hex);
        assert_eq!(hash.to_string(), hex);
        assert_eq!(hex.parse::<BlockHash>().unwrap(), hash);
    }

    #[test]
    fn block_hash_rejects_wrong_length() {
        assert!(BlockHash::from_hex("0xabcd").is_err());
    }

    #[test]
    fn storage_key_serde_as_hex() {
        let key = StorageKey(vec![0x26, 0xaa]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"0x26aa\"");
        let back: StorageKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn event_blobs_filters_key_and_missing_data() {
        let events = StorageKey(vec![1]);
        let set = RawChangeSet {
            block: BlockHash::default(),
            changes: vec![
                RawChange { key: StorageKey(vec![2]), data: Some(vec![9]) },
                RawChange { key: events.clone(), data: None },
                RawChange { key: events.clone(), data: Some(vec![7, 7]) },
            ],
        };
        let blobs: Vec<&[u8]> = set.event_blobs(&events).collect();
        assert_eq!(blobs, vec![&[7u8, 7][..]]);
    }
}
