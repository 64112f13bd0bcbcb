//! Connection settings for a Substrate node.

use std::time::Duration;

use chainevents_core::StorageKey;
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;

/// `twox128("System") ++ twox128("Events")`.
pub const SYSTEM_EVENTS_KEY: [u8; 32] = [
    0x26, 0xaa, 0x39, 0x4e, 0xea, 0x56, 0x30, 0xe0, 0x7c, 0x48, 0xae, 0x0c, 0x95, 0x58, 0xce, 0xf7,
    0x80, 0xd4, 0x1e, 0x5e, 0x16, 0x05, 0x67, 0x65, 0xbc, 0x84, 0x61, 0x85, 0x10, 0x72, 0xc9, 0xd7,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstrateConfig {
    /// Node WebSocket endpoint, e.g. `ws://127.0.0.1:9944`.
    pub url: String,
    /// Storage key of the per-block events blob. Defaults to `System.Events`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_key: Option<StorageKey>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_reconnect_initial_ms() -> u64 { 500 }
fn default_reconnect_max_ms() -> u64 { 60_000 }

impl SubstrateConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events_key: None,
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }

    /// The configured events key, or `System.Events`.
    pub fn events_key(&self) -> StorageKey {
        self.events_key
            .clone()
            .unwrap_or_else(|| StorageKey(SYSTEM_EVENTS_KEY.to_vec()))
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }
}
