//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for an [`EventsEngine`](crate::EventsEngine) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the asynchronous error channel. Receivers that fall this
    /// far behind observe `RecvError::Lagged`.
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
    /// Upper bound on concurrently registered listeners.
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
    /// Warn each time a listener's pending queue grows by this many entries
    /// while its backfill is running.
    #[serde(default = "default_pending_warn_threshold")]
    pub pending_warn_threshold: usize,
}

fn default_error_channel_capacity() -> usize { 256 }
fn default_max_listeners() -> usize { usize::MAX }
fn default_pending_warn_threshold() -> usize { 10_000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_channel_capacity: default_error_channel_capacity(),
            max_listeners: default_max_listeners(),
            pending_warn_threshold: default_pending_warn_threshold(),
        }
    }
}
