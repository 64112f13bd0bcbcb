//! Fluent builder for [`EventsEngine`].
//!
//! # Example
//!
//! ```rust,no_run
//! use chainevents_core::{EventsEngine, MemoryChain, PassthroughDecoder};
//!
//! let engine = EventsEngine::builder(MemoryChain::new(), PassthroughDecoder)
//!     .max_listeners(64)
//!     .error_channel_capacity(1024)
//!     .inline_callbacks()
//!     .build();
//! ```

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::EventsEngine;
use crate::executor::{CallbackExecutor, InlineExecutor, TokioExecutor};
use crate::source::{EventDecoder, RawEventSource};

pub struct EngineBuilder<S, D> {
    source: S,
    decoder: D,
    config: EngineConfig,
    executor: Arc<dyn CallbackExecutor>,
}

impl<S: RawEventSource, D: EventDecoder> EngineBuilder<S, D> {
    pub fn new(source: S, decoder: D) -> Self {
        Self {
            source,
            decoder,
            config: EngineConfig::default(),
            executor: Arc::new(TokioExecutor),
        }
    }

    /// Replace the whole config.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn error_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.error_channel_capacity = capacity;
        self
    }

    pub fn max_listeners(mut self, max: usize) -> Self {
        self.config.max_listeners = max;
        self
    }

    pub fn pending_warn_threshold(mut self, threshold: usize) -> Self {
        self.config.pending_warn_threshold = threshold;
        self
    }

    /// Run live callbacks on a custom executor.
    pub fn executor(mut self, executor: impl CallbackExecutor) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Run live callbacks on the dispatcher task itself.
    pub fn inline_callbacks(self) -> Self {
        self.executor(InlineExecutor)
    }

    pub fn build(self) -> EventsEngine<S, D> {
        EventsEngine::from_parts(self.source, self.decoder, self.config, self.executor)
    }
}
