//! chainevents-substrate: a Substrate node as a chainevents source.
//!
//! ```rust,no_run
//! use chainevents_core::EventsEngine;
//! use chainevents_substrate::{EventCountDecoder, SubstrateConfig, SubstrateSource};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let source = SubstrateSource::connect(&SubstrateConfig::new("ws://127.0.0.1:9944")).await?;
//! let engine = EventsEngine::new(source, EventCountDecoder);
//! let _listener = engine.register(0, |records, height, hash| {
//!     println!("#{height} {hash}: {} events", records.count);
//! })?;
//! let _listening = engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod rpc;
pub mod source;
pub mod subscriptions;

pub use client::{ClientConfig, WsRpcClient};
pub use config::{SubstrateConfig, SYSTEM_EVENTS_KEY};
pub use decoder::{EventCountDecoder, EventRecords};
pub use error::RpcError;
pub use source::SubstrateSource;
pub use subscriptions::Subscription;
