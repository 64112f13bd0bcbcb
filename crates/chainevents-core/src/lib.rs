//! chainevents-core: one shared live events subscription, fanned out to many
//! listeners, each with its own historical backfill.
//!
//! # Architecture
//!
//! ```text
//! EngineBuilder → EventsEngine
//!                      ├── RawEventSource    (node access: key, subscribe, header, hash, storage)
//!                      ├── EventDecoder      (raw events blob → batch)
//!                      ├── Dispatcher        (single live stream → every listener)
//!                      ├── ListenerRegistry  (lowest free id, snapshot under lock)
//!                      │     └── ListenerSlot
//!                      │           ├── PendingQueue  (buffered live batches during backfill)
//!                      │           └── Lane          (ordered direct delivery on the executor)
//!                      └── Backfill task     (per listener: replay [begin, live_start), then drain)
//! ```
//!
//! Each listener sees strictly increasing heights: history first, then the
//! live notifications buffered while history was replayed, then live
//! notifications as they arrive.

mod backfill;
mod dispatcher;
mod sync;

pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gate;
pub mod listener;
pub mod memory;
pub mod pending;
pub mod registry;
pub mod source;
pub mod types;

pub use builder::EngineBuilder;
pub use config::EngineConfig;
pub use engine::{EventsEngine, ListeningHandle};
pub use error::{DecodeError, ErrorKind, EventsError, SourceError};
pub use executor::{CallbackExecutor, InlineExecutor, Job, TokioExecutor};
pub use listener::{EventsCallback, ListenerHandle};
pub use memory::MemoryChain;
pub use source::{EventDecoder, PassthroughDecoder, RawChangeStream, RawEventSource, RawEvents};
pub use types::{
    BlockEvents, BlockHash, BlockHeight, ListenerId, ListenerMode, RawChange, RawChangeSet,
    StorageKey,
};
