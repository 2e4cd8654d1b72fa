//! # galena-server: `Galena` server node
//!
//! A server node owns a slice of the consistent-hash space: it serves
//! reads, coordinates and replicates writes, and takes part in cluster
//! rebalancing. The cluster RPC surface is the msgpack protocol defined
//! in `galena-wire`; the local engine is `galena-storage`.
//!
//! ## Architecture
//!
//! The node uses `mio` for non-blocking I/O with a poll-based event
//! loop, keeping control flow explicit with no async runtime. Requests
//! decoded on the event loop are handed to a fixed worker pool; workers
//! run the state machines (which may block on peer RPC) and push
//! finished responses back through a channel drained by the loop.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       galena-server                          │
//! │ ┌──────────┐   ┌─────────────┐   ┌─────────┐   ┌───────────┐ │
//! │ │ Listener │ → │ Connections │ → │ Workers │ → │ ServerNode│ │
//! │ │  (TCP)   │   │ (mio poll)  │   │ (inbox) │   │ (+ peers) │ │
//! │ └──────────┘   └─────────────┘   └─────────┘   └───────────┘ │
//! │       ▲            offer stream listener (own thread)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod connection;
mod control;
mod error;
mod metrics;
mod node;
mod queue;
mod replace;
mod server;
mod store;
mod stream;
mod worker;

pub use config::{
    DEFAULT_PORT, DEFAULT_REPLICATE_RETRY, DEFAULT_STREAM_PORT, ServerConfig,
};
pub use error::{ServerError, ServerResult};
pub use metrics::ServerMetrics;
pub use node::{HashSpaces, Reply, ServerNode};
pub use replace::ReplaceState;
pub use server::{Server, ShutdownHandle};
pub use stream::{OfferFile, OfferStorage, StreamListener};
