//! # galena-gateway: memcached text front end for `Galena`
//!
//! Clients speak the memcached ASCII protocol (`get`/`set`/`delete`
//! plus `noreply`) to the gateway; the gateway hashes each key, routes
//! the operation to the responsible server node over the cluster RPC,
//! and streams the reply back. `replace`, `append`, `prepend` and `cas`
//! are answered with a client error, as are nonzero flags and expiry
//! times.
//!
//! The event loop mirrors the server's: mio poll, a fixed worker pool
//! for the blocking cluster calls, completions drained back onto the
//! loop. The delicate part is connection lifetime: replies can finish
//! after the client has hung up, so every completion carries a weak
//! reference to its connection's validity flag and is dropped unread
//! when the flag is gone or cleared.

mod config;
mod connection;
mod error;
mod memtext;
mod reply;
mod router;
mod server;
mod worker;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult, ParseError};
pub use memtext::{MemtextParser, StoreCommandSink};
pub use reply::MultiGetState;
pub use router::Router;
pub use server::{Gateway, ShutdownHandle};
