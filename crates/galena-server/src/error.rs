//! Server error types.

use galena_storage::StorageError;
use galena_wire::WireError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// A replication fan-out ran out of retries with acks outstanding.
    #[error("replication failed: {outstanding} ack(s) outstanding after {attempts} attempt(s)")]
    ReplicationFailed { outstanding: usize, attempts: u32 },

    /// The two manager addresses must differ.
    #[error("-m and -p must be different")]
    ManagersMustDiffer,

    /// Server shutdown.
    #[error("server shutdown")]
    Shutdown,
}
