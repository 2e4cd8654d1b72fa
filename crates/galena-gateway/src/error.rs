//! Gateway error types.

use galena_wire::WireError;
use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur in the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Text protocol violation; the connection is closed.
    #[error("protocol error: {0}")]
    Parse(#[from] ParseError),

    /// Cluster RPC error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// No server answered a read after walking the replica list.
    #[error("get failed on all {tried} replica(s)")]
    GetFailed { tried: usize },

    /// The write coordinator kept failing.
    #[error("store failed after {attempts} attempt(s)")]
    StoreFailed { attempts: u32 },

    /// The delete coordinator kept failing.
    #[error("delete failed after {attempts} attempt(s)")]
    DeleteFailed { attempts: u32 },

    /// The hash space has no live nodes.
    #[error("no live server nodes")]
    NoNodes,
}

/// Memcached text parse errors. All of them are fatal to the
/// connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Command line exceeded the line cap without a terminator.
    #[error("command line too long")]
    LineTooLong,

    /// The command word is not part of the protocol.
    #[error("unknown command")]
    UnknownCommand,

    /// The command line has the wrong shape.
    #[error("malformed {0} command")]
    Malformed(&'static str),

    /// A numeric field did not parse.
    #[error("bad number in {0} command")]
    BadNumber(&'static str),

    /// The data block was not terminated by CRLF.
    #[error("bad data terminator")]
    BadTerminator,
}
