//! # galena-wire: cluster RPC protocol
//!
//! Length-prefixed msgpack frames carrying a small envelope:
//! `(kind, msgid, tag, body)`. `kind` distinguishes requests from
//! responses, `msgid` correlates them across a connection, `tag` is the
//! numeric method, and `body` is the msgpack encoding of the per-method
//! payload.
//!
//! The method catalog:
//!
//! | tag | method               |
//! |-----|----------------------|
//! |   0 | `KeepAlive`          |
//! |   2 | `HashSpaceSync`      |
//! |   8 | `ReplaceCopyStart`   |
//! |   9 | `ReplaceDeleteStart` |
//! |  10 | `ReplaceCopyEnd`     |
//! |  11 | `ReplaceDeleteEnd`   |
//! |  16 | `ReplaceOffer`       |
//! |  32 | `ReplicateSet`       |
//! |  33 | `ReplicateDelete`    |
//! |  34 | `Get`                |
//! |  35 | `Set`                |
//! |  36 | `Delete`             |
//! |  37 | `GetIfModified`      |
//! |  96 | `CreateBackup`       |
//! |  97 | `GetStatus`          |
//! |  98 | `SetConfig`          |

mod frame;
mod message;
mod session;

pub use frame::{Frame, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use message::{
    IfModified, Message, MessageKind, Record, Request, Response, StatusValue, tag,
};
pub use session::{Bus, SessionPool};

use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while encoding or decoding protocol traffic.
#[derive(Debug, Error)]
pub enum WireError {
    /// A frame advertised a length beyond the protocol cap.
    #[error("frame of {got} bytes exceeds cap of {cap}")]
    FrameTooLarge { got: usize, cap: usize },

    /// Msgpack decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Msgpack encoding failed.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The envelope carried an unknown method tag.
    #[error("unknown method tag: {0}")]
    UnknownTag(u8),

    /// The envelope carried an unknown message kind.
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    /// Transport-level I/O failure; callers treat this as transient.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the session mid-call.
    #[error("connection closed by peer")]
    ConnectionClosed,
}
