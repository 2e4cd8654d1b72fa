//! # galena-storage: local engine for Galena server nodes
//!
//! An in-memory index over an append-only op log. Every mutation is
//! appended to the log before the index is updated; on open the log is
//! replayed to rebuild the index. Values are opaque byte sequences
//! stamped with the [`ClockTime`] assigned by the write coordinator.
//!
//! Deletes leave tombstones carrying the delete stamp. Tombstones are
//! what let a replica reject a stale `ReplicateSet` that races with a
//! newer delete, so they are retained rather than purged.
//!
//! # File layout
//!
//! ```text
//! {path}             <- op log (magic header, then framed records)
//! {path}-{suffix}    <- backups created by `backup()`
//! ```

mod log;
mod store;

pub use log::{LogRecord, MAGIC};
pub use store::{Entry, Store};

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The log file does not start with the expected magic bytes.
    #[error("not a galena op log: {path}")]
    BadMagic { path: String },

    /// A log record is structurally invalid (not merely truncated).
    #[error("corrupt op log at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}
