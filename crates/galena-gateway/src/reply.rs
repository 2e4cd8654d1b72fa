//! Client reply rendering and multi-get aggregation.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

// Reply literals, preserved byte for byte.
pub const NOT_SUPPORTED: &[u8] = b"CLIENT_ERROR supported\r\n";
pub const GET_FAILED: &[u8] = b"SERVER_ERROR get failed\r\n";
pub const STORE_FAILED: &[u8] = b"SERVER_ERROR store failed\r\n";
pub const DELETE_FAILED: &[u8] = b"SERVER_ERROR delete failed\r\n";
pub const STORED: &[u8] = b"STORED\r\n";
pub const DELETED: &[u8] = b"DELETED\r\n";
pub const NOT_FOUND: &[u8] = b"NOT FOUND\r\n";
pub const END: &[u8] = b"END\r\n";

/// Renders one `VALUE` record.
///
/// The original emitted this as six gathered segments (header, key,
/// flags, length line, data, trailer); here they land in one owned
/// buffer handed to the write queue. `trailer` is `b"\r\n"` for a
/// multi-get record or `b"\r\nEND\r\n"` when this record closes a
/// single-key reply.
pub fn value_record(key: &[u8], value: &[u8], trailer: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + key.len() + 16 + value.len() + trailer.len());
    buf.put_slice(b"VALUE ");
    buf.put_slice(key);
    buf.put_slice(b" 0 ");
    buf.put_slice(value.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(value);
    buf.put_slice(trailer);
    buf.freeze()
}

/// Shared completion counter for one multi-key GET.
///
/// Every sub-request decrements once; whichever completion drives the
/// counter to zero owns the trailing `END`. Records may land in any
/// order before that.
#[derive(Debug)]
pub struct MultiGetState {
    remaining: AtomicUsize,
}

impl MultiGetState {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    /// Records one finished sub-request. Returns true exactly once, for
    /// the completion that must append the terminator.
    pub fn complete(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::SeqCst) == 1
    }
}
