//! Client connection state.
//!
//! Each connection owns a shared validity flag. Response callbacks hold
//! a weak reference to it and check it before writing, because cluster
//! replies routinely finish after the client has disconnected and a
//! reply for a dead connection must never reach a socket.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use mio::Interest;
use mio::net::TcpStream;

use crate::memtext::MemtextParser;

const READ_CHUNK: usize = 16 * 1024;
const INITIAL_BUFFER: usize = 16 * 1024;

/// State of one memcached client connection.
pub struct Connection {
    pub stream: TcpStream,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
    pub parser: MemtextParser,
    valid: Arc<AtomicBool>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            parser: MemtextParser::new(),
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A weak handle to the validity flag for in-flight callbacks.
    pub fn validity(&self) -> Weak<AtomicBool> {
        Arc::downgrade(&self.valid)
    }

    /// Drains the socket into the read buffer.
    ///
    /// Returns `false` when the peer closed the connection.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Flushes the write buffer to the socket.
    pub fn write(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// The poll interest matching the buffered state.
    pub fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // From here on every pending callback is a no-op.
        self.valid.store(false, Ordering::SeqCst);
    }
}

/// True when the flag is still owned by a live connection and set.
pub fn is_valid(valid: &Weak<AtomicBool>) -> bool {
    valid
        .upgrade()
        .is_some_and(|flag| flag.load(Ordering::SeqCst))
}
