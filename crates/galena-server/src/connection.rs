//! RPC connection state for the event loop.

use std::io::{self, Read, Write};

use bytes::BytesMut;
use mio::Interest;
use mio::net::TcpStream;

use galena_wire::{Frame, Message};

use crate::error::ServerResult;

const READ_CHUNK: usize = 16 * 1024;
const INITIAL_BUFFER: usize = 16 * 1024;

/// State of one accepted RPC connection.
pub struct Connection {
    pub stream: TcpStream,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
    /// Set when the connection should close once the write buffer drains.
    pub closing: bool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            closing: false,
        }
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
    ///
    /// Returns `true` when everything queued has been written.
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

    /// Attempts to decode one message from the read buffer.
    pub fn try_decode(&mut self) -> ServerResult<Option<Message>> {
        match Frame::decode(&mut self.read_buf)? {
            Some(frame) => Ok(Some(Message::from_frame(&frame)?)),
            None => Ok(None),
        }
    }

    /// Queues an outgoing message behind whatever is already buffered.
    pub fn queue_message(&mut self, message: &Message) -> ServerResult<()> {
        let frame = message.to_frame()?;
        frame.encode(&mut self.write_buf);
        Ok(())
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
