//! Blocking request/response sessions to cluster peers.
//!
//! One TCP session per peer address, lazily connected and cached. Calls
//! are serialized per peer; distinct peers are called concurrently from
//! different worker threads without contention. Any I/O failure tears
//! the session down so the next call reconnects; callers treat these
//! errors as transient and apply their own retry policy.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, trace};

use galena_types::NodeId;

use crate::frame::Frame;
use crate::message::{Message, Request, Response};
use crate::{WireError, WireResult};

/// Abstract request/response bus to cluster peers.
///
/// The store and replace state machines are written against this trait
/// so tests can substitute an in-process fake for the TCP pool.
pub trait Bus: Send + Sync {
    /// Sends a request and waits for the matching response.
    fn call(&self, node: NodeId, request: Request) -> WireResult<Response>;

    /// Sends a one-way notification; no response is awaited.
    fn notify(&self, node: NodeId, request: Request) -> WireResult<()>;
}

/// TCP-backed session pool.
pub struct SessionPool {
    timeout: Duration,
    sessions: Mutex<HashMap<NodeId, Arc<Mutex<Session>>>>,
}

impl SessionPool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session(&self, node: NodeId) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        Arc::clone(
            sessions
                .entry(node)
                .or_insert_with(|| Arc::new(Mutex::new(Session::new(node)))),
        )
    }
}

impl Bus for SessionPool {
    fn call(&self, node: NodeId, request: Request) -> WireResult<Response> {
        let session = self.session(node);
        let mut session = session.lock().expect("session lock poisoned");
        session.call(request, self.timeout)
    }

    fn notify(&self, node: NodeId, request: Request) -> WireResult<()> {
        let session = self.session(node);
        let mut session = session.lock().expect("session lock poisoned");
        session.notify(request, self.timeout)
    }
}

struct Session {
    node: NodeId,
    stream: Option<TcpStream>,
    next_msgid: u32,
    buf: BytesMut,
}

impl Session {
    fn new(node: NodeId) -> Self {
        Self {
            node,
            stream: None,
            next_msgid: 0,
            buf: BytesMut::new(),
        }
    }

    fn ensure_connected(&mut self, timeout: Duration) -> WireResult<&mut TcpStream> {
        if self.stream.is_none() {
            debug!(node = %self.node, "connecting peer session");
            let stream = TcpStream::connect_timeout(&self.node.addr(), timeout)?;
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
            stream.set_nodelay(true)?;
            self.buf.clear();
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("stream just ensured"))
    }

    fn call(&mut self, request: Request, timeout: Duration) -> WireResult<Response> {
        let msgid = self.next_msgid;
        self.next_msgid = self.next_msgid.wrapping_add(1);
        trace!(node = %self.node, msgid, tag = request.tag(), "session call");

        match self.call_inner(msgid, request, timeout) {
            Ok(response) => Ok(response),
            Err(e) => {
                // Tear down so the next call reconnects cleanly.
                self.stream = None;
                Err(e)
            }
        }
    }

    fn call_inner(
        &mut self,
        msgid: u32,
        request: Request,
        timeout: Duration,
    ) -> WireResult<Response> {
        let frame = Message::request(msgid, request).to_frame()?;
        let mut out = BytesMut::new();
        frame.encode(&mut out);

        let stream = self.ensure_connected(timeout)?;
        stream.write_all(&out)?;

        let mut chunk = [0u8; 16 * 1024];
        loop {
            while let Some(frame) = Frame::decode(&mut self.buf)? {
                match Message::from_frame(&frame)? {
                    Message::Response { msgid: got, response } if got == msgid => {
                        return Ok(response);
                    }
                    other => {
                        // Stale response from an abandoned call; skip it.
                        trace!(node = %self.node, msgid = other.msgid(), "discarding stale frame");
                    }
                }
            }
            let stream = self.stream.as_mut().ok_or(WireError::ConnectionClosed)?;
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Err(WireError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn notify(&mut self, request: Request, timeout: Duration) -> WireResult<()> {
        let msgid = self.next_msgid;
        self.next_msgid = self.next_msgid.wrapping_add(1);

        let frame = Message::request(msgid, request).to_frame()?;
        let mut out = BytesMut::new();
        frame.encode(&mut out);

        let result = self
            .ensure_connected(timeout)
            .and_then(|stream| Ok(stream.write_all(&out)?));
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Minimal in-thread peer answering every request with `KeepAlive`.
    fn spawn_peer() -> NodeId {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = BytesMut::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                    let msg = Message::from_frame(&frame).unwrap();
                    let reply = Message::response(msg.msgid(), Response::KeepAlive);
                    let mut out = BytesMut::new();
                    reply.to_frame().unwrap().encode(&mut out);
                    stream.write_all(&out).unwrap();
                }
            }
        });
        NodeId::new(addr)
    }

    #[test]
    fn call_roundtrips_over_tcp() {
        let node = spawn_peer();
        let pool = SessionPool::new(Duration::from_secs(2));
        let response = pool
            .call(node, Request::KeepAlive { adjust_clock: 1 })
            .unwrap();
        assert_eq!(response, Response::KeepAlive);

        // Session reuse: a second call on the same pool works too.
        let response = pool
            .call(node, Request::KeepAlive { adjust_clock: 2 })
            .unwrap();
        assert_eq!(response, Response::KeepAlive);
    }

    #[test]
    fn unreachable_peer_is_an_error() {
        let pool = SessionPool::new(Duration::from_millis(200));
        let node: NodeId = "127.0.0.1:1".parse().unwrap();
        assert!(pool.call(node, Request::KeepAlive { adjust_clock: 0 }).is_err());
    }
}
