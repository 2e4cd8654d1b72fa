//! The server's mio event loop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

use galena_storage::Store;
use galena_wire::{Message, SessionPool};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{ServerError, ServerResult};
use crate::node::ServerNode;
use crate::stream::StreamListener;
use crate::worker::{Completion, Job, WorkerPool};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
#[cfg(unix)]
const SIGNALS: Token = Token(2);

/// Connection tokens start here and are never reused, so a completion
/// for a closed connection can never reach a newer one.
const FIRST_CONN: u64 = 16;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Requests the event loop to stop from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// The server daemon: RPC listener, worker pool, offer stream listener,
/// keep-alive ticker.
pub struct Server {
    node: Arc<ServerNode>,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<u64, Connection>,
    next_conn: u64,
    workers: WorkerPool,
    completions: Receiver<Completion>,
    waker: Arc<Waker>,
    stream_listener: StreamListener,
    shutdown: Arc<AtomicBool>,
    keep_alive: Option<JoinHandle<()>>,
    #[cfg(unix)]
    signals: signal_hook_mio::v1_0::Signals,
}

impl Server {
    /// Opens the store, binds the sockets, and spawns the worker pool,
    /// stream listener and keep-alive ticker.
    pub fn new(mut config: ServerConfig) -> ServerResult<Self> {
        let mut listener =
            TcpListener::bind(config.listen).map_err(|source| ServerError::BindFailed {
                addr: config.listen,
                source,
            })?;
        // Rebind the configured address to what the OS actually gave us
        // so the node identity matches reality when port 0 was asked.
        config.listen = listener.local_addr()?;
        let local_addr = config.listen;

        let store = Arc::new(Store::open(&config.store_path)?);
        let bus = Arc::new(SessionPool::new(config.rpc_timeout));
        let node = Arc::new(ServerNode::new(config, store, bus));

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        #[cfg(unix)]
        let signals = {
            use signal_hook::consts::signal::{SIGINT, SIGTERM};
            let mut signals = signal_hook_mio::v1_0::Signals::new([SIGINT, SIGTERM])?;
            poll.registry()
                .register(&mut signals, SIGNALS, Interest::READABLE)?;
            signals
        };

        let (tx, completions) = channel();
        let workers = WorkerPool::start(
            node.config.workers,
            Arc::clone(&node),
            tx,
            Arc::clone(&waker),
        );

        let stream_addr = node.config.stream_addr().addr();
        let stream_listener = StreamListener::spawn(Arc::clone(&node), stream_addr)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let keep_alive = Self::spawn_keep_alive(&node, &shutdown);

        info!(listen = %local_addr, stream = %stream_listener.local_addr(), "server ready");

        Ok(Self {
            node,
            poll,
            listener,
            local_addr,
            connections: HashMap::new(),
            next_conn: FIRST_CONN,
            workers,
            completions,
            waker,
            stream_listener,
            shutdown,
            keep_alive,
            #[cfg(unix)]
            signals,
        })
    }

    fn spawn_keep_alive(
        node: &Arc<ServerNode>,
        shutdown: &Arc<AtomicBool>,
    ) -> Option<JoinHandle<()>> {
        if node.config.manager1.is_none() && node.config.manager2.is_none() {
            return None;
        }
        let node = Arc::clone(node);
        let shutdown = Arc::clone(shutdown);
        let interval = node.config.clock_interval;
        thread::Builder::new()
            .name("galena-keepalive".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    node.keep_alive();
                    // Sleep in short slices so shutdown stays prompt.
                    let mut left = interval;
                    while !left.is_zero() && !shutdown.load(Ordering::SeqCst) {
                        let step = left.min(Duration::from_millis(100));
                        thread::sleep(step);
                        left = left.saturating_sub(step);
                    }
                }
            })
            .ok()
    }

    /// The bound RPC address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared node state.
    pub fn node(&self) -> Arc<ServerNode> {
        Arc::clone(&self.node)
    }

    /// A handle that stops `run` from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Runs the event loop until shutdown is requested.
    pub fn run(&mut self) -> ServerResult<()> {
        let mut events = Events::with_capacity(256);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in &events {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => {}
                    #[cfg(unix)]
                    SIGNALS => {
                        for signal in self.signals.pending() {
                            info!(signal, "signal received, shutting down");
                            self.shutdown.store(true, Ordering::SeqCst);
                        }
                    }
                    Token(raw) => {
                        let id = raw as u64;
                        let readable = event.is_readable();
                        let writable = event.is_writable();
                        self.handle_connection(id, readable, writable);
                    }
                }
            }

            self.drain_completions();
        }

        self.stop();
        Ok(())
    }

    fn stop(&mut self) {
        info!("server stopping");
        self.workers.shutdown();
        self.stream_listener.stop();
        if let Some(handle) = self.keep_alive.take() {
            let _ = handle.join();
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.node.tcp_nodelay() {
                        let _ = stream.set_nodelay(true);
                    }
                    let id = self.next_conn;
                    self.next_conn += 1;
                    let token = Token(id as usize);
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(%peer, error = %e, "cannot register connection");
                        continue;
                    }
                    debug!(%peer, id, "rpc connection accepted");
                    self.connections.insert(id, Connection::new(stream));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_connection(&mut self, id: u64, readable: bool, writable: bool) {
        let mut jobs = Vec::new();
        let mut close = false;

        {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };

            if readable {
                match conn.read() {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(id, "connection closed by peer");
                        close = true;
                    }
                    Err(e) => {
                        debug!(id, error = %e, "read failed");
                        close = true;
                    }
                }

                while !close {
                    match conn.try_decode() {
                        Ok(Some(Message::Request { msgid, request })) => {
                            jobs.push(Job::Rpc {
                                conn: id,
                                msgid,
                                request,
                            });
                        }
                        Ok(Some(Message::Response { msgid, .. })) => {
                            warn!(id, msgid, "unexpected response frame from client");
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(id, error = %e, "protocol error, closing connection");
                            close = true;
                        }
                    }
                }
            }

            if writable && !close {
                match conn.write() {
                    Ok(true) if conn.closing => close = true,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(id, error = %e, "write failed");
                        close = true;
                    }
                }
            }
        }

        // Requests decoded before a close still run; their completions
        // find the connection gone and are dropped.
        for job in jobs {
            self.workers.submit(job);
        }
        if close {
            self.close_connection(id);
        } else {
            self.update_interest(id);
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(Completion { conn, message }) = self.completions.try_recv() {
            let Some(connection) = self.connections.get_mut(&conn) else {
                // The connection is gone; the response is dropped rather
                // than ever touching a newer connection's socket.
                debug!(conn, "dropping completion for closed connection");
                continue;
            };
            if let Err(e) = connection.queue_message(&message) {
                warn!(conn, error = %e, "cannot queue response");
                self.close_connection(conn);
                continue;
            }
            // Push what we can immediately; the rest flushes on the next
            // writable event.
            if let Err(e) = connection.write() {
                debug!(conn, error = %e, "write failed");
                self.close_connection(conn);
                continue;
            }
            self.update_interest(conn);
        }
    }

    fn update_interest(&mut self, id: u64) {
        if let Some(conn) = self.connections.get_mut(&id) {
            let interest = conn.interest();
            if let Err(e) =
                self.poll
                    .registry()
                    .reregister(&mut conn.stream, Token(id as usize), interest)
            {
                warn!(id, error = %e, "reregister failed");
                self.close_connection(id);
            }
        }
    }

    fn close_connection(&mut self, id: u64) {
        if let Some(mut conn) = self.connections.remove(&id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }
}
