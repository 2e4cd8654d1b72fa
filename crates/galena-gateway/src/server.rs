//! The gateway's mio event loop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

use galena_wire::SessionPool;

use crate::config::GatewayConfig;
use crate::connection::{Connection, is_valid};
use crate::error::{GatewayError, GatewayResult};
use crate::memtext::StoreCommandSink;
use crate::reply::{MultiGetState, NOT_SUPPORTED};
use crate::router::Router;
use crate::worker::{Completion, GatewayJob, WorkerPool};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
#[cfg(unix)]
const SIGNALS: Token = Token(2);

/// Connection tokens start here and are never reused; together with the
/// validity flags this keeps late replies off reused descriptors.
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

/// The gateway daemon.
pub struct Gateway {
    router: Arc<Router>,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<u64, Connection>,
    next_conn: u64,
    workers: WorkerPool,
    completions: Receiver<Completion>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    refresh: Option<JoinHandle<()>>,
    #[cfg(unix)]
    signals: signal_hook_mio::v1_0::Signals,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let mut listener =
            TcpListener::bind(config.listen).map_err(|source| GatewayError::BindFailed {
                addr: config.listen,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let bus = Arc::new(SessionPool::new(config.rpc_timeout));
        let router = Arc::new(Router::new(
            config.servers.clone(),
            config.replication,
            config.write_retry,
            bus,
        ));

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
            config.workers,
            Arc::clone(&router),
            tx,
            Arc::clone(&waker),
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let refresh = Self::spawn_refresh(&router, &shutdown, config.refresh_interval);

        info!(listen = %local_addr, servers = config.servers.len(), "gateway ready");

        Ok(Self {
            router,
            poll,
            listener,
            local_addr,
            connections: HashMap::new(),
            next_conn: FIRST_CONN,
            workers,
            completions,
            waker,
            shutdown,
            refresh,
            #[cfg(unix)]
            signals,
        })
    }

    fn spawn_refresh(
        router: &Arc<Router>,
        shutdown: &Arc<AtomicBool>,
        interval: Duration,
    ) -> Option<JoinHandle<()>> {
        let router = Arc::clone(router);
        let shutdown = Arc::clone(shutdown);
        thread::Builder::new()
            .name("galena-gw-refresh".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    let mut left = interval;
                    while !left.is_zero() && !shutdown.load(Ordering::SeqCst) {
                        let step = left.min(Duration::from_millis(100));
                        thread::sleep(step);
                        left = left.saturating_sub(step);
                    }
                    if !shutdown.load(Ordering::SeqCst) {
                        router.refresh();
                    }
                }
            })
            .ok()
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The cluster router, exposed for tests and tooling.
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// A handle that stops `run` from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Runs the event loop until shutdown is requested.
    pub fn run(&mut self) -> GatewayResult<()> {
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
        info!("gateway stopping");
        self.workers.shutdown();
        if let Some(handle) = self.refresh.take() {
            let _ = handle.join();
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let _ = stream.set_nodelay(true);
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
                    debug!(%peer, id, "client connection accepted");
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
                        debug!(id, "client disconnected");
                        close = true;
                    }
                    Err(e) => {
                        debug!(id, error = %e, "read failed");
                        close = true;
                    }
                }

                if !close {
                    let valid = conn.validity();
                    let mut sink = ConnSink {
                        conn: id,
                        valid,
                        jobs: &mut jobs,
                        direct: &mut conn.write_buf,
                    };
                    if let Err(e) = conn.parser.parse(&mut conn.read_buf, &mut sink) {
                        debug!(id, error = %e, "memcached text protocol error");
                        close = true;
                    }
                }
            }

            if writable && !close {
                if let Err(e) = conn.write() {
                    debug!(id, error = %e, "write failed");
                    close = true;
                }
            }
        }

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
        while let Ok(Completion { conn, valid, data }) = self.completions.try_recv() {
            // The weak flag is the authority: a dead connection's token
            // may be absent from the map, but never reassigned.
            if !is_valid(&valid) {
                debug!(conn, "dropping reply for dead connection");
                continue;
            }
            let Some(connection) = self.connections.get_mut(&conn) else {
                continue;
            };
            connection.write_buf.extend_from_slice(&data);
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
            // Dropping the connection clears its validity flag.
        }
    }
}

/// Adapter from parser callbacks to worker jobs.
///
/// Flag and expiry refusals are answered inline: they never reach the
/// cluster, mirroring how the protocol handler rejected them before
/// submitting anything.
struct ConnSink<'a> {
    conn: u64,
    valid: Weak<AtomicBool>,
    jobs: &'a mut Vec<GatewayJob>,
    direct: &'a mut BytesMut,
}

impl StoreCommandSink for ConnSink<'_> {
    fn get(&mut self, keys: Vec<Bytes>) {
        if keys.len() == 1 {
            let key = keys.into_iter().next().expect("length checked");
            self.jobs.push(GatewayJob::Get {
                conn: self.conn,
                valid: self.valid.clone(),
                key,
            });
            return;
        }

        let state = Arc::new(MultiGetState::new(keys.len()));
        for key in keys {
            self.jobs.push(GatewayJob::MultiGet {
                conn: self.conn,
                valid: self.valid.clone(),
                key,
                state: Arc::clone(&state),
            });
        }
    }

    fn set(&mut self, key: Bytes, flags: u16, exptime: u32, value: Bytes, noreply: bool) {
        if flags != 0 || exptime != 0 {
            self.direct.extend_from_slice(NOT_SUPPORTED);
            return;
        }
        self.jobs.push(GatewayJob::Set {
            conn: self.conn,
            valid: self.valid.clone(),
            key,
            value,
            noreply,
        });
    }

    fn delete(&mut self, key: Bytes, exptime: u32, noreply: bool) {
        if exptime != 0 {
            self.direct.extend_from_slice(NOT_SUPPORTED);
            return;
        }
        self.jobs.push(GatewayJob::Delete {
            conn: self.conn,
            valid: self.valid.clone(),
            key,
            noreply,
        });
    }

    fn unsupported(&mut self) {
        self.direct.extend_from_slice(NOT_SUPPORTED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    use tempfile::tempdir;

    use galena_server::{Server, ServerConfig};

    struct Cluster {
        gateway_addr: SocketAddr,
        server_shutdown: galena_server::ShutdownHandle,
        gateway_shutdown: ShutdownHandle,
        threads: Vec<thread::JoinHandle<()>>,
        _dir: tempfile::TempDir,
    }

    impl Drop for Cluster {
        fn drop(&mut self) {
            self.gateway_shutdown.shutdown();
            self.server_shutdown.shutdown();
            for thread in self.threads.drain(..) {
                let _ = thread.join();
            }
        }
    }

    /// One server node plus a gateway in front of it.
    fn start_cluster() -> Cluster {
        let dir = tempdir().unwrap();
        let server_config =
            ServerConfig::new("127.0.0.1:0".parse().unwrap(), dir.path().join("db"))
                .with_stream_port(0);
        let mut server = Server::new(server_config).unwrap();
        let server_addr = server.local_addr();
        let server_shutdown = server.shutdown_handle();
        let server_thread = thread::spawn(move || {
            server.run().unwrap();
        });

        let gateway_config = GatewayConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            vec![galena_types::NodeId::new(server_addr)],
        )
        .with_workers(2);
        let mut gateway = Gateway::new(gateway_config).unwrap();
        let gateway_addr = gateway.local_addr();
        let gateway_shutdown = gateway.shutdown_handle();
        let gateway_thread = thread::spawn(move || {
            gateway.run().unwrap();
        });

        Cluster {
            gateway_addr,
            server_shutdown,
            gateway_shutdown,
            threads: vec![server_thread, gateway_thread],
            _dir: dir,
        }
    }

    struct Client {
        stream: TcpStream,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            Self { stream }
        }

        fn send(&mut self, data: &[u8]) {
            self.stream.write_all(data).unwrap();
        }

        fn expect(&mut self, expected: &[u8]) {
            let mut got = vec![0u8; expected.len()];
            self.stream.read_exact(&mut got).unwrap();
            assert_eq!(
                String::from_utf8_lossy(&got),
                String::from_utf8_lossy(expected)
            );
        }
    }

    #[test]
    fn get_of_absent_key_ends_empty() {
        let cluster = start_cluster();
        let mut client = Client::connect(cluster.gateway_addr);
        client.send(b"get foo\r\n");
        client.expect(b"END\r\n");
    }

    #[test]
    fn set_then_get_roundtrip() {
        let cluster = start_cluster();
        let mut client = Client::connect(cluster.gateway_addr);
        client.send(b"set foo 0 0 5\r\nhello\r\n");
        client.expect(b"STORED\r\n");
        client.send(b"get foo\r\n");
        client.expect(b"VALUE foo 0 5\r\nhello\r\nEND\r\n");
    }

    #[test]
    fn noreply_set_is_silent() {
        let cluster = start_cluster();
        let mut client = Client::connect(cluster.gateway_addr);
        client.send(b"set foo 0 0 5 noreply\r\nhello\r\n");
        // No STORED: the very next bytes on the socket answer the get.
        client.send(b"get foo\r\n");
        client.expect(b"VALUE foo 0 5\r\nhello\r\nEND\r\n");
    }

    #[test]
    fn multi_get_emits_hits_then_one_end() {
        let cluster = start_cluster();
        let mut client = Client::connect(cluster.gateway_addr);
        client.send(b"set b 0 0 1\r\nX\r\n");
        client.expect(b"STORED\r\n");

        // Only `b` exists: exactly one record and exactly one END.
        client.send(b"get a b c\r\n");
        client.expect(b"VALUE b 0 1\r\nX\r\nEND\r\n");
    }

    #[test]
    fn delete_then_delete_again() {
        let cluster = start_cluster();
        let mut client = Client::connect(cluster.gateway_addr);
        client.send(b"set foo 0 0 5\r\nhello\r\n");
        client.expect(b"STORED\r\n");
        client.send(b"delete foo\r\n");
        client.expect(b"DELETED\r\n");
        client.send(b"delete foo\r\n");
        client.expect(b"NOT FOUND\r\n");
    }

    #[test]
    fn nonzero_flags_are_refused_without_state_change() {
        let cluster = start_cluster();
        let mut client = Client::connect(cluster.gateway_addr);
        client.send(b"set x 1 0 1\r\nA\r\n");
        client.expect(b"CLIENT_ERROR supported\r\n");
        client.send(b"get x\r\n");
        client.expect(b"END\r\n");
    }

    #[test]
    fn nonzero_exptime_is_refused() {
        let cluster = start_cluster();
        let mut client = Client::connect(cluster.gateway_addr);
        client.send(b"set x 0 60 1\r\nA\r\n");
        client.expect(b"CLIENT_ERROR supported\r\n");
        client.send(b"delete x 60\r\n");
        client.expect(b"CLIENT_ERROR supported\r\n");
    }

    #[test]
    fn unsupported_commands_are_refused() {
        let cluster = start_cluster();
        let mut client = Client::connect(cluster.gateway_addr);
        client.send(b"replace x 0 0 1\r\nA\r\n");
        client.expect(b"CLIENT_ERROR supported\r\n");
        // The connection survives and keeps serving.
        client.send(b"get x\r\n");
        client.expect(b"END\r\n");
    }

    #[test]
    fn unknown_command_closes_the_connection() {
        let cluster = start_cluster();
        let mut client = Client::connect(cluster.gateway_addr);
        client.send(b"bogus\r\n");
        let mut buf = [0u8; 1];
        // Either clean EOF or a reset, but never a reply.
        match client.stream.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(_) => panic!("expected the connection to close"),
        }
    }
}
