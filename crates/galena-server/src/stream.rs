//! The offer stream channel used by the rebalance copy phase.
//!
//! Offers do not travel over the RPC socket: a node moving a large
//! slice of its keyspace would starve request traffic. Instead each
//! node runs a dedicated stream listener, and senders accumulate their
//! offers in per-target spill files before pushing them over one
//! connection per target.
//!
//! The channel speaks length-prefixed msgpack, reusing the wire frame:
//! a header naming the rebalance and entry count, the entries, then an
//! acknowledgment carrying how many entries the receiver took. The
//! receiver applies entries under the usual clock-stamp rule, so a
//! stale offer never clobbers a newer local write.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::{debug, warn};

use galena_types::{ClockTime, NodeId};
use galena_wire::{Frame, WireError};

use crate::error::{ServerError, ServerResult};
use crate::node::ServerNode;

/// Poll interval of the accept loop while idle or shutting down.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Serialize, Deserialize)]
struct OfferHeader {
    replace_time: ClockTime,
    count: u64,
}

#[derive(Serialize, Deserialize)]
struct OfferEntry {
    clocktime: ClockTime,
    key: ByteBuf,
    value: ByteBuf,
}

#[derive(Serialize, Deserialize)]
struct OfferAck {
    received: u64,
}

fn write_frame(w: &mut impl Write, value: &impl Serialize) -> ServerResult<()> {
    let payload = rmp_serde::to_vec(value).map_err(WireError::from)?;
    let mut buf = BytesMut::new();
    Frame::new(Bytes::from(payload)).encode(&mut buf);
    w.write_all(&buf)?;
    Ok(())
}

/// Reads one frame payload, buffering across short reads.
fn read_frame(r: &mut impl Read, buf: &mut BytesMut) -> ServerResult<Bytes> {
    let mut chunk = [0u8; 16 * 1024];
    loop {
        if let Some(frame) = Frame::decode(buf).map_err(ServerError::Wire)? {
            return Ok(frame.payload);
        }
        let n = r.read(&mut chunk)?;
        if n == 0 {
            return Err(ServerError::Wire(WireError::ConnectionClosed));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Per-target spill file of pending offers.
pub struct OfferFile {
    file: tempfile::NamedTempFile,
    count: u64,
}

impl OfferFile {
    fn create(tmpdir: &Path) -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("galena-offer-")
            .tempfile_in(tmpdir)?;
        Ok(Self { file, count: 0 })
    }

    /// Number of entries spilled into this file.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Accumulates the copy-phase offers, one spill file per target node.
///
/// Spill files are created under the configured temporary directory and
/// removed when the storage is dropped, acknowledged or not.
pub struct OfferStorage {
    tmpdir: PathBuf,
    replace_time: ClockTime,
    files: HashMap<NodeId, OfferFile>,
}

impl OfferStorage {
    pub fn new(tmpdir: &Path, replace_time: ClockTime) -> ServerResult<Self> {
        // Fail early if the directory is unusable, not mid-scan.
        let probe = OfferFile::create(tmpdir)?;
        drop(probe);
        Ok(Self {
            tmpdir: tmpdir.to_path_buf(),
            replace_time,
            files: HashMap::new(),
        })
    }

    /// Spills one (key, value) pair destined for `target`.
    pub fn add(
        &mut self,
        target: NodeId,
        key: &[u8],
        value: &[u8],
        clocktime: ClockTime,
    ) -> ServerResult<()> {
        let entry = OfferEntry {
            clocktime,
            key: ByteBuf::from(key.to_vec()),
            value: ByteBuf::from(value.to_vec()),
        };
        let file = match self.files.entry(target) {
            std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(OfferFile::create(&self.tmpdir)?)
            }
        };
        write_frame(file.file.as_file_mut(), &entry)?;
        file.count += 1;
        Ok(())
    }

    /// The rebalance these offers belong to.
    pub fn replace_time(&self) -> ClockTime {
        self.replace_time
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Hands the spill files over for streaming.
    pub fn into_files(self) -> impl Iterator<Item = (NodeId, OfferFile)> {
        self.files.into_iter()
    }
}

/// Streams one spill file to a target's stream listener.
///
/// Returns the number of entries the receiver acknowledged.
pub fn send_offer(
    stream_addr: NodeId,
    file: &mut OfferFile,
    replace_time: ClockTime,
    timeout: Duration,
) -> ServerResult<u64> {
    let mut stream = TcpStream::connect_timeout(&stream_addr.addr(), timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    write_frame(
        &mut stream,
        &OfferHeader {
            replace_time,
            count: file.count,
        },
    )?;

    let spill = file.file.as_file_mut();
    spill.flush()?;
    spill.seek(SeekFrom::Start(0))?;
    io::copy(spill, &mut stream)?;

    let mut buf = BytesMut::new();
    let payload = read_frame(&mut stream, &mut buf)?;
    let ack: OfferAck = rmp_serde::from_slice(&payload).map_err(WireError::from)?;
    Ok(ack.received)
}

/// The receiving side: a dedicated listener applying incoming offers.
pub struct StreamListener {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamListener {
    /// Binds `addr` and spawns the accept loop.
    pub fn spawn(node: Arc<ServerNode>, addr: SocketAddr) -> ServerResult<Self> {
        let listener = TcpListener::bind(addr).map_err(|source| ServerError::BindFailed {
            addr,
            source,
        })?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("galena-stream".to_string())
            .spawn(move || accept_loop(&listener, &node, &accept_shutdown))?;

        Ok(Self {
            addr,
            shutdown,
            handle: Some(handle),
        })
    }

    /// The address the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting and joins the accept loop.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &TcpListener, node: &Arc<ServerNode>, shutdown: &Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "offer stream accepted");
                let node = Arc::clone(node);
                let spawned = thread::Builder::new()
                    .name("galena-stream-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = receive_offers(stream, &node) {
                            warn!(%peer, error = %e, "offer stream aborted");
                        }
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "cannot spawn offer stream handler");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "offer stream accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Drains one sender's offers into the local store.
fn receive_offers(mut stream: TcpStream, node: &Arc<ServerNode>) -> ServerResult<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    stream.set_write_timeout(Some(Duration::from_secs(30)))?;

    let mut buf = BytesMut::new();
    let payload = read_frame(&mut stream, &mut buf)?;
    let header: OfferHeader = rmp_serde::from_slice(&payload).map_err(WireError::from)?;
    debug!(count = header.count, replace_time = %header.replace_time, "offer stream header");

    let mut received = 0u64;
    for _ in 0..header.count {
        let payload = read_frame(&mut stream, &mut buf)?;
        let entry: OfferEntry = rmp_serde::from_slice(&payload).map_err(WireError::from)?;
        node.clock.observe(entry.clocktime);
        node.store()
            .set_if_newer(&entry.key, &entry.value, entry.clocktime)?;
        received += 1;
    }

    write_frame(&mut stream, &OfferAck { received })?;
    Ok(())
}
