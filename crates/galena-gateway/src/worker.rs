//! Worker pool executing cluster calls for parsed client commands.
//!
//! Jobs are routed to workers by connection id, so commands from one
//! client run in the order they arrived even when the client pipelines
//! (`set ... noreply` immediately followed by a `get` must observe the
//! write). Different connections spread across the pool.
//!
//! Every job carries a weak reference to its connection's validity
//! flag. Workers skip dead connections before doing cluster work, and
//! the event loop checks again before bytes reach a socket; between the
//! two, a reply can never land on a connection other than the one that
//! asked for it.

use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use mio::Waker;
use tracing::{debug, warn};

use crate::connection::is_valid;
use crate::reply::{
    DELETE_FAILED, DELETED, END, GET_FAILED, MultiGetState, NOT_FOUND, STORE_FAILED, STORED,
    value_record,
};
use crate::router::Router;

/// Rendered reply bytes addressed to one connection.
pub struct Completion {
    pub conn: u64,
    pub valid: Weak<AtomicBool>,
    pub data: Bytes,
}

/// One parsed client command, ready for the cluster.
pub enum GatewayJob {
    Get {
        conn: u64,
        valid: Weak<AtomicBool>,
        key: Bytes,
    },
    /// One sub-request of a multi-key GET sharing an aggregation state.
    MultiGet {
        conn: u64,
        valid: Weak<AtomicBool>,
        key: Bytes,
        state: Arc<MultiGetState>,
    },
    Set {
        conn: u64,
        valid: Weak<AtomicBool>,
        key: Bytes,
        value: Bytes,
        noreply: bool,
    },
    Delete {
        conn: u64,
        valid: Weak<AtomicBool>,
        key: Bytes,
        noreply: bool,
    },
    Shutdown,
}

impl GatewayJob {
    /// The connection this job belongs to; `Shutdown` has none.
    fn conn(&self) -> Option<u64> {
        match self {
            GatewayJob::Get { conn, .. }
            | GatewayJob::MultiGet { conn, .. }
            | GatewayJob::Set { conn, .. }
            | GatewayJob::Delete { conn, .. } => Some(*conn),
            GatewayJob::Shutdown => None,
        }
    }
}

/// The gateway worker pool: one inbox per worker, jobs routed by
/// connection id.
pub struct WorkerPool {
    inboxes: Vec<Sender<GatewayJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        count: usize,
        router: Arc<Router>,
        completions: Sender<Completion>,
        waker: Arc<Waker>,
    ) -> Self {
        assert!(count > 0, "worker count must be positive");
        let mut inboxes = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let (tx, rx) = channel::<GatewayJob>();
            let router = Arc::clone(&router);
            let completions = completions.clone();
            let waker = Arc::clone(&waker);
            let handle = thread::Builder::new()
                .name(format!("galena-gw-{i}"))
                .spawn(move || worker_loop(&rx, &router, &completions, &waker))
                .expect("failed to spawn worker thread");
            inboxes.push(tx);
            handles.push(handle);
        }

        Self { inboxes, handles }
    }

    /// Routes the job to its connection's worker.
    pub fn submit(&self, job: GatewayJob) {
        let idx = match job.conn() {
            Some(conn) => (conn % self.inboxes.len() as u64) as usize,
            None => 0,
        };
        // The channel only fails after shutdown; late jobs are moot.
        let _ = self.inboxes[idx].send(job);
    }

    pub fn shutdown(&mut self) {
        for inbox in &self.inboxes {
            let _ = inbox.send(GatewayJob::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    inbox: &Receiver<GatewayJob>,
    router: &Router,
    completions: &Sender<Completion>,
    waker: &Waker,
) {
    loop {
        let Ok(job) = inbox.recv() else { return };
        match job {
            GatewayJob::Shutdown => return,
            job => run_job(job, router, completions, waker),
        }
    }
}

fn run_job(
    job: GatewayJob,
    router: &Router,
    completions: &Sender<Completion>,
    waker: &Waker,
) {
    let send = |conn: u64, valid: &Weak<AtomicBool>, data: Bytes| {
        let completion = Completion {
            conn,
            valid: valid.clone(),
            data,
        };
        if completions.send(completion).is_err() {
            debug!("completion channel closed, dropping reply");
            return;
        }
        if let Err(e) = waker.wake() {
            warn!(error = %e, "waker failed");
        }
    };

    match job {
        GatewayJob::Get { conn, valid, key } => {
            if !is_valid(&valid) {
                return;
            }
            let data = match router.get(&key) {
                Ok(Some(record)) => value_record(&key, &record.value, b"\r\nEND\r\n"),
                Ok(None) => Bytes::from_static(END),
                Err(e) => {
                    debug!(error = %e, "get failed");
                    Bytes::from_static(GET_FAILED)
                }
            };
            send(conn, &valid, data);
        }
        GatewayJob::MultiGet {
            conn,
            valid,
            key,
            state,
        } => {
            if is_valid(&valid) {
                // Misses and errors contribute no record; the terminator
                // accounting below still runs for them.
                match router.get(&key) {
                    Ok(Some(record)) => {
                        send(conn, &valid, value_record(&key, &record.value, b"\r\n"));
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "multi-get sub-request failed"),
                }
            }
            if state.complete() {
                send(conn, &valid, Bytes::from_static(END));
            }
        }
        GatewayJob::Set {
            conn,
            valid,
            key,
            value,
            noreply,
        } => {
            if !is_valid(&valid) {
                return;
            }
            let result = router.set(&key, &value);
            if noreply {
                return;
            }
            let data = match result {
                Ok(_) => Bytes::from_static(STORED),
                Err(e) => {
                    debug!(error = %e, "set failed");
                    Bytes::from_static(STORE_FAILED)
                }
            };
            send(conn, &valid, data);
        }
        GatewayJob::Delete {
            conn,
            valid,
            key,
            noreply,
        } => {
            if !is_valid(&valid) {
                return;
            }
            let result = router.delete(&key);
            if noreply {
                return;
            }
            let data = match result {
                Ok(true) => Bytes::from_static(DELETED),
                Ok(false) => Bytes::from_static(NOT_FOUND),
                Err(e) => {
                    debug!(error = %e, "delete failed");
                    Bytes::from_static(DELETE_FAILED)
                }
            };
            send(conn, &valid, data);
        }
        GatewayJob::Shutdown => unreachable!("handled by the worker loop"),
    }
}
