//! Fixed worker pool running the RPC state machines.
//!
//! The event loop never blocks: decoded requests go into the pool's
//! bounded inbox and are handled on worker threads, which are allowed
//! to block on storage and on peer RPC. Finished responses travel back
//! through an mpsc channel; the waker nudges the poll loop to drain it.

use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use mio::Waker;
use tracing::{debug, warn};

use galena_wire::{Message, Request};

use crate::node::{Reply, ServerNode};
use crate::queue::Inbox;

/// A finished response addressed to the connection that asked.
pub struct Completion {
    pub conn: u64,
    pub message: Message,
}

/// Work items for the pool.
pub enum Job {
    Rpc {
        conn: u64,
        msgid: u32,
        request: Request,
    },
    Shutdown,
}

/// The worker pool.
pub struct WorkerPool {
    inbox: Arc<Inbox<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers draining a shared inbox.
    pub fn start(
        count: usize,
        node: Arc<ServerNode>,
        completions: Sender<Completion>,
        waker: Arc<Waker>,
    ) -> Self {
        assert!(count > 0, "worker count must be positive");
        let inbox = Arc::new(Inbox::new(4096));
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let inbox = Arc::clone(&inbox);
            let node = Arc::clone(&node);
            let completions = completions.clone();
            let waker = Arc::clone(&waker);
            let handle = thread::Builder::new()
                .name(format!("galena-worker-{i}"))
                .spawn(move || worker_loop(&inbox, &node, &completions, &waker))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { inbox, handles }
    }

    /// Enqueues a job, yielding while the inbox is full. Backpressure
    /// propagates to the event loop, which simply reads slower.
    pub fn submit(&self, job: Job) {
        self.inbox.push_blocking(job);
    }

    /// Stops and joins every worker.
    pub fn shutdown(&mut self) {
        for _ in 0..self.handles.len() {
            self.inbox.push_blocking(Job::Shutdown);
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
    inbox: &Inbox<Job>,
    node: &Arc<ServerNode>,
    completions: &Sender<Completion>,
    waker: &Arc<Waker>,
) {
    loop {
        match inbox.try_pop() {
            Some(Job::Rpc {
                conn,
                msgid,
                request,
            }) => {
                let completions = completions.clone();
                let waker = Arc::clone(waker);
                let reply = Reply::new(move |response| {
                    let message = Message::response(msgid, response);
                    if completions.send(Completion { conn, message }).is_err() {
                        debug!("completion channel closed, dropping response");
                        return;
                    }
                    if let Err(e) = waker.wake() {
                        warn!(error = %e, "waker failed");
                    }
                });
                node.dispatch(request, reply);
            }
            Some(Job::Shutdown) => return,
            None => thread::yield_now(),
        }
    }
}
