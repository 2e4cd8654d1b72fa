//! Shared node state and request dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use tracing::{debug, error, trace, warn};

use galena_hashspace::{HashSpace, HsSeed, SeedOrder};
use galena_storage::Store;
use galena_types::{LogicalClock, NodeId};
use galena_wire::{Bus, Request, Response};

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::metrics::ServerMetrics;
use crate::replace::ReplaceState;

/// A finished response on its way back to the requesting connection.
///
/// Handlers call `send` exactly once; the async write path sends before
/// its replica fan-out completes. Dropping a `Reply` without sending
/// leaves the caller to its RPC timeout, which is the intended signal
/// for unrecoverable handler failures.
pub struct Reply {
    inner: Box<dyn FnOnce(Response) + Send>,
}

impl Reply {
    pub fn new(f: impl FnOnce(Response) + Send + 'static) -> Self {
        Self { inner: Box::new(f) }
    }

    /// A reply sink that discards the response. Used for one-way
    /// notifications and in tests that only observe state.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn send(self, response: Response) {
        (self.inner)(response);
    }
}

/// The write and read views of the hash space.
///
/// They differ only during rebalance: `ReplaceCopyStart` installs the
/// new seed into the write view, and `ReplaceDeleteStart` promotes it
/// into the read view once the copy phase is done everywhere.
pub struct HashSpaces {
    whs: RwLock<HashSpace>,
    rhs: RwLock<HashSpace>,
}

impl HashSpaces {
    pub fn new(seed: &HsSeed) -> Self {
        Self {
            whs: RwLock::new(HashSpace::from_seed(seed)),
            rhs: RwLock::new(HashSpace::from_seed(seed)),
        }
    }

    pub fn whs(&self) -> RwLockReadGuard<'_, HashSpace> {
        self.whs.read().expect("whs lock poisoned")
    }

    pub fn rhs(&self) -> RwLockReadGuard<'_, HashSpace> {
        self.rhs.read().expect("rhs lock poisoned")
    }

    pub fn install_whs(&self, hs: HashSpace) {
        *self.whs.write().expect("whs lock poisoned") = hs;
    }

    pub fn install_rhs(&self, hs: HashSpace) {
        *self.rhs.write().expect("rhs lock poisoned") = hs;
    }
}

/// One server node: storage, clock, hash-space views, replace state.
///
/// All RPC handlers live on this type, split across the `store`,
/// `replace` and `control` modules. Handlers run on worker threads and
/// may block on peer RPC; nothing here runs on the event loop itself.
pub struct ServerNode {
    pub(crate) config: ServerConfig,
    pub(crate) node: NodeId,
    pub(crate) store: Arc<Store>,
    pub(crate) clock: LogicalClock,
    pub(crate) spaces: HashSpaces,
    pub(crate) replace: ReplaceState,
    pub(crate) metrics: ServerMetrics,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) tcp_nodelay: AtomicBool,
}

impl ServerNode {
    pub fn new(config: ServerConfig, store: Arc<Store>, bus: Arc<dyn Bus>) -> Self {
        let mut nodes = config.nodes.clone();
        let node = config.node_id();
        if !nodes.contains(&node) {
            nodes.push(node);
        }
        let seed = HsSeed::bootstrap(nodes);
        Self {
            node,
            spaces: HashSpaces::new(&seed),
            replace: ReplaceState::new(),
            clock: LogicalClock::new(),
            metrics: ServerMetrics::new(),
            store,
            bus,
            config,
            tcp_nodelay: AtomicBool::new(false),
        }
    }

    /// This node's identity on the ring.
    pub fn id(&self) -> NodeId {
        self.node
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Whether newly accepted RPC sockets should set `TCP_NODELAY`.
    pub fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay.load(Ordering::Relaxed)
    }

    /// Routes one decoded request to its handler.
    pub fn dispatch(&self, request: Request, reply: Reply) {
        trace!(tag = request.tag(), "dispatch");
        match request {
            Request::KeepAlive { adjust_clock } => {
                self.clock.merge(adjust_clock);
                reply.send(Response::KeepAlive);
            }
            Request::HashSpaceSync {
                wseed,
                rseed,
                adjust_clock,
            } => {
                self.clock.merge(adjust_clock);
                let accepted = self.sync_hash_spaces(&wseed, &rseed);
                reply.send(Response::HashSpaceSync { accepted });
            }
            Request::Get { key } => reply.send(self.handle_get(&key)),
            Request::GetIfModified { key, if_time } => {
                reply.send(self.handle_get_if_modified(&key, if_time));
            }
            Request::Set { flags, key, value } => self.handle_set(flags, &key, &value, reply),
            Request::Delete { flags, key } => self.handle_delete(flags, &key, reply),
            Request::ReplicateSet {
                adjust_clock,
                flags,
                clocktime,
                key,
                value,
            } => match self.handle_replicate_set(adjust_clock, flags, clocktime, &key, &value) {
                Ok(applied) => reply.send(Response::ReplicateSet { applied }),
                Err(e) => {
                    // No reply: the coordinator times out and retries
                    // against a node whose storage works.
                    error!(error = %e, "replicate-set failed locally");
                    drop(reply);
                }
            },
            Request::ReplicateDelete {
                adjust_clock,
                flags,
                clocktime,
                key,
            } => match self.handle_replicate_delete(adjust_clock, flags, clocktime, &key) {
                Ok(applied) => reply.send(Response::ReplicateDelete { applied }),
                Err(e) => {
                    error!(error = %e, "replicate-delete failed locally");
                    drop(reply);
                }
            },
            Request::ReplaceCopyStart {
                hsseed,
                adjust_clock,
                full,
            } => self.handle_replace_copy_start(&hsseed, adjust_clock, full, reply),
            Request::ReplaceDeleteStart {
                hsseed,
                adjust_clock,
            } => self.handle_replace_delete_start(&hsseed, adjust_clock, reply),
            Request::ReplaceOffer { addr } => {
                // One-way notice: the peer is about to open a stream.
                // No response travels back.
                debug!(from = %addr, "offer stream announced");
                drop(reply);
            }
            Request::CreateBackup { suffix } => reply.send(self.handle_create_backup(&suffix)),
            Request::GetStatus { command } => reply.send(self.handle_get_status(command)),
            Request::SetConfig { command, arg } => reply.send(self.handle_set_config(command, arg)),
            Request::ReplaceCopyEnd { .. } | Request::ReplaceDeleteEnd { .. } => {
                // Manager-bound notifications; a server receiving one has
                // been misaddressed.
                warn!("replace end notification addressed to a server node");
                drop(reply);
            }
        }
    }

    /// Applies pushed seeds, adopting whichever views are strictly newer.
    ///
    /// Returns false when the push is obsolete (older than the local
    /// write view).
    fn sync_hash_spaces(&self, wseed: &HsSeed, rseed: &HsSeed) -> bool {
        let order = self.spaces.whs().seed().compare(wseed);
        match order {
            SeedOrder::Newer => {
                debug!(clocktime = %wseed.clocktime, "adopting pushed hash spaces");
                self.spaces.install_whs(HashSpace::from_seed(wseed));
                if self.spaces.rhs().seed().compare(rseed) == SeedOrder::Newer {
                    self.spaces.install_rhs(HashSpace::from_seed(rseed));
                }
                true
            }
            SeedOrder::Same => true,
            SeedOrder::Obsolete => {
                debug!(clocktime = %wseed.clocktime, "rejecting obsolete hash space push");
                false
            }
        }
    }

    /// Sends one keep-alive round to the configured managers.
    pub fn keep_alive(&self) {
        for manager in [self.config.manager1, self.config.manager2]
            .into_iter()
            .flatten()
        {
            let request = Request::KeepAlive {
                adjust_clock: self.clock.tick(),
            };
            if let Err(e) = self.bus.call(manager, request) {
                debug!(manager = %manager, error = %e, "keep-alive failed");
            }
        }
    }

    pub(crate) fn notify_manager(&self, manager: NodeId, request: Request) -> ServerResult<()> {
        self.bus.call(manager, request)?;
        Ok(())
    }
}
