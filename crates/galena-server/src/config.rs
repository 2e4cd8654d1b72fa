//! Server node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use galena_hashspace::DEFAULT_REPLICATION;
use galena_types::NodeId;

use crate::error::{ServerError, ServerResult};

/// Default RPC listen port.
pub const DEFAULT_PORT: u16 = 19800;

/// Default offer-stream listen port.
pub const DEFAULT_STREAM_PORT: u16 = 19900;

/// Default retry limit for replicate fan-outs.
pub const DEFAULT_REPLICATE_RETRY: u32 = 20;

/// Configuration for a server node.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cluster RPC listen address.
    pub listen: SocketAddr,
    /// Listen port for the rebalance offer stream.
    pub stream_port: u16,
    /// Directory for offer spill files during rebalance.
    pub offer_tmpdir: PathBuf,
    /// Path to the op log.
    pub store_path: PathBuf,
    /// Primary manager address.
    pub manager1: Option<NodeId>,
    /// Secondary manager address; must differ from the primary.
    pub manager2: Option<NodeId>,
    /// Retry limit for `ReplicateSet` fan-outs.
    pub replicate_set_retry: u32,
    /// Retry limit for `ReplicateDelete` fan-outs.
    pub replicate_delete_retry: u32,
    /// Replica-list length (coordinator included).
    pub replication: usize,
    /// Initial cluster membership, this node included.
    pub nodes: Vec<NodeId>,
    /// Interval between keep-alives to the managers.
    pub clock_interval: Duration,
    /// Peer RPC call timeout.
    pub rpc_timeout: Duration,
    /// Worker thread count.
    pub workers: usize,
}

impl ServerConfig {
    /// Creates a configuration with defaults for everything but the
    /// listen address and store path.
    pub fn new(listen: SocketAddr, store_path: impl Into<PathBuf>) -> Self {
        Self {
            listen,
            stream_port: DEFAULT_STREAM_PORT,
            offer_tmpdir: PathBuf::from("/tmp"),
            store_path: store_path.into(),
            manager1: None,
            manager2: None,
            replicate_set_retry: DEFAULT_REPLICATE_RETRY,
            replicate_delete_retry: DEFAULT_REPLICATE_RETRY,
            replication: DEFAULT_REPLICATION,
            nodes: Vec::new(),
            clock_interval: Duration::from_secs(8),
            rpc_timeout: Duration::from_secs(5),
            workers: 4,
        }
    }

    pub fn with_stream_port(mut self, port: u16) -> Self {
        self.stream_port = port;
        self
    }

    pub fn with_offer_tmpdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.offer_tmpdir = dir.into();
        self
    }

    pub fn with_managers(
        mut self,
        manager1: Option<NodeId>,
        manager2: Option<NodeId>,
    ) -> ServerResult<Self> {
        if let (Some(m1), Some(m2)) = (manager1, manager2) {
            if m1 == m2 {
                return Err(ServerError::ManagersMustDiffer);
            }
        }
        self.manager1 = manager1;
        self.manager2 = manager2;
        Ok(self)
    }

    pub fn with_retry_limits(mut self, set: u32, delete: u32) -> Self {
        self.replicate_set_retry = set;
        self.replicate_delete_retry = delete;
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeId>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_replication(mut self, replication: usize) -> Self {
        self.replication = replication;
        self
    }

    /// The node identity derived from the listen address.
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.listen)
    }

    /// The offer-stream address derived from the listen address.
    pub fn stream_addr(&self) -> NodeId {
        self.node_id().with_port(self.stream_port)
    }
}
