//! Gateway configuration.

use std::net::SocketAddr;
use std::time::Duration;

use galena_hashspace::DEFAULT_REPLICATION;
use galena_types::NodeId;

/// Configuration for the gateway process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Memcached text listen address.
    pub listen: SocketAddr,
    /// Server nodes used to bootstrap the hash space.
    pub servers: Vec<NodeId>,
    /// Replica-list length when walking the ring.
    pub replication: usize,
    /// Cluster RPC call timeout.
    pub rpc_timeout: Duration,
    /// Attempts per client write before giving up.
    pub write_retry: u32,
    /// Worker thread count.
    pub workers: usize,
    /// Interval between hash-space refresh probes.
    pub refresh_interval: Duration,
}

impl GatewayConfig {
    pub fn new(listen: SocketAddr, servers: Vec<NodeId>) -> Self {
        Self {
            listen,
            servers,
            replication: DEFAULT_REPLICATION,
            rpc_timeout: Duration::from_secs(5),
            write_retry: 3,
            workers: 4,
            refresh_interval: Duration::from_secs(8),
        }
    }

    pub fn with_replication(mut self, replication: usize) -> Self {
        self.replication = replication;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}
