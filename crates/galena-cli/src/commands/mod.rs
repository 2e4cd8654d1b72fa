//! CLI subcommands.

pub mod gateway;
pub mod server;

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use galena_types::NodeId;

/// Shared TOML config for cluster membership.
#[derive(Debug, Default, Deserialize)]
pub struct ClusterFile {
    /// Replica-list length (coordinator included).
    pub replication: Option<usize>,
    /// Cluster node addresses.
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl ClusterFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("cannot parse config file {}", path.display()))
    }
}

/// Parses an address string into a node identity.
///
/// Accepts:
/// - Full address: "10.0.0.1:19800"
/// - Host only: "10.0.0.1" (gets `default_port`)
/// - Port only: "19800" (binds 0.0.0.0)
pub fn parse_node(address: &str, default_port: u16) -> Result<NodeId> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(NodeId::new(addr));
    }
    if let Ok(port) = address.parse::<u16>() {
        return Ok(NodeId::new(SocketAddr::from(([0, 0, 0, 0], port))));
    }
    if let Ok(addr) = format!("{address}:{default_port}").parse::<SocketAddr>() {
        return Ok(NodeId::new(addr));
    }
    bail!("invalid address '{address}'; use host, host:port, or port");
}

/// Parses a list of node addresses.
pub fn parse_nodes(addresses: &[String], default_port: u16) -> Result<Vec<NodeId>> {
    addresses
        .iter()
        .map(|a| parse_node(a, default_port))
        .collect()
}
