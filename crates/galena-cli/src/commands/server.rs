//! Server subcommand - runs one Galena server node.

use anyhow::{Context, Result};
use tracing::info;

use galena_server::{Server, ServerConfig};

use super::{ClusterFile, parse_node, parse_nodes};
use crate::ServerArgs;

/// Default manager RPC port.
const MANAGER_DEFAULT_PORT: u16 = 19700;

/// Default server RPC port, for node lists given without ports.
const SERVER_DEFAULT_PORT: u16 = galena_server::DEFAULT_PORT;

pub fn run(args: &ServerArgs) -> Result<()> {
    let listen = parse_node(&args.listen, SERVER_DEFAULT_PORT)?;

    let cluster = match &args.config {
        Some(path) => ClusterFile::load(path)?,
        None => ClusterFile::default(),
    };

    let mut node_addrs = parse_nodes(&args.nodes, SERVER_DEFAULT_PORT)?;
    node_addrs.extend(parse_nodes(&cluster.nodes, SERVER_DEFAULT_PORT)?);
    node_addrs.sort();
    node_addrs.dedup();

    let manager1 = args
        .manager1
        .as_deref()
        .map(|m| parse_node(m, MANAGER_DEFAULT_PORT))
        .transpose()?;
    let manager2 = args
        .manager2
        .as_deref()
        .map(|m| parse_node(m, MANAGER_DEFAULT_PORT))
        .transpose()?;

    let mut config = ServerConfig::new(listen.addr(), &args.store)
        .with_stream_port(args.stream_listen)
        .with_offer_tmpdir(&args.offer_tmp)
        .with_retry_limits(args.replicate_set_retry, args.replicate_delete_retry)
        .with_nodes(node_addrs)
        .with_managers(manager1, manager2)?;
    if let Some(replication) = cluster.replication {
        config = config.with_replication(replication);
    }

    println!();
    println!("Galena server node");
    println!();
    println!("  Listen address: {}", config.listen);
    println!("  Stream port:    {}", config.stream_port);
    println!("  Store:          {}", config.store_path.display());
    if let Some(m) = config.manager1 {
        println!("  Manager 1:      {m}");
    }
    if let Some(m) = config.manager2 {
        println!("  Manager 2:      {m}");
    }
    println!();
    println!("Node is ready. Press Ctrl+C to stop.");
    println!();

    let mut server = Server::new(config).context("failed to start server node")?;
    info!("server node starting");
    server.run().context("server error during operation")?;

    println!();
    println!("Node stopped gracefully.");
    Ok(())
}
