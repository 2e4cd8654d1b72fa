//! Gateway subcommand - runs the memcached text front end.

use anyhow::{Context, Result, bail};
use tracing::info;

use galena_gateway::{Gateway, GatewayConfig};

use super::{ClusterFile, parse_node, parse_nodes};
use crate::GatewayArgs;

const SERVER_DEFAULT_PORT: u16 = galena_server::DEFAULT_PORT;
const MEMTEXT_DEFAULT_PORT: u16 = 11211;

pub fn run(args: &GatewayArgs) -> Result<()> {
    let listen = parse_node(&args.listen, MEMTEXT_DEFAULT_PORT)?;

    let cluster = match &args.config {
        Some(path) => ClusterFile::load(path)?,
        None => ClusterFile::default(),
    };

    let mut servers = parse_nodes(&args.servers, SERVER_DEFAULT_PORT)?;
    servers.extend(parse_nodes(&cluster.nodes, SERVER_DEFAULT_PORT)?);
    servers.sort();
    servers.dedup();
    if servers.is_empty() {
        bail!("no server nodes given; pass --servers or --config");
    }

    let mut config = GatewayConfig::new(listen.addr(), servers);
    if let Some(replication) = cluster.replication {
        config = config.with_replication(replication);
    }

    println!();
    println!("Galena memcached gateway");
    println!();
    println!("  Listen address: {}", config.listen);
    println!("  Server nodes:   {}", config.servers.len());
    println!();
    println!("Gateway is ready. Press Ctrl+C to stop.");
    println!();

    let mut gateway = Gateway::new(config).context("failed to start gateway")?;
    info!("gateway starting");
    gateway.run().context("gateway error during operation")?;

    println!();
    println!("Gateway stopped gracefully.");
    Ok(())
}
