//! Galena unified CLI.
//!
//! A distributed, replicated key-value store with a memcached-
//! compatible gateway.
//!
//! # Quick Start
//!
//! ```bash
//! # Start a server node
//! galena server -l 127.0.0.1:19800 -s ./data/node0.gln
//!
//! # Start a gateway in front of it (new terminal)
//! galena gateway -t 127.0.0.1:11211 -s 127.0.0.1:19800
//!
//! # Talk memcached to it
//! printf 'set foo 0 0 5\r\nhello\r\nget foo\r\n' | nc 127.0.0.1 11211
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

/// Galena - distributed replicated key-value store.
#[derive(Parser)]
#[command(name = "galena")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Raise log verbosity to debug.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    logfile: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server node.
    Server(ServerArgs),

    /// Run a memcached text gateway.
    Gateway(GatewayArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Cluster RPC listen address (addr[:port] or port).
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:19800")]
    listen: String,

    /// Listen port for the rebalance offer stream.
    #[arg(short = 'L', long = "stream-listen", default_value_t = galena_server::DEFAULT_STREAM_PORT)]
    stream_listen: u16,

    /// Temporary directory for rebalance offer spill files.
    #[arg(short = 'f', long = "offer-tmp", default_value = "/tmp")]
    offer_tmp: PathBuf,

    /// Path to the op log.
    #[arg(short = 's', long = "store")]
    store: PathBuf,

    /// Address of manager 1 (addr[:port], default port 19700).
    #[arg(short = 'm', long = "manager1")]
    manager1: Option<String>,

    /// Address of manager 2; must differ from manager 1.
    #[arg(short = 'p', long = "manager2")]
    manager2: Option<String>,

    /// Replicate-set retry limit.
    #[arg(short = 'S', long = "replicate-set-retry", default_value_t = galena_server::DEFAULT_REPLICATE_RETRY)]
    replicate_set_retry: u32,

    /// Replicate-delete retry limit.
    #[arg(short = 'G', long = "replicate-delete-retry", default_value_t = galena_server::DEFAULT_REPLICATE_RETRY)]
    replicate_delete_retry: u32,

    /// Initial cluster membership, comma separated (self is implied).
    #[arg(short = 'n', long = "nodes", value_delimiter = ',')]
    nodes: Vec<String>,

    /// TOML file with cluster membership and replication factor.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct GatewayArgs {
    /// Memcached text listen address (addr[:port] or port).
    #[arg(short = 't', long = "memtext", default_value = "0.0.0.0:11211")]
    listen: String,

    /// Server node addresses, comma separated.
    #[arg(short = 's', long = "servers", value_delimiter = ',')]
    servers: Vec<String>,

    /// TOML file with cluster membership and replication factor.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.logfile.as_deref())?;

    match cli.command {
        Commands::Server(args) => commands::server::run(&args),
        Commands::Gateway(args) => commands::gateway::run(&args),
    }
}

fn init_logging(verbose: bool, logfile: Option<&std::path::Path>) -> Result<()> {
    use anyhow::Context;

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(move || file.try_clone().expect("log file clone"))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
