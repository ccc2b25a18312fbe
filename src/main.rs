use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use seedmesh::{Address, LocalNode, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "seedmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:5050")]
    bind: SocketAddr,

    /// Host advertised to other nodes.
    #[arg(short, long, default_value = "")]
    public_address: String,

    #[arg(short, long, default_value = "")]
    name: String,

    #[arg(long, default_value = "")]
    description: String,

    /// Directory holding the identity key, entry and DHT table.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Known node endpoint (HOST:PORT).
    #[arg(short = 'B', long = "bootstrap", value_name = "ENDPOINT")]
    bootstrap: Vec<String>,

    /// Address whose seed list is kept current.
    #[arg(short, long, value_name = "ADDRESS", value_parser = Address::from_str)]
    track: Vec<Address>,

    /// Address whose collection is mirrored after bootstrap.
    #[arg(short, long, value_name = "ADDRESS", value_parser = Address::from_str)]
    mirror: Vec<Address>,

    #[arg(long)]
    no_explore: bool,

    #[arg(long, default_value = "300")]
    seed_interval: u64,

    #[arg(long, default_value = "30")]
    explore_interval: u64,

    #[arg(long, default_value = "300")]
    status_interval: u64,
}

impl Args {
    fn config(&self) -> NodeConfig {
        NodeConfig {
            bind_addr: self.bind,
            public_address: self.public_address.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            data_dir: self.data_dir.clone(),
            seed_search_interval: Duration::from_secs(self.seed_interval),
            explore_interval: Duration::from_secs(self.explore_interval),
            ..NodeConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node = LocalNode::bind(args.config())
        .await
        .context("failed to start node")?;
    info!("Node address: {}", node.address());
    info!("Node endpoint: {}", node.entry().endpoint());

    for endpoint in &args.bootstrap {
        info!("Bootstrapping from {}", endpoint);
        match node.bootstrap(endpoint).await {
            Ok(inserted) => info!(inserted, "Bootstrap complete"),
            Err(e) => warn!(error = %e, endpoint = %endpoint, "Bootstrap failed"),
        }
    }

    if !args.no_explore {
        node.start_exploring();
    }

    let mut managers = Vec::new();
    for address in &args.track {
        match node.track(*address).await {
            Ok(manager) => managers.push(manager),
            Err(e) => warn!(error = %e, track = %address, "Cannot track address"),
        }
    }

    for address in &args.mirror {
        match node.mirror(*address, None).await {
            Ok(report) => info!(owner = %address, pieces = report.pieces, posts = report.posts, "Mirror complete"),
            Err(e) => warn!(error = %e, owner = %address, "Mirror failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                info!(
                    peers = node.peers().len(),
                    dht_records = node.dht().len().await,
                    posts = node.entry().post_count,
                    seeds = node.entry().seeds.len(),
                    mirrored = node.collections().len(),
                    "status"
                );
            }
        }
    }

    for manager in &managers {
        manager.stop();
    }
    node.shutdown().await;
    Ok(())
}
