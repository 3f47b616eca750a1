use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use mojito::{DhtConfig, Mojito, NodeId};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    node_id: Option<NodeId>,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = match s.rsplit_once('/') {
            Some((addr, id)) => (addr, Some(id)),
            None => (s, None),
        };

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let node_id = id_part
            .map(|id| NodeId::from_hex(id).context("node id must be 40 hex characters"))
            .transpose()?;

        Ok(BootstrapPeer { addr, node_id })
    }
}

#[derive(Parser, Debug)]
#[command(name = "mojito")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Seed node, `IP:PORT` or `IP:PORT/HEXID`.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    #[arg(long, default_value_t = 20)]
    k: usize,

    #[arg(long, default_value_t = 3)]
    alpha: usize,

    #[arg(long, default_value_t = 5000)]
    request_timeout_ms: u64,

    #[arg(long, default_value_t = 1)]
    max_retries: u32,

    /// Seconds between stats log lines.
    #[arg(short, long, default_value_t = 300)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = DhtConfig {
        k: args.k,
        alpha: args.alpha,
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        max_retries: args.max_retries,
        ..DhtConfig::default()
    };

    let node = Mojito::bind(args.bind, config)
        .await
        .context("failed to start node")?;
    let contact = node.local_contact();
    info!("Node {}/{}", contact.addr, contact.node_id);

    if !args.bootstrap.is_empty() {
        let seeds: Vec<SocketAddr> = args.bootstrap.iter().map(|p| p.addr).collect();
        match node.bootstrap(&seeds).await {
            Ok(report) => {
                for peer in &args.bootstrap {
                    let Some(expected) = peer.node_id else {
                        continue;
                    };
                    if !report.seeds.iter().any(|c| c.node_id == expected) {
                        warn!(addr = %peer.addr, "seed answered with a different node id");
                    }
                }
                info!(
                    seeds = report.seeds.len(),
                    closest = report.closest,
                    refreshed = report.refreshed,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Bootstrap complete"
                );
            }
            Err(e) => {
                warn!(error = %e, "Bootstrap failed");
            }
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.stats_interval.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let stats = node.stats().await;
                info!(
                    state = ?stats.state,
                    live = stats.table.live_contacts,
                    cached = stats.table.cached_contacts,
                    records = stats.table.stored_records,
                    estimated_size = stats.table.estimated_size,
                    rpc_sent = stats.rpc.sent,
                    rpc_timeouts = stats.rpc.timeouts,
                    "stats snapshot"
                );
            }
        }
    }

    node.close().await;
    Ok(())
}
