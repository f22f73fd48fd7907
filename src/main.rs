//! gossip - command line node
//!
//! Joins a topic, publishes every stdin line and prints every delivered
//! payload to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use gossipmesh::transport::TcpTransport;
use gossipmesh::{GossipConfig, GossipEngine, GossipError, NodeId};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Topic-scoped gossip node
#[derive(Parser, Debug)]
#[command(name = "gossip")]
#[command(version, about, long_about = None)]
struct Args {
    /// Topic shared by every node of the network
    topic: String,

    /// Address to listen on (host:port)
    listen: NodeId,

    /// Bootstrap nodes (host:port)
    bootstrap: Vec<NodeId>,

    /// Maximum neighbors kept
    #[arg(long, env = "GOSSIP_NEIGHBORS", default_value = "256")]
    neighbors: usize,

    /// Peers each received message is relayed to
    #[arg(long, env = "GOSSIP_FANOUT", default_value = "16")]
    fanout: usize,

    /// Peers asked for neighbors per discovery round
    #[arg(long, env = "GOSSIP_DISCOVER_FANOUT", default_value = "8")]
    discover_fanout: usize,

    /// Seconds between discovery rounds
    #[arg(long, env = "GOSSIP_DISCOVER_INTERVAL_SECS", default_value = "5")]
    discover_interval_secs: u64,

    /// Seconds a message hash suppresses duplicates
    #[arg(long, env = "GOSSIP_DEDUP_WINDOW_SECS", default_value = "60")]
    dedup_window_secs: u64,

    /// Delivered payloads buffered before the oldest is dropped
    #[arg(long, env = "GOSSIP_QUEUE_CAPACITY", default_value = "256")]
    queue_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GOSSIP_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries payloads only
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    Ok(())
}

fn build_config(args: &Args) -> GossipConfig {
    GossipConfig::new()
        .with_neighbor_capacity(args.neighbors)
        .with_gossip_fanout(args.fanout)
        .with_discovery_fanout(args.discover_fanout)
        .with_discovery_interval(Duration::from_secs(args.discover_interval_secs))
        .with_dedup_window(Duration::from_secs(args.dedup_window_secs))
        .with_queue_capacity(args.queue_capacity)
}

/// Print delivered payloads until the node stops
async fn print_messages(node: GossipEngine<TcpTransport>) {
    loop {
        match node.get_msg().await {
            Ok(payload) => println!("{}", String::from_utf8_lossy(&payload)),
            Err(GossipError::Stopped) => break,
            Err(e) => warn!(error = %e, "cannot read message"),
        }
    }
}

/// Publish stdin lines until EOF
async fn publish_stdin(node: &GossipEngine<TcpTransport>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if let Err(e) = node.gossip(line) {
            warn!(error = %e, "publish failed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    let config = build_config(&args);
    let node = GossipEngine::new(args.listen.clone(), &args.topic, TcpTransport::default(), config)
        .context("Invalid node configuration")?;

    let bound = node
        .listen()
        .await
        .with_context(|| format!("Cannot listen on {}", args.listen))?;
    info!(node = %bound, topic = %args.topic, "gossip node started");

    let admitted = node.join(&args.bootstrap).await?;
    info!(admitted, bootstrap = args.bootstrap.len(), "bootstrap complete");

    let printer = tokio::spawn(print_messages(node.clone()));

    tokio::select! {
        result = publish_stdin(&node) => {
            if let Err(e) = result {
                warn!(error = %e, "stdin closed");
            }
            info!("end of input, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }

    node.close().await;
    if let Err(e) = printer.await {
        warn!(error = %e, "printer task ended abnormally");
    }

    let stats = node.stats();
    info!(
        published = stats.messages_published,
        delivered = stats.messages_delivered,
        duplicates = stats.duplicates_rejected,
        "node stopped"
    );

    Ok(())
}
