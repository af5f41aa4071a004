use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use murmur::{NetworkArgs, NetworkConfig, Node};

/// Interval between telemetry log lines.
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = NetworkArgs::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NetworkConfig::try_from(args).context("invalid configuration")?;
    let publish_topic = config
        .topics
        .first()
        .cloned()
        .context("at least one topic is required")?;

    let node = Node::start(config, |topic: &str, payload: &[u8]| {
        println!("[{}] {}", topic, String::from_utf8_lossy(payload));
    })
    .await
    .context("failed to start node")?;
    info!(peer_id = %node.peer_id().to_hex(), addr = %node.local_addr(), "node identity");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interval = time::interval(TELEMETRY_INTERVAL);

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        if let Err(e) = node.publish(&publish_topic, line.into_bytes()).await {
                            warn!(topic = %publish_topic, error = %e, "publish failed");
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!(error = %e, "stdin closed");
                        stdin_open = false;
                    }
                }
            }
            _ = interval.tick() => {
                let snapshot = node.snapshot();
                info!(
                    peers = snapshot.peers,
                    mesh = ?snapshot.mesh_sizes,
                    cache_entries = snapshot.cache_entries,
                    history_entries = snapshot.history_entries,
                    scored_peers = snapshot.scored_peers,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
