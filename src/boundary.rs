//! Process-level call boundary for embedding hosts.
//!
//! A host that cannot hold a [`Node`] directly starts one with [`start`],
//! pushes messages with [`send_gossip`], and receives them through the
//! [`GossipReceiver`] it passed in. The running node's handle is the only
//! process-wide state in the crate.

use std::ffi::OsString;
use std::future::Future;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::NetworkConfig;
use crate::error::GossipError;
use crate::node::{GossipHandle, Node};
use crate::protocols::GossipReceiver;

static NODE: Mutex<Option<GossipHandle>> = Mutex::new(None);

/// Install a stderr subscriber honouring `RUST_LOG`; keeps any existing one.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Start a node from command-line style `args` (first element is the program
/// name) and block until Ctrl-C. Exits the process with status 1 if the node
/// cannot start.
pub fn start<I, T, R>(args: I, receiver: R)
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    R: GossipReceiver,
{
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C, stopping");
        }
        info!("received shutdown signal");
    };

    if let Err(e) = start_until(args, receiver, ctrl_c) {
        error!(error = %e, "gossip node failed to start");
        std::process::exit(1);
    }
}

/// Like [`start`], but runs until `shutdown` resolves and reports startup
/// errors instead of exiting. At most one such node runs per process.
pub fn start_until<I, T, R, F>(args: I, receiver: R, shutdown: F) -> Result<(), GossipError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    R: GossipReceiver,
    F: Future<Output = ()>,
{
    init_tracing();
    let config = NetworkConfig::from_args(args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("murmur")
        .build()
        .map_err(|e| GossipError::StartupFailure(format!("failed to build runtime: {e}")))?;

    runtime.block_on(async move {
        let node = Node::start(config, receiver).await?;

        let installed = {
            let mut slot = NODE.lock();
            if slot.is_some() {
                false
            } else {
                *slot = Some(node.handle());
                true
            }
        };
        if !installed {
            node.shutdown().await;
            return Err(GossipError::StartupFailure("a gossip node is already running".into()));
        }

        shutdown.await;

        NODE.lock().take();
        node.shutdown().await;
        Ok(())
    })
}

/// Publish `payload` on `topic` through the running node without blocking.
/// Dropped when no node is running or its command queue is full.
pub fn send_gossip(topic: &str, payload: &[u8]) {
    let handle = NODE.lock().clone();
    match handle {
        Some(handle) => {
            if let Err(e) = handle.send_gossip(topic, payload) {
                debug!(topic = %topic, error = %e, "gossip dropped");
            }
        }
        None => debug!(topic = %topic, "no gossip node running, dropping message"),
    }
}

/// Whether a node started through this boundary is currently running.
pub fn is_running() -> bool {
    NODE.lock().is_some()
}
