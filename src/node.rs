//! # High-Level Node API
//!
//! A [`Node`] owns everything a running gossip participant needs: the TCP
//! listener, one session task per peer, the propagation engine, and an actor
//! that serialises host commands and drives the heartbeat.
//!
//! ## Quick Start
//!
//! ```ignore
//! let config = NetworkConfig::from_args(["murmur", "--port", "0", "--topics", "blocks"])?;
//! let node = Node::start(config, |topic: &str, payload: &[u8]| {
//!     println!("{topic}: {} bytes", payload.len());
//! })
//! .await?;
//!
//! node.connect("10.0.0.2:9000".parse()?).await?;
//! node.publish("blocks", b"hello".to_vec()).await?;
//! node.shutdown().await;
//! ```
//!
//! ## Tasks
//!
//! | Task | Count | Stops on |
//! |------|-------|----------|
//! | accept loop | 1 | shutdown signal |
//! | actor (commands + heartbeat) | 1 | `Quit`, shutdown signal |
//! | session | 1 per peer | peer error, disconnect, shutdown signal |
//!
//! Session tasks live in a [`JoinSet`] so shutdown can wait for them with a
//! bound and abort whatever is left.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::engine::{EngineSnapshot, GossipEngine};
use crate::error::GossipError;
use crate::identity::{Keypair, PeerId};
use crate::messages::MessageId;
use crate::protocols::GossipReceiver;
use crate::session::{PeerSessionState, Session, SessionEngine, SessionEvent, SessionTable};

/// Host commands buffered ahead of the actor.
const COMMAND_QUEUE_SIZE: usize = 1024;

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    /// Reply is absent for fire-and-forget sends.
    Publish(String, Vec<u8>, Option<oneshot::Sender<Result<MessageId, GossipError>>>),
    Subscribe(String, oneshot::Sender<Result<(), GossipError>>),
    Unsubscribe(String, oneshot::Sender<Result<(), GossipError>>),
    Quit,
}

/// Cheap-to-clone handle for submitting work to a running node.
#[derive(Clone)]
pub struct GossipHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl GossipHandle {
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId, GossipError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(topic.to_string(), data, Some(tx)))
            .await
            .map_err(|_| GossipError::Closed)?;
        rx.await.map_err(|_| GossipError::Closed)?
    }

    /// Queue a publish without waiting. Never blocks the caller; a full
    /// command queue drops the message and reports it.
    pub fn send_gossip(&self, topic: &str, payload: &[u8]) -> Result<(), GossipError> {
        self.cmd_tx
            .try_send(Command::Publish(topic.to_string(), payload.to_vec(), None))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    GossipError::TransportFailure("command queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => GossipError::Closed,
            })
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), GossipError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(topic.to_string(), tx))
            .await
            .map_err(|_| GossipError::Closed)?;
        rx.await.map_err(|_| GossipError::Closed)?
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), GossipError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe(topic.to_string(), tx))
            .await
            .map_err(|_| GossipError::Closed)?;
        rx.await.map_err(|_| GossipError::Closed)?
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

struct NodeActor {
    engine: Arc<SessionEngine>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl NodeActor {
    async fn run(self, mut cmd_rx: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        let mut heartbeat = tokio::time::interval(self.engine.config().heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Publish(topic, data, reply)) => {
                            let result = self.engine.publish(&topic, data);
                            match reply {
                                Some(reply) => {
                                    let _ = reply.send(result);
                                }
                                None => {
                                    if let Err(e) = result {
                                        warn!(topic = %topic, error = %e, "dropping gossip");
                                    }
                                }
                            }
                        }
                        Some(Command::Subscribe(topic, reply)) => {
                            let _ = reply.send(self.engine.subscribe(&topic));
                        }
                        Some(Command::Unsubscribe(topic, reply)) => {
                            let _ = reply.send(self.engine.unsubscribe(&topic));
                        }
                        Some(Command::Quit) => {
                            debug!("node actor quitting");
                            break;
                        }
                        None => {
                            debug!("node handles dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.engine.heartbeat();
                    self.reap_sessions();
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    fn reap_sessions(&self) {
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!(error = %e, "session task panicked");
                }
            }
        }
    }
}

// ============================================================================
// Node
// ============================================================================

pub struct Node {
    engine: Arc<SessionEngine>,
    sessions: Arc<SessionTable>,
    handle: GossipHandle,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    accept: JoinHandle<()>,
    actor: JoinHandle<()>,
}

impl Node {
    /// Bind, join the configured topics, and start dialling bootstrap peers.
    ///
    /// Only configuration and binding errors fail startup; unreachable
    /// bootstrap peers are logged and skipped.
    pub async fn start<R: GossipReceiver>(config: NetworkConfig, receiver: R) -> Result<Self, GossipError> {
        Self::start_with_keypair(config, Keypair::generate(), receiver).await
    }

    pub async fn start_with_keypair<R: GossipReceiver>(
        config: NetworkConfig,
        keypair: Keypair,
        receiver: R,
    ) -> Result<Self, GossipError> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| GossipError::StartupFailure(format!("failed to bind {}: {}", config.listen_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GossipError::StartupFailure(e.to_string()))?;

        let sessions = Arc::new(SessionTable::new());
        let engine = Arc::new(GossipEngine::new(
            keypair,
            config.gossip.clone(),
            sessions.clone(),
            Arc::new(receiver),
        ));
        for topic in &config.topics {
            engine.subscribe(topic)?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = Arc::new(Mutex::new(JoinSet::new()));

        let accept = tokio::spawn(accept_loop(
            listener,
            engine.clone(),
            sessions.clone(),
            tasks.clone(),
            shutdown_rx.clone(),
        ));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let actor = NodeActor {
            engine: engine.clone(),
            tasks: tasks.clone(),
        };
        let actor = tokio::spawn(actor.run(cmd_rx, shutdown_rx.clone()));

        info!(
            peer_id = %engine.local_id(),
            addr = %local_addr,
            topics = ?config.topics,
            "node started"
        );

        let node = Self {
            engine,
            sessions,
            handle: GossipHandle { cmd_tx },
            local_addr,
            shutdown_tx,
            tasks,
            accept,
            actor,
        };

        for addr in config.boot_nodes {
            let engine = node.engine.clone();
            let sessions = node.sessions.clone();
            let shutdown = node.shutdown_tx.subscribe();
            node.tasks.lock().spawn(async move {
                match dial(addr, engine, sessions, shutdown).await {
                    Ok(session) => {
                        info!(addr = %addr, peer = %session.peer_id(), "connected to bootstrap peer");
                        session.run().await;
                    }
                    Err(e) => warn!(addr = %addr, error = %e, "bootstrap peer unreachable"),
                }
            });
        }

        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.engine.local_id()
    }

    /// The bound address; useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> GossipHandle {
        self.handle.clone()
    }

    /// Dial `addr` and run a session with whoever answers.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId, GossipError> {
        let session = dial(addr, self.engine.clone(), self.sessions.clone(), self.shutdown_tx.subscribe()).await?;
        let peer = session.peer_id();
        self.tasks.lock().spawn(session.run());
        debug!(addr = %addr, peer = %peer, "connected");
        Ok(peer)
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId, GossipError> {
        self.handle.publish(topic, data).await
    }

    pub fn send_gossip(&self, topic: &str, payload: &[u8]) -> Result<(), GossipError> {
        self.handle.send_gossip(topic, payload)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), GossipError> {
        self.handle.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), GossipError> {
        self.handle.unsubscribe(topic).await
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.engine.subscriptions()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.engine.connected_peers()
    }

    /// Lifecycle state of the session with `peer`; `None` once Closed.
    pub fn peer_state(&self, peer: &PeerId) -> Option<PeerSessionState> {
        self.sessions.state(peer)
    }

    /// Session lifecycle transitions from now on.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe_events()
    }

    pub fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.engine.mesh_for(topic).into_iter().collect()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.engine.snapshot()
    }

    /// Stop accepting, close every session, and wait for tasks with a bound.
    pub async fn shutdown(self) {
        info!(peer_id = %self.engine.local_id(), "shutting down");
        self.handle.quit().await;
        let _ = self.shutdown_tx.send(true);

        let _ = self.accept.await;
        let _ = self.actor.await;

        // The accept loop has stopped, so nothing spawns into the set anymore.
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(self.engine.config().shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "sessions did not stop in time, aborting");
            tasks.shutdown().await;
        }
        debug!("shutdown complete");
    }
}

async fn dial(
    addr: SocketAddr,
    engine: Arc<SessionEngine>,
    sessions: Arc<SessionTable>,
    shutdown: watch::Receiver<bool>,
) -> Result<Session<TcpStream>, GossipError> {
    let stream = tokio::time::timeout(engine.config().handshake_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| GossipError::TransportFailure(format!("connect to {addr} timed out")))??;
    stream.set_nodelay(true)?;
    Session::establish(stream, engine, sessions, shutdown).await
}

async fn accept_loop(
    listener: TcpListener,
    engine: Arc<SessionEngine>,
    sessions: Arc<SessionTable>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let engine = engine.clone();
                let sessions = sessions.clone();
                let shutdown = shutdown.clone();
                tasks.lock().spawn(async move {
                    match Session::establish(stream, engine, sessions, shutdown).await {
                        Ok(session) => {
                            debug!(addr = %addr, peer = %session.peer_id(), "inbound session");
                            session.run().await;
                        }
                        Err(e) => debug!(addr = %addr, error = %e, "inbound handshake failed"),
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GossipConfig;
    use std::time::Duration;

    fn local_config(topics: &[&str]) -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            boot_nodes: Vec::new(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            gossip: GossipConfig {
                heartbeat_interval: Duration::from_millis(50),
                ..GossipConfig::default()
            },
        }
    }

    fn ignore(_: &str, _: &[u8]) {}

    #[tokio::test]
    async fn starts_on_ephemeral_port_with_configured_topics() {
        let node = Node::start(local_config(&["alpha", "beta"]), ignore).await.unwrap();
        assert_ne!(node.local_addr().port(), 0);
        let mut subs = node.subscriptions();
        subs.sort();
        assert_eq!(subs, vec!["alpha".to_string(), "beta".to_string()]);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_startup_failure() {
        let first = Node::start(local_config(&["alpha"]), ignore).await.unwrap();
        let mut config = local_config(&["alpha"]);
        config.listen_addr = first.local_addr();

        let err = Node::start(config, ignore).await.err().unwrap();
        assert!(matches!(err, GossipError::StartupFailure(_)));
        first.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_boot_node_does_not_fail_startup() {
        let mut config = local_config(&["alpha"]);
        // Reserved port on loopback; nothing listens there.
        config.boot_nodes = vec!["127.0.0.1:1".parse().unwrap()];
        let node = Node::start(config, ignore).await.unwrap();
        assert!(node.connected_peers().is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn runtime_subscription_changes() {
        let node = Node::start(local_config(&["alpha"]), ignore).await.unwrap();
        node.subscribe("gamma").await.unwrap();
        assert!(node.subscriptions().contains(&"gamma".to_string()));
        node.unsubscribe("alpha").await.unwrap();
        assert_eq!(node.subscriptions(), vec!["gamma".to_string()]);

        assert!(matches!(node.subscribe("").await, Err(GossipError::ValidationFailed(_))));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn handle_reports_closed_after_shutdown() {
        let node = Node::start(local_config(&["alpha"]), ignore).await.unwrap();
        let handle = node.handle();
        node.shutdown().await;

        assert!(matches!(handle.publish("alpha", vec![1]).await, Err(GossipError::Closed)));
        assert!(matches!(handle.send_gossip("alpha", b"x"), Err(GossipError::Closed)));
    }

    #[tokio::test]
    async fn connect_reports_remote_identity() {
        let a = Node::start(local_config(&["alpha"]), ignore).await.unwrap();
        let b = Node::start(local_config(&["alpha"]), ignore).await.unwrap();

        let peer = a.connect(b.local_addr()).await.unwrap();
        assert_eq!(peer, b.peer_id());
        assert!(a.connected_peers().contains(&b.peer_id()));
        assert_eq!(a.peer_state(&peer), Some(PeerSessionState::Active));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn remote_shutdown_walks_session_to_closed() {
        let a = Node::start(local_config(&["alpha"]), ignore).await.unwrap();
        let b = Node::start(local_config(&["alpha"]), ignore).await.unwrap();
        let mut events = a.session_events();

        let peer = a.connect(b.local_addr()).await.unwrap();
        b.shutdown().await;

        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Ok(event) = events.recv().await {
                assert_eq!(event.peer, peer);
                seen.push(event.state);
                if event.state == PeerSessionState::Closed {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(
            seen,
            vec![
                PeerSessionState::Connecting,
                PeerSessionState::Active,
                PeerSessionState::Draining,
                PeerSessionState::Closed,
            ]
        );
        assert_eq!(a.peer_state(&peer), None);
        assert!(a.connected_peers().is_empty());
        a.shutdown().await;
    }
}
