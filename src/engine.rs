//! # Propagation Engine
//!
//! The broadcast core. Every session task, the heartbeat, and host publishes
//! call into one shared [`GossipEngine`]; the engine owns the registry, mesh,
//! caches and scores behind their own locks.
//!
//! ## Message Lifecycle
//!
//! ```text
//! Received ─validate─> Validated ─record─┬─> Duplicate  (dropped silently)
//!                                        └─> Novel      (deliver once, forward to mesh \ {sender, source})
//! ```
//!
//! Publishing records the id first and never delivers to the local host.
//! Control frames skip the cache entirely and only touch registry and mesh.
//!
//! ## Locking
//!
//! Locks are acquired in one global order and never held across the host
//! callback or a [`FrameSink`] call:
//!
//! `publish → registry → mesh → scores → cache → history`
//!
//! Registry and mesh are written together whenever a change to one can break
//! the mesh-subset-of-subscribers invariant.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use tracing::{debug, trace, warn};

use crate::cache::{MessageCache, MessageHistory};
use crate::config::GossipConfig;
use crate::error::{GossipError, MessageRejection};
use crate::identity::{Keypair, PeerId, now_ms};
use crate::mesh::{MeshManager, Rebalance};
use crate::messages::{Frame, GossipMessage, MAX_TOPIC_LENGTH, MessageId, is_valid_topic};
use crate::protocols::{FrameSink, GossipReceiver};
use crate::registry::PeerRegistry;
use crate::score::{ScoreBook, SlidingWindow};

/// Penalty for a session closed over too many undecodable frames. Large
/// enough that a peer reconnecting straight away is graylisted.
pub const MALFORMED_FLOOD_PENALTY: f64 = 4.0;

/// Penalty for frames that break protocol rules (late Hello, graft during backoff).
pub const PROTOCOL_VIOLATION_PENALTY: f64 = 1.0;

/// Upper bound on a backoff a peer may ask us to honour.
pub const MAX_PRUNE_BACKOFF: Duration = Duration::from_secs(600);

/// What happened to an inbound data frame that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { forwarded: usize },
    Duplicate,
    /// Valid, but for a topic this node does not subscribe to.
    Ignored,
}

/// Point-in-time counters for telemetry.
#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub peers: usize,
    pub subscriptions: Vec<String>,
    pub mesh_sizes: Vec<(String, usize)>,
    pub cache_entries: usize,
    pub history_entries: usize,
    pub scored_peers: usize,
}

struct PublishState {
    seqno: u64,
    rate: SlidingWindow,
}

pub struct GossipEngine<S: FrameSink> {
    keypair: Keypair,
    local_id: PeerId,
    config: GossipConfig,
    sink: Arc<S>,
    receiver: Arc<dyn GossipReceiver>,
    publish: Mutex<PublishState>,
    subscriptions: RwLock<HashSet<String>>,
    registry: RwLock<PeerRegistry>,
    mesh: RwLock<MeshManager>,
    scores: Mutex<ScoreBook>,
    cache: RwLock<MessageCache>,
    history: Mutex<MessageHistory>,
}

impl<S: FrameSink> GossipEngine<S> {
    pub fn new(keypair: Keypair, config: GossipConfig, sink: Arc<S>, receiver: Arc<dyn GossipReceiver>) -> Self {
        // Seed from the clock so a restarted node never reuses ids still
        // sitting in its peers' caches.
        let seqno = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        Self {
            local_id: keypair.peer_id(),
            keypair,
            sink,
            receiver,
            publish: Mutex::new(PublishState {
                seqno,
                rate: SlidingWindow::new(Duration::from_secs(1)),
            }),
            subscriptions: RwLock::new(HashSet::new()),
            registry: RwLock::new(PeerRegistry::new()),
            mesh: RwLock::new(MeshManager::new(config.mesh_n, config.mesh_n_low, config.mesh_n_high)),
            scores: Mutex::new(ScoreBook::new(config.score.clone())),
            cache: RwLock::new(MessageCache::new(config.cache_capacity)),
            history: Mutex::new(MessageHistory::new(config.history_capacity, config.history_window)),
            config,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    // ========================================================================
    // Local subscriptions
    // ========================================================================

    /// Join `topic`: build a mesh for it and announce the subscription.
    pub fn subscribe(&self, topic: &str) -> Result<(), GossipError> {
        check_topic(topic)?;
        if !self.subscriptions.write().insert(topic.to_string()) {
            return Ok(());
        }
        self.mesh.write().join(topic);

        let peers = self.registry.read().peer_ids();
        self.send_to_all(peers, Frame::Subscribe { topic: topic.to_string() });
        let outcome = self.rebalance_topic(topic, Instant::now());
        debug!(topic = %topic, mesh_size = outcome.grafted.len(), "subscribed");
        Ok(())
    }

    /// Leave `topic`: prune its mesh and announce the unsubscription.
    pub fn unsubscribe(&self, topic: &str) -> Result<(), GossipError> {
        if !self.subscriptions.write().remove(topic) {
            return Ok(());
        }
        let members = self.mesh.write().leave(topic);
        let backoff_secs = self.config.prune_backoff.as_secs();
        self.send_to_all(members, Frame::Prune { topic: topic.to_string(), backoff_secs });

        let peers = self.registry.read().peer_ids();
        self.send_to_all(peers, Frame::Unsubscribe { topic: topic.to_string() });
        debug!(topic = %topic, "unsubscribed");
        Ok(())
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.read().contains(topic)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().iter().cloned().collect()
    }

    // ========================================================================
    // Peer lifecycle
    // ========================================================================

    /// Register a peer whose session just became Active and tell it what we want.
    pub fn add_peer(&self, peer: PeerId) -> bool {
        let added = self.registry.write().add_peer(peer);
        for topic in self.subscriptions() {
            let _ = self.sink.send_frame(&peer, Frame::Subscribe { topic });
        }
        added
    }

    /// Forget a peer everywhere and refill any mesh it leaves short.
    /// Unknown peers are a no-op; returns whether the peer was known.
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let (known, mesh_topics) = {
            let mut registry = self.registry.write();
            let known = registry.contains(peer);
            registry.remove_peer(peer);
            let mut mesh = self.mesh.write();
            (known, mesh.remove_peer(peer))
        };

        let now = Instant::now();
        for topic in &mesh_topics {
            self.rebalance_topic(topic, now);
        }
        if known {
            debug!(peer = %peer, mesh_topics = mesh_topics.len(), "peer removed");
        }
        known
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.registry.read().peer_ids()
    }

    pub fn peers_for(&self, topic: &str) -> HashSet<PeerId> {
        self.registry.read().peers_for(topic)
    }

    pub fn mesh_for(&self, topic: &str) -> HashSet<PeerId> {
        self.mesh.read().mesh_for(topic)
    }

    // ========================================================================
    // Publish path
    // ========================================================================

    /// Sign and send a new message. The local host is never handed its own message.
    pub fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId, GossipError> {
        check_topic(topic)?;
        if data.len() > self.config.max_message_size {
            return Err(MessageRejection::MessageTooLarge.into());
        }

        // Held for the whole publish so per-origin seqnos hit the wire in order.
        let mut state = self.publish.lock();
        let now = Instant::now();
        if !state.rate.try_record(now, self.config.publish_rate_limit) {
            return Err(MessageRejection::RateLimited.into());
        }
        state.seqno = state.seqno.wrapping_add(1);
        let message = GossipMessage::new_signed(&self.keypair, state.seqno, topic, data, now_ms());
        let id = message.id();

        self.cache.write().record(id, now);
        self.history.lock().put(id, message.clone(), now);

        let targets = self.publish_targets(topic);
        let seqno = message.seqno;
        let sent = self.send_to_all(targets, Frame::Data(message));
        drop(state);

        debug!(
            topic = %topic,
            seqno = seqno,
            msg_id = %hex::encode(&id[..8]),
            peers = sent,
            "published message"
        );
        Ok(id)
    }

    /// Mesh peers for joined topics; a random fanout of subscribers otherwise.
    fn publish_targets(&self, topic: &str) -> Vec<PeerId> {
        let registry = self.registry.read();
        let mesh = self.mesh.read();
        let members = mesh.mesh_for(topic);
        if !members.is_empty() {
            return members.into_iter().collect();
        }
        let scores = self.scores.lock();
        registry
            .peers_for(topic)
            .into_iter()
            .filter(|p| !scores.is_graylisted(p))
            .choose_multiple(&mut rand::thread_rng(), self.config.mesh_n)
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Dispatch one decoded frame from `from`.
    pub fn handle_frame(&self, from: &PeerId, frame: Frame) -> Result<(), GossipError> {
        match frame {
            Frame::Data(message) => self.handle_message(from, message).map(|_| ()),
            Frame::Subscribe { topic } => self.handle_subscribe(from, &topic),
            Frame::Unsubscribe { topic } => {
                self.handle_unsubscribe(from, &topic);
                Ok(())
            }
            Frame::Graft { topic } => self.handle_graft(from, &topic),
            Frame::Prune { topic, backoff_secs } => {
                self.handle_prune(from, &topic, backoff_secs);
                Ok(())
            }
            Frame::IHave { topic, ids } => {
                self.handle_ihave(from, &topic, ids);
                Ok(())
            }
            Frame::IWant { ids } => {
                self.handle_iwant(from, ids);
                Ok(())
            }
            Frame::Hello(_) => {
                self.penalize(from, PROTOCOL_VIOLATION_PENALTY);
                Err(GossipError::MalformedFrame("unexpected hello after handshake".into()))
            }
            // Keepalive is answered by the session itself.
            Frame::Ping(_) | Frame::Pong(_) => Ok(()),
        }
    }

    pub fn handle_message(&self, from: &PeerId, message: GossipMessage) -> Result<Delivery, GossipError> {
        if self.is_graylisted(from) {
            trace!(peer = %from, "ignoring message from graylisted peer");
            return Err(MessageRejection::Graylisted.into());
        }

        if let Err(rejection) = self.validate(&message) {
            self.scores.lock().invalid_message(from);
            debug!(
                peer = %from,
                topic = %message.topic,
                reason = %rejection,
                "rejecting invalid message"
            );
            return Err(rejection.into());
        }

        if message.source == self.local_id {
            trace!(peer = %from, "own message echoed back");
            return Ok(Delivery::Duplicate);
        }
        if !self.is_subscribed(&message.topic) {
            trace!(peer = %from, topic = %message.topic, "message for unsubscribed topic");
            return Ok(Delivery::Ignored);
        }

        let id = message.id();
        let now = Instant::now();
        if !self.cache.write().record(id, now) {
            trace!(peer = %from, msg_id = %hex::encode(&id[..8]), "duplicate message");
            return Ok(Delivery::Duplicate);
        }

        self.scores.lock().first_delivery(from);
        self.history.lock().put(id, message.clone(), now);

        self.receiver.receive_gossip(&message.topic, &message.data);

        let source = message.source;
        let targets: Vec<PeerId> = self
            .mesh
            .read()
            .mesh_for(&message.topic)
            .into_iter()
            .filter(|p| p != from && *p != source)
            .collect();
        let topic = message.topic.clone();
        let forwarded = self.send_to_all(targets, Frame::Data(message));

        trace!(
            peer = %from,
            source = %source,
            topic = %topic,
            msg_id = %hex::encode(&id[..8]),
            forwarded = forwarded,
            "delivered novel message"
        );
        Ok(Delivery::Delivered { forwarded })
    }

    fn validate(&self, message: &GossipMessage) -> Result<(), MessageRejection> {
        check_topic(&message.topic)?;
        if message.data.len() > self.config.max_message_size {
            return Err(MessageRejection::MessageTooLarge);
        }

        let now = now_ms();
        let max_age = self.config.max_message_age.as_millis() as u64;
        let max_skew = self.config.max_clock_skew.as_millis() as u64;
        if message.timestamp_ms.saturating_add(max_age) < now {
            return Err(MessageRejection::Expired);
        }
        if message.timestamp_ms > now.saturating_add(max_skew) {
            return Err(MessageRejection::FromFuture);
        }

        message.verify_signature().map_err(MessageRejection::InvalidSignature)
    }

    fn handle_subscribe(&self, from: &PeerId, topic: &str) -> Result<(), GossipError> {
        if let Err(rejection) = check_topic(topic) {
            self.penalize(from, PROTOCOL_VIOLATION_PENALTY);
            return Err(rejection.into());
        }
        let added = self.registry.write().subscribe(from, topic)?;
        trace!(peer = %from, topic = %topic, "peer subscribed");

        if added && self.mesh.read().needs_peers(topic) {
            self.rebalance_topic(topic, Instant::now());
        }
        Ok(())
    }

    fn handle_unsubscribe(&self, from: &PeerId, topic: &str) {
        let was_meshed = {
            let mut registry = self.registry.write();
            registry.unsubscribe(from, topic);
            let mut mesh = self.mesh.write();
            mesh.remove(topic, from)
        };
        trace!(peer = %from, topic = %topic, "peer unsubscribed");

        if was_meshed {
            self.rebalance_topic(topic, Instant::now());
        }
    }

    fn handle_graft(&self, from: &PeerId, topic: &str) -> Result<(), GossipError> {
        #[derive(Clone, Copy)]
        enum Verdict {
            Accepted,
            Refused,
            Violation,
        }

        let now = Instant::now();
        let verdict = if !self.is_subscribed(topic) || self.is_graylisted(from) {
            Verdict::Refused
        } else {
            let mut registry = self.registry.write();
            if !registry.contains(from) {
                return Err(GossipError::UnknownPeer(*from));
            }
            // A graft implies interest in the topic.
            let subscribed = registry.subscribe(from, topic).is_ok();
            let mut mesh = self.mesh.write();
            if !subscribed {
                Verdict::Refused
            } else if mesh.contains(topic, from) {
                Verdict::Accepted
            } else if mesh.in_backoff(from, topic, now) {
                Verdict::Violation
            } else if mesh.add(topic, *from) {
                Verdict::Accepted
            } else {
                Verdict::Refused
            }
        };

        match verdict {
            Verdict::Accepted => trace!(peer = %from, topic = %topic, "graft accepted"),
            Verdict::Refused | Verdict::Violation => {
                if matches!(verdict, Verdict::Violation) {
                    debug!(peer = %from, topic = %topic, "graft during backoff");
                    self.penalize(from, PROTOCOL_VIOLATION_PENALTY);
                }
                // The peer now backs off from us; mirror it so we do not graft them first.
                self.mesh.write().record_backoff(from, topic, self.config.prune_backoff, now);
                let backoff_secs = self.config.prune_backoff.as_secs();
                let _ = self.sink.send_frame(from, Frame::Prune { topic: topic.to_string(), backoff_secs });
            }
        }
        Ok(())
    }

    fn handle_prune(&self, from: &PeerId, topic: &str, backoff_secs: u64) {
        let now = Instant::now();
        let backoff = match backoff_secs {
            0 => self.config.prune_backoff,
            secs => Duration::from_secs(secs).min(MAX_PRUNE_BACKOFF),
        };
        let removed = {
            let mut mesh = self.mesh.write();
            mesh.record_backoff(from, topic, backoff, now);
            mesh.remove(topic, from)
        };
        trace!(peer = %from, topic = %topic, backoff_secs = backoff.as_secs(), "pruned by peer");

        if removed && self.mesh.read().needs_peers(topic) {
            self.rebalance_topic(topic, now);
        }
    }

    fn handle_ihave(&self, from: &PeerId, topic: &str, ids: Vec<MessageId>) {
        if !self.is_subscribed(topic) || self.is_graylisted(from) {
            return;
        }
        let wanted: Vec<MessageId> = {
            let cache = self.cache.read();
            ids.into_iter()
                .take(self.config.max_ihave_length)
                .filter(|id| !cache.seen(id))
                .collect()
        };
        if !wanted.is_empty() {
            trace!(peer = %from, topic = %topic, wanted = wanted.len(), "requesting via IWANT");
            let _ = self.sink.send_frame(from, Frame::IWant { ids: wanted });
        }
    }

    fn handle_iwant(&self, from: &PeerId, ids: Vec<MessageId>) {
        if self.is_graylisted(from) {
            return;
        }
        let messages: Vec<GossipMessage> = {
            let history = self.history.lock();
            ids.iter()
                .take(self.config.max_ihave_length)
                .filter_map(|id| history.get(id).cloned())
                .collect()
        };
        for message in messages {
            let _ = self.sink.send_frame(from, Frame::Data(message));
        }
    }

    // ========================================================================
    // Scoring
    // ========================================================================

    /// `from` sent more undecodable frames than the session tolerates.
    /// Isolated decode errors are not scored; only the flood is.
    pub fn report_malformed_flood(&self, from: &PeerId) {
        self.penalize(from, MALFORMED_FLOOD_PENALTY);
    }

    fn penalize(&self, peer: &PeerId, penalty: f64) {
        self.scores.lock().add_penalty(peer, penalty);
    }

    pub fn is_graylisted(&self, peer: &PeerId) -> bool {
        self.scores.lock().is_graylisted(peer)
    }

    pub fn score(&self, peer: &PeerId) -> f64 {
        self.scores.lock().score(peer)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Recompute the mesh for `topic` and send the resulting GRAFT/PRUNE frames.
    pub fn rebalance_topic(&self, topic: &str, now: Instant) -> Rebalance {
        let outcome = {
            let registry = self.registry.read();
            let subscribers = registry.peers_for(topic);
            let mut mesh = self.mesh.write();
            let excluded: HashSet<PeerId> = {
                let scores = self.scores.lock();
                subscribers.iter().filter(|p| scores.is_graylisted(p)).copied().collect()
            };
            mesh.rebalance(topic, &subscribers, &excluded, self.config.prune_backoff, now)
        };

        for peer in &outcome.grafted {
            let _ = self.sink.send_frame(peer, Frame::Graft { topic: topic.to_string() });
        }
        let backoff_secs = self.config.prune_backoff.as_secs();
        for peer in &outcome.pruned {
            let _ = self.sink.send_frame(peer, Frame::Prune { topic: topic.to_string(), backoff_secs });
        }

        if !outcome.is_empty() {
            debug!(
                topic = %topic,
                grafted = outcome.grafted.len(),
                pruned = outcome.pruned.len(),
                dropped = outcome.dropped.len(),
                mesh_size = self.mesh.read().mesh_len(topic),
                "mesh rebalanced"
            );
        }
        outcome
    }

    /// Send IHAVE for recent messages to a few subscribed peers outside the mesh.
    fn emit_gossip(&self, topic: &str) {
        let ids = self.history.lock().recent_ids(topic, self.config.max_ihave_length);
        if ids.is_empty() {
            return;
        }
        let targets: Vec<PeerId> = {
            let registry = self.registry.read();
            let mesh = self.mesh.read();
            let scores = self.scores.lock();
            registry
                .peers_for(topic)
                .into_iter()
                .filter(|p| !mesh.contains(topic, p) && !scores.is_graylisted(p))
                .choose_multiple(&mut rand::thread_rng(), self.config.gossip_lazy)
        };
        if targets.is_empty() {
            return;
        }
        trace!(topic = %topic, ids = ids.len(), peers = targets.len(), "emitting IHAVE");
        self.send_to_all(targets, Frame::IHave { topic: topic.to_string(), ids });
    }

    pub fn heartbeat(&self) {
        self.heartbeat_at(Instant::now());
    }

    pub fn heartbeat_at(&self, now: Instant) {
        let evicted = match now.checked_sub(self.config.cache_ttl) {
            Some(cutoff) => self.evict_seen_before(cutoff),
            None => 0,
        };
        self.history.lock().expire(now);

        for topic in self.subscriptions() {
            self.rebalance_topic(&topic, now);
            self.emit_gossip(&topic);
        }

        let graylisted: Vec<PeerId> = {
            let registry = self.registry.read();
            let scores = self.scores.lock();
            scores.graylisted().into_iter().filter(|p| registry.contains(p)).collect()
        };
        for peer in &graylisted {
            warn!(peer = %peer, score = self.score(peer), "disconnecting graylisted peer");
            self.sink.disconnect(peer);
        }

        self.scores.lock().decay();
        self.mesh.write().cleanup_backoff(now);

        if evicted > 0 {
            trace!(evicted = evicted, "evicted expired cache entries");
        }
    }

    /// Drop dedup entries that arrived before `cutoff`.
    pub fn evict_seen_before(&self, cutoff: Instant) -> usize {
        self.cache.write().evict_older_than(cutoff)
    }

    pub fn seen(&self, id: &MessageId) -> bool {
        self.cache.read().seen(id)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let mut subscriptions = self.subscriptions();
        subscriptions.sort();
        let mesh_sizes = {
            let mesh = self.mesh.read();
            subscriptions.iter().map(|t| (t.clone(), mesh.mesh_len(t))).collect()
        };
        EngineSnapshot {
            peers: self.registry.read().len(),
            mesh_sizes,
            subscriptions,
            cache_entries: self.cache.read().len(),
            history_entries: self.history.lock().len(),
            scored_peers: self.scores.lock().len(),
        }
    }

    fn send_to_all(&self, peers: impl IntoIterator<Item = PeerId>, frame: Frame) -> usize {
        let mut sent = 0;
        for peer in peers {
            match self.sink.send_frame(&peer, frame.clone()) {
                Ok(()) => sent += 1,
                Err(e) => trace!(peer = %peer, kind = frame.kind(), error = %e, "frame not queued"),
            }
        }
        sent
    }
}

fn check_topic(topic: &str) -> Result<(), MessageRejection> {
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(MessageRejection::TopicTooLong);
    }
    if !is_valid_topic(topic) {
        return Err(MessageRejection::InvalidTopic);
    }
    Ok(())
}
