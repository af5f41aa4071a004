//! # Peer Registry
//!
//! Tracks connected peers and which topics each one has announced. Session
//! lifecycle lives in the session table; a peer is here exactly while its
//! session is Active. Both directions of the subscription relation are indexed so that
//! `peers_for(topic)` and `topics_of(peer)` are single lookups:
//!
//! ```text
//! peers:  PeerId -> {Topic}
//! topics: Topic  -> {PeerId}
//! ```
//!
//! The two maps are kept in lockstep; every mutation touches both or neither.

use std::collections::{HashMap, HashSet};

use crate::error::GossipError;
use crate::identity::PeerId;

/// Subscriptions a single remote peer may hold.
/// SECURITY: bounds per-peer bookkeeping under subscription floods.
pub const MAX_SUBSCRIPTIONS_PER_PEER: usize = 100;

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, HashSet<String>>,
    topics: HashMap<String, HashSet<PeerId>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the peer was already known.
    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }
        self.peers.insert(peer, HashSet::new());
        true
    }

    /// Forget a peer and all of its subscriptions. Unknown peers are a no-op.
    ///
    /// Returns the topics the peer was subscribed to.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<String> {
        let Some(topics) = self.peers.remove(peer) else {
            return Vec::new();
        };
        for topic in &topics {
            self.unindex(topic, peer);
        }
        topics.into_iter().collect()
    }

    /// Record that `peer` wants `topic`. Returns true if this is a new subscription.
    pub fn subscribe(&mut self, peer: &PeerId, topic: &str) -> Result<bool, GossipError> {
        let topics = self.peers.get_mut(peer).ok_or(GossipError::UnknownPeer(*peer))?;
        if topics.contains(topic) {
            return Ok(false);
        }
        if topics.len() >= MAX_SUBSCRIPTIONS_PER_PEER {
            return Err(GossipError::SubscriptionLimit {
                peer: *peer,
                limit: MAX_SUBSCRIPTIONS_PER_PEER,
            });
        }
        topics.insert(topic.to_string());
        self.topics.entry(topic.to_string()).or_default().insert(*peer);
        Ok(true)
    }

    /// Drop a subscription. Unknown peers and unknown topics are a no-op.
    pub fn unsubscribe(&mut self, peer: &PeerId, topic: &str) -> bool {
        let Some(topics) = self.peers.get_mut(peer) else {
            return false;
        };
        if !topics.remove(topic) {
            return false;
        }
        self.unindex(topic, peer);
        true
    }

    fn unindex(&mut self, topic: &str, peer: &PeerId) {
        if let Some(set) = self.topics.get_mut(topic) {
            set.remove(peer);
            if set.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    pub fn peers_for(&self, topic: &str) -> HashSet<PeerId> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    pub fn is_subscribed(&self, peer: &PeerId, topic: &str) -> bool {
        self.topics.get(topic).is_some_and(|set| set.contains(peer))
    }

    pub fn topics_of(&self, peer: &PeerId) -> Vec<String> {
        self.peers
            .get(peer)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    #[test]
    fn subscribe_unknown_peer_fails() {
        let mut registry = PeerRegistry::new();
        let err = registry.subscribe(&peer(1), "alpha").unwrap_err();
        assert!(matches!(err, GossipError::UnknownPeer(p) if p == peer(1)));
        assert!(registry.peers_for("alpha").is_empty());
    }

    #[test]
    fn remove_unknown_peer_is_noop() {
        let mut registry = PeerRegistry::new();
        assert!(registry.remove_peer(&peer(1)).is_empty());
        registry.add_peer(peer(2));
        assert!(registry.remove_peer(&peer(1)).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn add_peer_is_idempotent() {
        let mut registry = PeerRegistry::new();
        assert!(registry.add_peer(peer(1)));
        registry.subscribe(&peer(1), "alpha").unwrap();
        assert!(!registry.add_peer(peer(1)));
        assert!(registry.is_subscribed(&peer(1), "alpha"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn both_indexes_stay_consistent() {
        let mut registry = PeerRegistry::new();
        registry.add_peer(peer(1));
        registry.add_peer(peer(2));
        registry.subscribe(&peer(1), "alpha").unwrap();
        registry.subscribe(&peer(1), "beta").unwrap();
        registry.subscribe(&peer(2), "alpha").unwrap();

        assert_eq!(registry.peers_for("alpha").len(), 2);
        assert_eq!(registry.peers_for("beta"), HashSet::from([peer(1)]));

        let mut removed = registry.remove_peer(&peer(1));
        removed.sort();
        assert_eq!(removed, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(registry.peers_for("alpha"), HashSet::from([peer(2)]));
        assert!(registry.peers_for("beta").is_empty());
        assert!(registry.topics_of(&peer(1)).is_empty());
    }

    #[test]
    fn duplicate_subscribe_reports_false() {
        let mut registry = PeerRegistry::new();
        registry.add_peer(peer(1));
        assert!(registry.subscribe(&peer(1), "alpha").unwrap());
        assert!(!registry.subscribe(&peer(1), "alpha").unwrap());
        assert_eq!(registry.topics_of(&peer(1)).len(), 1);
    }

    #[test]
    fn unsubscribe_clears_index() {
        let mut registry = PeerRegistry::new();
        registry.add_peer(peer(1));
        registry.subscribe(&peer(1), "alpha").unwrap();
        assert!(registry.unsubscribe(&peer(1), "alpha"));
        assert!(!registry.unsubscribe(&peer(1), "alpha"));
        assert!(!registry.unsubscribe(&peer(9), "alpha"));
        assert!(registry.peers_for("alpha").is_empty());
    }

    #[test]
    fn subscription_cap_enforced() {
        let mut registry = PeerRegistry::new();
        registry.add_peer(peer(1));
        for i in 0..MAX_SUBSCRIPTIONS_PER_PEER {
            registry.subscribe(&peer(1), &format!("topic-{i}")).unwrap();
        }
        let err = registry.subscribe(&peer(1), "one-too-many").unwrap_err();
        assert!(matches!(err, GossipError::SubscriptionLimit { .. }));
    }
}
