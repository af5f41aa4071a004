//! # Mesh Manager
//!
//! For each topic the local node has joined, keeps the bounded set of peers that
//! receive full message bodies eagerly. Everyone else subscribed to the topic
//! only hears about messages through IHAVE gossip.
//!
//! ## Rebalance
//!
//! ```text
//! |mesh| <  D_lo  → graft random eligible subscribers until |mesh| = D
//! |mesh| >  D_hi  → prune random mesh members until |mesh| = D
//! otherwise       → leave the mesh alone
//! ```
//!
//! Random selection means no peer is starved deterministically, and an
//! adversary cannot predict which slots open up. Peers we pruned or that pruned
//! us sit out a backoff period before they can be grafted again.
//!
//! Invariant: a mesh member is always a current subscriber of the topic.
//! [`MeshManager::rebalance`] repairs any drift against the registry's view.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::Rng;
use rand::seq::IteratorRandom;

use crate::identity::PeerId;

/// Maximum (peer, topic) backoff entries.
/// SECURITY: bounds backoff bookkeeping under prune floods.
pub const MAX_BACKOFF_ENTRIES: usize = 10_000;

/// Outcome of one rebalance round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Rebalance {
    /// Added to the mesh; they should be sent GRAFT.
    pub grafted: Vec<PeerId>,
    /// Removed to shrink the mesh; they should be sent PRUNE.
    pub pruned: Vec<PeerId>,
    /// Removed because they no longer subscribe; nothing to send.
    pub dropped: Vec<PeerId>,
}

impl Rebalance {
    pub fn is_empty(&self) -> bool {
        self.grafted.is_empty() && self.pruned.is_empty() && self.dropped.is_empty()
    }
}

#[derive(Debug)]
pub struct MeshManager {
    meshes: HashMap<String, HashSet<PeerId>>,
    backoff: LruCache<(PeerId, String), Instant>,
    mesh_n: usize,
    mesh_n_low: usize,
    mesh_n_high: usize,
}

impl MeshManager {
    pub fn new(mesh_n: usize, mesh_n_low: usize, mesh_n_high: usize) -> Self {
        debug_assert!(mesh_n_low <= mesh_n && mesh_n <= mesh_n_high);
        let cap = NonZeroUsize::new(MAX_BACKOFF_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            meshes: HashMap::new(),
            backoff: LruCache::new(cap),
            mesh_n,
            mesh_n_low,
            mesh_n_high,
        }
    }

    /// Start maintaining a mesh for `topic`. Returns false if already joined.
    pub fn join(&mut self, topic: &str) -> bool {
        if self.meshes.contains_key(topic) {
            return false;
        }
        self.meshes.insert(topic.to_string(), HashSet::new());
        true
    }

    /// Stop maintaining `topic`, returning the peers that were in its mesh.
    pub fn leave(&mut self, topic: &str) -> Vec<PeerId> {
        self.meshes
            .remove(topic)
            .map(|mesh| mesh.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn is_joined(&self, topic: &str) -> bool {
        self.meshes.contains_key(topic)
    }

    pub fn mesh_for(&self, topic: &str) -> HashSet<PeerId> {
        self.meshes.get(topic).cloned().unwrap_or_default()
    }

    pub fn mesh_len(&self, topic: &str) -> usize {
        self.meshes.get(topic).map_or(0, HashSet::len)
    }

    pub fn contains(&self, topic: &str, peer: &PeerId) -> bool {
        self.meshes.get(topic).is_some_and(|m| m.contains(peer))
    }

    pub fn needs_peers(&self, topic: &str) -> bool {
        self.is_joined(topic) && self.mesh_len(topic) < self.mesh_n_low
    }

    /// Add a peer the caller has verified is subscribed.
    /// Fails if the topic is not joined or the mesh is full.
    pub fn add(&mut self, topic: &str, peer: PeerId) -> bool {
        let high = self.mesh_n_high;
        match self.meshes.get_mut(topic) {
            Some(mesh) if mesh.len() < high => mesh.insert(peer),
            _ => false,
        }
    }

    pub fn remove(&mut self, topic: &str, peer: &PeerId) -> bool {
        self.meshes.get_mut(topic).is_some_and(|m| m.remove(peer))
    }

    /// Remove a peer from every mesh. Returns the topics it was removed from.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<String> {
        self.meshes
            .iter_mut()
            .filter_map(|(topic, mesh)| mesh.remove(peer).then(|| topic.clone()))
            .collect()
    }

    pub fn record_backoff(&mut self, peer: &PeerId, topic: &str, duration: Duration, now: Instant) {
        self.backoff.put((*peer, topic.to_string()), now + duration);
    }

    pub fn in_backoff(&self, peer: &PeerId, topic: &str, now: Instant) -> bool {
        self.backoff
            .peek(&(*peer, topic.to_string()))
            .is_some_and(|expiry| *expiry > now)
    }

    pub fn cleanup_backoff(&mut self, now: Instant) -> usize {
        let expired: Vec<(PeerId, String)> = self
            .backoff
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.backoff.pop(key);
        }
        expired.len()
    }

    pub fn rebalance(
        &mut self,
        topic: &str,
        subscribers: &HashSet<PeerId>,
        excluded: &HashSet<PeerId>,
        backoff: Duration,
        now: Instant,
    ) -> Rebalance {
        self.rebalance_with_rng(topic, subscribers, excluded, backoff, now, &mut rand::thread_rng())
    }

    /// [`rebalance`](Self::rebalance) with an explicit randomness source.
    pub fn rebalance_with_rng<R: Rng + ?Sized>(
        &mut self,
        topic: &str,
        subscribers: &HashSet<PeerId>,
        excluded: &HashSet<PeerId>,
        backoff: Duration,
        now: Instant,
        rng: &mut R,
    ) -> Rebalance {
        let mut outcome = Rebalance::default();
        let (mesh_n, low, high) = (self.mesh_n, self.mesh_n_low, self.mesh_n_high);

        let Some(mesh) = self.meshes.get(topic) else {
            return outcome;
        };

        outcome.dropped = mesh.difference(subscribers).copied().collect();
        let mut mesh_len = mesh.len() - outcome.dropped.len();

        if mesh_len < low {
            let candidates = subscribers.iter().filter(|peer| {
                !mesh.contains(*peer) && !excluded.contains(*peer) && !self.in_backoff(peer, topic, now)
            });
            outcome.grafted = candidates.copied().choose_multiple(rng, mesh_n - mesh_len);
            mesh_len += outcome.grafted.len();
        }

        if mesh_len > high {
            let dropped: HashSet<&PeerId> = outcome.dropped.iter().collect();
            outcome.pruned = mesh
                .iter()
                .filter(|peer| !dropped.contains(peer))
                .copied()
                .choose_multiple(rng, mesh_len - mesh_n);
        }

        if let Some(mesh) = self.meshes.get_mut(topic) {
            for peer in outcome.dropped.iter().chain(&outcome.pruned) {
                mesh.remove(peer);
            }
            mesh.extend(outcome.grafted.iter().copied());
        }
        for peer in &outcome.pruned {
            self.record_backoff(peer, topic, backoff, now);
        }

        debug_assert!(self.mesh_for(topic).is_subset(subscribers));
        outcome
    }
}
