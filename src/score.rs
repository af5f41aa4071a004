//! # Peer Scoring
//!
//! Misbehaving peers lose score; once a score falls below the graylist
//! threshold the peer's frames are ignored, it is no longer promoted into any
//! mesh, and the node disconnects it on the next heartbeat.
//!
//! | Component | Signal | Contribution |
//! |-----------|--------|--------------|
//! | P2 | first delivery of a novel message | `+w2 * min(count, cap)` |
//! | P4 | message failing validation | `w4 * count²` (negative) |
//! | P7 | malformed frame or protocol violation | `w7 * penalty²` (negative) |
//!
//! Counters decay multiplicatively on every heartbeat, so a peer that stops
//! misbehaving eventually recovers.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::identity::PeerId;

/// Maximum peers to track scores for.
/// SECURITY: bounds the score table itself.
pub const MAX_SCORED_PEERS: usize = 10_000;

pub const DEFAULT_GRAYLIST_THRESHOLD: f64 = -100.0;
pub const DEFAULT_FIRST_DELIVERY_WEIGHT: f64 = 1.0;
pub const DEFAULT_FIRST_DELIVERY_CAP: f64 = 100.0;
pub const DEFAULT_INVALID_MESSAGE_WEIGHT: f64 = -100.0;
pub const DEFAULT_BEHAVIOUR_PENALTY_WEIGHT: f64 = -10.0;

/// Per-heartbeat multiplier applied to every counter.
pub const DEFAULT_SCORE_DECAY: f64 = 0.9;

/// Counters below this absolute value snap to zero.
pub const DEFAULT_DECAY_TO_ZERO: f64 = 0.01;

#[derive(Clone, Debug)]
pub struct ScoreParams {
    pub graylist_threshold: f64,
    pub first_delivery_weight: f64,
    pub first_delivery_cap: f64,
    pub invalid_message_weight: f64,
    pub behaviour_penalty_weight: f64,
    pub decay: f64,
    pub decay_to_zero: f64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            graylist_threshold: DEFAULT_GRAYLIST_THRESHOLD,
            first_delivery_weight: DEFAULT_FIRST_DELIVERY_WEIGHT,
            first_delivery_cap: DEFAULT_FIRST_DELIVERY_CAP,
            invalid_message_weight: DEFAULT_INVALID_MESSAGE_WEIGHT,
            behaviour_penalty_weight: DEFAULT_BEHAVIOUR_PENALTY_WEIGHT,
            decay: DEFAULT_SCORE_DECAY,
            decay_to_zero: DEFAULT_DECAY_TO_ZERO,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PeerScore {
    first_deliveries: f64,
    invalid_messages: f64,
    behaviour_penalty: f64,
}

impl PeerScore {
    fn calculate(&self, params: &ScoreParams) -> f64 {
        let p2 = params.first_delivery_weight * self.first_deliveries.min(params.first_delivery_cap);
        let p4 = params.invalid_message_weight * self.invalid_messages * self.invalid_messages;
        let p7 = params.behaviour_penalty_weight * self.behaviour_penalty * self.behaviour_penalty;
        p2 + p4 + p7
    }

    fn decay(&mut self, params: &ScoreParams) {
        for counter in [
            &mut self.first_deliveries,
            &mut self.invalid_messages,
            &mut self.behaviour_penalty,
        ] {
            *counter *= params.decay;
            if counter.abs() < params.decay_to_zero {
                *counter = 0.0;
            }
        }
    }

    fn is_neutral(&self) -> bool {
        self.first_deliveries == 0.0 && self.invalid_messages == 0.0 && self.behaviour_penalty == 0.0
    }
}

#[derive(Debug)]
pub struct ScoreBook {
    scores: LruCache<PeerId, PeerScore>,
    params: ScoreParams,
}

impl ScoreBook {
    pub fn new(params: ScoreParams) -> Self {
        let cap = NonZeroUsize::new(MAX_SCORED_PEERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            scores: LruCache::new(cap),
            params,
        }
    }

    pub fn first_delivery(&mut self, peer: &PeerId) {
        self.scores.get_or_insert_mut(*peer, PeerScore::default).first_deliveries += 1.0;
    }

    pub fn invalid_message(&mut self, peer: &PeerId) {
        self.scores.get_or_insert_mut(*peer, PeerScore::default).invalid_messages += 1.0;
    }

    pub fn add_penalty(&mut self, peer: &PeerId, penalty: f64) {
        self.scores.get_or_insert_mut(*peer, PeerScore::default).behaviour_penalty += penalty;
    }

    /// Unknown peers score zero.
    pub fn score(&self, peer: &PeerId) -> f64 {
        self.scores
            .peek(peer)
            .map(|s| s.calculate(&self.params))
            .unwrap_or(0.0)
    }

    pub fn is_graylisted(&self, peer: &PeerId) -> bool {
        self.score(peer) < self.params.graylist_threshold
    }

    /// Every tracked peer currently below the graylist threshold.
    pub fn graylisted(&self) -> Vec<PeerId> {
        self.scores
            .iter()
            .filter(|(_, s)| s.calculate(&self.params) < self.params.graylist_threshold)
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn decay(&mut self) {
        let mut neutral = Vec::new();
        for (peer, score) in self.scores.iter_mut() {
            score.decay(&self.params);
            if score.is_neutral() {
                neutral.push(*peer);
            }
        }
        for peer in neutral {
            self.scores.pop(&peer);
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Counts events inside a trailing time window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    events: VecDeque<Instant>,
    window: Duration,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            window,
        }
    }

    /// Record an event at `now` and return how many fall inside the window.
    pub fn record(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.events.push_back(now);
        self.events.len()
    }

    /// Record only if fewer than `max` events are in the window.
    /// Returns false when the limit is already reached.
    pub fn try_record(&mut self, now: Instant, max: usize) -> bool {
        self.prune(now);
        if self.events.len() >= max {
            return false;
        }
        self.events.push_back(now);
        true
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.saturating_duration_since(*front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}
