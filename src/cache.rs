//! # Message Cache
//!
//! Two bounded stores with different jobs:
//!
//! | Store | Holds | Window | Used for |
//! |-------|-------|--------|----------|
//! | [`MessageCache`] | ids + arrival time | `cache_ttl` (120 s) | deduplication |
//! | [`MessageHistory`] | full messages | `history_window` (3 s) | IHAVE / IWANT |
//!
//! A present id means the message was already delivered to the host and
//! forwarded to the mesh. Once an id is evicted a late duplicate is treated as
//! novel again; that bounded false negative is the price of bounded memory.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::messages::{GossipMessage, MessageId};

#[derive(Debug)]
pub struct MessageCache {
    entries: HashMap<MessageId, Instant>,
    /// Min-heap on arrival time; holds exactly the ids in `entries`.
    by_arrival: BinaryHeap<Reverse<(Instant, MessageId)>>,
    capacity: usize,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_arrival: BinaryHeap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn seen(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert `id` unless already present. Returns true when the id was novel.
    ///
    /// At the hard cap the oldest entries are evicted first.
    pub fn record(&mut self, id: MessageId, at: Instant) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        while self.entries.len() >= self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }
        self.entries.insert(id, at);
        self.by_arrival.push(Reverse((at, id)));
        debug_assert_eq!(self.entries.len(), self.by_arrival.len());
        true
    }

    fn evict_oldest(&mut self) -> bool {
        match self.by_arrival.pop() {
            Some(Reverse((_, id))) => {
                self.entries.remove(&id);
                true
            }
            None => false,
        }
    }

    /// Drop every entry that arrived strictly before `cutoff`.
    pub fn evict_older_than(&mut self, cutoff: Instant) -> usize {
        let mut evicted = 0;
        while let Some(Reverse((arrived, _))) = self.by_arrival.peek() {
            if *arrived >= cutoff {
                break;
            }
            self.evict_oldest();
            evicted += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug)]
struct StoredMessage {
    message: GossipMessage,
    stored_at: Instant,
}

/// Recent message bodies, kept just long enough to answer IWANT requests.
#[derive(Debug)]
pub struct MessageHistory {
    messages: LruCache<MessageId, StoredMessage>,
    window: Duration,
}

impl MessageHistory {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            messages: LruCache::new(cap),
            window,
        }
    }

    pub fn put(&mut self, id: MessageId, message: GossipMessage, now: Instant) {
        self.messages.push(id, StoredMessage { message, stored_at: now });
    }

    pub fn get(&self, id: &MessageId) -> Option<&GossipMessage> {
        self.messages.peek(id).map(|stored| &stored.message)
    }

    /// Ids stored for `topic`, newest first, at most `limit`.
    pub fn recent_ids(&self, topic: &str, limit: usize) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|(_, stored)| stored.message.topic == topic)
            .map(|(id, _)| *id)
            .take(limit)
            .collect()
    }

    /// Drop bodies older than the history window.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((_, oldest)) = self.messages.peek_lru() {
            if now.saturating_duration_since(oldest.stored_at) <= self.window {
                break;
            }
            self.messages.pop_lru();
            expired += 1;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
