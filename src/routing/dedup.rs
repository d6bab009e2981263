//! Duplicate suppression
//!
//! A time-windowed, capacity-bounded set of recently seen keys. The router
//! keys it on `(MessageId, source NodeId)` for frames, and discovery keys a
//! second instance on `(request_id, origin)` for route requests.
//!
//! Entries are kept in insertion order; expiry and overflow both evict from
//! the front, so memory stays bounded however fast traffic arrives.

use crate::protocol::{MessageId, NodeId};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Key used for frame deduplication
pub type MessageKey = (MessageId, NodeId);

/// Bounded FIFO cache of recently seen keys
#[derive(Debug)]
pub struct SeenCache<K> {
    seen: HashMap<K, Instant>,
    order: VecDeque<(K, Instant)>,
    window: Duration,
    capacity: usize,
}

impl<K: Hash + Eq + Clone> SeenCache<K> {
    /// Create a cache; a capacity of 0 is treated as 1
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            window,
            capacity,
        }
    }

    /// Record `key`; returns `false` if it was already present
    pub fn check_and_insert(&mut self, key: K, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains_key(&key) {
            return false;
        }

        while self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(key.clone(), now);
        self.order.push_back((key, now));
        true
    }

    /// Whether `key` is present and unexpired
    pub fn contains(&self, key: &K, now: Instant) -> bool {
        match self.seen.get(key) {
            Some(at) => now.saturating_duration_since(*at) <= self.window,
            None => false,
        }
    }

    /// Drop entries older than the window
    pub fn expire(&mut self, now: Instant) {
        while let Some((key, at)) = self.order.front() {
            if now.saturating_duration_since(*at) <= self.window {
                break;
            }
            self.seen.remove(key);
            self.order.pop_front();
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}
