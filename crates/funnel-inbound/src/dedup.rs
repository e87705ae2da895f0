//! Inbound message deduplication
//!
//! Transports upstream deliver at least once, so the same message id can show
//! up more than once. Each conversation remembers the ids it has seen for a
//! bounded time and a bounded count; ids are never refreshed once inserted, so
//! insertion order is also `last_seen` order.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// Outcome of [`SeenIds::check_and_insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeenStatus {
    /// First time this id was seen (within the TTL); it is now remembered
    Fresh,
    /// The id was already seen; the caller should skip the message
    Duplicate,
    /// No id was supplied, nothing was tracked
    Untracked,
}

impl SeenStatus {
    /// Whether the id was usable for deduplication
    pub fn ok(self) -> bool {
        !matches!(self, SeenStatus::Untracked)
    }

    /// Whether the message was already delivered
    pub fn is_duplicate(self) -> bool {
        matches!(self, SeenStatus::Duplicate)
    }
}

/// Per-conversation cache of external message ids
#[derive(Debug, Default)]
pub struct SeenIds {
    entries: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl SeenIds {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Record `id` as seen at `now`, reporting whether it was already known.
    pub fn check_and_insert(
        &mut self,
        id: &str,
        now: Instant,
        ttl: Duration,
        max_entries: usize,
    ) -> SeenStatus {
        if id.is_empty() {
            return SeenStatus::Untracked;
        }

        self.purge_expired(now, ttl);
        if self.entries.contains_key(id) {
            return SeenStatus::Duplicate;
        }

        self.evict_to(max_entries.saturating_sub(1));
        self.entries.insert(id.to_string(), now);
        self.order.push_back(id.to_string());
        SeenStatus::Fresh
    }

    /// Drop every id older than `ttl`.
    pub fn purge_expired(&mut self, now: Instant, ttl: Duration) {
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .is_none_or(|seen| now.saturating_duration_since(*seen) >= ttl);
            if !expired {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.entries.remove(&id);
            }
        }
    }

    /// Evict oldest ids until at most `limit` remain.
    fn evict_to(&mut self, limit: usize) {
        while self.entries.len() > limit {
            match self.order.pop_front() {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}
