//! Conversation records keyed by conversation id, plus the shared config.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::{ConfigPatch, DebounceConfig};
use crate::conversation::ConversationState;

/// A conversation record behind its per-key lock.
///
/// The lock is only ever held for short, synchronous sections; nothing awaits
/// while holding it.
pub type SharedState = Arc<Mutex<ConversationState>>;

/// A record removed by [`ConversationKeyStore::sweep`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweptRecord {
    pub key: String,
    /// Transcript entries discarded with the record
    pub history_len: usize,
}

/// Owns one [`ConversationState`] per key and the timing configuration.
pub struct ConversationKeyStore {
    records: Mutex<HashMap<String, SharedState>>,
    config: RwLock<DebounceConfig>,
}

impl ConversationKeyStore {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config: RwLock::new(config.normalized()),
        }
    }

    /// Current configuration
    pub fn config(&self) -> DebounceConfig {
        self.config.read().clone()
    }

    /// Merge `patch` into the configuration and return the result.
    ///
    /// Timers that are already armed keep the delay they were armed with.
    pub fn update_config(&self, patch: &ConfigPatch) -> DebounceConfig {
        let mut config = self.config.write();
        *config = config.apply(patch);
        config.clone()
    }

    /// Look up `key`, creating its record if needed. Refreshes the TTL.
    pub fn get_or_create(&self, key: &str) -> SharedState {
        let ttl = self.config.read().state_ttl;
        let now = Instant::now();
        let state = {
            let mut records = self.records.lock();
            records
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ConversationState::new(key, now, ttl))))
                .clone()
        };
        state.lock().touch(now, ttl);
        state
    }

    /// Look up `key` without creating it. Refreshes the TTL when found.
    pub fn get(&self, key: &str) -> Option<SharedState> {
        let state = self.records.lock().get(key).cloned()?;
        let ttl = self.config.read().state_ttl;
        state.lock().touch(Instant::now(), ttl);
        Some(state)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }

    /// Remove every record whose TTL passed, disarming its timers first.
    ///
    /// Records that are locked, mid-flush or still holding unflushed fragments
    /// are left for a later sweep.
    pub fn sweep(&self, now: Instant) -> Vec<SweptRecord> {
        let mut swept = Vec::new();
        self.records.lock().retain(|key, state| {
            let Some(mut state) = state.try_lock() else {
                return true;
            };
            if !state.is_expired(now)
                || state.is_flushing()
                || state.has_open_burst()
                || !state.pending.is_empty()
            {
                return true;
            }
            state.timers.clear_all();
            swept.push(SweptRecord {
                key: key.clone(),
                history_len: state.history.len(),
            });
            false
        });
        swept
    }

    /// Disarm and drop every record.
    pub fn clear(&self) {
        let drained: Vec<SharedState> = self.records.lock().drain().map(|(_, s)| s).collect();
        for state in drained {
            state.lock().timers.clear_all();
        }
    }
}
