//! Conversation state: pending fragments, burst bookkeeping, timers, transcript.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::dedup::SeenIds;

/// One piece of a user's turn, as delivered by the transport
#[derive(Debug, Clone)]
pub struct InboundFragment {
    /// Message text (never blank once queued)
    pub text: String,
    /// Identifier assigned by the upstream transport, if any
    pub external_id: Option<String>,
    /// Channel the fragment came through (e.g. "whatsapp")
    pub source_channel: Option<String>,
    /// When the fragment was queued, on the runtime clock
    pub enqueued_at: Instant,
    /// When the fragment was queued, on the wall clock
    pub received_at: DateTime<Utc>,
}

/// Author of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Tag used when rendering transcripts
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

/// Optional data attached to a transcript entry
#[derive(Debug, Clone, Default)]
pub struct HistoryExtra {
    /// Transport identifier of the message this entry records
    pub external_id: Option<String>,
    /// Free-form metadata from the transport layer
    pub metadata: Option<serde_json::Value>,
}

/// A single transcript line
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub external_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    /// Runtime clock timestamp, used for snapshot cutoffs
    pub at: Instant,
    pub recorded_at: DateTime<Utc>,
}

/// Where a conversation's flush path currently is.
///
/// `Draining` covers the late-join wait and batch building, `Invoking` the
/// handler call. A key is "flushing" in both and "processing" only in the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPhase {
    #[default]
    Idle,
    Draining,
    Invoking,
}

/// The two timers a conversation may own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Debounce,
    MaxWait,
}

/// An armed single-shot timer, tagged so a stale firing can recognise itself
#[derive(Debug)]
pub struct TimerSlot {
    pub(crate) seq: u64,
    pub(crate) handle: JoinHandle<()>,
}

/// Timer handles owned by a conversation record
#[derive(Debug, Default)]
pub struct Timers {
    debounce: Option<TimerSlot>,
    max_wait: Option<TimerSlot>,
    next_seq: u64,
}

impl Timers {
    fn slot_mut(&mut self, kind: TimerKind) -> &mut Option<TimerSlot> {
        match kind {
            TimerKind::Debounce => &mut self.debounce,
            TimerKind::MaxWait => &mut self.max_wait,
        }
    }

    /// Allocate a tag for the next timer armed on this record.
    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Abort whatever occupies `kind` and install `slot` in its place.
    pub fn clear_and_replace(&mut self, kind: TimerKind, slot: TimerSlot) {
        if let Some(old) = self.slot_mut(kind).replace(slot) {
            old.handle.abort();
        }
    }

    /// Abort and remove the timer of `kind`, if armed.
    pub fn clear(&mut self, kind: TimerKind) {
        if let Some(old) = self.slot_mut(kind).take() {
            old.handle.abort();
        }
    }

    pub fn clear_all(&mut self) {
        self.clear(TimerKind::Debounce);
        self.clear(TimerKind::MaxWait);
    }

    /// Called by a firing timer: vacate the slot if it still belongs to `seq`.
    ///
    /// Returns `false` when the timer was replaced or cleared in the meantime,
    /// in which case the firing must be ignored.
    pub(crate) fn take_if_current(&mut self, kind: TimerKind, seq: u64) -> bool {
        let slot = self.slot_mut(kind);
        if slot.as_ref().is_some_and(|s| s.seq == seq) {
            // Not aborted: the caller is the task behind this handle.
            slot.take();
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Debounce => self.debounce.is_some(),
            TimerKind::MaxWait => self.max_wait.is_some(),
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear_all();
    }
}

/// Everything the engine tracks for one conversation key
#[derive(Debug)]
pub struct ConversationState {
    pub key: String,
    /// FIFO of fragments waiting for the next flush
    pub pending: VecDeque<InboundFragment>,
    /// First fragment of the open burst; `None` when no burst is open
    pub first_pending_at: Option<Instant>,
    /// Deadline of the max-wait timer armed for the open burst
    pub max_wait_deadline: Option<Instant>,
    /// Incremented every time a burst opens
    pub burst_id: u64,
    pub timers: Timers,
    pub phase: FlushPhase,
    /// A flush or enqueue arrived while this key was busy
    pub flush_requested: bool,
    /// Bounded transcript, oldest first
    pub history: VecDeque<HistoryEntry>,
    pub seen_ids: SeenIds,
    pub expires_at: Instant,
}

impl ConversationState {
    pub fn new(key: impl Into<String>, now: Instant, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            pending: VecDeque::new(),
            first_pending_at: None,
            max_wait_deadline: None,
            burst_id: 0,
            timers: Timers::default(),
            phase: FlushPhase::Idle,
            flush_requested: false,
            history: VecDeque::new(),
            seen_ids: SeenIds::default(),
            expires_at: now + ttl,
        }
    }

    /// Extend the record's lifetime.
    pub fn touch(&mut self, now: Instant, ttl: Duration) {
        self.expires_at = now + ttl;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// The handler is running for this key
    pub fn is_processing(&self) -> bool {
        self.phase == FlushPhase::Invoking
    }

    /// Some flush invocation owns this key
    pub fn is_flushing(&self) -> bool {
        self.phase != FlushPhase::Idle
    }

    pub fn has_open_burst(&self) -> bool {
        self.first_pending_at.is_some()
    }

    /// Start a new burst at `now` and return its id.
    pub fn open_burst(&mut self, now: Instant) -> u64 {
        self.first_pending_at = Some(now);
        self.max_wait_deadline = None;
        self.burst_id += 1;
        self.burst_id
    }

    /// Forget the open burst and disarm both timers.
    pub fn close_burst(&mut self) {
        self.timers.clear_all();
        self.first_pending_at = None;
        self.max_wait_deadline = None;
    }

    /// Take every pending fragment, in arrival order.
    pub fn drain_pending(&mut self) -> Vec<InboundFragment> {
        self.pending.drain(..).collect()
    }

    /// Append to the transcript, dropping the oldest entries beyond `max_len`.
    pub fn push_history(&mut self, entry: HistoryEntry, max_len: usize) {
        self.history.push_back(entry);
        while self.history.len() > max_len {
            self.history.pop_front();
        }
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            key: self.key.clone(),
            burst_id: self.burst_id,
            phase: self.phase,
            pending: self.pending.len(),
            burst_open: self.has_open_burst(),
            flush_requested: self.flush_requested,
            debounce_armed: self.timers.is_armed(TimerKind::Debounce),
            max_wait_armed: self.timers.is_armed(TimerKind::MaxWait),
            history_len: self.history.len(),
            seen_ids: self.seen_ids.len(),
        }
    }
}

/// Read-only view of a conversation record, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub key: String,
    pub burst_id: u64,
    pub phase: FlushPhase,
    pub pending: usize,
    pub burst_open: bool,
    pub flush_requested: bool,
    pub debounce_armed: bool,
    pub max_wait_armed: bool,
    pub history_len: usize,
    pub seen_ids: usize,
}
