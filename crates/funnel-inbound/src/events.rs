//! Engine event types

use serde::{Deserialize, Serialize};

use crate::handler::FlushReason;

/// Events emitted while buffering and flushing inbound messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A fragment joined the pending queue
    FragmentQueued {
        key: String,
        burst_id: u64,
        pending: usize,
    },

    /// A new burst started for a conversation
    BurstOpened { key: String, burst_id: u64 },

    /// A flush attempt found the key busy and left a request behind
    FlushDeferred { key: String, reason: FlushReason },

    /// A flush attempt found nothing to drain
    FlushSkipped { key: String, reason: FlushReason },

    /// A batch was drained and is being handed to the turn handler
    FlushStarted {
        key: String,
        burst_id: u64,
        reason: FlushReason,
        batch_size: usize,
    },

    /// The turn handler returned
    FlushFinished {
        key: String,
        burst_id: u64,
        ok: bool,
        handler_ms: u64,
    },

    /// More input arrived while the handler ran; another burst was scheduled
    Rearmed { key: String, burst_id: u64 },

    /// An idle conversation record outlived its TTL and was removed
    Swept { key: String, history_len: usize },
}

impl InboundEvent {
    /// Conversation key the event refers to
    pub fn key(&self) -> &str {
        match self {
            InboundEvent::FragmentQueued { key, .. }
            | InboundEvent::BurstOpened { key, .. }
            | InboundEvent::FlushDeferred { key, .. }
            | InboundEvent::FlushSkipped { key, .. }
            | InboundEvent::FlushStarted { key, .. }
            | InboundEvent::FlushFinished { key, .. }
            | InboundEvent::Rearmed { key, .. }
            | InboundEvent::Swept { key, .. } => key,
        }
    }
}
