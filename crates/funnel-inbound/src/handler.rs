//! Turn handler trait and the payload it receives

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::InboundFragment;
use crate::error::Result;

/// Why a flush was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// The quiet period after the latest fragment elapsed
    Debounce,
    /// The burst hit its hard latency ceiling
    MaxWait,
    /// Scheduled after a handler returned with more input waiting
    Rearm,
    /// Requested explicitly through the engine
    Manual,
}

impl FlushReason {
    /// Whether the late-join window applies before draining.
    ///
    /// Re-armed flushes skip it, matching the production flow; see the
    /// `rearmed_flush_skips_late_join` test.
    pub fn waits_for_late_joiners(self) -> bool {
        matches!(self, FlushReason::Debounce | FlushReason::MaxWait)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::Debounce => "debounce",
            FlushReason::MaxWait => "max_wait",
            FlushReason::Rearm => "rearm",
            FlushReason::Manual => "manual",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fragment of a flushed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: Option<String>,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl From<&InboundFragment> for BatchItem {
    fn from(fragment: &InboundFragment) -> Self {
        Self {
            id: fragment.external_id.clone(),
            text: fragment.text.clone(),
            received_at: fragment.received_at,
        }
    }
}

/// Timing diagnostics attached to every flush
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushTiming {
    pub reason: FlushReason,
    /// Time from the burst's first fragment to the drain
    pub waited_ms: u64,
    /// Time from the batch's newest fragment to the drain
    pub quiet_ms: u64,
}

/// A merged turn, ready for reply generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushPayload {
    /// Correlation id for everything this turn triggers downstream
    pub turn_id: Uuid,
    pub key: String,
    pub burst_id: u64,
    /// Fragment texts joined in arrival order
    pub merged_text: String,
    pub last_text: String,
    /// Id of the last fragment; the message replies should quote
    pub reply_to: Option<String>,
    /// Ids of every fragment in the batch
    pub exclude_ids: HashSet<String>,
    pub items: Vec<BatchItem>,
    pub channel_hint: Option<String>,
    /// Prior transcript, without the batch itself
    pub history: String,
    pub timing: FlushTiming,
}

impl FlushPayload {
    /// Texts of the batch, in order
    pub fn texts(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.text.as_str()).collect()
    }
}

/// Receives each flushed turn.
///
/// Failures are logged by the engine and never retried; the engine's own
/// bookkeeping continues whether the handler succeeds, fails, or panics.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn on_flush_block(&self, payload: FlushPayload) -> Result<()>;
}

/// Type alias for a shared turn handler
pub type BoxedHandler = Arc<dyn TurnHandler>;

#[async_trait]
impl<T: TurnHandler + ?Sized> TurnHandler for Arc<T> {
    async fn on_flush_block(&self, payload: FlushPayload) -> Result<()> {
        (**self).on_flush_block(payload).await
    }
}

/// Merge a drained batch into a payload.
pub(crate) fn merge_batch(
    key: &str,
    burst_id: u64,
    batch: &[InboundFragment],
    history: String,
    timing: FlushTiming,
) -> FlushPayload {
    let items: Vec<BatchItem> = batch.iter().map(BatchItem::from).collect();
    let merged_text = items
        .iter()
        .map(|item| item.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let last = batch.last();

    FlushPayload {
        turn_id: Uuid::new_v4(),
        key: key.to_string(),
        burst_id,
        merged_text,
        last_text: last.map(|f| f.text.clone()).unwrap_or_default(),
        reply_to: last.and_then(|f| f.external_id.clone()),
        exclude_ids: batch_ids(batch),
        items,
        channel_hint: last.and_then(|f| f.source_channel.clone()),
        history,
        timing,
    }
}

/// Ids carried by a batch.
pub(crate) fn batch_ids(batch: &[InboundFragment]) -> HashSet<String> {
    batch
        .iter()
        .filter_map(|f| f.external_id.clone())
        .collect()
}
