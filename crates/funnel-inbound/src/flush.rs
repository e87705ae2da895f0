//! Flush coordination
//!
//! A flush drains a conversation's whole pending queue into one turn and hands
//! it to the [`TurnHandler`](crate::TurnHandler). Per key the flush path moves
//! `Idle -> Draining -> Invoking -> Idle`; an attempt that finds the key in any
//! other phase only leaves `flush_requested` behind, which the running flush
//! consumes once its handler returns. That gives at most one handler call in
//! flight per key without ever blocking on a lock across an await.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Instant;

use crate::conversation::{ConversationState, FlushPhase};
use crate::engine::Shared;
use crate::error::Error;
use crate::events::InboundEvent;
use crate::handler::{FlushPayload, FlushReason, FlushTiming, merge_batch};
use crate::history::{self, HistoryQuery};
use crate::scheduler;
use crate::store::SharedState;

enum Entry {
    Begin,
    Busy,
    Empty,
}

/// Flush the pending queue of `key`.
pub(crate) async fn flush(shared: &Arc<Shared>, key: &str, reason: FlushReason) {
    let Some(state) = shared.store.get(key) else {
        return;
    };

    let entry = {
        let mut state = state.lock();
        if state.is_processing() {
            tracing::debug!("Flush ({}) for {} deferred: turn in progress", reason, key);
            state.flush_requested = true;
            Entry::Busy
        } else if state.is_flushing() {
            tracing::debug!("Flush ({}) for {} deferred: already draining", reason, key);
            state.flush_requested = true;
            Entry::Busy
        } else {
            state.phase = FlushPhase::Draining;
            if state.pending.is_empty() {
                finish_empty(&mut state);
                Entry::Empty
            } else {
                Entry::Begin
            }
        }
    };
    match entry {
        Entry::Begin => {}
        Entry::Busy => {
            shared.emit(InboundEvent::FlushDeferred {
                key: key.to_string(),
                reason,
            });
            return;
        }
        Entry::Empty => {
            shared.emit(InboundEvent::FlushSkipped {
                key: key.to_string(),
                reason,
            });
            return;
        }
    }

    // The transcript snapshot is taken as of this decision, so entries the
    // transport records during the late-join wait stay out of it.
    let decided_at = Instant::now();
    let late_join = shared.store.config().late_join;
    if reason.waits_for_late_joiners() && !late_join.is_zero() {
        tokio::time::sleep(late_join).await;
    }

    let Some(payload) = prepare_batch(shared, &state, key, reason, decided_at) else {
        shared.emit(InboundEvent::FlushSkipped {
            key: key.to_string(),
            reason,
        });
        return;
    };

    let burst_id = payload.burst_id;
    let batch_size = payload.items.len();
    tracing::info!(
        "Flushing {} fragment(s) for {} (burst {}, {}, waited {}ms)",
        batch_size,
        key,
        burst_id,
        reason,
        payload.timing.waited_ms
    );
    shared.emit(InboundEvent::FlushStarted {
        key: key.to_string(),
        burst_id,
        reason,
        batch_size,
    });

    let started = Instant::now();
    let result = match AssertUnwindSafe(shared.handler.on_flush_block(payload))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::HandlerPanicked),
    };
    let handler_ms = started.elapsed().as_millis() as u64;
    if let Err(e) = &result {
        tracing::warn!("Turn handler failed for {} (burst {}): {}", key, burst_id, e);
    }
    shared.emit(InboundEvent::FlushFinished {
        key: key.to_string(),
        burst_id,
        ok: result.is_ok(),
        handler_ms,
    });

    if let Some(next_burst) = complete(shared, &state) {
        tracing::debug!("Input arrived during turn for {}, rearmed burst {}", key, next_burst);
        shared.emit(InboundEvent::Rearmed {
            key: key.to_string(),
            burst_id: next_burst,
        });
    }
}

fn finish_empty(state: &mut ConversationState) {
    state.close_burst();
    state.phase = FlushPhase::Idle;
}

/// Drain the queue and build the turn payload, moving the key to `Invoking`.
///
/// Returns `None` (and releases the key) if the queue emptied in the meantime
/// or the engine shut down during the late-join wait.
fn prepare_batch(
    shared: &Shared,
    state: &SharedState,
    key: &str,
    reason: FlushReason,
    decided_at: Instant,
) -> Option<FlushPayload> {
    let mut state = state.lock();
    if shared.is_shut_down() {
        tracing::debug!("Engine shut down, dropping {} pending for {}", state.pending.len(), key);
        state.drain_pending();
        finish_empty(&mut state);
        return None;
    }
    if state.pending.is_empty() {
        finish_empty(&mut state);
        return None;
    }

    let now = Instant::now();
    let burst_id = state.burst_id;
    let waited = state
        .first_pending_at
        .map(|first| now.saturating_duration_since(first))
        .unwrap_or_default();
    let batch = state.drain_pending();
    state.close_burst();

    let quiet = batch
        .last()
        .map(|f| now.saturating_duration_since(f.enqueued_at))
        .unwrap_or_default();
    let timing = FlushTiming {
        reason,
        waited_ms: waited.as_millis() as u64,
        quiet_ms: quiet.as_millis() as u64,
    };

    let mut payload = merge_batch(key, burst_id, &batch, String::new(), timing);
    payload.history = history::build(
        &state.history,
        &HistoryQuery {
            exclude_ids: Some(&payload.exclude_ids),
            max_at: Some(decided_at),
        },
    );

    state.phase = FlushPhase::Invoking;
    state.flush_requested = false;
    Some(payload)
}

/// Release the key after the handler returned; schedule another burst if input
/// arrived meanwhile. Returns the burst id that was rearmed, if any.
fn complete(shared: &Arc<Shared>, state: &SharedState) -> Option<u64> {
    let mut state = state.lock();
    let mut rearmed = None;
    if (!state.pending.is_empty() || state.flush_requested) && !shared.is_shut_down() {
        state.flush_requested = false;
        let config = shared.store.config();
        let now = Instant::now();
        if !state.has_open_burst() {
            scheduler::open_burst(shared, &mut state, &config, now);
        }
        scheduler::arm_debounce(shared, &mut state, &config, now, FlushReason::Rearm);
        rearmed = Some(state.burst_id);
    }

    state.phase = FlushPhase::Idle;
    rearmed
}
