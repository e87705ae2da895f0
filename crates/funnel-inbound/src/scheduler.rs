//! Debounce scheduling
//!
//! Every fragment slides the quiet-period timer forward; the first fragment of
//! a burst also arms a max-wait timer, and the quiet period is clamped so it can
//! never end after that deadline. Continuous input therefore still flushes
//! within `max_wait` of the burst's first fragment.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::{DebounceConfig, MIN_TIMER_DELAY};
use crate::conversation::{ConversationState, InboundFragment, TimerKind, TimerSlot};
use crate::engine::Shared;
use crate::events::InboundEvent;
use crate::handler::FlushReason;

/// Source of the randomized quiet period, in milliseconds
pub trait Jitter: Send + Sync {
    /// Pick a value in `min_ms..=max_ms` (`min_ms <= max_ms`).
    fn pick_ms(&self, min_ms: u64, max_ms: u64) -> u64;
}

/// Uniform jitter from the thread-local RNG
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn pick_ms(&self, min_ms: u64, max_ms: u64) -> u64 {
        if min_ms >= max_ms {
            return min_ms;
        }
        rand::thread_rng().gen_range(min_ms..=max_ms)
    }
}

/// Always picks the same value, clamped into the configured range
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub u64);

impl Jitter for FixedJitter {
    fn pick_ms(&self, min_ms: u64, max_ms: u64) -> u64 {
        self.0.clamp(min_ms, max_ms)
    }
}

/// Quiet period to wait after a fragment arriving at `now`.
pub fn debounce_delay(
    jitter: &dyn Jitter,
    config: &DebounceConfig,
    now: Instant,
    max_wait_deadline: Option<Instant>,
) -> Duration {
    let (lo, hi) = config.debounce_range_ms();
    let mut delay = Duration::from_millis(jitter.pick_ms(lo, hi));
    if let Some(deadline) = max_wait_deadline {
        delay = delay.min(deadline.saturating_duration_since(now));
    }
    delay.max(MIN_TIMER_DELAY)
}

/// A fragment as handed over by the transport
#[derive(Debug, Clone, Default)]
pub struct NewFragment {
    pub text: String,
    pub external_id: Option<String>,
    pub source_channel: Option<String>,
}

/// Queue a fragment for `key` and (re)arm its timers.
///
/// Returns `false` when the text is blank and nothing was queued.
pub(crate) fn enqueue(shared: &Arc<Shared>, key: &str, fragment: NewFragment) -> bool {
    if fragment.text.trim().is_empty() {
        tracing::debug!("Ignoring blank fragment for {}", key);
        return false;
    }

    let config = shared.store.config();
    let state = shared.store.get_or_create(key);
    let now = Instant::now();
    let external_id = fragment.external_id.filter(|id| !id.is_empty());

    let mut events = Vec::with_capacity(2);
    {
        let mut state = state.lock();
        state.pending.push_back(InboundFragment {
            text: fragment.text,
            external_id,
            source_channel: fragment.source_channel,
            enqueued_at: now,
            received_at: Utc::now(),
        });
        if state.is_flushing() {
            state.flush_requested = true;
        }
        if !state.has_open_burst() {
            let burst_id = open_burst(shared, &mut state, &config, now);
            events.push(InboundEvent::BurstOpened {
                key: key.to_string(),
                burst_id,
            });
        }
        let delay = arm_debounce(shared, &mut state, &config, now, FlushReason::Debounce);
        tracing::debug!(
            "Queued fragment for {} (burst {}, {} pending), flush in {:?}",
            key,
            state.burst_id,
            state.pending.len(),
            delay
        );
        events.push(InboundEvent::FragmentQueued {
            key: key.to_string(),
            burst_id: state.burst_id,
            pending: state.pending.len(),
        });
    }

    for event in events {
        shared.emit(event);
    }
    true
}

/// Start a burst at `now` and arm its max-wait timer. Returns the burst id.
pub(crate) fn open_burst(
    shared: &Arc<Shared>,
    state: &mut ConversationState,
    config: &DebounceConfig,
    now: Instant,
) -> u64 {
    let burst_id = state.open_burst(now);
    state.max_wait_deadline = Some(now + config.max_wait);
    arm_timer(
        shared,
        state,
        TimerKind::MaxWait,
        config.max_wait,
        FlushReason::MaxWait,
    );
    burst_id
}

/// Replace the debounce timer with a fresh one. Returns the chosen delay.
pub(crate) fn arm_debounce(
    shared: &Arc<Shared>,
    state: &mut ConversationState,
    config: &DebounceConfig,
    now: Instant,
    reason: FlushReason,
) -> Duration {
    let delay = debounce_delay(shared.jitter.as_ref(), config, now, state.max_wait_deadline);
    arm_timer(shared, state, TimerKind::Debounce, delay, reason);
    delay
}

fn arm_timer(
    shared: &Arc<Shared>,
    state: &mut ConversationState,
    kind: TimerKind,
    delay: Duration,
    reason: FlushReason,
) {
    let seq = state.timers.next_seq();
    let handle = spawn_timer(shared, &state.key, kind, seq, delay, reason);
    state.timers.clear_and_replace(kind, TimerSlot { seq, handle });
}

fn spawn_timer(
    shared: &Arc<Shared>,
    key: &str,
    kind: TimerKind,
    seq: u64,
    delay: Duration,
    reason: FlushReason,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    let key = key.to_string();
    shared.runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let Some(state) = shared.store.get(&key) else {
            return;
        };
        let current = state.lock().timers.take_if_current(kind, seq);
        drop(state);
        if current {
            crate::flush::flush(&shared, &key, reason).await;
        }
    })
}
