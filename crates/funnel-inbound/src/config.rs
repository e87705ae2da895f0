//! Timing configuration shared by every conversation
//!
//! The engine keeps one [`DebounceConfig`] behind a lock and reads it fresh at
//! each scheduling decision. Updates arrive as a [`ConfigPatch`] (a partial,
//! millisecond-based view that is easy to load from a settings store) and are
//! always normalized instead of rejected.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest delay ever used for a timer, so clamping never yields zero.
pub const MIN_TIMER_DELAY: Duration = Duration::from_millis(10);

const MAX_DEBOUNCE: Duration = Duration::from_secs(120);
const MAX_WAIT_CEILING: Duration = Duration::from_secs(600);
const MAX_LATE_JOIN: Duration = Duration::from_secs(5);
const MIN_STATE_TTL: Duration = Duration::from_secs(1);

/// Timing and sizing parameters for the inbound engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Lower bound of the randomized quiet period
    pub debounce_min: Duration,
    /// Upper bound of the randomized quiet period
    pub debounce_max: Duration,
    /// Hard ceiling between the first fragment of a burst and its flush
    pub max_wait: Duration,
    /// Pause before draining, to catch arrivals racing the timer
    pub late_join: Duration,
    /// How long an untouched conversation record is kept
    pub state_ttl: Duration,
    /// How often expired conversation records are swept
    pub sweep_interval: Duration,
    /// How long an inbound message id is remembered
    pub dedup_ttl: Duration,
    /// Maximum number of remembered message ids per conversation
    pub dedup_max_entries: usize,
    /// Maximum number of transcript entries per conversation
    pub history_max: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            debounce_min: Duration::from_millis(3000),
            debounce_max: Duration::from_millis(6000),
            max_wait: Duration::from_secs(20),
            late_join: Duration::from_millis(350),
            state_ttl: Duration::from_secs(6 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            dedup_ttl: Duration::from_secs(10 * 60),
            dedup_max_entries: 500,
            history_max: 40,
        }
    }
}

impl DebounceConfig {
    /// Return a copy with `patch` merged in and the result normalized.
    pub fn apply(&self, patch: &ConfigPatch) -> Self {
        let ms = Duration::from_millis;
        let merged = Self {
            debounce_min: patch.debounce_min_ms.map(ms).unwrap_or(self.debounce_min),
            debounce_max: patch.debounce_max_ms.map(ms).unwrap_or(self.debounce_max),
            max_wait: patch.max_wait_ms.map(ms).unwrap_or(self.max_wait),
            late_join: patch.late_join_ms.map(ms).unwrap_or(self.late_join),
            state_ttl: patch.state_ttl_ms.map(ms).unwrap_or(self.state_ttl),
            sweep_interval: patch.sweep_interval_ms.map(ms).unwrap_or(self.sweep_interval),
            dedup_ttl: patch.dedup_ttl_ms.map(ms).unwrap_or(self.dedup_ttl),
            dedup_max_entries: patch.dedup_max_entries.unwrap_or(self.dedup_max_entries),
            history_max: patch.history_max.unwrap_or(self.history_max),
        };
        merged.normalized()
    }

    /// Swap inverted debounce bounds and clamp every field into a sane range.
    pub fn normalized(mut self) -> Self {
        if self.debounce_min > self.debounce_max {
            std::mem::swap(&mut self.debounce_min, &mut self.debounce_max);
        }
        self.debounce_min = self.debounce_min.min(MAX_DEBOUNCE);
        self.debounce_max = self.debounce_max.min(MAX_DEBOUNCE);
        self.max_wait = self.max_wait.clamp(MIN_TIMER_DELAY, MAX_WAIT_CEILING);
        self.late_join = self.late_join.min(MAX_LATE_JOIN);
        // A record must outlive the longest burst, or the sweeper would take
        // fragments that are still waiting for their flush.
        let longest_burst = self.max_wait + self.late_join + self.debounce_max;
        self.state_ttl = self.state_ttl.max(MIN_STATE_TTL).max(longest_burst);
        self.sweep_interval = self.sweep_interval.max(MIN_TIMER_DELAY);
        self.dedup_max_entries = self.dedup_max_entries.max(1);
        self.history_max = self.history_max.max(1);
        self
    }

    /// Debounce bounds in whole milliseconds, `min <= max`.
    pub fn debounce_range_ms(&self) -> (u64, u64) {
        let lo = self.debounce_min.as_millis() as u64;
        let hi = self.debounce_max.as_millis() as u64;
        (lo.min(hi), lo.max(hi))
    }
}

/// Partial configuration update, expressed in milliseconds and counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub debounce_min_ms: Option<u64>,
    pub debounce_max_ms: Option<u64>,
    pub max_wait_ms: Option<u64>,
    pub late_join_ms: Option<u64>,
    pub state_ttl_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub dedup_ttl_ms: Option<u64>,
    pub dedup_max_entries: Option<usize>,
    pub history_max: Option<usize>,
}

impl ConfigPatch {
    /// Whether the patch changes nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Parse a single `name=value` assignment, e.g. `debounce_min_ms=1500`.
    pub fn parse_assignment(input: &str) -> Result<Self> {
        let (name, value) = input
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("expected name=value, got '{}'", input)))?;
        let name = name.trim();
        let value = value.trim();
        let number: u64 = value
            .parse()
            .map_err(|_| Error::Config(format!("'{}' is not a number for {}", value, name)))?;

        let mut patch = Self::default();
        match name {
            "debounce_min_ms" => patch.debounce_min_ms = Some(number),
            "debounce_max_ms" => patch.debounce_max_ms = Some(number),
            "max_wait_ms" => patch.max_wait_ms = Some(number),
            "late_join_ms" => patch.late_join_ms = Some(number),
            "state_ttl_ms" => patch.state_ttl_ms = Some(number),
            "sweep_interval_ms" => patch.sweep_interval_ms = Some(number),
            "dedup_ttl_ms" => patch.dedup_ttl_ms = Some(number),
            "dedup_max_entries" => patch.dedup_max_entries = Some(number as usize),
            "history_max" => patch.history_max = Some(number as usize),
            other => return Err(Error::Config(format!("unknown setting '{}'", other))),
        }
        Ok(patch)
    }
}
