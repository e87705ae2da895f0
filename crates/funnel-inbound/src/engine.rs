//! Inbound engine: the entry point used by the transport and admin layers

use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigPatch, DebounceConfig};
use crate::conversation::{ConversationSnapshot, HistoryEntry, HistoryExtra, Role};
use crate::dedup::SeenStatus;
use crate::error::{Error, Result};
use crate::events::InboundEvent;
use crate::handler::{BoxedHandler, FlushReason};
use crate::history::{self, HistoryQuery};
use crate::scheduler::{self, Jitter, NewFragment, RandomJitter};
use crate::store::{ConversationKeyStore, SweptRecord};

/// An inbound text message, as reported by a transport
#[derive(Debug, Clone, Default)]
pub struct InboundText {
    /// Conversation key, e.g. the sender's phone number
    pub key: String,
    /// Channel the message came through
    pub channel_hint: Option<String>,
    pub text: String,
    /// Transport message id, used for dedup and reply-to
    pub external_id: Option<String>,
}

impl InboundText {
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel_hint = Some(channel.into());
        self
    }
}

/// State shared by the engine handle, its timers and its sweeper.
pub(crate) struct Shared {
    pub(crate) store: ConversationKeyStore,
    pub(crate) jitter: Arc<dyn Jitter>,
    pub(crate) handler: BoxedHandler,
    pub(crate) runtime: Handle,
    events: broadcast::Sender<InboundEvent>,
    cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn emit(&self, event: InboundEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn sweep_expired(&self) -> Vec<SweptRecord> {
        let swept = self.store.sweep(Instant::now());
        for record in &swept {
            tracing::debug!(
                "Expired conversation {} swept ({} history entries)",
                record.key,
                record.history_len
            );
            self.emit(InboundEvent::Swept {
                key: record.key.clone(),
                history_len: record.history_len,
            });
        }
        swept
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Debounces inbound messages per conversation and hands merged turns to a
/// [`TurnHandler`](crate::TurnHandler).
///
/// Cloning is cheap; all clones drive the same engine.
#[derive(Clone)]
pub struct InboundEngine {
    shared: Arc<Shared>,
}

impl InboundEngine {
    /// Create an engine using random jitter.
    ///
    /// Must be called from within a tokio runtime; timers and the expiry
    /// sweeper run on that runtime.
    pub fn new(config: DebounceConfig, handler: BoxedHandler) -> Result<Self> {
        Self::with_jitter(config, handler, Arc::new(RandomJitter))
    }

    /// Create an engine with an explicit jitter source.
    pub fn with_jitter(
        config: DebounceConfig,
        handler: BoxedHandler,
        jitter: Arc<dyn Jitter>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Other(format!("inbound engine needs a tokio runtime: {}", e)))?;
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            store: ConversationKeyStore::new(config),
            jitter,
            handler,
            runtime: runtime.clone(),
            events,
            cancel: CancellationToken::new(),
        });

        runtime.spawn(run_sweeper(Arc::downgrade(&shared), shared.cancel.clone()));
        Ok(Self { shared })
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.shared.events.subscribe()
    }

    /// Current timing configuration
    pub fn config(&self) -> DebounceConfig {
        self.shared.store.config()
    }

    /// Hot-swap timing parameters. Applies to the next scheduling decision.
    pub fn update_config(&self, patch: &ConfigPatch) -> DebounceConfig {
        let config = self.shared.store.update_config(patch);
        tracing::debug!("Inbound config updated: {:?}", config);
        config
    }

    /// Queue an inbound text for its conversation (fire-and-forget).
    ///
    /// Returns `false` if the text was blank and ignored.
    pub fn enqueue_inbound_text(&self, inbound: InboundText) -> bool {
        scheduler::enqueue(
            &self.shared,
            &inbound.key,
            NewFragment {
                text: inbound.text,
                external_id: inbound.external_id,
                source_channel: inbound.channel_hint,
            },
        )
    }

    /// Record a transport message id; call before enqueueing to drop redeliveries.
    pub fn mark_inbound_seen(&self, key: &str, external_id: &str) -> SeenStatus {
        let config = self.shared.store.config();
        let state = self.shared.store.get_or_create(key);
        let status = state.lock().seen_ids.check_and_insert(
            external_id,
            Instant::now(),
            config.dedup_ttl,
            config.dedup_max_entries,
        );
        if status.is_duplicate() {
            tracing::debug!("Duplicate inbound {} for {}", external_id, key);
        }
        status
    }

    /// Append to the conversation transcript used for history snapshots.
    pub fn push_history(&self, key: &str, role: Role, text: impl Into<String>, extra: HistoryExtra) {
        let max_len = self.shared.store.config().history_max;
        let state = self.shared.store.get_or_create(key);
        state.lock().push_history(
            HistoryEntry {
                role,
                text: text.into(),
                external_id: extra.external_id.filter(|id| !id.is_empty()),
                metadata: extra.metadata,
                at: Instant::now(),
                recorded_at: Utc::now(),
            },
            max_len,
        );
    }

    /// Render the current transcript of `key`, if the conversation exists.
    pub fn history(&self, key: &str) -> Option<String> {
        let state = self.shared.store.get(key)?;
        let state = state.lock();
        Some(history::build(&state.history, &HistoryQuery::default()))
    }

    /// Transcript entries of `key`, oldest first, with their metadata.
    pub fn transcript(&self, key: &str) -> Option<Vec<HistoryEntry>> {
        let state = self.shared.store.get(key)?;
        let entries = state.lock().history.iter().cloned().collect();
        Some(entries)
    }

    /// Flush `key` right away, skipping the late-join window.
    ///
    /// If a turn is already running the request is folded into it, exactly as
    /// a timer firing would be.
    pub async fn flush_now(&self, key: &str) {
        crate::flush::flush(&self.shared, key, FlushReason::Manual).await;
    }

    /// Diagnostics for one conversation
    pub fn snapshot(&self, key: &str) -> Option<ConversationSnapshot> {
        let state = self.shared.store.get(key)?;
        let snapshot = state.lock().snapshot();
        Some(snapshot)
    }

    /// Keys of every live conversation record
    pub fn conversations(&self) -> Vec<String> {
        self.shared.store.keys()
    }

    /// Remove expired conversation records now instead of waiting for the sweeper.
    pub fn sweep_expired(&self) -> Vec<SweptRecord> {
        self.shared.sweep_expired()
    }

    /// Stop the sweeper and disarm every timer. Turns already running finish;
    /// unflushed fragments are dropped.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.store.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }
}

async fn run_sweeper(shared: Weak<Shared>, cancel: CancellationToken) {
    loop {
        let interval = match shared.upgrade() {
            Some(shared) => shared.store.config().sweep_interval,
            None => return,
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.sweep_expired();
    }
}
