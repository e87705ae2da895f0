//! funnel-inbound: debounce and coalescing of inbound chat messages
//!
//! Users type in bursts ("oi", "tudo bem?", "quanto custa?"). This crate
//! collects the fragments of each conversation into a single turn, hands the
//! turn to a [`TurnHandler`], and guarantees that no fragment is lost, no turn
//! runs twice concurrently for the same conversation, and no burst waits longer
//! than the configured max-wait.

pub mod config;
pub mod conversation;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod events;
mod flush;
pub mod handler;
pub mod history;
pub mod scheduler;
pub mod store;

pub use config::{ConfigPatch, DebounceConfig};
pub use conversation::{ConversationSnapshot, FlushPhase, HistoryEntry, HistoryExtra, Role};
pub use dedup::SeenStatus;
pub use engine::{InboundEngine, InboundText};
pub use error::{Error, Result};
pub use events::InboundEvent;
pub use handler::{BatchItem, BoxedHandler, FlushPayload, FlushReason, FlushTiming, TurnHandler};
pub use scheduler::{FixedJitter, Jitter, RandomJitter};
