//! Console turn handler: prints flushed turns and queues acknowledgements

use async_trait::async_trait;
use funnel_inbound::{FlushPayload, HistoryEntry, Result, TurnHandler};
use tokio::sync::mpsc;

use crate::utils::truncate_chars;

/// An assistant line to record in a conversation's transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub key: String,
    pub text: String,
}

/// Prints each turn to stdout and, when enabled, answers it.
///
/// Replies go back to the main loop, which records them in the transcript,
/// the same way a real transport records outbound messages.
pub struct ConsoleHandler {
    replies: Option<mpsc::UnboundedSender<Reply>>,
}

impl ConsoleHandler {
    pub fn new(replies: Option<mpsc::UnboundedSender<Reply>>) -> Self {
        Self { replies }
    }
}

/// Render a flushed turn for the console.
pub fn render_turn(payload: &FlushPayload) -> String {
    let mut out = format!(
        "── turn {} · {} · burst {} · {} fragment(s) · {} after {}ms",
        truncate_chars(&payload.turn_id.to_string(), 8),
        payload.key,
        payload.burst_id,
        payload.items.len(),
        payload.timing.reason,
        payload.timing.waited_ms,
    );
    if let Some(reply_to) = &payload.reply_to {
        out.push_str(&format!(" · reply-to {}", reply_to));
    }
    if !payload.history.is_empty() {
        out.push_str("\n   context:");
        for line in payload.history.lines() {
            out.push_str("\n     ");
            out.push_str(&truncate_chars(line, 120));
        }
    }
    for item in &payload.items {
        out.push_str("\n   > ");
        out.push_str(&item.text);
    }
    out
}

/// Render one transcript entry as `HH:MM:SS [Role] text (#id)`.
pub fn render_entry(entry: &HistoryEntry) -> String {
    let mut out = format!(
        "{} [{}] {}",
        entry.recorded_at.format("%H:%M:%S"),
        entry.role.label(),
        entry.text
    );
    if let Some(id) = &entry.external_id {
        out.push_str(&format!(" (#{})", id));
    }
    if let Some(metadata) = &entry.metadata {
        out.push_str(&format!(" {}", metadata));
    }
    out
}

#[async_trait]
impl TurnHandler for ConsoleHandler {
    async fn on_flush_block(&self, payload: FlushPayload) -> Result<()> {
        println!("{}", render_turn(&payload));

        if let Some(replies) = &self.replies {
            let text = format!(
                "Recebi {} mensagem(ns): \"{}\"",
                payload.items.len(),
                truncate_chars(&payload.last_text, 60)
            );
            println!("   < {}", text);
            // The main loop may already be gone during shutdown.
            let _ = replies.send(Reply {
                key: payload.key,
                text,
            });
        }
        Ok(())
    }
}
