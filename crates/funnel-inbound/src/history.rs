//! Transcript snapshots handed to the turn handler

use std::collections::HashSet;

use tokio::time::Instant;

use crate::conversation::HistoryEntry;

/// Filters applied when rendering a transcript
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery<'a> {
    /// Ids of messages that must not appear (the batch being flushed)
    pub exclude_ids: Option<&'a HashSet<String>>,
    /// Ignore entries recorded after this instant
    pub max_at: Option<Instant>,
}

/// Render `history` as role-tagged lines, oldest first.
///
/// Never mutates the transcript.
pub fn build<'h>(
    history: impl IntoIterator<Item = &'h HistoryEntry>,
    query: &HistoryQuery<'_>,
) -> String {
    let mut out = String::new();

    for entry in history {
        let excluded = match (&entry.external_id, query.exclude_ids) {
            (Some(id), Some(exclude)) => exclude.contains(id),
            _ => false,
        };
        if excluded {
            continue;
        }
        if query.max_at.is_some_and(|cutoff| entry.at > cutoff) {
            continue;
        }
        let text = entry.text.trim();
        if text.is_empty() {
            continue;
        }

        if !out.is_empty() {
            out.push('\n');
        }
        out.push('[');
        out.push_str(entry.role.label());
        out.push_str("]: ");
        out.push_str(text);
    }

    out
}
