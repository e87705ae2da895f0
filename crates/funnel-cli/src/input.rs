//! Console line parsing
//!
//! Each line is either a slash command or an inbound message:
//!
//! ```text
//! 5511999 oi                 message for conversation 5511999
//! 5511999 #wamid.42 oi       same, carrying a transport message id
//! /set max_wait_ms=8000      hot-update engine timing
//! /flush 5511999             flush a conversation now
//! /history 5511999           print a transcript
//! /state 5511999             print conversation diagnostics
//! /quit
//! ```

use funnel_inbound::ConfigPatch;

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Message {
        key: String,
        external_id: Option<String>,
        text: String,
    },
    Set(ConfigPatch),
    Flush(String),
    History(String),
    State(String),
    Help,
    Quit,
    Empty,
}

/// Parse one console line.
pub fn parse_line(line: &str) -> Result<Line, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Line::Empty);
    }

    if let Some(command) = line.strip_prefix('/') {
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        return match name {
            "set" => ConfigPatch::parse_assignment(arg)
                .map(Line::Set)
                .map_err(|e| e.to_string()),
            "flush" => require_key(arg).map(Line::Flush),
            "history" => require_key(arg).map(Line::History),
            "state" => require_key(arg).map(Line::State),
            "help" => Ok(Line::Help),
            "quit" | "exit" => Ok(Line::Quit),
            other => Err(format!("Unknown command: /{}", other)),
        };
    }

    let (key, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("Expected '<key> <text>', got '{}'", line))?;
    let rest = rest.trim_start();

    let (external_id, text) = match rest.strip_prefix('#') {
        Some(tagged) => match tagged.split_once(char::is_whitespace) {
            Some((id, text)) => (Some(id.to_string()), text.trim_start()),
            None => return Err("Message id given without text".to_string()),
        },
        None => (None, rest),
    };

    Ok(Line::Message {
        key: key.to_string(),
        external_id,
        text: text.to_string(),
    })
}

fn require_key(arg: &str) -> Result<String, String> {
    if arg.is_empty() {
        Err("Missing conversation key".to_string())
    } else {
        Ok(arg.to_string())
    }
}

/// Help text for the console
pub fn help() -> &'static str {
    "Lines:  <key> [#id] <text>   queue an inbound message\n\
     /set <name>=<value>          update engine timing (e.g. max_wait_ms=8000)\n\
     /flush <key>                 flush a conversation now\n\
     /history <key>               print a conversation transcript\n\
     /state <key>                 print conversation diagnostics\n\
     /quit                        exit"
}
