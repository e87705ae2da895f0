//! funnel - console transport for the inbound debounce engine

mod config;
mod console;
mod input;
mod utils;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use console::{ConsoleHandler, Reply};
use funnel_inbound::{
    ConfigPatch, DebounceConfig, HistoryExtra, InboundEngine, InboundText, Role, SeenStatus,
};
use input::Line;
use utils::format_ms;

/// funnel - coalesce bursts of chat messages into single turns
#[derive(Parser, Debug)]
#[command(name = "funnel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ~/.config/funnel/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Channel name attached to console input
    #[arg(long)]
    channel: Option<String>,

    /// Lower bound of the debounce window, in milliseconds
    #[arg(long)]
    debounce_min_ms: Option<u64>,

    /// Upper bound of the debounce window, in milliseconds
    #[arg(long)]
    debounce_max_ms: Option<u64>,

    /// Hard ceiling on how long a burst may wait, in milliseconds
    #[arg(long)]
    max_wait_ms: Option<u64>,

    /// Late-join pause before draining, in milliseconds
    #[arg(long)]
    late_join_ms: Option<u64>,

    /// Do not acknowledge flushed turns
    #[arg(long)]
    no_reply: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

impl Args {
    /// Command-line timing overrides, layered over the file's.
    fn overlay(&self, mut patch: ConfigPatch) -> ConfigPatch {
        patch.debounce_min_ms = self.debounce_min_ms.or(patch.debounce_min_ms);
        patch.debounce_max_ms = self.debounce_max_ms.or(patch.debounce_max_ms);
        patch.max_wait_ms = self.max_wait_ms.or(patch.max_wait_ms);
        patch.late_join_ms = self.late_join_ms.or(patch.late_join_ms);
        patch
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing; stdout is reserved for the console transcript
    let filter = if args.verbose {
        EnvFilter::new("funnel=debug,funnel_inbound=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    // Load config file
    let cfg = match &args.config {
        Some(path) => config::Config::load_from(path),
        None => config::Config::load(),
    };

    // Merge config with CLI args (CLI takes precedence)
    let channel = args
        .channel
        .clone()
        .or(cfg.channel.clone())
        .unwrap_or_else(|| "console".to_string());
    let auto_reply = !args.no_reply && cfg.auto_reply.unwrap_or(true);
    let engine_config = DebounceConfig::default().apply(&args.overlay(cfg.debounce.clone()));

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();
    let handler = Arc::new(ConsoleHandler::new(auto_reply.then_some(reply_tx)));
    let engine = InboundEngine::new(engine_config, handler)?;

    if args.verbose {
        let mut events = engine.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                tracing::debug!(key = event.key(), "{:?}", event);
            }
        });
    }

    print_banner(&engine.config(), &channel);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(reply) = reply_rx.recv() => {
                engine.push_history(&reply.key, Role::Assistant, reply.text, HistoryExtra::default());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match input::parse_line(&line) {
                    Ok(Line::Quit) => break,
                    Ok(parsed) => handle_line(&engine, &channel, parsed).await,
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
        }
    }

    engine.shutdown();
    Ok(())
}

async fn handle_line(engine: &InboundEngine, channel: &str, line: Line) {
    match line {
        Line::Message {
            key,
            external_id,
            text,
        } => {
            if let Some(id) = &external_id {
                if engine.mark_inbound_seen(&key, id) == SeenStatus::Duplicate {
                    println!("(duplicate {} ignored)", id);
                    return;
                }
            }

            engine.push_history(
                &key,
                Role::User,
                text.clone(),
                HistoryExtra {
                    external_id: external_id.clone(),
                    metadata: None,
                },
            );

            let mut inbound = InboundText::new(key, text).with_channel(channel);
            if let Some(id) = external_id {
                inbound = inbound.with_id(id);
            }
            if !engine.enqueue_inbound_text(inbound) {
                eprintln!("Error: message not queued");
            }
        }
        Line::Set(patch) => {
            let config = engine.update_config(&patch);
            print_timing(&config);
        }
        Line::Flush(key) => engine.flush_now(&key).await,
        Line::History(key) => match engine.transcript(&key) {
            Some(entries) if !entries.is_empty() => {
                for entry in &entries {
                    println!("{}", console::render_entry(entry));
                }
            }
            Some(_) => println!("(no history for {})", key),
            None => println!("(unknown conversation {})", key),
        },
        Line::State(key) => match engine.snapshot(&key) {
            Some(snapshot) => match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Error: {}", e),
            },
            None => println!("(unknown conversation {})", key),
        },
        Line::Help => println!("{}", input::help()),
        Line::Empty | Line::Quit => {}
    }
}

fn print_banner(config: &DebounceConfig, channel: &str) {
    println!("funnel v{}", env!("CARGO_PKG_VERSION"));
    println!("Channel: {}", channel);
    print_timing(config);
    println!("Type /help for commands, /quit to exit\n");
}

fn print_timing(config: &DebounceConfig) {
    let (lo, hi) = config.debounce_range_ms();
    println!(
        "Debounce: {}-{} · max wait {} · late join {}",
        format_ms(lo),
        format_ms(hi),
        format_ms(config.max_wait.as_millis() as u64),
        format_ms(config.late_join.as_millis() as u64),
    );
}
