//! Configuration file support

use funnel_inbound::ConfigPatch;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Configuration for funnel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Channel name reported for console input
    pub channel: Option<String>,
    /// Whether the console handler acknowledges each turn
    pub auto_reply: Option<bool>,
    /// Timing overrides for the inbound engine
    pub debounce: ConfigPatch,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("funnel")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for FUNNEL_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("FUNNEL_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a specific path, falling back to defaults
    pub fn load_from(path: &PathBuf) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parse config from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            channel: Some("console".to_string()),
            auto_reply: Some(true),
            debounce: ConfigPatch {
                debounce_min_ms: Some(3000),
                debounce_max_ms: Some(6000),
                max_wait_ms: Some(20000),
                late_join_ms: Some(350),
                ..Default::default()
            },
        };

        default_config.save()?;
        Ok(path)
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# funnel configuration file
# Place at ~/.config/funnel/config.toml (Linux/Mac) or %APPDATA%\funnel\config.toml (Windows)
# or point FUNNEL_CONFIG_PATH at it.

# Channel name attached to console input
channel = "console"

# Acknowledge every flushed turn with an assistant line
auto_reply = true

# Inbound engine timing (milliseconds unless noted)
[debounce]
debounce_min_ms = 3000
debounce_max_ms = 6000
max_wait_ms = 20000
late_join_ms = 350
# state_ttl_ms = 21600000
# sweep_interval_ms = 60000
# dedup_ttl_ms = 600000
# dedup_max_entries = 500
# history_max = 40
"#
}
