//! Configuration file support for courier
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/courier/config.toml`
//! - macOS: `~/Library/Application Support/courier/config.toml`
//! - Windows: `%APPDATA%\courier\config.toml`

use crate::error::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default simulated latency before a normal message is handled.
pub const DEFAULT_NORMAL_DELAY: Duration = Duration::from_secs(1);

/// Default number of pool workers for normal messages.
pub const DEFAULT_WORKERS: usize = 4;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix for the names of threads the dispatcher spawns
    pub thread_name: String,
    /// Queue settings
    pub queue: QueueSettings,
    /// Normal-path executor settings
    pub normal: NormalSettings,
    /// Shutdown settings
    pub shutdown: ShutdownSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_name: "courier".to_string(),
            queue: QueueSettings::default(),
            normal: NormalSettings::default(),
            shutdown: ShutdownSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::from_file(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration from a specific file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::config_path() {
            Ok(path) => Self::from_file_or_default(&path),
            Err(e) => {
                log::warn!("Using default config: {}", e);
                Self::default()
            }
        }
    }

    /// Load `path`, falling back to defaults.
    ///
    /// A missing file is silent. Unreadable, malformed or invalid files are
    /// logged at `warn` before the defaults are used.
    pub fn from_file_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring config at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "courier") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        Self::write_default_config_file(&path)?;
        Ok(path)
    }

    /// Write the commented default config to `path`
    pub fn write_default_config_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG_TOML)?;
        Ok(())
    }

    /// Reject settings the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == Some(0) {
            return Err(Error::Config("queue.capacity must be at least 1".to_string()));
        }
        if self.normal.mode == NormalMode::Pool && self.normal.workers == 0 {
            return Err(Error::Config("normal.workers must be at least 1".to_string()));
        }
        if self.thread_name.is_empty() {
            return Err(Error::Config("thread_name must not be empty".to_string()));
        }
        Ok(())
    }
}

const DEFAULT_CONFIG_TOML: &str = r#"# courier configuration file

# Prefix for dispatcher thread names
thread_name = "courier"

[queue]
# Maximum number of pending messages. Omit for an unbounded queue.
# capacity = 1024

# What post does when a bounded queue is full: "reject" or "block"
overflow = "reject"

[normal]
# Executor for normal messages:
#   "pool"     - fixed set of worker threads, joined on shutdown
#   "detached" - one untracked thread per message
mode = "pool"

# Number of pool workers
workers = 4

# Simulated latency before a normal message is handled
delay = "1s"

[shutdown]
# "discard" drops pending work on shutdown, "drain" finishes it first
policy = "discard"
"#;

/// What `post` does when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Fail with [`Error::QueueSaturated`]
    #[default]
    Reject,
    /// Wait until the consumer makes room
    Block,
}

/// Queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum pending messages, `None` for unbounded
    pub capacity: Option<usize>,
    /// Behaviour of `post` when the queue is full
    pub overflow: OverflowPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::Reject,
        }
    }
}

/// Executor used for normal messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalMode {
    /// Bounded pool owned and joined by the dispatcher
    #[default]
    Pool,
    /// One detached thread per message, never joined
    Detached,
}

/// Normal-path executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalSettings {
    /// Executor type
    pub mode: NormalMode,
    /// Number of pool workers (ignored in detached mode)
    pub workers: usize,
    /// Simulated latency before handling
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub delay: Duration,
}

impl Default for NormalSettings {
    fn default() -> Self {
        Self {
            mode: NormalMode::Pool,
            workers: DEFAULT_WORKERS,
            delay: DEFAULT_NORMAL_DELAY,
        }
    }
}

/// What happens to pending work on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Drop queued messages and cancel pool jobs that have not started handling
    #[default]
    Discard,
    /// Handle every queued message and pool job before stopping
    Drain,
}

/// Shutdown settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    pub policy: ShutdownPolicy,
}

/// Parse a human readable duration such as `"250ms"` or `"1s"`
pub fn parse_duration(s: &str) -> Result<Duration> {
    Ok(humantime::parse_duration(s.trim())?)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}
