//! Error types for courier

use thiserror::Error;

/// Result type alias for courier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in courier
#[derive(Debug, Error)]
pub enum Error {
    /// Bounded queue is full and the overflow policy rejects new messages
    #[error("Queue saturated: {capacity} messages pending")]
    QueueSaturated { capacity: usize },

    /// The dispatcher has been shut down
    #[error("Dispatcher is closed")]
    Closed,

    /// A dispatcher thread could not be started
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Duration string could not be parsed
    #[error("Invalid duration: {0}")]
    Duration(#[from] humantime::DurationError),
}
