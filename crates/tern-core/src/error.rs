use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("subscriber lagged behind, {0} events dropped")]
    Lagged(u64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}
