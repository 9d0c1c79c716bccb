//! Error types shared by every Cadence crate.

use thiserror::Error;

/// Unified error type.
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CadenceError {
    /// Shorthand for a database error with context.
    pub fn db(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Database(format!("{context}: {err}"))
    }

    /// Shorthand for a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
