//! Error Handling Module
//!
//! Defines the error taxonomy for the self-training scheduler.
//! Uses thiserror for ergonomic error definitions.
//!
//! Configuration errors are fatal for a training run; everything else is a
//! per-round failure the round driver may recover from.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for bag/instance self-training operations
#[derive(Error, Debug)]
pub enum MilError {
    /// Misconfiguration that must abort the run (bad ratios, empty sampler pools, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error with bag store construction or tabular ingestion
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error reported by an encoder or aggregator during a round
    #[error("Training error: {0}")]
    Training(String),

    /// Checkpoint could not be written or read
    #[error("Checkpoint error at '{0}': {1}")]
    Checkpoint(PathBuf, String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MilError {
    /// Whether this error is a fatal configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, MilError::Config(_))
    }
}

impl From<serde_json::Error> for MilError {
    fn from(err: serde_json::Error) -> Self {
        MilError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MilError {
    fn from(err: toml::de::Error) -> Self {
        MilError::Config(format!("invalid TOML: {}", err))
    }
}

impl From<toml::ser::Error> for MilError {
    fn from(err: toml::ser::Error) -> Self {
        MilError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for MilError {
    fn from(err: csv::Error) -> Self {
        MilError::Dataset(format!("CSV: {}", err))
    }
}

/// Convenience Result type for self-training operations
pub type Result<T> = std::result::Result<T, MilError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| MilError::InvalidInput(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| MilError::InvalidInput(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| MilError::InvalidInput(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| MilError::InvalidInput(f()))
    }
}
