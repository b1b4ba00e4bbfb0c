//! Error Handling Module
//!
//! Defines the error type shared by every layer of the trainer.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for Semixup operations
#[derive(Error, Debug)]
pub enum SemixupError {
    /// Error loading or decoding an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with the sample population or data streams
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error while generating or loading a fold split
    #[error("Split error: {0}")]
    Split(String),

    /// Error with model construction or parameter snapshots
    #[error("Model error: {0}")]
    Model(String),

    /// Error raised inside a training or validation step
    #[error("Training error: {0}")]
    Training(String),

    /// Configuration error (fatal, detected before training starts)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stream referenced by the sampling configuration does not exist
    #[error("Unknown data stream '{0}'")]
    MissingStream(String),

    /// Error reading or writing a checkpoint
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor data could not be converted
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience Result type for Semixup operations
pub type Result<T> = std::result::Result<T, SemixupError>;

impl From<serde_json::Error> for SemixupError {
    fn from(err: serde_json::Error) -> Self {
        SemixupError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SemixupError {
    fn from(err: toml::de::Error) -> Self {
        SemixupError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for SemixupError {
    fn from(err: toml::ser::Error) -> Self {
        SemixupError::Serialization(err.to_string())
    }
}

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| SemixupError::Dataset(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| SemixupError::Dataset(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| SemixupError::Dataset(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| SemixupError::Dataset(f()))
    }
}
