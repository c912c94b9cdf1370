//! Error types for model loading and validation.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The model file could not be read.
    #[error("failed to read model {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The model is not valid TOML or does not match the schema.
    #[error("invalid model: {0}")]
    Parse(String),

    /// The model parsed but violates one or more structural rules.
    #[error("invalid model: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A size string such as `10G` could not be parsed.
    #[error("invalid size '{value}': {reason}")]
    InvalidSize { value: String, reason: &'static str },
}

impl From<toml::de::Error> for ModelError {
    fn from(err: toml::de::Error) -> Self {
        ModelError::Parse(err.to_string())
    }
}

pub type ModelResult<T> = Result<T, ModelError>;
