//! Errors raised while assembling configuration

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no configuration value at '{0}'")]
    Missing(String),

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot tell the format of {0}; use a .toml or .json extension")]
    UnknownFormat(PathBuf),

    #[error("malformed {format} configuration: {message}")]
    Malformed { format: &'static str, message: String },

    #[error("'{key}' does not match its expected shape: {message}")]
    Shape { key: String, message: String },

    #[error("invalid {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("cannot load .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
}

impl ConfigError {
    /// Validation failure on a named field
    pub fn invalid(field: &str, message: impl std::fmt::Display) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn shape(key: &str, err: serde_json::Error) -> Self {
        Self::Shape {
            key: if key.is_empty() { "<root>".to_string() } else { key.to_string() },
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
