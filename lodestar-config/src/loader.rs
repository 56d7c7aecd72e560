//! File formats understood by [`ConfigManager`](crate::ConfigManager)

use crate::{ConfigError, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    /// Format for a file name, judged by extension
    pub fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("toml") {
            Some(Self::Toml)
        } else if ext.eq_ignore_ascii_case("json") {
            Some(Self::Json)
        } else {
            None
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Json => "JSON",
            Self::Toml => "TOML",
        }
    }
}

/// Turns file contents into the JSON tree the manager layers
#[derive(Debug, Clone, Copy)]
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    /// Loader for whatever format the extension names
    pub fn for_path(path: &Path) -> Result<Self> {
        FileFormat::of(path)
            .map(Self::new)
            .ok_or_else(|| ConfigError::UnknownFormat(path.to_path_buf()))
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn read(&self, path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse(&content)
    }

    pub fn parse(&self, content: &str) -> Result<Value> {
        let malformed = |message: String| ConfigError::Malformed {
            format: self.format.name(),
            message,
        };
        match self.format {
            FileFormat::Json => serde_json::from_str(content).map_err(|e| malformed(e.to_string())),
            // TOML datetimes have no JSON counterpart; everything else maps 1:1
            FileFormat::Toml => toml::from_str::<toml::Value>(content)
                .map_err(|e| malformed(e.message().to_string()))
                .and_then(|v| serde_json::to_value(v).map_err(|e| malformed(e.to_string()))),
        }
    }
}
