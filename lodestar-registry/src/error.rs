//! Error types for the registry
//!
//! Covers the registry operations themselves, the HTTP API mapping and the
//! remote client used by heartbeat agents and gateways.

use thiserror::Error;

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No live lease exists for the instance
    #[error("Instance not found: {service}/{instance_id}")]
    NotFound {
        service: String,
        instance_id: String,
    },

    /// Registration payload failed validation
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// Lease data the sweeper cannot reason about
    #[error("Malformed lease for {key}: {reason}")]
    MalformedLease { key: String, reason: String },

    /// Unparseable request sent to the HTTP API
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request body over the API's size limit
    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// The remote registry answered with an unexpected status
    #[error("Registry responded with {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    /// API route table could not be built
    #[error("Route error: {0}")]
    Route(#[from] matchit::InsertError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] lodestar_config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    /// Create a not-found error
    pub fn not_found(service: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self::NotFound {
            service: service.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Create an invalid registration error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRegistration(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if a client should simply try again on its next tick
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::UnexpectedStatus { status, .. } => *status >= 500,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// HTTP status code reported by the registry API
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::InvalidRegistration(_) | Self::BadRequest(_) | Self::Json(_) => 400,
            Self::PayloadTooLarge(_) => 413,
            Self::UnexpectedStatus { status, .. } => *status,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = RegistryError::not_found("file-storage-service", "fs-1");
        assert_eq!(
            err.to_string(),
            "Instance not found: file-storage-service/fs-1"
        );
        assert!(err.is_not_found());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RegistryError::not_found("a", "b").status_code(), 404);
        assert_eq!(RegistryError::invalid("port").status_code(), 400);
        assert_eq!(RegistryError::PayloadTooLarge(1024).status_code(), 413);
        assert_eq!(
            RegistryError::MalformedLease {
                key: "a/b".into(),
                reason: "future heartbeat".into()
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn test_invalid_is_not_recoverable() {
        assert!(!RegistryError::invalid("empty service name").is_recoverable());
        assert!(
            RegistryError::UnexpectedStatus {
                status: 503,
                message: String::new()
            }
            .is_recoverable()
        );
    }
}
