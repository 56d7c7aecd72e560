//! Gateway error types

use http::StatusCode;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur while routing or forwarding a request
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No route matched the request
    #[error("No route for {method} {path}")]
    NoRoute { method: String, path: String },

    /// The target service has no UP instance in the current snapshot
    #[error("No available instance for service '{service}'")]
    NoInstances { service: String },

    /// Every attempt failed to connect
    #[error("Bad gateway for service '{service}' after {attempts} attempt(s): {message}")]
    BadGateway {
        service: String,
        attempts: u32,
        message: String,
    },

    /// Every attempt timed out
    #[error("Gateway timeout for service '{service}' after {attempts} attempt(s)")]
    GatewayTimeout { service: String, attempts: u32 },

    /// The request was cancelled before it completed
    #[error("Request cancelled")]
    Cancelled,

    /// The inbound request could not be read
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Route configuration that cannot be compiled
    #[error("Invalid route '{route}': {reason}")]
    InvalidRoute { route: String, reason: String },

    /// Unknown or malformed filter declaration
    #[error("Invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// Registry access failed
    #[error("Registry error: {0}")]
    Registry(#[from] lodestar_registry::RegistryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] lodestar_config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    /// Create an invalid route error
    pub fn invalid_route(route: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRoute {
            route: route.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid filter error
    pub fn invalid_filter(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    /// Status code returned to the caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoRoute { .. } => StatusCode::NOT_FOUND,
            Self::NoInstances { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            // nginx's "client closed request"
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors that must stop the gateway from starting
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidRoute { .. } | Self::InvalidFilter { .. } | Self::Config(_)
        )
    }

    /// Transient conditions a caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoInstances { .. } | Self::BadGateway { .. } | Self::GatewayTimeout { .. }
        )
    }
}
