//! # Lodestar Gateway
//!
//! Registry-aware API gateway.
//!
//! ## Features
//!
//! - **Routes** - Ordered predicates over path, headers and method; first match wins
//! - **Filters** - Path rewriting, header edits and rate limiting per route
//! - **Load Balancing** - Round-robin, random or least-connections over UP instances
//! - **Retries** - Per-attempt timeouts, retry on connection failure or timeout
//! - **Snapshot Cache** - Registry contents refreshed in the background, never on the request path
//! - **Discovery Locator** - Optional `/{service}/**` routing for unrouted services
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lodestar_gateway::{GatewayConfig, GatewayServer, PredicateDefinition, RouteDefinition};
//! use lodestar_registry::RegistryClient;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::new().route(
//!     RouteDefinition::new(
//!         "files",
//!         PredicateDefinition::path_prefix("/files"),
//!         "file-storage-service",
//!     )
//!     .filter("PrefixPath=/api"),
//! );
//!
//! let server = GatewayServer::from_config(&config)?;
//! let registry = RegistryClient::new(&config.registry_url, Duration::from_secs(2))?;
//!
//! let shutdown = CancellationToken::new();
//! server.start_refresh(Arc::new(registry), config.refresh_period(), shutdown.clone());
//!
//! let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
//! server.serve(listener, shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod forward;
pub mod retry;
pub mod route;
pub mod server;
pub mod snapshot;

pub use balancer::{ConnectionGuard, LoadBalanceStrategy, LoadBalancer};
pub use config::GatewayConfig;
pub use context::{DispatchState, GatewayRequest, GatewayResponse, RequestContext};
pub use dispatcher::Dispatcher;
pub use error::{GatewayError, Result};
pub use filter::{FilterOutcome, GatewayFilter, parse_filter};
pub use forward::{ForwardError, Forwarder, HttpForwarder};
pub use retry::{BackoffConfig, BackoffStrategy, RetryPolicy};
pub use route::{CompiledRoute, Predicate, PredicateDefinition, RouteDefinition, RouteTable};
pub use server::GatewayServer;
pub use snapshot::{SnapshotCache, SnapshotSource};

pub mod prelude {
    pub use crate::config::GatewayConfig;
    pub use crate::context::{GatewayRequest, GatewayResponse};
    pub use crate::dispatcher::Dispatcher;
    pub use crate::error::{GatewayError, Result};
    pub use crate::route::{PredicateDefinition, RouteDefinition, RouteTable};
    pub use crate::server::GatewayServer;
    pub use crate::snapshot::{SnapshotCache, SnapshotSource};
}
