//! # Lodestar
//!
//! A lease-based service registry and a registry-aware API gateway.
//!
//! Services register `host:port` under a name and renew a lease with
//! periodic heartbeats. The registry evicts instances whose lease lapses,
//! unless renewals collapse across the board, in which case it assumes a
//! network problem and stops evicting (self-preservation). The gateway
//! matches requests against ordered routes, picks an UP instance from a
//! cached registry snapshot and forwards, retrying on connection failures
//! and timeouts.
//!
//! ## Crates
//!
//! | crate              | re-exported as | contents                                  |
//! |--------------------|----------------|-------------------------------------------|
//! | `lodestar-registry`| [`registry`]   | store, leases, HTTP API, client, heartbeat|
//! | `lodestar-gateway` | [`gateway`]    | routes, filters, balancing, dispatch      |
//! | `lodestar-config`  | [`config`]     | layered file and environment config       |
//! | `lodestar-log`     | [`log`]        | `tracing` subscriber setup                |
//!
//! ## Example
//!
//! ```rust,no_run
//! use lodestar::app::{load_config, serve_standalone};
//! use lodestar::gateway::GatewayConfig;
//! use lodestar::registry::RegistryConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = load_config(None)?;
//! let registry: RegistryConfig = manager.section("registry")?;
//! let gateway: GatewayConfig = manager.section("gateway")?;
//!
//! let registry_listener = tokio::net::TcpListener::bind(registry.bind_address()).await?;
//! let gateway_listener = tokio::net::TcpListener::bind(gateway.bind_address()).await?;
//!
//! serve_standalone(
//!     registry,
//!     gateway,
//!     registry_listener,
//!     gateway_listener,
//!     CancellationToken::new(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod app;

pub use lodestar_config as config;
pub use lodestar_gateway as gateway;
pub use lodestar_log as log;
pub use lodestar_registry as registry;

pub use app::{AppError, AppResult};

pub mod prelude {
    pub use crate::app::{AppError, AppResult, load_config};
    pub use lodestar_gateway::prelude::{
        Dispatcher, GatewayConfig, GatewayError, GatewayRequest, GatewayResponse, GatewayServer,
        PredicateDefinition, RouteDefinition, RouteTable, SnapshotCache, SnapshotSource,
    };
    pub use lodestar_registry::prelude::{
        HeartbeatAgent, InstanceStatus, Registration, RegistryClient, RegistryConfig,
        RegistryError, RegistryService, RegistrySnapshot, ServiceInstance, StatusFilter,
    };
}
