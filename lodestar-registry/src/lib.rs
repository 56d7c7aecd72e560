//! # Lodestar Registry
//!
//! Lease-based registry of service instances.
//!
//! ## Features
//!
//! - **Registration** - Instances announce `host:port` and metadata under a service name
//! - **Leases** - Heartbeats keep an instance alive; missed ones expire it
//! - **Self-Preservation** - Eviction stops when renewals collapse registry-wide
//! - **Status Overrides** - Drain an instance with `OUT_OF_SERVICE`
//! - **HTTP API** - Eureka-style REST surface plus a client and heartbeat agent
//!
//! ## Quick Start
//!
//! ```rust
//! use lodestar_registry::{Registration, RegistryConfig, RegistryService};
//!
//! let registry = RegistryService::new(RegistryConfig::default());
//!
//! registry
//!     .register(Registration::new("file-storage-service", "fs-1", "10.0.0.1", 8081))
//!     .unwrap();
//!
//! // Instances start out STARTING and become UP on their first renewal
//! assert!(registry.query("file-storage-service").is_empty());
//! registry.renew("file-storage-service", "fs-1").unwrap();
//! assert_eq!(registry.query("file-storage-service").len(), 1);
//! ```
//!
//! ## Running the Server
//!
//! ```rust,no_run
//! use lodestar_registry::{RegistryConfig, RegistryServer, RegistryService};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RegistryConfig::default();
//! let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
//! let registry = Arc::new(RegistryService::new(config));
//!
//! let shutdown = CancellationToken::new();
//! registry.start_eviction(shutdown.clone());
//! RegistryServer::new(registry)?.serve(listener, shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod instance;
pub mod lease;
pub mod service;
pub mod store;

pub use client::{Heartbeat, HeartbeatAgent, RegistryClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RegistryConfig;
pub use error::{RegistryError, Result};
pub use http::{MAX_REGISTRATION_BYTES, RegisterRequest, RegistryServer, ServiceInstances};
pub use instance::{
    InstanceKey, InstanceStatus, Registration, ServiceInstance, normalize_service_name,
};
pub use lease::{LeaseManager, SweepReport};
pub use service::{RegistryService, RegistryStats, StatusFilter};
pub use store::{InstanceStore, RegistrySnapshot};

pub mod prelude {
    pub use crate::client::{HeartbeatAgent, RegistryClient};
    pub use crate::config::RegistryConfig;
    pub use crate::error::{RegistryError, Result};
    pub use crate::instance::{InstanceStatus, Registration, ServiceInstance};
    pub use crate::service::{RegistryService, StatusFilter};
    pub use crate::store::RegistrySnapshot;
}
