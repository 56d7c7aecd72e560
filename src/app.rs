//! Process wiring shared by the `lodestar` binary and its tests
//!
//! Construction order is fixed: registry store and leases, then the
//! registry service, then the gateway's route table, snapshot cache and
//! dispatcher.

use lodestar_config::{ConfigError, ConfigManager};
use lodestar_gateway::{GatewayConfig, GatewayError, GatewayServer, SnapshotSource};
use lodestar_log::LogError;
use lodestar_registry::{RegistryClient, RegistryConfig, RegistryError, RegistryServer, RegistryService};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Prefix of environment variables that override file configuration
pub const ENV_PREFIX: &str = "LODESTAR";

/// Anything that stops a Lodestar process
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;

/// Layer an optional file, `.env` and `LODESTAR_*` variables
pub fn load_config(path: Option<&Path>) -> AppResult<ConfigManager> {
    let manager = ConfigManager::with_prefix(ENV_PREFIX);
    if let Some(path) = path {
        manager.load_file(path)?;
        info!("Loaded configuration from {}", path.display());
    }
    manager.load_dotenv(None)?;
    Ok(manager)
}

/// Registry API plus its eviction sweep, until `shutdown`
pub async fn serve_registry(
    config: RegistryConfig,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let registry = Arc::new(RegistryService::new(config));
    let sweeper = registry.start_eviction(shutdown.clone());

    RegistryServer::new(registry)?.serve(listener, shutdown).await?;
    join("eviction sweep", sweeper).await;
    Ok(())
}

/// Gateway fed from a remote registry over HTTP, until `shutdown`
pub async fn serve_gateway(
    config: GatewayConfig,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let client = RegistryClient::new(
        &config.registry_url,
        Duration::from_millis(config.attempt_timeout_ms),
    )?;
    info!(registry = %config.registry_url, "Gateway reading registry over HTTP");
    serve_gateway_from(config, Arc::new(client), listener, shutdown).await
}

/// Gateway fed from any snapshot source
pub async fn serve_gateway_from(
    config: GatewayConfig,
    source: Arc<dyn SnapshotSource>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let server = GatewayServer::from_config(&config)?;
    let refresher = server.start_refresh(source, config.refresh_period(), shutdown.clone());

    server.serve(listener, shutdown).await?;
    join("snapshot refresh", refresher).await;
    Ok(())
}

/// Registry and gateway in one process; the gateway reads the registry directly
pub async fn serve_standalone(
    registry_config: RegistryConfig,
    gateway_config: GatewayConfig,
    registry_listener: TcpListener,
    gateway_listener: TcpListener,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let registry = Arc::new(RegistryService::new(registry_config));
    let sweeper = registry.start_eviction(shutdown.clone());
    let api = RegistryServer::new(Arc::clone(&registry))?;

    let gateway = serve_gateway_from(gateway_config, registry, gateway_listener, shutdown.clone());
    let (api, gateway) = tokio::join!(api.serve(registry_listener, shutdown), gateway);

    join("eviction sweep", sweeper).await;
    api?;
    gateway
}

async fn join(task: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!("Background task '{}' ended abnormally: {}", task, e);
    }
}
