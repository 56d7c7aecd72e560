//! Lodestar CLI
//!
//! # Commands
//!
//! - `lodestar registry` - Run the service registry
//! - `lodestar gateway` - Run the gateway against a remote registry
//! - `lodestar standalone` - Run both in one process
//! - `lodestar routes` - Compile and list the configured gateway routes

use clap::{Args, Parser, Subcommand};
use lodestar::app::{self, AppResult};
use lodestar::gateway::{GatewayConfig, RouteTable};
use lodestar::log::{LogConfig, LogFormat, LogLevel};
use lodestar::registry::RegistryConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Service registry and discovery gateway
#[derive(Parser)]
#[command(name = "lodestar")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "Service registry with leases and a registry-aware API gateway")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true, env = "LODESTAR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (json, plain, pretty, compact)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service registry
    Registry(ListenArgs),

    /// Run the gateway against a remote registry
    Gateway(GatewayArgs),

    /// Run registry and gateway in one process
    Standalone {
        /// Registry port
        #[arg(long)]
        registry_port: Option<u16>,

        /// Gateway port
        #[arg(long)]
        gateway_port: Option<u16>,
    },

    /// Compile the configured routes and list them
    Routes,
}

#[derive(Args)]
struct ListenArgs {
    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to bind
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Args)]
struct GatewayArgs {
    #[command(flatten)]
    listen: ListenArgs,

    /// Registry base URL
    #[arg(long)]
    registry_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log = LogConfig::from_env();
    if let Some(level) = cli.log_level {
        log = log.level(level);
    }
    if let Some(format) = cli.log_format {
        log = log.format(format);
    }
    let _guard = match log.init() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("lodestar: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let manager = app::load_config(cli.config.as_deref())?;
    let shutdown = shutdown_on_ctrl_c();

    match cli.command {
        Commands::Registry(args) => {
            let mut config: RegistryConfig = manager.section("registry")?;
            if let Some(host) = args.host {
                config.host = host;
            }
            if let Some(port) = args.port {
                config.port = port;
            }
            let listener = TcpListener::bind(config.bind_address()).await?;
            app::serve_registry(config, listener, shutdown).await
        }

        Commands::Gateway(args) => {
            let mut config: GatewayConfig = manager.section("gateway")?;
            if let Some(host) = args.listen.host {
                config.host = host;
            }
            if let Some(port) = args.listen.port {
                config.port = port;
            }
            if let Some(url) = args.registry_url {
                config.registry_url = url;
            }
            let listener = TcpListener::bind(config.bind_address()).await?;
            app::serve_gateway(config, listener, shutdown).await
        }

        Commands::Standalone {
            registry_port,
            gateway_port,
        } => {
            let mut registry: RegistryConfig = manager.section("registry")?;
            let mut gateway: GatewayConfig = manager.section("gateway")?;
            if let Some(port) = registry_port {
                registry.port = port;
            }
            if let Some(port) = gateway_port {
                gateway.port = port;
            }
            let registry_listener = TcpListener::bind(registry.bind_address()).await?;
            let gateway_listener = TcpListener::bind(gateway.bind_address()).await?;
            app::serve_standalone(registry, gateway, registry_listener, gateway_listener, shutdown)
                .await
        }

        Commands::Routes => {
            let config: GatewayConfig = manager.section("gateway")?;
            let table = RouteTable::compile(&config.routes)?;
            for route in table.routes() {
                println!(
                    "{:<20} -> {:<28} filters: {}",
                    route.id,
                    route.service,
                    route.filters.len()
                );
            }
            info!(routes = table.len(), "Route table compiled");
            Ok(())
        }
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                trigger.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
    shutdown
}
