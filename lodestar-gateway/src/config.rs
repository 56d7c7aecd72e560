//! Gateway configuration
//!
//! Loaded from the `[gateway]` section; routes are an array of tables.
//!
//! ```toml
//! [gateway]
//! port = 8080
//! registry_url = "http://localhost:8761"
//! load_balancing = "round_robin"
//! max_retries = 2
//! attempt_timeout_ms = 3000
//!
//! [[gateway.routes]]
//! id = "files"
//! service = "file-storage-service"
//! filters = ["StripPrefix=1"]
//!
//! [gateway.routes.predicate]
//! type = "path_prefix"
//! prefix = "/files"
//! ```

use crate::balancer::LoadBalanceStrategy;
use crate::retry::{BackoffConfig, BackoffStrategy, RetryPolicy};
use crate::route::RouteDefinition;
use lodestar_config::{ConfigError, ConfigValidator, Validate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Gateway server, registry access and dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Registry the snapshot is fetched from
    pub registry_url: String,
    /// Period of the snapshot refresh
    pub refresh_interval_ms: u64,
    pub load_balancing: LoadBalanceStrategy,
    /// Extra attempts after a connection failure or timeout
    pub max_retries: u32,
    pub attempt_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub backoff: BackoffConfig,
    /// Route `/{service}/**` to registered services without a route
    pub discovery_locator: bool,
    /// Largest request body accepted for forwarding
    pub max_body_bytes: usize,
    /// Ordered routes; the first match wins
    pub routes: Vec<RouteDefinition>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            registry_url: "http://localhost:8761".to_string(),
            refresh_interval_ms: 5_000,
            load_balancing: LoadBalanceStrategy::RoundRobin,
            max_retries: 2,
            attempt_timeout_ms: 3000,
            connect_timeout_ms: 1000,
            backoff: BackoffConfig::None,
            discovery_locator: false,
            max_body_bytes: 10 * 1024 * 1024,
            routes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    pub fn route(mut self, route: RouteDefinition) -> Self {
        self.routes.push(route);
        self
    }

    pub fn load_balancing(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.load_balancing = strategy;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = millis(timeout);
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = millis(interval);
        self
    }

    pub fn discovery_locator(mut self, enabled: bool) -> Self {
        self.discovery_locator = enabled;
        self
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.attempt_timeout_ms))
            .with_backoff(BackoffStrategy::from(&self.backoff))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Whole milliseconds, never rounding a non-zero duration down to zero
fn millis(duration: Duration) -> u64 {
    if duration.is_zero() {
        return 0;
    }
    duration.as_millis().clamp(1, u64::MAX as u128) as u64
}

impl Validate for GatewayConfig {
    fn validate(&self) -> lodestar_config::Result<()> {
        ConfigValidator::not_empty(&self.host, "gateway.host")?;
        ConfigValidator::is_port(self.port, "gateway.port")?;
        ConfigValidator::is_url(&self.registry_url, "gateway.registry_url")?;
        ConfigValidator::positive(self.refresh_interval_ms, "gateway.refresh_interval_ms")?;
        ConfigValidator::positive(self.attempt_timeout_ms, "gateway.attempt_timeout_ms")?;
        ConfigValidator::positive(self.connect_timeout_ms, "gateway.connect_timeout_ms")?;
        ConfigValidator::positive(self.max_body_bytes, "gateway.max_body_bytes")?;

        let mut ids = HashSet::new();
        for route in &self.routes {
            ConfigValidator::not_empty(&route.id, "gateway.routes.id")?;
            if !ids.insert(route.id.as_str()) {
                return Err(ConfigError::invalid(
                    "gateway.routes.id",
                    format!("duplicate route id '{}'", route.id),
                ));
            }
        }
        Ok(())
    }
}
