//! Registry configuration
//!
//! Loaded from the `[registry]` section of the Lodestar configuration file,
//! overridable through `LODESTAR_REGISTRY__*` environment variables.
//!
//! ```toml
//! [registry]
//! port = 8761
//! heartbeat_interval_ms = 30000
//! eviction_multiplier = 3
//! self_preservation_threshold = 0.85
//! ```

use chrono::Duration as ChronoDuration;
use lodestar_config::{ConfigValidator, Validate};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lease and server settings for the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Address the HTTP API binds to
    pub host: String,
    pub port: u16,
    /// Interval at which instances are expected to renew
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats tolerated before a lease expires
    pub eviction_multiplier: u32,
    /// Period of the eviction sweep
    pub eviction_interval_ms: u64,
    /// Time an evicted instance stays visible as DOWN before removal
    pub eviction_grace_ms: u64,
    pub enable_self_preservation: bool,
    /// Renewal ratio below which eviction is suspended
    pub self_preservation_threshold: f64,
    /// Register instances directly as UP instead of STARTING
    pub register_as_up: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8761,
            heartbeat_interval_ms: 30_000,
            eviction_multiplier: 3,
            eviction_interval_ms: 30_000,
            eviction_grace_ms: 0,
            enable_self_preservation: true,
            self_preservation_threshold: 0.85,
            register_as_up: false,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = millis(interval);
        self
    }

    /// Set the eviction multiplier
    pub fn eviction_multiplier(mut self, multiplier: u32) -> Self {
        self.eviction_multiplier = multiplier;
        self
    }

    /// Set the eviction sweep period
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval_ms = millis(interval);
        self
    }

    /// Set the grace window between eviction and removal
    pub fn eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace_ms = millis(grace);
        self
    }

    /// Enable or disable self-preservation
    pub fn self_preservation(mut self, enabled: bool) -> Self {
        self.enable_self_preservation = enabled;
        self
    }

    /// Set the self-preservation threshold
    pub fn self_preservation_threshold(mut self, threshold: f64) -> Self {
        self.self_preservation_threshold = threshold;
        self
    }

    pub fn register_as_up(mut self, enabled: bool) -> Self {
        self.register_as_up = enabled;
        self
    }

    pub fn heartbeat_period(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.heartbeat_interval_ms as i64)
    }

    /// How long a lease lives without renewal
    pub fn lease_duration(&self) -> ChronoDuration {
        self.heartbeat_period() * self.eviction_multiplier as i32
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    pub fn grace_period(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.eviction_grace_ms as i64)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Whole milliseconds, never rounding a non-zero interval down to zero
fn millis(interval: Duration) -> u64 {
    if interval.is_zero() {
        return 0;
    }
    interval.as_millis().clamp(1, u64::MAX as u128) as u64
}

impl Validate for RegistryConfig {
    fn validate(&self) -> lodestar_config::Result<()> {
        ConfigValidator::not_empty(&self.host, "registry.host")?;
        ConfigValidator::is_port(self.port, "registry.port")?;
        ConfigValidator::positive(self.heartbeat_interval_ms, "registry.heartbeat_interval_ms")?;
        ConfigValidator::positive(self.eviction_multiplier, "registry.eviction_multiplier")?;
        ConfigValidator::positive(self.eviction_interval_ms, "registry.eviction_interval_ms")?;
        ConfigValidator::in_range(
            self.self_preservation_threshold,
            0.0,
            1.0,
            "registry.self_preservation_threshold",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_config::ConfigManager;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.lease_duration(), ChronoDuration::seconds(90));
        assert_eq!(config.sweep_period(), Duration::from_secs(30));
        assert!(config.enable_self_preservation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RegistryConfig::new()
            .heartbeat_interval(Duration::from_secs(5))
            .eviction_multiplier(2)
            .eviction_grace(Duration::from_secs(10))
            .self_preservation(false);
        assert_eq!(config.lease_duration(), ChronoDuration::seconds(10));
        assert_eq!(config.grace_period(), ChronoDuration::seconds(10));
        assert!(!config.enable_self_preservation);
    }

    #[test]
    fn test_sub_second_intervals_are_kept() {
        let config = RegistryConfig::new()
            .heartbeat_interval(Duration::from_millis(200))
            .eviction_interval(Duration::from_millis(50))
            .eviction_grace(Duration::from_millis(500));
        assert_eq!(config.lease_duration(), ChronoDuration::milliseconds(600));
        assert_eq!(config.sweep_period(), Duration::from_millis(50));
        assert_eq!(config.grace_period(), ChronoDuration::milliseconds(500));
        assert!(config.validate().is_ok());

        let config = RegistryConfig::new().heartbeat_interval(Duration::from_micros(10));
        assert_eq!(config.heartbeat_interval_ms, 1);

        let config = RegistryConfig::new().eviction_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let config = RegistryConfig::new().self_preservation_threshold(1.5);
        assert!(config.validate().is_err());

        let config = RegistryConfig::new().eviction_multiplier(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_manager_with_env_override() {
        let manager = ConfigManager::with_prefix("LODESTAR");
        manager.set("registry.heartbeat_interval_ms", 10_000).unwrap();
        manager.load_env_from(vec![(
            "LODESTAR_REGISTRY__ENABLE_SELF_PRESERVATION".to_string(),
            "false".to_string(),
        )]);

        let config: RegistryConfig = manager.section("registry").unwrap();
        assert_eq!(config.heartbeat_interval_ms, 10_000);
        assert_eq!(config.port, 8761);
        assert!(!config.enable_self_preservation);
    }
}
