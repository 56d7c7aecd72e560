//! The registry service: registration, renewal and queries over leases

use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::instance::{
    InstanceStatus, Registration, ServiceInstance, normalize_service_name,
};
use crate::lease::{LeaseManager, SweepReport};
use crate::store::{InstanceStore, RegistrySnapshot};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which instances a query returns
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StatusFilter {
    /// Only routable instances
    #[default]
    Up,
    /// Everything, for diagnostics
    Any,
    /// Instances in one of the listed states
    Only(Vec<InstanceStatus>),
}

impl StatusFilter {
    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        match self {
            Self::Up => instance.is_up(),
            Self::Any => true,
            Self::Only(statuses) => statuses.contains(&instance.status),
        }
    }
}

impl FromStr for StatusFilter {
    type Err = RegistryError;

    /// `up`, `any`, or a comma-separated list of statuses
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "up" => Ok(Self::Up),
            "any" | "all" => Ok(Self::Any),
            list => list
                .split(',')
                .map(InstanceStatus::from_str)
                .collect::<Result<Vec<_>>>()
                .map(Self::Only),
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub service_count: usize,
    pub total_instances: usize,
    pub up_instances: usize,
    pub self_preservation: bool,
    pub generation: u64,
}

/// Service registry holding leases for every known instance
#[derive(Debug)]
pub struct RegistryService {
    config: RegistryConfig,
    store: InstanceStore,
    leases: LeaseManager,
    clock: Arc<dyn Clock>,
}

impl RegistryService {
    /// Create a registry on the system clock
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let leases = LeaseManager::new(&config, Arc::clone(&clock));
        Self {
            config,
            store: InstanceStore::new(),
            leases,
            clock,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    /// Register an instance, or refresh an existing registration.
    ///
    /// A re-registration replaces address and metadata and resets the lease,
    /// keeping the current status so an OUT_OF_SERVICE override survives a
    /// client restart. An instance coming back from eviction starts over.
    pub fn register(&self, registration: Registration) -> Result<Arc<ServiceInstance>> {
        let registration = registration.validated()?;
        let key = registration.key();
        let now = self.clock.now();
        let register_as_up = self.config.register_as_up;

        let (instance, previous) =
            self.store
                .upsert_with(&key.service_name, &key.instance_id, |existing| {
                    let mut next = ServiceInstance::from_registration(registration, now);
                    match existing {
                        Some(current) if !current.is_evicted() => {
                            next.registered_at = current.registered_at;
                            next.status = current.status;
                        }
                        _ if register_as_up => next.status = InstanceStatus::Up,
                        _ => {}
                    }
                    next
                });

        match previous {
            Some(_) => debug!("Re-registered instance {} at {}", key, instance.address()),
            None => info!(
                "Registered instance {} at {} ({})",
                key,
                instance.address(),
                instance.status
            ),
        }
        Ok(instance)
    }

    /// Renew an instance's lease, promoting STARTING to UP
    pub fn renew(&self, service_name: &str, instance_id: &str) -> Result<Arc<ServiceInstance>> {
        let service_name = normalize_service_name(service_name);
        let now = self.clock.now();
        let mut evicted = false;

        let current = self
            .store
            .update(&service_name, instance_id, |current| {
                if current.is_evicted() {
                    evicted = true;
                    return None;
                }
                let mut next = current.clone();
                next.last_heartbeat_at = now;
                if next.status == InstanceStatus::Starting {
                    next.status = InstanceStatus::Up;
                }
                Some(next)
            })
            .filter(|_| !evicted)
            .ok_or_else(|| RegistryError::not_found(&service_name, instance_id))?;

        self.leases.record_renewal(&current);
        debug!("Renewed lease for {}", current.key());
        Ok(current)
    }

    /// Remove an instance. Removing an unknown instance is not an error.
    pub fn deregister(&self, service_name: &str, instance_id: &str) -> bool {
        let service_name = normalize_service_name(service_name);
        match self.store.remove(&service_name, instance_id) {
            Some(removed) => {
                info!("Deregistered instance {}", removed.key());
                true
            }
            None => {
                debug!(
                    "Deregister for unknown instance {}/{}",
                    service_name, instance_id
                );
                false
            }
        }
    }

    /// Override an instance's status
    pub fn set_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<Arc<ServiceInstance>> {
        let service_name = normalize_service_name(service_name);
        let mut evicted = false;

        let current = self
            .store
            .update(&service_name, instance_id, |current| {
                if current.is_evicted() {
                    evicted = true;
                    return None;
                }
                let mut next = current.clone();
                next.status = status;
                Some(next)
            })
            .filter(|_| !evicted)
            .ok_or_else(|| RegistryError::not_found(&service_name, instance_id))?;

        info!("Set status of {} to {}", current.key(), status);
        Ok(current)
    }

    /// UP instances of a service, sorted by id
    pub fn query(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.query_with(service_name, &StatusFilter::Up)
    }

    pub fn query_with(&self, service_name: &str, filter: &StatusFilter) -> Vec<ServiceInstance> {
        self.store
            .instances_of(&normalize_service_name(service_name))
            .into_iter()
            .filter(|i| filter.matches(i))
            .map(Arc::unwrap_or_clone)
            .collect()
    }

    /// Every instance of every service, in any status
    pub fn query_all(&self) -> RegistrySnapshot {
        self.store.snapshot(self.clock.now())
    }

    /// Run one eviction sweep now
    pub fn sweep(&self) -> SweepReport {
        self.leases.sweep(&self.store)
    }

    pub fn is_self_preserving(&self) -> bool {
        self.leases.is_self_preserving()
    }

    pub fn stats(&self) -> RegistryStats {
        let snapshot = self.query_all();
        let up_instances = snapshot
            .services
            .values()
            .flatten()
            .filter(|i| i.is_up())
            .count();

        RegistryStats {
            service_count: snapshot.services.len(),
            total_instances: snapshot.instance_count(),
            up_instances,
            self_preservation: self.is_self_preserving(),
            generation: snapshot.version,
        }
    }

    /// Start the periodic eviction sweep.
    ///
    /// The first sweep runs one period after start; the loop ends when
    /// `shutdown` is cancelled. A zero period falls back to the default.
    pub fn start_eviction(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut period = self.config.sweep_period();
        if period.is_zero() {
            period = RegistryConfig::default().sweep_period();
            warn!(?period, "Eviction interval is zero, using the default");
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Eviction loop stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        registry.sweep();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn registry() -> (Arc<ManualClock>, RegistryService) {
        let clock = Arc::new(ManualClock::default());
        let config = RegistryConfig::new()
            .heartbeat_interval(std::time::Duration::from_secs(1))
            .self_preservation(false);
        let registry = RegistryService::with_clock(config, clock.clone());
        (clock, registry)
    }

    #[test]
    fn test_register_starts_then_renew_promotes() {
        let (_, registry) = registry();
        let instance = registry
            .register(Registration::new("file-storage", "fs-1", "10.0.0.1", 8081))
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::Starting);
        assert!(registry.query("file-storage").is_empty());

        let renewed = registry.renew("file-storage", "fs-1").unwrap();
        assert_eq!(renewed.status, InstanceStatus::Up);
        assert_eq!(registry.query("file-storage").len(), 1);
    }

    #[test]
    fn test_register_as_up() {
        let registry = RegistryService::new(RegistryConfig::new().register_as_up(true));
        registry
            .register(Registration::new("svc", "a", "h", 1))
            .unwrap();
        assert_eq!(registry.query("svc").len(), 1);
    }

    #[test]
    fn test_service_names_are_case_insensitive() {
        let (_, registry) = registry();
        registry
            .register(Registration::new("FILE-STORAGE", "fs-1", "h", 1))
            .unwrap();
        registry.renew("File-Storage", "fs-1").unwrap();
        assert_eq!(registry.query("file-storage").len(), 1);
    }

    #[test]
    fn test_duplicate_registration_is_an_update() {
        let (clock, registry) = registry();
        registry
            .register(Registration::new("svc", "a", "10.0.0.1", 8080))
            .unwrap();
        registry.renew("svc", "a").unwrap();
        let first = registry.store().get("svc", "a").unwrap();

        clock.advance(Duration::seconds(2));
        registry
            .register(Registration::new("svc", "a", "10.0.0.2", 9090).metadata("zone", "b"))
            .unwrap();

        let all = registry.query_with("svc", &StatusFilter::Any);
        assert_eq!(all.len(), 1);
        let current = &all[0];
        assert_eq!(current.address(), "10.0.0.2:9090");
        assert_eq!(current.metadata.get("zone").map(String::as_str), Some("b"));
        assert_eq!(current.status, InstanceStatus::Up);
        assert_eq!(current.registered_at, first.registered_at);
        assert_eq!(current.last_heartbeat_at, clock.now());
    }

    #[test]
    fn test_renew_unknown_is_not_found() {
        let (_, registry) = registry();
        assert!(registry.renew("svc", "ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let (_, registry) = registry();
        registry
            .register(Registration::new("svc", "a", "h", 1))
            .unwrap();
        assert!(registry.deregister("svc", "a"));
        assert!(!registry.deregister("svc", "a"));
        assert!(registry.query_all().is_empty());
    }

    #[test]
    fn test_status_override_survives_renewal() {
        let (_, registry) = registry();
        registry
            .register(Registration::new("svc", "a", "h", 1))
            .unwrap();
        registry.renew("svc", "a").unwrap();

        registry
            .set_status("svc", "a", InstanceStatus::OutOfService)
            .unwrap();
        let renewed = registry.renew("svc", "a").unwrap();
        assert_eq!(renewed.status, InstanceStatus::OutOfService);
        assert!(registry.query("svc").is_empty());

        let diagnostics = registry.query_with(
            "svc",
            &StatusFilter::Only(vec![InstanceStatus::OutOfService]),
        );
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_renew_after_eviction_in_grace_is_not_found() {
        let clock = Arc::new(ManualClock::default());
        let config = RegistryConfig::new()
            .heartbeat_interval(std::time::Duration::from_secs(1))
            .eviction_grace(std::time::Duration::from_secs(30))
            .self_preservation(false);
        let registry = RegistryService::with_clock(config, clock.clone());
        registry
            .register(Registration::new("svc", "a", "h", 1))
            .unwrap();

        clock.advance(Duration::seconds(5));
        assert_eq!(registry.sweep().evicted.len(), 1);
        assert!(registry.renew("svc", "a").unwrap_err().is_not_found());

        // Re-registering brings it back
        registry
            .register(Registration::new("svc", "a", "h", 1))
            .unwrap();
        assert!(registry.renew("svc", "a").is_ok());
        assert_eq!(registry.query("svc").len(), 1);
    }

    #[test]
    fn test_status_filter_parse() {
        assert_eq!("".parse::<StatusFilter>().unwrap(), StatusFilter::Up);
        assert_eq!("ANY".parse::<StatusFilter>().unwrap(), StatusFilter::Any);
        assert_eq!(
            "down,out_of_service".parse::<StatusFilter>().unwrap(),
            StatusFilter::Only(vec![InstanceStatus::Down, InstanceStatus::OutOfService])
        );
        assert!("sideways".parse::<StatusFilter>().is_err());
    }

    #[test]
    fn test_stats() {
        let (_, registry) = registry();
        registry.register(Registration::new("a", "1", "h", 1)).unwrap();
        registry.register(Registration::new("a", "2", "h", 1)).unwrap();
        registry.register(Registration::new("b", "1", "h", 1)).unwrap();
        registry.renew("a", "1").unwrap();

        let stats = registry.stats();
        assert_eq!(stats.service_count, 2);
        assert_eq!(stats.total_instances, 3);
        assert_eq!(stats.up_instances, 1);
        assert!(!stats.self_preservation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_loop_stops_on_shutdown() {
        let registry = Arc::new(RegistryService::new(RegistryConfig::default()));
        let shutdown = CancellationToken::new();
        let handle = registry.start_eviction(shutdown.clone());

        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_eviction_interval_uses_default() {
        let clock = Arc::new(ManualClock::default());
        let mut config = RegistryConfig::new()
            .heartbeat_interval(std::time::Duration::from_secs(1))
            .self_preservation(false);
        config.eviction_interval_ms = 0;
        let registry = Arc::new(RegistryService::with_clock(config, clock.clone()));
        registry
            .register(Registration::new("svc", "a", "10.0.0.1", 80))
            .unwrap();
        clock.advance(Duration::seconds(10));

        let shutdown = CancellationToken::new();
        let handle = registry.start_eviction(shutdown.clone());

        tokio::time::sleep(std::time::Duration::from_secs(29)).await;
        assert_eq!(registry.stats().total_instances, 1);
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(registry.stats().total_instances, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
