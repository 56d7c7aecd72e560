//! Lease expiry, eviction and self-preservation
//!
//! Every sweep compares the renewals received since the previous sweep with
//! the renewals the registered population should have produced. When too
//! few arrive the registry assumes it is partitioned from its clients rather
//! than that they all died, and stops evicting until renewals recover.

use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::instance::{InstanceKey, InstanceStatus, ServiceInstance};
use crate::store::InstanceStore;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Outcome of one eviction sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Another sweep was already running; nothing was done
    pub skipped: bool,
    pub self_preservation: bool,
    /// Renewals received during the window
    pub renewals: u64,
    pub expected_renewals: f64,
    /// `None` when no renewals were expected
    pub renewal_ratio: Option<f64>,
    /// Leases expired this sweep
    pub evicted: Vec<InstanceKey>,
    /// Entries removed from the store this sweep
    pub removed: Vec<InstanceKey>,
    /// Entries skipped because their lease data made no sense
    pub malformed: Vec<InstanceKey>,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.evicted.is_empty() && self.removed.is_empty() && self.malformed.is_empty()
    }
}

/// Clears the in-progress flag when a sweep ends, even by panic
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Decides which leases have expired and whether eviction is safe
#[derive(Debug)]
pub struct LeaseManager {
    heartbeat: Duration,
    lease: Duration,
    grace: Duration,
    threshold: f64,
    self_preservation_enabled: bool,
    clock: Arc<dyn Clock>,
    renewals: AtomicU64,
    window_start: Mutex<DateTime<Utc>>,
    self_preserving: AtomicBool,
    sweeping: AtomicBool,
}

impl LeaseManager {
    pub fn new(config: &RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let window_start = clock.now();
        Self {
            heartbeat: config.heartbeat_period(),
            lease: config.lease_duration(),
            grace: config.grace_period(),
            threshold: config.self_preservation_threshold,
            self_preservation_enabled: config.enable_self_preservation,
            clock,
            renewals: AtomicU64::new(0),
            window_start: Mutex::new(window_start),
            self_preserving: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease
    }

    /// Count a successful renewal toward the current window.
    ///
    /// Instances registered after the window opened are left out of the
    /// expected count, so their renewals are left out here too.
    pub fn record_renewal(&self, instance: &ServiceInstance) {
        if instance.registered_at <= *self.window_start.lock() {
            self.renewals.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_self_preserving(&self) -> bool {
        self.self_preserving.load(Ordering::Acquire)
    }

    /// Whether the lease has expired at `now`.
    ///
    /// A heartbeat stamped further in the future than one heartbeat interval
    /// cannot come from this registry's clock and is reported as malformed.
    pub fn check_lease(&self, instance: &ServiceInstance, now: DateTime<Utc>) -> Result<bool> {
        if instance.last_heartbeat_at > now + self.heartbeat {
            return Err(RegistryError::MalformedLease {
                key: instance.key().to_string(),
                reason: format!(
                    "last heartbeat {} is ahead of registry clock {}",
                    instance.last_heartbeat_at, now
                ),
            });
        }
        Ok(now - instance.last_heartbeat_at > self.lease)
    }

    /// Renewals the live population should have sent between `from` and `to`.
    ///
    /// Only instances registered before the window opened are counted, so a
    /// burst of new registrations cannot push the ratio down on its own.
    fn expected_renewals(&self, store: &InstanceStore, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        let heartbeat_ms = self.heartbeat.num_milliseconds();
        if heartbeat_ms <= 0 {
            return 0.0;
        }
        let per_instance = (to - from).num_milliseconds().max(0) as f64 / heartbeat_ms as f64;

        let eligible = store
            .instances()
            .iter()
            .filter(|i| !i.is_evicted() && i.registered_at <= from)
            .count();

        eligible as f64 * per_instance
    }

    fn update_mode(&self, preserving: bool, ratio: Option<f64>) {
        let was = self.self_preserving.swap(preserving, Ordering::AcqRel);
        match (was, preserving) {
            (false, true) => warn!(
                renewal_ratio = ?ratio,
                threshold = self.threshold,
                "Entering self-preservation mode, lease eviction suspended"
            ),
            (true, false) => info!(
                renewal_ratio = ?ratio,
                "Renewals recovered, leaving self-preservation mode"
            ),
            _ => {}
        }
    }

    /// Run one eviction sweep over `store`.
    ///
    /// Sweeps never overlap: a call made while another is running returns a
    /// report with `skipped` set.
    pub fn sweep(&self, store: &InstanceStore) -> SweepReport {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            debug!("Eviction sweep already in progress, skipping");
            return SweepReport::skipped();
        }
        let _guard = SweepGuard(&self.sweeping);

        let now = self.clock.now();
        let window_start = std::mem::replace(&mut *self.window_start.lock(), now);
        let renewals = self.renewals.swap(0, Ordering::AcqRel);
        let expected = self.expected_renewals(store, window_start, now);
        let ratio = (expected > 0.0).then(|| renewals as f64 / expected);
        let preserving = self.self_preservation_enabled && ratio.is_some_and(|r| r < self.threshold);
        self.update_mode(preserving, ratio);

        let mut report = SweepReport {
            self_preservation: preserving,
            renewals,
            expected_renewals: expected,
            renewal_ratio: ratio,
            ..Default::default()
        };

        self.remove_expired_grace(store, now, &mut report);

        if preserving {
            return report;
        }

        let mut malformed = Vec::new();
        let mut evicted = Vec::new();
        store.for_each_expired(
            |instance| {
                if instance.is_evicted() {
                    return false;
                }
                self.check_lease(instance, now).unwrap_or_else(|e| {
                    warn!("Skipping lease during sweep: {}", e);
                    malformed.push(instance.key());
                    false
                })
            },
            |instance| evicted.push(instance),
        );
        report.malformed = malformed;

        for instance in evicted {
            self.evict(store, &instance, now, &mut report);
        }

        if !report.is_noop() {
            info!(
                evicted = report.evicted.len(),
                removed = report.removed.len(),
                "Eviction sweep finished"
            );
        }
        report
    }

    /// Expire one lease, unless it was renewed since the candidate was taken
    fn evict(
        &self,
        store: &InstanceStore,
        candidate: &ServiceInstance,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let unchanged = |current: &ServiceInstance| {
            current.last_heartbeat_at == candidate.last_heartbeat_at && !current.is_evicted()
        };
        let key = candidate.key();

        if self.grace <= Duration::zero() {
            if store
                .remove_if(&key.service_name, &key.instance_id, unchanged)
                .is_some()
            {
                warn!("Evicted expired lease {}", key);
                report.evicted.push(key.clone());
                report.removed.push(key);
            }
            return;
        }

        let mut marked = false;
        store.update(&key.service_name, &key.instance_id, |current| {
            if !unchanged(current) {
                return None;
            }
            marked = true;
            let mut next = current.clone();
            next.status = InstanceStatus::Down;
            next.evicted_at = Some(now);
            Some(next)
        });
        if marked {
            warn!("Evicted expired lease {}, removal after grace window", key);
            report.evicted.push(key);
        }
    }

    /// Drop evicted entries whose grace window has passed
    fn remove_expired_grace(&self, store: &InstanceStore, now: DateTime<Utc>, report: &mut SweepReport) {
        let grace = self.grace;
        store.for_each_expired(
            |instance| instance.evicted_at.is_some_and(|at| now - at >= grace),
            |instance| {
                let removed = store.remove_if(&instance.service_name, &instance.instance_id, |current| {
                    current.evicted_at == instance.evicted_at
                });
                if removed.is_some() {
                    debug!("Removed evicted instance {}", instance.key());
                    report.removed.push(instance.key());
                }
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::instance::Registration;

    fn setup(config: RegistryConfig) -> (Arc<ManualClock>, LeaseManager, InstanceStore) {
        let clock = Arc::new(ManualClock::default());
        let leases = LeaseManager::new(&config, clock.clone());
        (clock, leases, InstanceStore::new())
    }

    fn put(store: &InstanceStore, clock: &ManualClock, id: &str) {
        let mut instance = ServiceInstance::from_registration(
            Registration::new("svc", id, "127.0.0.1", 8080),
            clock.now(),
        );
        instance.status = InstanceStatus::Up;
        store.put(instance);
    }

    fn heartbeat(store: &InstanceStore, clock: &ManualClock, leases: &LeaseManager, id: &str) {
        let renewed = store
            .update("svc", id, |current| {
                let mut next = current.clone();
                next.last_heartbeat_at = clock.now();
                Some(next)
            })
            .unwrap();
        leases.record_renewal(&renewed);
    }

    fn config() -> RegistryConfig {
        RegistryConfig::new()
            .heartbeat_interval(std::time::Duration::from_secs(1))
            .eviction_multiplier(3)
    }

    #[test]
    fn test_lease_boundary() {
        let (clock, leases, _) = setup(config());
        let instance = ServiceInstance::from_registration(
            Registration::new("svc", "a", "h", 1),
            clock.now(),
        );

        let at_limit = clock.now() + Duration::seconds(3);
        assert!(!leases.check_lease(&instance, at_limit).unwrap());
        assert!(leases.check_lease(&instance, at_limit + Duration::milliseconds(1)).unwrap());
    }

    #[test]
    fn test_future_heartbeat_is_malformed() {
        let (clock, leases, store) = setup(config().self_preservation(false));
        put(&store, &clock, "a");
        store.update("svc", "a", |current| {
            let mut next = current.clone();
            next.last_heartbeat_at = clock.now() + Duration::hours(1);
            Some(next)
        });

        let report = leases.sweep(&store);
        assert_eq!(report.malformed.len(), 1);
        assert!(report.evicted.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_lease_evicted_without_self_preservation() {
        let (clock, leases, store) = setup(config().self_preservation(false));
        put(&store, &clock, "a");

        clock.advance(Duration::milliseconds(3500));
        let report = leases.sweep(&store);
        assert_eq!(report.evicted, vec![InstanceKey::new("svc", "a")]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_renewed_lease_survives() {
        let (clock, leases, store) = setup(config().self_preservation(false));
        put(&store, &clock, "a");

        for _ in 0..5 {
            clock.advance(Duration::seconds(1));
            heartbeat(&store, &clock, &leases, "a");
        }
        let report = leases.sweep(&store);
        assert!(report.evicted.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_self_preservation_blocks_eviction() {
        let (clock, leases, store) = setup(config());
        for id in ["a", "b", "c", "d"] {
            put(&store, &clock, id);
        }

        clock.advance(Duration::seconds(10));
        let report = leases.sweep(&store);
        assert!(report.self_preservation);
        assert_eq!(report.renewal_ratio, Some(0.0));
        assert!(report.evicted.is_empty());
        assert_eq!(store.len(), 4);
        assert!(leases.is_self_preserving());
    }

    #[test]
    fn test_self_preservation_exits_when_renewals_recover() {
        let (clock, leases, store) = setup(config());
        for id in ["a", "b"] {
            put(&store, &clock, id);
        }
        clock.advance(Duration::seconds(4));
        assert!(leases.sweep(&store).self_preservation);

        for _ in 0..4 {
            clock.advance(Duration::seconds(1));
            heartbeat(&store, &clock, &leases, "a");
            heartbeat(&store, &clock, &leases, "b");
        }
        let report = leases.sweep(&store);
        assert_eq!(report.renewal_ratio, Some(1.0));
        assert!(!report.self_preservation);
        assert!(!leases.is_self_preserving());
    }

    #[test]
    fn test_new_arrivals_do_not_mask_silent_population() {
        let (clock, leases, store) = setup(config());
        for id in ["a", "b", "c", "d"] {
            put(&store, &clock, id);
        }

        clock.advance(Duration::seconds(1));
        let arrivals: Vec<String> = (0..8).map(|n| format!("new-{}", n)).collect();
        for id in &arrivals {
            put(&store, &clock, id);
        }
        for _ in 0..4 {
            clock.advance(Duration::seconds(1));
            for id in &arrivals {
                heartbeat(&store, &clock, &leases, id);
            }
        }

        let report = leases.sweep(&store);
        assert_eq!(report.renewals, 0);
        assert_eq!(report.renewal_ratio, Some(0.0));
        assert!(report.self_preservation);
        assert_eq!(store.len(), 12);
    }

    #[test]
    fn test_empty_window_never_preserves() {
        let (_, leases, store) = setup(config());
        let report = leases.sweep(&store);
        assert_eq!(report.renewal_ratio, None);
        assert!(!report.self_preservation);
    }

    #[test]
    fn test_grace_window_marks_down_then_removes() {
        let (clock, leases, store) = setup(
            config()
                .self_preservation(false)
                .eviction_grace(std::time::Duration::from_secs(5)),
        );
        put(&store, &clock, "a");

        clock.advance(Duration::seconds(4));
        let report = leases.sweep(&store);
        assert_eq!(report.evicted.len(), 1);
        assert!(report.removed.is_empty());
        let entry = store.get("svc", "a").unwrap();
        assert_eq!(entry.status, InstanceStatus::Down);
        assert!(!entry.is_up());

        clock.advance(Duration::seconds(5));
        let report = leases.sweep(&store);
        assert!(report.evicted.is_empty());
        assert_eq!(report.removed, vec![InstanceKey::new("svc", "a")]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_sweep_is_skipped() {
        let (_, leases, store) = setup(config());
        leases.sweeping.store(true, Ordering::Release);
        assert!(leases.sweep(&store).skipped);

        leases.sweeping.store(false, Ordering::Release);
        assert!(!leases.sweep(&store).skipped);
    }
}
