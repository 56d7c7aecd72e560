//! Cached registry snapshot
//!
//! The gateway never asks the registry on the request path. A background
//! task refreshes one shared [`RegistrySnapshot`] and request handlers read
//! whatever copy is current.

use crate::config::GatewayConfig;
use crate::error::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use lodestar_registry::{RegistryClient, RegistryService, RegistrySnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where snapshots come from
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<RegistrySnapshot>;
}

/// Embedded registry in the same process
#[async_trait]
impl SnapshotSource for RegistryService {
    async fn fetch(&self) -> Result<RegistrySnapshot> {
        Ok(self.query_all())
    }
}

/// Remote registry over HTTP
#[async_trait]
impl SnapshotSource for RegistryClient {
    async fn fetch(&self) -> Result<RegistrySnapshot> {
        Ok(self.fetch_snapshot().await?)
    }
}

/// Lock-free holder of the current snapshot
///
/// ```
/// # tokio_test::block_on(async {
/// use lodestar_gateway::SnapshotCache;
/// use lodestar_registry::{Registration, RegistryConfig, RegistryService};
///
/// let registry = RegistryService::new(RegistryConfig::default().register_as_up(true));
/// registry
///     .register(Registration::new("file-storage-service", "fs-1", "10.0.0.1", 8081))
///     .unwrap();
///
/// let cache = SnapshotCache::default();
/// assert!(cache.refresh(&registry).await.unwrap());
/// assert_eq!(cache.load().up_instances("file-storage-service").len(), 1);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct SnapshotCache {
    current: ArcSwap<RegistrySnapshot>,
}

impl SnapshotCache {
    pub fn new(initial: RegistrySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// The snapshot in effect right now
    pub fn load(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Publish `snapshot` unless it is the generation already held.
    ///
    /// A generation is the registry's epoch plus its version, so a restarted
    /// registry always replaces what the previous one published. Returns
    /// whether a swap happened.
    pub fn store(&self, snapshot: RegistrySnapshot) -> bool {
        if self.current.load().same_generation(&snapshot) {
            return false;
        }
        debug!(
            epoch = %snapshot.epoch,
            version = snapshot.version,
            instances = snapshot.instance_count(),
            "Swapping registry snapshot"
        );
        self.current.store(Arc::new(snapshot));
        true
    }

    /// Fetch once from `source` and publish the result
    pub async fn refresh(&self, source: &dyn SnapshotSource) -> Result<bool> {
        let snapshot = source.fetch().await?;
        Ok(self.store(snapshot))
    }

    /// Refresh every `period` until `shutdown` is cancelled.
    ///
    /// The first refresh happens immediately. A failed refresh keeps the
    /// previous snapshot and is retried on the next tick. A zero period
    /// falls back to the default.
    pub fn start_refresh(
        self: &Arc<Self>,
        source: Arc<dyn SnapshotSource>,
        mut period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        if period.is_zero() {
            period = GatewayConfig::default().refresh_period();
            warn!(?period, "Snapshot refresh interval is zero, using the default");
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now(), period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Snapshot refresh stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = cache.refresh(source.as_ref()).await {
                            warn!(
                                error = %e,
                                version = cache.version(),
                                "Registry snapshot refresh failed, keeping previous snapshot"
                            );
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use lodestar_registry::{RegistryConfig, Registration};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_refresh_swaps_only_on_new_version() {
        let registry = RegistryService::new(RegistryConfig::default().register_as_up(true));
        let cache = SnapshotCache::default();

        registry
            .register(Registration::new("svc", "a", "10.0.0.1", 80))
            .unwrap();
        assert!(cache.refresh(&registry).await.unwrap());
        assert_eq!(cache.load().up_instances("svc").len(), 1);

        // Renewals do not change routing, so nothing to swap
        registry.renew("svc", "a").unwrap();
        assert!(!cache.refresh(&registry).await.unwrap());

        registry.deregister("svc", "a");
        assert!(cache.refresh(&registry).await.unwrap());
        assert!(cache.load().up_instances("svc").is_empty());
    }

    #[tokio::test]
    async fn test_restarted_registry_replaces_snapshot_at_same_version() {
        let before = RegistryService::new(RegistryConfig::default().register_as_up(true));
        before
            .register(Registration::new("svc", "old", "10.0.0.1", 80))
            .unwrap();
        let cache = SnapshotCache::default();
        assert!(cache.refresh(&before).await.unwrap());

        let after = RegistryService::new(RegistryConfig::default().register_as_up(true));
        after
            .register(Registration::new("svc", "new", "10.0.0.2", 80))
            .unwrap();
        assert_eq!(after.query_all().version, cache.version());

        assert!(cache.refresh(&after).await.unwrap());
        let ids: Vec<_> = cache
            .load()
            .up_instances("svc")
            .iter()
            .map(|i| i.instance_id.clone())
            .collect();
        assert_eq!(ids, vec!["new".to_string()]);
    }

    #[derive(Debug, Default)]
    struct FailingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SnapshotSource for FailingSource {
        async fn fetch(&self) -> Result<RegistrySnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::BadRequest("registry unreachable".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_survives_errors() {
        let mut initial = RegistrySnapshot::default();
        initial.version = 7;
        let cache = Arc::new(SnapshotCache::new(initial));
        let source = Arc::new(FailingSource::default());
        let shutdown = CancellationToken::new();

        let handle = cache.start_refresh(source.clone(), Duration::from_secs(5), shutdown.clone());
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.version(), 7);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_refresh_period_uses_default() {
        let cache = Arc::new(SnapshotCache::default());
        let source = Arc::new(FailingSource::default());
        let shutdown = CancellationToken::new();

        let handle = cache.start_refresh(source.clone(), Duration::ZERO, shutdown.clone());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
