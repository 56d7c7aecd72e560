//! Instance Load Balancing
//!
//! Picks one instance out of a service's UP set for every attempt.
//!
//! # Strategies
//!
//! - **Round Robin**: per-service cursor over the UP set in instance id order
//! - **Random**: uniform random choice
//! - **Least Connections**: fewest in-flight requests, ties broken by order
//!
//! In-flight requests are counted with a [`ConnectionGuard`] held for the
//! lifetime of an attempt. Counters exist only while non-zero; cursors of
//! services that leave the registry are dropped with
//! [`LoadBalancer::retain_services`].

use dashmap::DashMap;
use lodestar_registry::ServiceInstance;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================================================
// Load Balancing Strategy
// ============================================================================

/// Load balancing strategy for instance selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Rotate through instances
    #[default]
    RoundRobin,
    /// Random selection
    Random,
    /// Route to the instance with the fewest in-flight requests
    LeastConnections,
}

// ============================================================================
// Load Balancer
// ============================================================================

/// Instance selector shared by all requests.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    strategy: LoadBalanceStrategy,
    /// Round-robin position per service
    cursors: DashMap<String, AtomicUsize>,
    /// In-flight requests per instance key
    in_flight: DashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy,
            cursors: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    #[inline]
    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    /// Choose one of `candidates` for `service`.
    ///
    /// `candidates` must be in a stable order (the snapshot's id order) for
    /// round-robin to be fair. Returns `None` only when `candidates` is empty.
    pub fn select<'a>(
        &self,
        service: &str,
        candidates: &[&'a ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(candidates[0]);
        }

        let index = match self.strategy {
            LoadBalanceStrategy::RoundRobin => self.next_cursor(service) % candidates.len(),
            LoadBalanceStrategy::Random => rand::rng().random_range(0..candidates.len()),
            LoadBalanceStrategy::LeastConnections => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, instance)| self.in_flight(instance))
                .map(|(index, _)| index)
                .unwrap_or(0),
        };
        candidates.get(index).copied()
    }

    fn next_cursor(&self, service: &str) -> usize {
        if let Some(cursor) = self.cursors.get(service) {
            return cursor.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Forget round-robin positions of services `keep` rejects.
    pub fn retain_services(&self, keep: impl Fn(&str) -> bool) {
        self.cursors.retain(|service, _| keep(service));
    }

    /// Number of requests currently forwarded to `instance`.
    pub fn in_flight(&self, instance: &ServiceInstance) -> usize {
        self.in_flight
            .get(&instance.key().to_string())
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Count a request against `instance` until the guard drops.
    pub fn acquire(&self, instance: &ServiceInstance) -> ConnectionGuard<'_> {
        let key = instance.key().to_string();
        self.in_flight
            .entry(key.clone())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            in_flight: &self.in_flight,
            key,
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> (usize, usize) {
        (self.cursors.len(), self.in_flight.len())
    }
}

// ============================================================================
// Connection Guard
// ============================================================================

/// RAII guard for in-flight tracking.
#[derive(Debug)]
pub struct ConnectionGuard<'a> {
    in_flight: &'a DashMap<String, AtomicUsize>,
    key: String,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        // Decrement and removal share the shard lock with `acquire`
        self.in_flight
            .remove_if(&self.key, |_, count| count.fetch_sub(1, Ordering::Relaxed) == 1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_registry::{InstanceStatus, Registration};
    use std::collections::HashMap;

    fn instances(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| {
                let mut instance = ServiceInstance::from_registration(
                    Registration::new("svc", format!("i-{}", i), "10.0.0.1", 8000 + i as u16),
                    chrono::Utc::now(),
                );
                instance.status = InstanceStatus::Up;
                instance
            })
            .collect()
    }

    #[test]
    fn test_round_robin_is_uniform() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::RoundRobin);
        let pool = instances(3);
        let candidates: Vec<&ServiceInstance> = pool.iter().collect();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for _ in 0..300 {
            let chosen = lb.select("svc", &candidates).unwrap();
            *counts.entry(chosen.instance_id.as_str()).or_default() += 1;
        }
        assert!(counts.values().all(|&c| c == 100), "{:?}", counts);
    }

    #[test]
    fn test_cursors_are_per_service() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::RoundRobin);
        let pool = instances(2);
        let candidates: Vec<&ServiceInstance> = pool.iter().collect();

        assert_eq!(lb.select("a", &candidates).unwrap().instance_id, "i-0");
        assert_eq!(lb.select("b", &candidates).unwrap().instance_id, "i-0");
        assert_eq!(lb.select("a", &candidates).unwrap().instance_id, "i-1");
    }

    #[test]
    fn test_empty_and_single() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::Random);
        assert!(lb.select("svc", &[]).is_none());

        let pool = instances(1);
        let candidates: Vec<&ServiceInstance> = pool.iter().collect();
        assert_eq!(lb.select("svc", &candidates).unwrap().instance_id, "i-0");
    }

    #[test]
    fn test_random_stays_in_range() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::Random);
        let pool = instances(4);
        let candidates: Vec<&ServiceInstance> = pool.iter().collect();
        for _ in 0..100 {
            assert!(lb.select("svc", &candidates).is_some());
        }
    }

    #[test]
    fn test_least_connections_and_guard() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::LeastConnections);
        let pool = instances(2);
        let candidates: Vec<&ServiceInstance> = pool.iter().collect();

        let guard = lb.acquire(&pool[0]);
        assert_eq!(lb.in_flight(&pool[0]), 1);
        assert_eq!(lb.select("svc", &candidates).unwrap().instance_id, "i-1");

        drop(guard);
        assert_eq!(lb.in_flight(&pool[0]), 0);
        assert_eq!(lb.select("svc", &candidates).unwrap().instance_id, "i-0");
    }

    #[test]
    fn test_idle_counters_are_dropped() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::LeastConnections);
        let pool = instances(50);

        let first = lb.acquire(&pool[0]);
        let second = lb.acquire(&pool[0]);
        for instance in &pool[1..] {
            drop(lb.acquire(instance));
        }
        assert_eq!(lb.tracked().1, 1);

        drop(first);
        assert_eq!(lb.in_flight(&pool[0]), 1);
        drop(second);
        assert_eq!(lb.in_flight(&pool[0]), 0);
        assert_eq!(lb.tracked().1, 0);

        // A later request starts from zero again
        let _again = lb.acquire(&pool[0]);
        assert_eq!(lb.in_flight(&pool[0]), 1);
    }

    #[test]
    fn test_retain_services_drops_cursors() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::RoundRobin);
        let pool = instances(2);
        let candidates: Vec<&ServiceInstance> = pool.iter().collect();
        for service in ["a", "b", "c"] {
            lb.select(service, &candidates);
        }
        lb.select("a", &candidates);
        assert_eq!(lb.tracked().0, 3);

        lb.retain_services(|service| service == "a");
        assert_eq!(lb.tracked().0, 1);
        // "a" keeps its position
        assert_eq!(lb.select("a", &candidates).unwrap().instance_id, "i-0");
    }

    #[test]
    fn test_strategy_from_config() {
        let strategy: LoadBalanceStrategy =
            serde_json::from_str("\"least_connections\"").unwrap();
        assert_eq!(strategy, LoadBalanceStrategy::LeastConnections);
        assert_eq!(LoadBalanceStrategy::default(), LoadBalanceStrategy::RoundRobin);
    }
}
