//! Concurrent instance store
//!
//! Entries are immutable `Arc<ServiceInstance>` values replaced wholesale
//! under a short write lock. Readers clone the `Arc`s they need and drop the
//! lock immediately, so a snapshot never blocks behind a writer for long and
//! never observes a half-updated instance.

use crate::instance::ServiceInstance;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

type ServiceMap = HashMap<String, HashMap<String, Arc<ServiceInstance>>>;

/// Point-in-time copy of the registry contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Identifies the store the snapshot came from; new on every registry start
    #[serde(default)]
    pub epoch: Uuid,
    /// Store generation the snapshot was taken at
    pub version: u64,
    pub taken_at: DateTime<Utc>,
    /// Instances per service, sorted by instance id
    pub services: BTreeMap<String, Vec<ServiceInstance>>,
}

impl RegistrySnapshot {
    /// All instances of a service, whatever their status
    pub fn instances(&self, service_name: &str) -> &[ServiceInstance] {
        self.services
            .get(service_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Routable instances of a service, in id order
    pub fn up_instances(&self, service_name: &str) -> Vec<&ServiceInstance> {
        self.instances(service_name)
            .iter()
            .filter(|i| i.is_up())
            .collect()
    }

    pub fn contains_service(&self, service_name: &str) -> bool {
        self.services.contains_key(service_name)
    }

    /// Whether both snapshots were taken at the same generation of the same store
    pub fn same_generation(&self, other: &RegistrySnapshot) -> bool {
        self.epoch == other.epoch && self.version == other.version
    }

    pub fn instance_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Keep only instances matching `keep`, dropping services left empty
    pub fn retain(mut self, mut keep: impl FnMut(&ServiceInstance) -> bool) -> Self {
        for instances in self.services.values_mut() {
            instances.retain(|i| keep(i));
        }
        self.services.retain(|_, instances| !instances.is_empty());
        self
    }
}

/// Instance store keyed by service name, then instance id
#[derive(Debug)]
pub struct InstanceStore {
    services: RwLock<ServiceMap>,
    epoch: Uuid,
    /// Bumped on every change a router could observe
    generation: AtomicU64,
}

impl Default for InstanceStore {
    fn default() -> Self {
        Self {
            services: RwLock::default(),
            epoch: Uuid::new_v4(),
            generation: AtomicU64::new(0),
        }
    }
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an instance, returning the previous entry
    pub fn put(&self, instance: ServiceInstance) -> Option<Arc<ServiceInstance>> {
        self.upsert_with(&instance.service_name.clone(), &instance.instance_id.clone(), |_| {
            instance
        })
        .1
    }

    /// Insert or replace an instance built from the current entry, atomically.
    ///
    /// Returns the stored instance and the one it replaced.
    pub fn upsert_with<F>(
        &self,
        service_name: &str,
        instance_id: &str,
        build: F,
    ) -> (Arc<ServiceInstance>, Option<Arc<ServiceInstance>>)
    where
        F: FnOnce(Option<&ServiceInstance>) -> ServiceInstance,
    {
        let mut services = self.services.write();
        let instances = services.entry(service_name.to_string()).or_default();

        let next = Arc::new(build(instances.get(instance_id).map(Arc::as_ref)));
        let previous = instances.insert(instance_id.to_string(), Arc::clone(&next));

        let changed = previous
            .as_ref()
            .is_none_or(|prev| prev.routing_differs(&next));
        if changed {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        (next, previous)
    }

    pub fn get(&self, service_name: &str, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        self.services
            .read()
            .get(service_name)
            .and_then(|instances| instances.get(instance_id))
            .cloned()
    }

    /// Replace an entry with the result of `f`.
    ///
    /// `f` returns `None` to leave the entry untouched. The outer `None`
    /// means no such entry exists; otherwise the current entry is returned.
    pub fn update<F>(
        &self,
        service_name: &str,
        instance_id: &str,
        f: F,
    ) -> Option<Arc<ServiceInstance>>
    where
        F: FnOnce(&ServiceInstance) -> Option<ServiceInstance>,
    {
        let mut services = self.services.write();
        let slot = services.get_mut(service_name)?.get_mut(instance_id)?;

        if let Some(next) = f(slot) {
            if slot.routing_differs(&next) {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            *slot = Arc::new(next);
        }
        Some(Arc::clone(slot))
    }

    /// Remove an instance, dropping its service once empty
    pub fn remove(&self, service_name: &str, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        self.remove_if(service_name, instance_id, |_| true)
    }

    /// Remove an instance only if `predicate` still holds under the write lock
    pub fn remove_if<P>(
        &self,
        service_name: &str,
        instance_id: &str,
        predicate: P,
    ) -> Option<Arc<ServiceInstance>>
    where
        P: FnOnce(&ServiceInstance) -> bool,
    {
        let mut services = self.services.write();
        let instances = services.get_mut(service_name)?;

        if !predicate(instances.get(instance_id)?) {
            return None;
        }
        let removed = instances.remove(instance_id);
        if instances.is_empty() {
            services.remove(service_name);
        }
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    /// Visit every instance `is_expired` selects.
    ///
    /// Candidates are gathered under the read lock and visited after it is
    /// released, so `visit` may write back to the store. Writers re-check
    /// their condition, e.g. through [`InstanceStore::remove_if`].
    pub fn for_each_expired<P, F>(&self, mut is_expired: P, mut visit: F)
    where
        P: FnMut(&ServiceInstance) -> bool,
        F: FnMut(Arc<ServiceInstance>),
    {
        let candidates: Vec<Arc<ServiceInstance>> = {
            let services = self.services.read();
            services
                .values()
                .flat_map(HashMap::values)
                .filter(|i| is_expired(i))
                .cloned()
                .collect()
        };

        for instance in candidates {
            visit(instance);
        }
    }

    /// Instances of one service, sorted by id
    pub fn instances_of(&self, service_name: &str) -> Vec<Arc<ServiceInstance>> {
        let mut list: Vec<Arc<ServiceInstance>> = self
            .services
            .read()
            .get(service_name)
            .map(|instances| instances.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }

    /// Every instance currently stored
    pub fn instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.services
            .read()
            .values()
            .flat_map(HashMap::values)
            .cloned()
            .collect()
    }

    /// Consistent copy of the whole store
    pub fn snapshot(&self, taken_at: DateTime<Utc>) -> RegistrySnapshot {
        let services = self.services.read();
        let version = self.generation.load(Ordering::Acquire);

        let services = services
            .iter()
            .map(|(name, instances)| {
                let mut list: Vec<ServiceInstance> =
                    instances.values().map(|i| ServiceInstance::clone(i)).collect();
                list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
                (name.clone(), list)
            })
            .collect();

        RegistrySnapshot {
            epoch: self.epoch,
            version,
            taken_at,
            services,
        }
    }

    /// Number of stored instances
    pub fn len(&self) -> usize {
        self.services.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
