//! Process-local belief of registry state.
//!
//! The snapshot is the source the session lifecycle replays after a reset,
//! and the baseline the reconciliation sweep diffs against.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::model::{Service, ServiceInstance};

/// Local object that serves calls for an exported service.
pub type Handler = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct Snapshot {
    imported: DashSet<Service>,
    exported: DashMap<Service, Handler>,
    instances: DashMap<String, ServiceInstance>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, service: Service) {
        self.imported.insert(service);
    }

    pub fn unsubscribe(&self, service: &Service) -> bool {
        self.imported.remove(service).is_some()
    }

    pub fn is_imported(&self, service: &Service) -> bool {
        self.imported.contains(service)
    }

    pub fn imported(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.imported.iter().map(|s| s.key().clone()).collect();
        services.sort();
        services
    }

    pub fn export(&self, service: Service, handler: Handler) {
        self.exported.insert(service, handler);
    }

    pub fn logout(&self, service: &Service) -> Option<Handler> {
        self.exported.remove(service).map(|(_, handler)| handler)
    }

    pub fn handler(&self, service: &Service) -> Option<Handler> {
        self.exported.get(service).map(|h| Arc::clone(h.value()))
    }

    pub fn exported(&self) -> Vec<(Service, Handler)> {
        let mut entries: Vec<(Service, Handler)> = self
            .exported
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn instance(&self, path: &str) -> Option<ServiceInstance> {
        self.instances.get(path).map(|i| i.value().clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.instances.contains_key(path)
    }

    /// Returns the previous value for the path, if any.
    pub fn record(&self, path: &str, instance: ServiceInstance) -> Option<ServiceInstance> {
        self.instances.insert(path.to_string(), instance)
    }

    /// Removes and returns the entry. Only the caller that gets `Some` owns
    /// the matching "deleted" delivery.
    pub fn take(&self, path: &str) -> Option<ServiceInstance> {
        self.instances.remove(path).map(|(_, instance)| instance)
    }

    /// Drops every instance of `service` without notifying anyone.
    pub fn purge(&self, service: &Service) -> Vec<ServiceInstance> {
        let mut purged = Vec::new();
        self.instances.retain(|_, instance| {
            if &instance.service == service {
                purged.push(instance.clone());
                false
            } else {
                true
            }
        });
        purged
    }

    pub fn instances(&self) -> HashMap<String, ServiceInstance> {
        self.instances
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Host;

    fn instance(name: &str, addr: &str) -> ServiceInstance {
        ServiceInstance::new(Service::new(name, "1"), Host::new(addr))
    }

    #[test]
    fn record_is_keyed_by_path() {
        let snapshot = Snapshot::new();
        assert!(snapshot.record("/r/a/1/0", instance("a", "h:1")).is_none());
        assert!(snapshot.record("/r/a/1/0", instance("a", "h:1")).is_some());
        assert_eq!(snapshot.instance_count(), 1);
    }

    #[test]
    fn take_is_single_owner() {
        let snapshot = Snapshot::new();
        snapshot.record("/r/a/1/0", instance("a", "h:1"));
        assert!(snapshot.take("/r/a/1/0").is_some());
        assert!(snapshot.take("/r/a/1/0").is_none());
    }

    #[test]
    fn purge_only_touches_one_service() {
        let snapshot = Snapshot::new();
        snapshot.record("/r/a/1/0", instance("a", "h:1"));
        snapshot.record("/r/a/1/1", instance("a", "h:2"));
        snapshot.record("/r/b/1/0", instance("b", "h:1"));
        assert_eq!(snapshot.purge(&Service::new("a", "1")).len(), 2);
        assert_eq!(snapshot.instance_count(), 1);
    }

    #[test]
    fn handlers_round_trip_by_service() {
        let snapshot = Snapshot::new();
        let service = Service::new("a", "1");
        snapshot.export(service.clone(), Arc::new(42u32));
        let handler = snapshot.handler(&service).unwrap();
        assert_eq!(handler.downcast_ref::<u32>(), Some(&42));
        assert!(snapshot.logout(&service).is_some());
        assert!(snapshot.exported().is_empty());
    }
}
