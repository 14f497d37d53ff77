//! Index of hosts the listener has acknowledged, per service.
//!
//! The reconciliation sweep treats a live node whose host is missing from
//! this index as not installed, even if the snapshot already holds its path.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::model::{Service, ServiceInstance};

pub trait KnownHosts: Send + Sync {
    fn contains(&self, instance: &ServiceInstance) -> bool;

    /// Called after the listener acknowledged an add or change.
    fn added(&self, _instance: &ServiceInstance) {}

    /// Called after the listener acknowledged a delete.
    fn removed(&self, _instance: &ServiceInstance) {}
}

#[derive(Debug, Default)]
pub struct HostIndex {
    hosts: DashMap<Service, HashSet<String>>,
}

impl HostIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hosts(&self, service: &Service) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .hosts
            .get(service)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        hosts.sort();
        hosts
    }
}

impl KnownHosts for HostIndex {
    fn contains(&self, instance: &ServiceInstance) -> bool {
        self.hosts
            .get(&instance.service)
            .map(|set| set.contains(&instance.host.address))
            .unwrap_or(false)
    }

    fn added(&self, instance: &ServiceInstance) {
        self.hosts
            .entry(instance.service.clone())
            .or_default()
            .insert(instance.host.address.clone());
    }

    fn removed(&self, instance: &ServiceInstance) {
        if let Some(mut set) = self.hosts.get_mut(&instance.service) {
            set.remove(&instance.host.address);
        }
        self.hosts.remove_if(&instance.service, |_, set| set.is_empty());
    }
}
