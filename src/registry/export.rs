//! Ephemeral nodes published for exported services.

use std::sync::Arc;

use dashmap::DashMap;
use log::{error, info, warn};

use crate::codec::Codec;
use crate::model::{PublishedInstance, Service, ServiceInstance};
use crate::store::{CoordinationStore, CreateMode};
use crate::Result;

/// Outcome of a demotion pass, by node path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemoteReport {
    pub demoted: Vec<String>,
    pub failed: Vec<String>,
}

pub(crate) struct Exports {
    store: Arc<dyn CoordinationStore>,
    codec: Arc<dyn Codec>,
    /// Every node created per service, in creation order.
    published: DashMap<Service, Vec<PublishedInstance>>,
    /// Live exported node path -> payload last written there.
    exported: DashMap<String, ServiceInstance>,
}

impl Exports {
    pub(crate) fn new(store: Arc<dyn CoordinationStore>, codec: Arc<dyn Codec>) -> Self {
        Self {
            store,
            codec,
            published: DashMap::new(),
            exported: DashMap::new(),
        }
    }

    /// Creates an ephemeral sequential node under `dir` and records it.
    pub(crate) fn publish(&self, dir: &str, instance: ServiceInstance) -> Result<String> {
        let data = self.codec.encode_instance(&instance)?;
        let path = self
            .store
            .create(&format!("{dir}/"), &data, CreateMode::EphemeralSequential)?;
        self.record(path.clone(), instance);
        Ok(path)
    }

    fn record(&self, path: String, instance: ServiceInstance) {
        let service = instance.service.clone();
        // Entry API: concurrent first exports of a service share one list.
        self.published
            .entry(service.clone())
            .or_default()
            .push(PublishedInstance {
                instance: instance.clone(),
                path: path.clone(),
            });
        self.exported.insert(path.clone(), instance);
        info!("exported {service} at {path}");
    }

    /// Deletes every node created for `service`. Returns how many records were dropped.
    pub(crate) fn destroy_service(&self, service: &Service) -> usize {
        let Some((_, instances)) = self.published.remove(service) else {
            return 0;
        };
        for published in &instances {
            self.destroy_path(&published.path);
        }
        instances.len()
    }

    /// Deletes one node; an already-absent node only drops the record.
    pub(crate) fn destroy_path(&self, path: &str) {
        match self.store.delete(path, None) {
            Ok(()) => info!("withdrew {path}"),
            Err(err) if err.is_no_node() => {}
            Err(err) => error!("failed to withdraw {path}: {err}"),
        }
        self.exported.remove(path);
    }

    /// Withdraws every exported node and forgets all records.
    pub(crate) fn destroy_all(&self) {
        let paths: Vec<String> = self.exported.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            self.destroy_path(&path);
        }
        self.published.clear();
    }

    /// Rewrites every exported node with priority zero.
    pub(crate) fn demote(&self) -> DemoteReport {
        let targets: Vec<(String, ServiceInstance)> = self
            .exported
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut report = DemoteReport::default();
        for (path, instance) in targets {
            let demoted = instance.demoted();
            let written = self
                .codec
                .encode_instance(&demoted)
                .and_then(|data| self.store.set_data(&path, &data, None));
            match written {
                Ok(_) => {
                    info!("demoted {} at {path}", demoted.host);
                    self.exported.insert(path.clone(), demoted);
                    report.demoted.push(path);
                }
                Err(err) => {
                    warn!("failed to demote {path}: {err}");
                    report.failed.push(path);
                }
            }
        }
        report
    }

    pub(crate) fn instances(&self) -> Vec<ServiceInstance> {
        let mut instances: Vec<(String, ServiceInstance)> = self
            .exported
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        instances.sort_by(|a, b| a.0.cmp(&b.0));
        instances.into_iter().map(|(_, instance)| instance).collect()
    }

    pub(crate) fn published(&self, service: &Service) -> Vec<PublishedInstance> {
        self.published
            .get(service)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub(crate) fn services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.published.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }
}
