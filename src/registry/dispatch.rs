//! Single delivery path from watches and sweeps to the listener.
//!
//! The snapshot only reflects what the listener acknowledged: a failed add
//! or change leaves the previous entry in place so the next sweep retries it.

use std::sync::Arc;

use log::{debug, error, info};

use crate::hosts::KnownHosts;
use crate::listener::ImportListener;
use crate::model::ServiceInstance;
use crate::snapshot::Snapshot;

pub(crate) struct Dispatcher {
    listener: Arc<dyn ImportListener>,
    hosts: Arc<dyn KnownHosts>,
    snapshot: Arc<Snapshot>,
}

impl Dispatcher {
    pub(crate) fn new(
        listener: Arc<dyn ImportListener>,
        hosts: Arc<dyn KnownHosts>,
        snapshot: Arc<Snapshot>,
    ) -> Self {
        Self {
            listener,
            hosts,
            snapshot,
        }
    }

    pub(crate) fn hosts(&self) -> &dyn KnownHosts {
        self.hosts.as_ref()
    }

    /// Delivers "add" and records the path. A repeated add overwrites the entry.
    pub(crate) fn install(&self, path: &str, instance: ServiceInstance) -> bool {
        match self.listener.add(&instance) {
            Ok(()) => {
                self.hosts.added(&instance);
                info!("added {instance} at {path}");
                self.snapshot.record(path, instance);
                true
            }
            Err(err) => {
                error!("listener rejected add of {instance} at {path}: {err}");
                false
            }
        }
    }

    pub(crate) fn change(&self, path: &str, old: &ServiceInstance, new: ServiceInstance) -> bool {
        match self.listener.change(old, &new) {
            Ok(()) => {
                self.hosts.added(&new);
                info!("changed {old} -> {new} at {path}");
                self.snapshot.record(path, new);
                true
            }
            Err(err) => {
                error!("listener rejected change of {old} at {path}: {err}");
                false
            }
        }
    }

    /// Delivers "delete" if, and only if, this call removed the path from the
    /// snapshot. Racing removers for the same path see `None`.
    pub(crate) fn remove(&self, path: &str) -> Option<ServiceInstance> {
        let Some(instance) = self.snapshot.take(path) else {
            debug!("{path} already absent from snapshot");
            return None;
        };
        match self.listener.delete(&instance) {
            Ok(()) => info!("deleted {instance} at {path}"),
            Err(err) => error!("listener rejected delete of {instance} at {path}: {err}"),
        }
        self.hosts.removed(&instance);
        Some(instance)
    }
}
