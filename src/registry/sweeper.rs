//! Periodic re-listing of every imported service.
//!
//! Watches can be lost (notifications dropped during a disconnect, a
//! re-registering read that failed). The sweep compares the store against the
//! snapshot and pushes the difference through the dispatcher so the listener
//! converges within one refresh interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};

use super::import::ImportContext;
use crate::model::{Service, ServiceInstance};
use crate::store::child_path;
use crate::Result;

/// Corrections applied by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub services: usize,
    pub installed: usize,
    pub updated: usize,
    pub removed: usize,
    /// Deliveries the listener rejected; retried on the next sweep.
    pub failed: usize,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.installed == 0 && self.updated == 0 && self.removed == 0 && self.failed == 0
    }
}

pub(crate) struct Sweeper {
    ctx: Arc<ImportContext>,
    running: AtomicBool,
}

struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Sweeper {
    pub(crate) fn new(ctx: Arc<ImportContext>) -> Self {
        Self {
            ctx,
            running: AtomicBool::new(false),
        }
    }

    /// Runs one pass. `Ok(None)` if another pass or a subscribe is in flight.
    pub(crate) fn run_once(&self) -> Result<Option<SweepReport>> {
        if self.ctx.subscription_in_progress() {
            debug!("subscribe in progress, skipping sweep");
            return Ok(None);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sweep already running");
            return Ok(None);
        }
        let _running = Running(&self.running);

        let services = self.ctx.snapshot.imported();
        // Belief first: a watch landing mid-listing then shows up as a
        // repeated add, never as a delete of a live node.
        let known = self.ctx.snapshot.instances();
        let current = self.list(&services)?;

        let mut updates = Vec::new();
        let mut installs = Vec::new();
        for (path, instance) in &current {
            match known.get(path) {
                // Known path the host index lost track of: re-add.
                Some(_) if !self.ctx.dispatcher.hosts().contains(instance) => {
                    installs.push((path.clone(), instance.clone()))
                }
                Some(old) if old.host.property_changed(&instance.host) => {
                    updates.push((path.clone(), old.clone(), instance.clone()))
                }
                Some(_) => {}
                None => installs.push((path.clone(), instance.clone())),
            }
        }
        let mut removes: Vec<&String> = known
            .iter()
            .filter(|(path, instance)| {
                !current.contains_key(*path) && services.contains(&instance.service)
            })
            .map(|(path, _)| path)
            .collect();
        removes.sort();
        updates.sort_by(|a, b| a.0.cmp(&b.0));
        installs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut report = SweepReport {
            services: services.len(),
            ..SweepReport::default()
        };
        for (path, old, new) in updates {
            if self.ctx.is_withdrawn(&new.service) {
                continue;
            }
            if self.ctx.dispatcher.change(&path, &old, new) {
                report.updated += 1;
            } else {
                report.failed += 1;
            }
        }
        for path in removes {
            if self.ctx.dispatcher.remove(path).is_some() {
                report.removed += 1;
            }
        }
        for (path, instance) in installs {
            if self.ctx.is_withdrawn(&instance.service) {
                continue;
            }
            if !self.ctx.has_data_watch(&path) {
                match self.ctx.watch_data(&instance.service, &path) {
                    Ok(_) => {}
                    Err(err) if err.is_no_node() => {
                        debug!("{path} deleted before it could be re-watched");
                        continue;
                    }
                    Err(err) => debug!("could not re-watch {path}: {err}"),
                }
            }
            if self.ctx.dispatcher.install(&path, instance) {
                report.installed += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.is_clean() {
            debug!("sweep of {} services found nothing to fix", report.services);
        } else {
            info!(
                "sweep corrected {} installs, {} updates, {} removes ({} failed)",
                report.installed, report.updated, report.removed, report.failed
            );
        }
        Ok(Some(report))
    }

    /// Reads every instance under the given services' directories.
    fn list(&self, services: &[Service]) -> Result<HashMap<String, ServiceInstance>> {
        let ctx = &self.ctx;
        let mut current = HashMap::new();
        for service in services {
            let dir = ctx.layout.service_dir(service);
            let children = match ctx.store.get_children(&dir, None) {
                Ok(children) => children,
                Err(err) if err.is_no_node() => continue,
                Err(err) => {
                    error!("sweep aborted listing {dir}: {err}");
                    return Err(err);
                }
            };
            for child in children {
                let path = child_path(&dir, &child);
                let read = ctx
                    .store
                    .get_data(&path, None)
                    .and_then(|data| ctx.codec.decode_instance(&data));
                match read {
                    Ok(instance) => {
                        current.insert(path, instance);
                    }
                    Err(err) if err.is_no_node() => debug!("{path} vanished during sweep"),
                    Err(err) => error!("sweep skipped unreadable {path}: {err}"),
                }
            }
        }
        Ok(current)
    }
}
