//! Subscriptions, directory watches and per-instance watches.
//!
//! Every subscribed service directory carries one children watch; every node
//! under it carries one data watch. Both kinds reach the listener only
//! through the dispatcher, and both tolerate the other having already
//! delivered the same removal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::{DashMap, DashSet};
use log::{debug, error, info, warn};

use super::dispatch::Dispatcher;
use super::paths::Layout;
use super::retry::RetryQueue;
use super::watch::WatchCell;
use crate::codec::Codec;
use crate::config::RegistryConfig;
use crate::diff::diff;
use crate::model::{Service, ServiceInstance};
use crate::snapshot::Snapshot;
use crate::store::{child_path, CoordinationStore, EventKind, WatchedEvent, Watcher};
use crate::{Error, Result};

/// Shared state of the import side, handed to watches, the sweeper and the
/// retry worker.
pub(crate) struct ImportContext {
    pub(crate) store: Arc<dyn CoordinationStore>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) snapshot: Arc<Snapshot>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) layout: Layout,
    pub(crate) config: Arc<RegistryConfig>,
    pub(crate) retry: Arc<RetryQueue>,
    withdrawn: DashSet<Service>,
    children_watches: DashMap<Service, Arc<ChildrenWatch>>,
    data_watches: DashMap<String, Arc<DataWatch>>,
    subscribing: AtomicUsize,
}

struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Busy(counter)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ImportContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        codec: Arc<dyn Codec>,
        snapshot: Arc<Snapshot>,
        dispatcher: Dispatcher,
        layout: Layout,
        config: Arc<RegistryConfig>,
        retry: Arc<RetryQueue>,
    ) -> Self {
        Self {
            store,
            codec,
            snapshot,
            dispatcher,
            layout,
            config,
            retry,
            withdrawn: DashSet::new(),
            children_watches: DashMap::new(),
            data_watches: DashMap::new(),
            subscribing: AtomicUsize::new(0),
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>, service: &Service) -> Result<bool> {
        self.subscribe_attempt(service, 1)
    }

    /// Lists the service directory, arms its watches and delivers every
    /// instance found. A missing directory schedules a retry.
    pub(crate) fn subscribe_attempt(self: &Arc<Self>, service: &Service, attempt: u32) -> Result<bool> {
        if !self.config.import_enabled_for(service) {
            warn!("import disabled for {service}");
            return Ok(false);
        }
        self.withdrawn.remove(service);
        let _busy = Busy::enter(&self.subscribing);

        let dir = self.layout.service_dir(service);
        let watch = Arc::new(ChildrenWatch {
            service: service.clone(),
            dir: dir.clone(),
            cell: WatchCell::armed(),
            children: Mutex::new(Vec::new()),
            ctx: Arc::downgrade(self),
        });
        let children = {
            // Held across the listing so an early notification sees it.
            let mut listing = watch.lock_children()?;
            match self.store.get_children(&dir, Some(watch.clone())) {
                Ok(mut children) => {
                    children.sort();
                    listing.clone_from(&children);
                    children
                }
                Err(err) if err.is_no_node() => {
                    watch.cell.cancel();
                    info!("no instances of {service} at {dir} yet (attempt {attempt})");
                    drop(listing);
                    self.schedule_retry(service, attempt);
                    return Ok(false);
                }
                Err(err) => {
                    watch.cell.cancel();
                    error!("failed to list {dir} for {service}: {err}");
                    return Ok(false);
                }
            }
        };
        if let Some(previous) = self.children_watches.insert(service.clone(), watch) {
            previous.cell.cancel();
        }

        for child in children {
            let path = child_path(&dir, &child);
            match self.watch_data(service, &path) {
                Ok(instance) => {
                    self.dispatcher.install(&path, instance);
                }
                Err(err) => info!("skipping {path} while importing {service}: {err}"),
            }
        }
        self.snapshot.subscribe(service.clone());
        info!("imported {service}");
        Ok(true)
    }

    /// Marks the service withdrawn, disarms its watches and drops its
    /// instances without delivering anything.
    pub(crate) fn unsubscribe(&self, service: &Service) {
        self.withdrawn.insert(service.clone());
        self.snapshot.unsubscribe(service);
        if let Some((_, watch)) = self.children_watches.remove(service) {
            watch.cell.cancel();
        }
        self.data_watches.retain(|_, watch| {
            if &watch.service == service {
                watch.cell.cancel();
                false
            } else {
                true
            }
        });
        let purged = self.snapshot.purge(service);
        for instance in &purged {
            self.dispatcher.hosts().removed(instance);
        }
        info!("unsubscribed {service}, dropped {} instances", purged.len());
    }

    pub(crate) fn is_withdrawn(&self, service: &Service) -> bool {
        self.withdrawn.contains(service)
    }

    /// True while a live children watch covers the service directory.
    pub(crate) fn is_watching(&self, service: &Service) -> bool {
        self.children_watches
            .get(service)
            .map(|w| !w.cell.is_cancelled())
            .unwrap_or(false)
    }

    pub(crate) fn has_data_watch(&self, path: &str) -> bool {
        self.data_watches
            .get(path)
            .map(|w| !w.cell.is_cancelled())
            .unwrap_or(false)
    }

    pub(crate) fn subscription_in_progress(&self) -> bool {
        self.subscribing.load(Ordering::Acquire) > 0
    }

    pub(crate) fn schedule_retry(&self, service: &Service, attempt: u32) {
        if let Some(max) = self.config.reinstall_max_attempts {
            if attempt >= max {
                warn!("giving up on {service} after {attempt} attempts");
                return;
            }
        }
        match self.retry.schedule(service.clone(), attempt) {
            Ok(_) => debug!(
                "retrying {service} in {:?} (attempt {})",
                self.config.reinstall_delay(),
                attempt + 1
            ),
            Err(err) => debug!("not retrying {service}: {err}"),
        }
    }

    /// Reads `path` with a fresh data watch, replacing any previous one.
    pub(crate) fn watch_data(self: &Arc<Self>, service: &Service, path: &str) -> Result<ServiceInstance> {
        let watch = Arc::new(DataWatch {
            service: service.clone(),
            path: path.to_string(),
            cell: WatchCell::armed(),
            delivery: Mutex::new(()),
            ctx: Arc::downgrade(self),
        });
        if let Some(previous) = self.data_watches.insert(path.to_string(), watch.clone()) {
            previous.cell.cancel();
        }
        let read = self
            .store
            .get_data(path, Some(watch.clone()))
            .and_then(|data| self.codec.decode_instance(&data));
        if read.is_err() {
            watch.cell.cancel();
            self.forget_data_watch(&watch);
        }
        read
    }

    fn forget_data_watch(&self, watch: &Arc<DataWatch>) {
        self.data_watches
            .remove_if(&watch.path, |_, current| Arc::ptr_eq(current, watch));
    }

    fn forget_children_watch(&self, watch: &Arc<ChildrenWatch>) {
        self.children_watches
            .remove_if(&watch.service, |_, current| Arc::ptr_eq(current, watch));
    }

    fn on_children_changed(self: &Arc<Self>, watch: &Arc<ChildrenWatch>) -> Result<()> {
        let changes = {
            let mut listing = watch.lock_children()?;
            if !watch.cell.rearm() {
                return Ok(());
            }
            let mut current = match self.store.get_children(&watch.dir, Some(watch.clone())) {
                Ok(current) => current,
                Err(err) => {
                    watch.cell.cancel();
                    self.forget_children_watch(watch);
                    drop(listing);
                    self.schedule_retry(&watch.service, 1);
                    return if err.is_no_node() {
                        warn!("directory {} vanished while re-listing", watch.dir);
                        Ok(())
                    } else {
                        Err(err)
                    };
                }
            };
            current.sort();
            let previous = std::mem::replace(&mut *listing, current);
            diff(previous.as_slice(), listing.as_slice())
        };
        debug!(
            "{}: {} added, {} deleted",
            watch.dir,
            changes.added.len(),
            changes.deleted.len()
        );

        for child in changes.added {
            if self.is_withdrawn(&watch.service) {
                break;
            }
            let path = child_path(&watch.dir, &child);
            match self.watch_data(&watch.service, &path) {
                Ok(instance) => {
                    self.dispatcher.install(&path, instance);
                }
                Err(err) if err.is_no_node() => debug!("{path} deleted before it could be read"),
                Err(err) => error!("failed to read new instance {path}: {err}"),
            }
        }
        // Normally the child's own data watch has already delivered these.
        for child in changes.deleted {
            let path = child_path(&watch.dir, &child);
            if let Some((_, stale)) = self.data_watches.remove(&path) {
                stale.cell.cancel();
            }
            self.dispatcher.remove(&path);
        }
        Ok(())
    }

    fn on_data_changed(self: &Arc<Self>, watch: &Arc<DataWatch>) -> Result<()> {
        let _ordered = watch
            .delivery
            .lock()
            .map_err(|_| Error::Poisoned("data watch delivery"))?;
        if !watch.cell.rearm() {
            return Ok(());
        }
        let data = match self.store.get_data(&watch.path, Some(watch.clone())) {
            Ok(data) => data,
            Err(err) if err.is_no_node() => {
                watch.cell.cancel();
                self.forget_data_watch(watch);
                self.dispatcher.remove(&watch.path);
                return Ok(());
            }
            Err(err) => {
                watch.cell.cancel();
                self.forget_data_watch(watch);
                return Err(err);
            }
        };
        let fresh = match self.codec.decode_instance(&data) {
            Ok(fresh) => fresh,
            Err(err) => {
                error!("unreadable instance at {}: {err}", watch.path);
                return Ok(());
            }
        };
        if self.is_withdrawn(&watch.service) {
            watch.cell.cancel();
            return Ok(());
        }
        match self.snapshot.instance(&watch.path) {
            Some(old) => {
                self.dispatcher.change(&watch.path, &old, fresh);
            }
            None => {
                self.dispatcher.install(&watch.path, fresh);
            }
        }
        Ok(())
    }

    fn on_node_deleted(&self, watch: &Arc<DataWatch>) -> Result<()> {
        let _ordered = watch
            .delivery
            .lock()
            .map_err(|_| Error::Poisoned("data watch delivery"))?;
        watch.cell.cancel();
        self.forget_data_watch(watch);
        self.dispatcher.remove(&watch.path);
        Ok(())
    }
}

/// Watch on a service directory's child list.
pub(crate) struct ChildrenWatch {
    service: Service,
    dir: String,
    cell: WatchCell,
    /// Last listing, sorted.
    children: Mutex<Vec<String>>,
    ctx: Weak<ImportContext>,
}

impl ChildrenWatch {
    fn lock_children(&self) -> Result<MutexGuard<'_, Vec<String>>> {
        self.children
            .lock()
            .map_err(|_| Error::Poisoned("children watch listing"))
    }
}

impl Watcher for ChildrenWatch {
    fn process(self: Arc<Self>, event: &WatchedEvent) -> Result<()> {
        if !self.cell.fire() {
            debug!("ignoring {event} on inactive children watch");
            return Ok(());
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return Ok(());
        };
        if ctx.is_withdrawn(&self.service) {
            self.cell.cancel();
            warn!("dropping {event} for unsubscribed {}", self.service);
            return Ok(());
        }
        debug!("children watch received {event}");
        match event.kind {
            EventKind::NodeChildrenChanged => ctx
                .on_children_changed(&self)
                .map_err(|err| Error::runtime("children watch", err)),
            EventKind::NodeDeleted => {
                self.cell.cancel();
                ctx.forget_children_watch(&self);
                warn!("directory {} of {} was deleted", self.dir, self.service);
                ctx.schedule_retry(&self.service, 1);
                Ok(())
            }
            _ => {
                warn!("children watch cannot handle {event}");
                if self.cell.rearm() {
                    ctx.store.get_children(&self.dir, Some(self.clone()))?;
                }
                Ok(())
            }
        }
    }
}

/// Watch on a single instance node.
pub(crate) struct DataWatch {
    service: Service,
    path: String,
    cell: WatchCell,
    /// Serializes deliveries for this path.
    delivery: Mutex<()>,
    ctx: Weak<ImportContext>,
}

impl Watcher for DataWatch {
    fn process(self: Arc<Self>, event: &WatchedEvent) -> Result<()> {
        if !self.cell.fire() {
            debug!("ignoring {event} on inactive data watch");
            return Ok(());
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return Ok(());
        };
        if ctx.is_withdrawn(&self.service) {
            self.cell.cancel();
            warn!("dropping {event} for unsubscribed {}", self.service);
            return Ok(());
        }
        debug!("data watch received {event}");
        match event.kind {
            EventKind::NodeDataChanged => ctx
                .on_data_changed(&self)
                .map_err(|err| Error::runtime("data watch", err)),
            EventKind::NodeDeleted => ctx.on_node_deleted(&self),
            _ => {
                warn!("data watch cannot handle {event}");
                if self.cell.rearm() {
                    ctx.store.get_data(&self.path, Some(self.clone()))?;
                }
                Ok(())
            }
        }
    }
}
