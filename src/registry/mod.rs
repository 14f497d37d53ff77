//! The registry: exports local services, imports remote ones, and keeps both
//! consistent with the coordination store across watch gaps and session loss.
//!
//! ```no_run
//! use std::sync::Arc;
//! use beacon::{LocalHost, MemoryStore, Registry, Service};
//! # fn listener() -> Arc<dyn beacon::ImportListener> { unimplemented!() }
//!
//! let store = MemoryStore::new();
//! let registry = Registry::builder(Arc::new(store.session()), listener(), LocalHost::new("10.0.0.1:7000"))
//!     .build()?;
//! registry.start()?;
//! registry.export(Service::new("com.acme.Orders", "1.0"), Arc::new(()))?;
//! registry.ready()?;
//! registry.subscribe(&Service::new("com.acme.Billing", "2.1"))?;
//! # Ok::<(), beacon::Error>(())
//! ```

mod buffer;
mod dispatch;
mod export;
mod import;
mod paths;
mod publish;
mod retry;
mod sweeper;
mod watch;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{error, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::{ConfigSource, MemoryConfig, RegistryConfig};
use crate::hosts::{HostIndex, KnownHosts};
use crate::listener::ImportListener;
use crate::model::{LocalHost, PublishedInstance, Service, ServiceInstance, StatusSource};
use crate::snapshot::{Handler, Snapshot};
use crate::store::{CoordinationStore, SessionEvent};
use crate::{Error, Result};

use buffer::StartupBuffer;
use dispatch::Dispatcher;
use export::Exports;
use import::ImportContext;
use paths::{mkdirs, Layout};
use publish::Publisher;
use sweeper::Sweeper;

pub use export::DemoteReport;
pub use retry::{Reinstall, RetryQueue};
pub use sweeper::SweepReport;
pub use watch::WatchState;

pub struct RegistryBuilder {
    store: Arc<dyn CoordinationStore>,
    listener: Arc<dyn ImportListener>,
    local: LocalHost,
    config: RegistryConfig,
    codec: Arc<dyn Codec>,
    hosts: Arc<dyn KnownHosts>,
    status: Arc<dyn StatusSource>,
    config_source: Arc<dyn ConfigSource>,
}

impl RegistryBuilder {
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn hosts(mut self, hosts: Arc<dyn KnownHosts>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn status(mut self, status: Arc<dyn StatusSource>) -> Self {
        self.status = status;
        self
    }

    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = source;
        self
    }

    pub fn build(self) -> Result<Registry> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let layout = Layout::new(&config);
        let snapshot = Arc::new(Snapshot::new());
        let retry = Arc::new(RetryQueue::new(config.reinstall_delay()));
        let dispatcher = Dispatcher::new(self.listener, self.hosts, Arc::clone(&snapshot));
        let imports = Arc::new(ImportContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.codec),
            Arc::clone(&snapshot),
            dispatcher,
            layout.clone(),
            Arc::clone(&config),
            Arc::clone(&retry),
        ));
        let publisher = Arc::new(Publisher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.codec),
            layout.clone(),
            self.local.clone(),
            self.status,
            self.config_source,
            config.status_force,
            config.config_force,
        ));
        let inner = Inner {
            exports: Exports::new(Arc::clone(&self.store), self.codec),
            store: self.store,
            sweeper: Sweeper::new(Arc::clone(&imports)),
            imports,
            publisher,
            buffer: StartupBuffer::new(),
            snapshot,
            retry,
            layout,
            local: self.local,
            config,
            stop: Stop::default(),
        };
        Ok(Registry {
            inner: Arc::new(inner),
            workers: Mutex::new(Vec::new()),
        })
    }
}

/// Shutdown flag plus a wakeup for the fixed-rate sweeper.
#[derive(Default)]
struct Stop {
    flag: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Stop {
    fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns false if the flag was already set.
    fn set(&self) -> bool {
        let first = !self.flag.swap(true, Ordering::AcqRel);
        let _guard = self.lock.lock();
        self.wake.notify_all();
        first
    }

    /// Sleeps until `deadline`. False means shutdown was requested.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let Ok(mut guard) = self.lock.lock() else {
            return false;
        };
        loop {
            if self.is_set() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            match self.wake.wait_timeout(guard, deadline - now) {
                Ok((next, _)) => guard = next,
                Err(_) => return false,
            }
        }
    }
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    config: Arc<RegistryConfig>,
    local: LocalHost,
    layout: Layout,
    snapshot: Arc<Snapshot>,
    exports: Exports,
    buffer: StartupBuffer,
    publisher: Arc<Publisher>,
    imports: Arc<ImportContext>,
    sweeper: Sweeper,
    retry: Arc<RetryQueue>,
    stop: Stop,
}

impl Inner {
    /// Publishes one export node and records the handler.
    fn export_now(&self, service: Service, handler: Handler) -> Result<()> {
        if !self.config.export_enabled_for(&service) {
            warn!("export disabled for {service}");
            return Ok(());
        }
        let host = self
            .local
            .host
            .clone()
            .with_tag(self.config.tag_for(&service))
            .with_priority(self.config.priority_for(&service));
        let dir = self.layout.service_dir(&service);
        mkdirs(self.store.as_ref(), &dir)?;
        self.exports
            .publish(&dir, ServiceInstance::new(service.clone(), host))?;
        self.snapshot.export(service, handler);
        Ok(())
    }

    fn publish_session_nodes(&self) -> Result<()> {
        self.publisher.publish_status()?;
        self.publisher.publish_config()
    }

    fn withdraw_session_nodes(&self) {
        if let Err(err) = self.publisher.destroy_status() {
            error!("failed to withdraw status node: {err}");
        }
        if let Err(err) = self.publisher.destroy_config() {
            error!("failed to withdraw config node: {err}");
        }
    }

    fn reinstall(&self, entry: Reinstall) {
        let service = &entry.service;
        if self.imports.is_withdrawn(service) {
            info!("dropping retry for unsubscribed {service}");
            return;
        }
        if self.imports.is_watching(service) {
            info!("{service} already imported, dropping retry");
            return;
        }
        match self.imports.subscribe_attempt(service, entry.attempt + 1) {
            Ok(true) => info!("re-subscribed {service} after {} attempts", entry.attempt),
            Ok(false) => {}
            Err(err) => error!("retry of {service} failed: {err}"),
        }
    }

    fn sweep_loop(&self) {
        let interval = self.config.refresh_interval();
        let mut next = Instant::now() + interval;
        while self.stop.sleep_until(next) {
            if let Err(err) = self.sweeper.run_once() {
                error!("reconciliation sweep failed: {err}");
            }
            next += interval;
            let now = Instant::now();
            if next < now {
                next = now + interval;
            }
        }
        info!("sweeper stopped");
    }

    fn reinstall_loop(&self) {
        let poll = self.config.retry_poll_interval();
        while !self.stop.is_set() {
            match self.retry.poll(poll) {
                Ok(Some(entry)) => self.reinstall(entry),
                Ok(None) => {}
                Err(err) => {
                    error!("retry queue failed: {err}");
                    break;
                }
            }
        }
        info!("reinstall worker stopped");
    }
}

pub struct Registry {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    pub fn builder(
        store: Arc<dyn CoordinationStore>,
        listener: Arc<dyn ImportListener>,
        local: LocalHost,
    ) -> RegistryBuilder {
        RegistryBuilder {
            store,
            listener,
            local,
            config: RegistryConfig::default(),
            codec: Arc::new(JsonCodec),
            hosts: Arc::new(HostIndex::new()),
            status: Arc::new(BTreeMap::<String, String>::new),
            config_source: Arc::new(MemoryConfig::default()),
        }
    }

    /// Spawns the sweeper and reinstall workers. Calling twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| Error::Poisoned("registry workers"))?;
        if !workers.is_empty() || self.inner.stop.is_set() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        workers.push(
            thread::Builder::new()
                .name("beacon-sweeper".into())
                .spawn(move || inner.sweep_loop())?,
        );
        let inner = Arc::clone(&self.inner);
        workers.push(
            thread::Builder::new()
                .name("beacon-reinstall".into())
                .spawn(move || inner.reinstall_loop())?,
        );
        info!(
            "registry started for {} (refresh {:?})",
            self.inner.local.sid,
            self.inner.config.refresh_interval()
        );
        Ok(())
    }

    /// Stops the workers and withdraws every node this registry created.
    pub fn shutdown(&self) {
        if !self.inner.stop.set() {
            return;
        }
        self.inner.retry.close();
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("registry worker panicked");
            }
        }
        self.inner.exports.destroy_all();
        self.inner.withdraw_session_nodes();
        info!("registry for {} shut down", self.inner.local.sid);
    }

    /// Signals that the local endpoint accepts connections: flushes buffered
    /// exports, then publishes the status and config nodes.
    pub fn ready(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .buffer
            .reach(|service, handler| inner.export_now(service, handler))
            .map_err(|err| Error::runtime("ready", err))?;
        inner
            .publish_session_nodes()
            .map_err(|err| Error::runtime("ready", err))
    }

    pub fn is_ready(&self) -> bool {
        self.inner.buffer.is_started()
    }

    /// Exports queued until `ready()`.
    pub fn deferred_exports(&self) -> usize {
        self.inner.buffer.pending()
    }

    /// Exports `service`. Returns false if the export was deferred until `ready()`.
    pub fn export(&self, service: Service, handler: Handler) -> Result<bool> {
        let inner = &self.inner;
        inner
            .buffer
            .offer(service, handler, |service, handler| {
                inner.export_now(service, handler)
            })
            .map_err(|err| Error::runtime("export", err))
    }

    /// Withdraws every node created for `service` and returns its handler.
    pub fn logout(&self, service: &Service) -> Option<Handler> {
        let removed = self.inner.exports.destroy_service(service);
        info!("logged out {service}, {removed} nodes withdrawn");
        self.inner.snapshot.logout(service)
    }

    pub fn subscribe(&self, service: &Service) -> Result<bool> {
        self.inner.imports.subscribe(service)
    }

    pub fn unsubscribe(&self, service: &Service) {
        self.inner.imports.unsubscribe(service)
    }

    pub fn demote(&self) -> DemoteReport {
        let report = self.inner.exports.demote();
        if !report.failed.is_empty() {
            warn!(
                "demoted {} nodes, {} failed",
                report.demoted.len(),
                report.failed.len()
            );
        }
        report
    }

    /// Rebuilds everything this process owns in the store from the snapshot.
    pub fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        info!("resetting registry state for {}", inner.local.sid);
        inner.exports.destroy_all();
        inner.withdraw_session_nodes();

        for (service, handler) in inner.snapshot.exported() {
            let label = service.to_string();
            if let Err(err) = inner.export_now(service, handler) {
                error!("failed to re-export {label}: {err}");
            }
        }
        for service in inner.snapshot.imported() {
            if let Err(err) = inner.imports.subscribe(&service) {
                error!("failed to re-subscribe {service}: {err}");
            }
        }
        if inner.buffer.is_started() {
            inner
                .publish_session_nodes()
                .map_err(|err| Error::runtime("reset", err))?;
        }
        Ok(())
    }

    pub fn handle_session_event(&self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Disconnected => {
                warn!("disconnected from coordination store");
                Ok(())
            }
            SessionEvent::Reconnected | SessionEvent::Expired => {
                info!("session event {event:?}, rebuilding");
                self.reset()
            }
        }
    }

    /// Runs one reconciliation pass on the calling thread.
    pub fn sweep(&self) -> Result<Option<SweepReport>> {
        self.inner.sweeper.run_once()
    }

    /// Every instance this process currently exports.
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.inner.exports.instances()
    }

    pub fn services(&self) -> Vec<Service> {
        self.inner.exports.services()
    }

    pub fn published(&self, service: &Service) -> Vec<PublishedInstance> {
        self.inner.exports.published(service)
    }

    pub fn pending_reinstalls(&self) -> Vec<(Service, Instant)> {
        self.inner.retry.pending()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.inner.snapshot
    }

    pub fn handler(&self, service: &Service) -> Option<Handler> {
        self.inner.snapshot.handler(service)
    }

    pub fn status_path(&self) -> Option<String> {
        self.inner.publisher.status_path()
    }

    pub fn config_path(&self) -> Option<String> {
        self.inner.publisher.config_path()
    }

    pub fn local(&self) -> &LocalHost {
        &self.inner.local
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
