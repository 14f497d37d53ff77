#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use beacon::store::WatchHandle;
use beacon::{
    CoordinationStore, CreateMode, Error, ImportListener, LocalHost, Registry, RegistryConfig,
    Result, ServiceInstance,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Add(ServiceInstance),
    Change(ServiceInstance, ServiceInstance),
    Delete(ServiceInstance),
}

/// Records every delivery in order; can be told to reject adds.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Delivery>>,
    reject_adds: AtomicBool,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject_adds(&self, reject: bool) {
        self.reject_adds.store(reject, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Delivery> {
        self.events.lock().unwrap().clone()
    }

    pub fn adds(&self) -> usize {
        self.count(|d| matches!(d, Delivery::Add(_)))
    }

    pub fn changes(&self) -> usize {
        self.count(|d| matches!(d, Delivery::Change(..)))
    }

    pub fn deletes(&self) -> usize {
        self.count(|d| matches!(d, Delivery::Delete(_)))
    }

    pub fn deletes_of(&self, address: &str) -> usize {
        self.count(|d| matches!(d, Delivery::Delete(i) if i.host.address == address))
    }

    /// Addresses currently believed alive: adds minus deletes.
    pub fn live(&self) -> Vec<String> {
        let mut live: Vec<String> = Vec::new();
        for event in self.events() {
            match event {
                Delivery::Add(i) => live.push(i.host.address),
                Delivery::Delete(i) => {
                    if let Some(pos) = live.iter().position(|a| *a == i.host.address) {
                        live.remove(pos);
                    }
                }
                Delivery::Change(..) => {}
            }
        }
        live.sort();
        live
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn count(&self, pred: impl Fn(&Delivery) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|d| pred(d)).count()
    }
}

impl ImportListener for RecordingListener {
    fn add(&self, instance: &ServiceInstance) -> Result<()> {
        if self.reject_adds.load(Ordering::SeqCst) {
            return Err(Error::listener("adds rejected"));
        }
        self.events.lock().unwrap().push(Delivery::Add(instance.clone()));
        Ok(())
    }

    fn change(&self, old: &ServiceInstance, new: &ServiceInstance) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Delivery::Change(old.clone(), new.clone()));
        Ok(())
    }

    fn delete(&self, instance: &ServiceInstance) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Delivery::Delete(instance.clone()));
        Ok(())
    }
}

/// Wraps a store to count creates and fail writes to chosen paths.
pub struct ScriptedStore {
    inner: Arc<dyn CoordinationStore>,
    creates: Mutex<Vec<(String, CreateMode)>>,
    failing_writes: Mutex<HashSet<String>>,
}

impl ScriptedStore {
    pub fn new(inner: Arc<dyn CoordinationStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            creates: Mutex::new(Vec::new()),
            failing_writes: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_writes_to(&self, path: &str) {
        self.failing_writes.lock().unwrap().insert(path.to_string());
    }

    pub fn creates(&self, mode: CreateMode) -> Vec<String> {
        self.creates
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| *m == mode)
            .map(|(p, _)| p.clone())
            .collect()
    }
}

impl CoordinationStore for ScriptedStore {
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let actual = self.inner.create(path, data, mode)?;
        self.creates.lock().unwrap().push((actual.clone(), mode));
        Ok(actual)
    }

    fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.inner.delete(path, version)
    }

    fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<i32> {
        if self.failing_writes.lock().unwrap().contains(path) {
            return Err(Error::ConnectionLoss(format!("scripted failure at {path}")));
        }
        self.inner.set_data(path, data, version)
    }

    fn get_data(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<u8>> {
        self.inner.get_data(path, watch)
    }

    fn get_children(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<String>> {
        self.inner.get_children(path, watch)
    }

    fn exists(&self, path: &str, watch: Option<WatchHandle>) -> Result<bool> {
        self.inner.exists(path, watch)
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Wraps a store to run one-shot hooks at chosen points of a read.
pub struct HookedStore {
    inner: Arc<dyn CoordinationStore>,
    after_plain_listing: Mutex<Option<(String, Hook)>>,
    before_watched_read: Mutex<Option<(String, Hook)>>,
}

impl HookedStore {
    pub fn new(inner: Arc<dyn CoordinationStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            after_plain_listing: Mutex::new(None),
            before_watched_read: Mutex::new(None),
        })
    }

    /// Runs `hook` once, right after an unwatched listing of `path` returns.
    pub fn after_plain_listing(&self, path: &str, hook: impl FnOnce() + Send + 'static) {
        *self.after_plain_listing.lock().unwrap() = Some((path.to_string(), Box::new(hook)));
    }

    /// Runs `hook` once, right before a watched read (data or children) of `path`.
    pub fn before_watched_read(&self, path: &str, hook: impl FnOnce() + Send + 'static) {
        *self.before_watched_read.lock().unwrap() = Some((path.to_string(), Box::new(hook)));
    }

    fn fire(slot: &Mutex<Option<(String, Hook)>>, path: &str) {
        let hook = {
            let mut slot = slot.lock().unwrap();
            match slot.as_ref() {
                Some((target, _)) if target == path => slot.take().map(|(_, hook)| hook),
                _ => None,
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl CoordinationStore for HookedStore {
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.inner.create(path, data, mode)
    }

    fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.inner.delete(path, version)
    }

    fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<i32> {
        self.inner.set_data(path, data, version)
    }

    fn get_data(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<u8>> {
        if watch.is_some() {
            Self::fire(&self.before_watched_read, path);
        }
        self.inner.get_data(path, watch)
    }

    fn get_children(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<String>> {
        let plain = watch.is_none();
        if !plain {
            Self::fire(&self.before_watched_read, path);
        }
        let children = self.inner.get_children(path, watch)?;
        if plain {
            Self::fire(&self.after_plain_listing, path);
        }
        Ok(children)
    }

    fn exists(&self, path: &str, watch: Option<WatchHandle>) -> Result<bool> {
        self.inner.exists(path, watch)
    }
}

pub fn registry(
    store: Arc<dyn CoordinationStore>,
    listener: Arc<dyn ImportListener>,
    address: &str,
) -> Registry {
    registry_with(store, listener, address, RegistryConfig::default())
}

pub fn registry_with(
    store: Arc<dyn CoordinationStore>,
    listener: Arc<dyn ImportListener>,
    address: &str,
    config: RegistryConfig,
) -> Registry {
    Registry::builder(store, listener, LocalHost::new(address).with_sid(address.replace(':', "_")))
        .config(config)
        .build()
        .expect("build registry")
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
