//! In-process hierarchical store with sessions and one-shot watches.
//!
//! `MemoryStore` owns the tree; every `MemorySession` is a client of it with
//! its own ephemeral nodes and watches. Notifications are delivered on the
//! mutating thread once the tree lock has been released, so watchers may
//! call back into the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error};

use super::{child_path, CoordinationStore, CreateMode, EventKind, WatchHandle, WatchedEvent};
use crate::{Error, Result};

struct Node {
    data: Vec<u8>,
    version: i32,
    owner: Option<u64>,
    next_seq: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<u64>) -> Self {
        Self {
            data,
            version: 0,
            owner,
            next_seq: 0,
        }
    }
}

struct Registered {
    session: u64,
    watcher: WatchHandle,
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, Vec<Registered>>,
    child_watches: HashMap<String, Vec<Registered>>,
    exist_watches: HashMap<String, Vec<Registered>>,
}

type Fired = Vec<(WatchHandle, WatchedEvent)>;

impl TreeState {
    fn take(map: &mut HashMap<String, Vec<Registered>>, path: &str, kind: EventKind, out: &mut Fired) {
        if let Some(watches) = map.remove(path) {
            for reg in watches {
                let dup = out.iter().any(|(w, e)| {
                    e.path == path && Arc::as_ptr(w) as *const () == Arc::as_ptr(&reg.watcher) as *const ()
                });
                if !dup {
                    out.push((
                        reg.watcher,
                        WatchedEvent {
                            kind,
                            path: path.to_string(),
                        },
                    ));
                }
            }
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = child_path(path, "");
        self.nodes
            .range(prefix.clone()..)
            .next()
            .map(|(key, _)| key.starts_with(&prefix))
            .unwrap_or(false)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_path(path, "");
        let mut names: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        names.sort();
        names
    }

    fn remove_node(&mut self, path: &str, fired: &mut Fired) {
        self.nodes.remove(path);
        Self::take(&mut self.data_watches, path, EventKind::NodeDeleted, fired);
        Self::take(&mut self.exist_watches, path, EventKind::NodeDeleted, fired);
        Self::take(&mut self.child_watches, path, EventKind::NodeDeleted, fired);
        let parent = parent_of(path);
        Self::take(
            &mut self.child_watches,
            &parent,
            EventKind::NodeChildrenChanged,
            fired,
        );
    }

    fn register(
        map: &mut HashMap<String, Vec<Registered>>,
        path: &str,
        session: u64,
        watcher: WatchHandle,
    ) {
        let entry = map.entry(path.to_string()).or_default();
        let ptr = Arc::as_ptr(&watcher) as *const ();
        if !entry.iter().any(|r| Arc::as_ptr(&r.watcher) as *const () == ptr) {
            entry.push(Registered { session, watcher });
        }
    }

    fn drop_session_watches(&mut self, session: u64) {
        for map in [
            &mut self.data_watches,
            &mut self.child_watches,
            &mut self.exist_watches,
        ] {
            for watches in map.values_mut() {
                watches.retain(|r| r.session != session);
            }
            map.retain(|_, watches| !watches.is_empty());
        }
    }
}

struct Tree {
    state: Mutex<TreeState>,
    next_session: AtomicU64,
    deliver: AtomicBool,
}

impl Tree {
    fn lock(&self) -> Result<MutexGuard<'_, TreeState>> {
        self.state
            .lock()
            .map_err(|_| Error::Poisoned("memory store tree"))
    }

    fn fire(&self, fired: Fired) {
        if !self.deliver.load(Ordering::Acquire) {
            if !fired.is_empty() {
                debug!("dropping {} watch notifications", fired.len());
            }
            return;
        }
        for (watcher, event) in fired {
            if let Err(err) = watcher.process(&event) {
                error!("watcher for {event} failed: {err}");
            }
        }
    }
}

/// Shared in-memory tree. Clone to share between threads.
#[derive(Clone)]
pub struct MemoryStore {
    tree: Arc<Tree>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut state = TreeState::default();
        state.nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self {
            tree: Arc::new(Tree {
                state: Mutex::new(state),
                next_session: AtomicU64::new(1),
                deliver: AtomicBool::new(true),
            }),
        }
    }

    /// Opens a new client session on the shared tree.
    pub fn session(&self) -> MemorySession {
        let id = self.tree.next_session.fetch_add(1, Ordering::Relaxed);
        MemorySession {
            tree: Arc::clone(&self.tree),
            id: AtomicU64::new(id),
            closed: AtomicBool::new(false),
        }
    }

    /// When disabled, triggered watches are consumed without notifying anyone.
    pub fn set_watch_delivery(&self, enabled: bool) {
        self.tree.deliver.store(enabled, Ordering::Release);
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.tree.lock().map(|s| s.nodes.len()).unwrap_or(0)
    }

    /// Every node path in ascending order.
    pub fn dump(&self) -> Vec<String> {
        self.tree
            .lock()
            .map(|s| s.nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.tree
            .lock()
            .map(|s| {
                if s.nodes.contains_key(path) {
                    s.children(path)
                } else {
                    Vec::new()
                }
            })
            .unwrap_or_default()
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.tree
            .lock()
            .ok()
            .and_then(|s| s.nodes.get(path).map(|n| n.data.clone()))
    }
}

/// One client connection to a `MemoryStore`.
pub struct MemorySession {
    tree: Arc<Tree>,
    id: AtomicU64,
    closed: AtomicBool,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Ends the current session and transparently starts a new one.
    ///
    /// The old session's watches are discarded and its ephemeral nodes are
    /// deleted, notifying other sessions' watches.
    pub fn expire(&self) -> Result<()> {
        let old = self.id();
        let fresh = self.tree.next_session.fetch_add(1, Ordering::Relaxed);
        self.id.store(fresh, Ordering::Release);
        self.end(old)
    }

    /// Ends the session for good; later calls fail with `ConnectionLoss`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.end(self.id())
    }

    fn end(&self, session: u64) -> Result<()> {
        let mut fired = Vec::new();
        {
            let mut state = self.tree.lock()?;
            state.drop_session_watches(session);
            let mut owned: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, node)| node.owner == Some(session))
                .map(|(path, _)| path.clone())
                .collect();
            // Deepest first so parents never outlive their check for children.
            owned.sort_by(|a, b| b.len().cmp(&a.len()));
            for path in owned {
                state.remove_node(&path, &mut fired);
            }
        }
        debug!("session {session} ended, {} notifications", fired.len());
        self.tree.fire(fired);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionLoss("session closed".to_string()));
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn validate(path: &str, allow_trailing_slash: bool) -> Result<()> {
    let invalid = !path.starts_with('/')
        || path.contains("//")
        || (path.len() > 1 && path.ends_with('/') && !allow_trailing_slash);
    if invalid {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn check_version(path: &str, expected: Option<i32>, actual: i32) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(Error::BadVersion {
            path: path.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

impl CoordinationStore for MemorySession {
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.check_open()?;
        let sequential = mode == CreateMode::EphemeralSequential;
        validate(path, sequential)?;
        if path == "/" {
            return Err(Error::NodeExists(path.to_string()));
        }

        let mut fired = Vec::new();
        let actual = {
            let mut state = self.tree.lock()?;
            let parent = parent_of(path);
            let parent_node = state
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| Error::NoNode(parent.clone()))?;
            let actual = if sequential {
                let seq = parent_node.next_seq;
                parent_node.next_seq += 1;
                format!("{path}{seq:010}")
            } else {
                path.to_string()
            };
            if state.nodes.contains_key(&actual) {
                return Err(Error::NodeExists(actual));
            }
            let owner = mode.is_ephemeral().then(|| self.id());
            state.nodes.insert(actual.clone(), Node::new(data.to_vec(), owner));
            TreeState::take(&mut state.exist_watches, &actual, EventKind::NodeCreated, &mut fired);
            TreeState::take(
                &mut state.child_watches,
                &parent,
                EventKind::NodeChildrenChanged,
                &mut fired,
            );
            actual
        };
        self.tree.fire(fired);
        Ok(actual)
    }

    fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.check_open()?;
        validate(path, false)?;
        if path == "/" {
            return Err(Error::InvalidPath(path.to_string()));
        }
        let mut fired = Vec::new();
        {
            let mut state = self.tree.lock()?;
            let node = state
                .nodes
                .get(path)
                .ok_or_else(|| Error::NoNode(path.to_string()))?;
            check_version(path, version, node.version)?;
            if state.has_children(path) {
                return Err(Error::NotEmpty(path.to_string()));
            }
            state.remove_node(path, &mut fired);
        }
        self.tree.fire(fired);
        Ok(())
    }

    fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<i32> {
        self.check_open()?;
        validate(path, false)?;
        let mut fired = Vec::new();
        let new_version = {
            let mut state = self.tree.lock()?;
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| Error::NoNode(path.to_string()))?;
            check_version(path, version, node.version)?;
            node.data = data.to_vec();
            node.version += 1;
            let new_version = node.version;
            TreeState::take(&mut state.data_watches, path, EventKind::NodeDataChanged, &mut fired);
            TreeState::take(&mut state.exist_watches, path, EventKind::NodeDataChanged, &mut fired);
            new_version
        };
        self.tree.fire(fired);
        Ok(new_version)
    }

    fn get_data(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<u8>> {
        self.check_open()?;
        validate(path, false)?;
        let mut state = self.tree.lock()?;
        let data = state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(watch) = watch {
            TreeState::register(&mut state.data_watches, path, self.id(), watch);
        }
        Ok(data)
    }

    fn get_children(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<String>> {
        self.check_open()?;
        validate(path, false)?;
        let mut state = self.tree.lock()?;
        if !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        let children = state.children(path);
        if let Some(watch) = watch {
            TreeState::register(&mut state.child_watches, path, self.id(), watch);
        }
        Ok(children)
    }

    fn exists(&self, path: &str, watch: Option<WatchHandle>) -> Result<bool> {
        self.check_open()?;
        validate(path, false)?;
        let mut state = self.tree.lock()?;
        let exists = state.nodes.contains_key(path);
        if let Some(watch) = watch {
            TreeState::register(&mut state.exist_watches, path, self.id(), watch);
        }
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<WatchedEvent>>,
    }

    impl super::super::Watcher for Recorder {
        fn process(self: Arc<Self>, event: &WatchedEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    #[test]
    fn sequential_names_are_monotonic_per_parent() {
        let store = MemoryStore::new();
        let s = store.session();
        s.create("/svc", b"", CreateMode::Persistent).unwrap();
        let a = s.create("/svc/", b"a", CreateMode::EphemeralSequential).unwrap();
        let b = s.create("/svc/", b"b", CreateMode::EphemeralSequential).unwrap();
        assert_eq!(a, "/svc/0000000000");
        assert_eq!(b, "/svc/0000000001");
        assert_eq!(s.get_children("/svc", None).unwrap(), vec!["0000000000", "0000000001"]);
    }

    #[test]
    fn create_requires_parent_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let s = store.session();
        assert!(s.create("/a/b", b"", CreateMode::Persistent).unwrap_err().is_no_node());
        s.create("/a", b"", CreateMode::Persistent).unwrap();
        assert!(s.create("/a", b"", CreateMode::Persistent).unwrap_err().is_node_exists());
    }

    #[test]
    fn delete_checks_children_and_version() {
        let store = MemoryStore::new();
        let s = store.session();
        s.create("/a", b"", CreateMode::Persistent).unwrap();
        s.create("/a/b", b"", CreateMode::Persistent).unwrap();
        assert!(matches!(s.delete("/a", None), Err(Error::NotEmpty(_))));
        assert!(matches!(s.delete("/a/b", Some(3)), Err(Error::BadVersion { .. })));
        s.delete("/a/b", Some(0)).unwrap();
        s.delete("/a", None).unwrap();
        assert!(s.delete("/a", None).unwrap_err().is_no_node());
    }

    #[test]
    fn watches_fire_once() {
        let store = MemoryStore::new();
        let s = store.session();
        s.create("/a", b"", CreateMode::Persistent).unwrap();
        let rec = Arc::new(Recorder::default());
        s.get_children("/a", Some(rec.clone())).unwrap();
        s.create("/a/x", b"1", CreateMode::Persistent).unwrap();
        s.create("/a/y", b"1", CreateMode::Persistent).unwrap();
        assert_eq!(rec.kinds(), vec![EventKind::NodeChildrenChanged]);

        s.get_data("/a/x", Some(rec.clone())).unwrap();
        s.set_data("/a/x", b"2", None).unwrap();
        s.set_data("/a/x", b"3", None).unwrap();
        assert_eq!(rec.kinds().len(), 2);

        s.get_data("/a/x", Some(rec.clone())).unwrap();
        s.delete("/a/x", None).unwrap();
        assert_eq!(rec.kinds().last(), Some(&EventKind::NodeDeleted));
    }

    #[test]
    fn exists_watch_fires_on_create() {
        let store = MemoryStore::new();
        let s = store.session();
        let rec = Arc::new(Recorder::default());
        assert!(!s.exists("/late", Some(rec.clone())).unwrap());
        s.create("/late", b"", CreateMode::Persistent).unwrap();
        assert_eq!(rec.kinds(), vec![EventKind::NodeCreated]);
    }

    #[test]
    fn expiry_removes_ephemerals_and_notifies_other_sessions() {
        let store = MemoryStore::new();
        let owner = store.session();
        let observer = store.session();
        owner.create("/svc", b"", CreateMode::Persistent).unwrap();
        owner.create("/svc/", b"x", CreateMode::EphemeralSequential).unwrap();

        let rec = Arc::new(Recorder::default());
        observer.get_children("/svc", Some(rec.clone())).unwrap();
        let lost = Arc::new(Recorder::default());
        owner.get_children("/svc", Some(lost.clone())).unwrap();

        let before = owner.id();
        owner.expire().unwrap();
        assert_ne!(owner.id(), before);
        assert!(store.children("/svc").is_empty());
        assert_eq!(rec.kinds(), vec![EventKind::NodeChildrenChanged]);
        assert!(lost.kinds().is_empty());

        // The renewed session keeps working.
        owner.create("/svc/", b"y", CreateMode::EphemeralSequential).unwrap();
        assert_eq!(store.children("/svc").len(), 1);
    }

    #[test]
    fn suppressed_delivery_consumes_watches() {
        let store = MemoryStore::new();
        let s = store.session();
        s.create("/a", b"", CreateMode::Persistent).unwrap();
        let rec = Arc::new(Recorder::default());
        s.get_children("/a", Some(rec.clone())).unwrap();
        store.set_watch_delivery(false);
        s.create("/a/x", b"", CreateMode::Persistent).unwrap();
        store.set_watch_delivery(true);
        s.create("/a/y", b"", CreateMode::Persistent).unwrap();
        assert!(rec.kinds().is_empty());
    }

    #[test]
    fn closed_session_rejects_calls() {
        let store = MemoryStore::new();
        let s = store.session();
        s.create("/e", b"", CreateMode::Ephemeral).unwrap();
        s.close().unwrap();
        assert_eq!(store.node_count(), 1);
        assert!(matches!(s.exists("/e", None), Err(Error::ConnectionLoss(_))));
    }
}
