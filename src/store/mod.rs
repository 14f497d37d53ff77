//! Boundary to the hierarchical coordination store.
//!
//! The registry only needs the handful of primitives below. Watches are
//! one-shot: a watcher passed to a read is notified at most once, and must be
//! passed again to a later read to keep observing the node.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use crate::Result;

pub use memory::{MemorySession, MemoryStore};

/// Persistence of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a store-assigned monotonic suffix appended to the name.
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
}

impl fmt::Display for WatchedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.path)
    }
}

/// Receives a single notification for a watched node.
///
/// Errors are surfaced to the store client, which logs them; they never
/// reach the code that mutated the node.
pub trait Watcher: Send + Sync {
    fn process(self: Arc<Self>, event: &WatchedEvent) -> Result<()>;
}

pub type WatchHandle = Arc<dyn Watcher>;

/// Connection state changes reported by a store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Disconnected,
    /// Connection restored within the session timeout.
    Reconnected,
    /// Session lost: every ephemeral node and watch it owned is gone.
    Expired,
}

pub trait CoordinationStore: Send + Sync {
    /// Creates a node and returns its actual path (sequential nodes get a suffix).
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// `version: None` deletes regardless of the node's version.
    fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// Returns the node's new version.
    fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<i32>;

    fn get_data(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<u8>>;

    /// Child names (not full paths), sorted ascending.
    fn get_children(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<String>>;

    /// A watch set on a missing node fires when the node is created.
    fn exists(&self, path: &str, watch: Option<WatchHandle>) -> Result<bool>;
}

impl<S: CoordinationStore + ?Sized> CoordinationStore for Arc<S> {
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        (**self).create(path, data, mode)
    }

    fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        (**self).delete(path, version)
    }

    fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<i32> {
        (**self).set_data(path, data, version)
    }

    fn get_data(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<u8>> {
        (**self).get_data(path, watch)
    }

    fn get_children(&self, path: &str, watch: Option<WatchHandle>) -> Result<Vec<String>> {
        (**self).get_children(path, watch)
    }

    fn exists(&self, path: &str, watch: Option<WatchHandle>) -> Result<bool> {
        (**self).exists(path, watch)
    }
}

/// Joins a parent path and a child name.
pub fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}
