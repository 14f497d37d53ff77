//! Service registry over a hierarchical coordination store.
//!
//! Processes export ephemeral service-instance nodes and import the instances
//! other processes export, with one-shot watches for low latency and a
//! periodic reconciliation sweep for correctness when notifications are lost.

pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod hosts;
pub mod listener;
pub mod model;
pub mod registry;
pub mod snapshot;
pub mod store;

pub use codec::{Codec, JsonCodec};
pub use config::{ConfigSource, MemoryConfig, RegistryConfig, ServiceOverrides};
pub use diff::{diff, Diff};
pub use error::{Error, Result};
pub use hosts::{HostIndex, KnownHosts};
pub use listener::ImportListener;
pub use model::{
    Host, HostStatus, LocalHost, PublishedInstance, Service, ServiceInstance, StatusSource,
    DEFAULT_PRIORITY,
};
pub use registry::{DemoteReport, Registry, RegistryBuilder, SweepReport};
pub use snapshot::{Handler, Snapshot};
pub use store::{
    CoordinationStore, CreateMode, EventKind, MemorySession, MemoryStore, SessionEvent,
    WatchedEvent, Watcher,
};
