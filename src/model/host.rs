use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Priority given to exported instances when no override is configured.
pub const DEFAULT_PRIORITY: u32 = 5;

/// Network address of an instance plus its mutable runtime properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub address: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

impl Host {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tag: String::new(),
            priority: DEFAULT_PRIORITY,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Same address, different tag, priority or properties.
    pub fn property_changed(&self, other: &Host) -> bool {
        self.address == other.address
            && (self.tag != other.tag
                || self.priority != other.priority
                || self.properties != other.properties)
    }

    /// A priority of zero marks the host unselectable.
    pub fn is_demoted(&self) -> bool {
        self.priority == 0
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[tag={},priority={}]", self.address, self.tag, self.priority)
    }
}

/// The host this process exports from, plus its session-unique id.
///
/// The sid names the status and config nodes, so it must not contain `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHost {
    pub host: Host,
    pub sid: String,
}

impl LocalHost {
    pub fn new(address: impl Into<String>) -> Self {
        let host = Host::new(address);
        let sid = format!("{}@{}", host.address, std::process::id());
        Self { host, sid }
    }

    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = sid.into();
        self
    }
}
