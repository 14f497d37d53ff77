use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Host, Service};

/// A service bound to a host; the payload of every service node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service: Service,
    pub host: Host,
}

impl ServiceInstance {
    pub fn new(service: Service, host: Host) -> Self {
        Self { service, host }
    }

    /// Copy of this instance with priority zero.
    pub fn demoted(&self) -> Self {
        Self {
            service: self.service.clone(),
            host: self.host.clone().with_priority(0),
        }
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.host)
    }
}

/// An exported instance and the node path it was created under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedInstance {
    pub instance: ServiceInstance,
    pub path: String,
}
