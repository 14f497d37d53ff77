//! Identity and payload types shared by the export and import paths.

mod host;
mod instance;
mod service;
mod status;

pub use host::{Host, LocalHost, DEFAULT_PRIORITY};
pub use instance::{PublishedInstance, ServiceInstance};
pub use service::Service;
pub use status::{HostStatus, StatusSource};
