use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Host;

/// Payload of the per-process status node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    pub sid: String,
    pub host: Host,
    #[serde(default)]
    pub status: BTreeMap<String, String>,
}

/// Supplies the runtime status published under the status directory.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> BTreeMap<String, String>;
}

impl<F> StatusSource for F
where
    F: Fn() -> BTreeMap<String, String> + Send + Sync,
{
    fn status(&self) -> BTreeMap<String, String> {
        self()
    }
}
