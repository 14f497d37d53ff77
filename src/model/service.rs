use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of an exported or imported service.
///
/// Two services are the same key when name, version and catalog all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub catalog: String,
}

impl Service {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            catalog: String::new(),
        }
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = catalog.into();
        self
    }

    /// Directory segment under the service name: `version` or `version:catalog`.
    pub fn version_and_catalog(&self) -> String {
        if self.catalog.is_empty() {
            self.version.clone()
        } else {
            format!("{}:{}", self.version, self.catalog)
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version_and_catalog())
    }
}
