//! Directory layout under the registry root.

use log::debug;

use crate::config::RegistryConfig;
use crate::model::Service;
use crate::store::{CoordinationStore, CreateMode};
use crate::Result;

#[derive(Debug, Clone)]
pub(crate) struct Layout {
    root: String,
    status_dir: String,
    config_dir: String,
}

impl Layout {
    pub(crate) fn new(config: &RegistryConfig) -> Self {
        Self {
            root: config.root.clone(),
            status_dir: config.status_dir.clone(),
            config_dir: config.config_dir.clone(),
        }
    }

    /// `<root>/<name>/<version[:catalog]>`, skipping empty segments.
    pub(crate) fn service_dir(&self, service: &Service) -> String {
        join(&self.root, &[&service.name, &service.version_and_catalog()])
    }

    pub(crate) fn status_dir(&self) -> String {
        join(&self.root, &[&self.status_dir])
    }

    pub(crate) fn config_dir(&self) -> String {
        join(&self.root, &[&self.config_dir])
    }
}

fn join(root: &str, segments: &[&str]) -> String {
    let mut path = root.trim_end_matches('/').to_string();
    for segment in segments.iter().filter(|s| !s.is_empty()) {
        path.push('/');
        path.push_str(segment);
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Creates every missing directory on `path` as a persistent node.
///
/// Safe against concurrent creators: losing a creation race is not an error.
pub(crate) fn mkdirs(store: &dyn CoordinationStore, path: &str) -> Result<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        if store.exists(&current, None)? {
            continue;
        }
        match store.create(&current, &[], CreateMode::Persistent) {
            Ok(_) => debug!("created directory {current}"),
            Err(err) if err.is_node_exists() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
