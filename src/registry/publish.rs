//! Per-process status and config nodes.
//!
//! Both are ephemeral, named by the local sid, and published at most once per
//! session. The config node also carries a watch through which operators push
//! configuration back into the process.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{error, info, warn};

use super::paths::{mkdirs, Layout};
use super::watch::WatchCell;
use crate::codec::Codec;
use crate::config::ConfigSource;
use crate::model::{HostStatus, LocalHost, StatusSource};
use crate::store::{child_path, CoordinationStore, CreateMode, EventKind, WatchedEvent, Watcher};
use crate::{Error, Result};

pub(crate) struct Publisher {
    store: Arc<dyn CoordinationStore>,
    codec: Arc<dyn Codec>,
    layout: Layout,
    local: LocalHost,
    status_source: Arc<dyn StatusSource>,
    config_source: Arc<dyn ConfigSource>,
    status_force: bool,
    config_force: bool,
    status_path: Mutex<Option<String>>,
    config_watch: Mutex<Option<Arc<ConfigWatch>>>,
}

impl Publisher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        codec: Arc<dyn Codec>,
        layout: Layout,
        local: LocalHost,
        status_source: Arc<dyn StatusSource>,
        config_source: Arc<dyn ConfigSource>,
        status_force: bool,
        config_force: bool,
    ) -> Self {
        Self {
            store,
            codec,
            layout,
            local,
            status_source,
            config_source,
            status_force,
            config_force,
            status_path: Mutex::new(None),
            config_watch: Mutex::new(None),
        }
    }

    fn status_slot(&self) -> Result<MutexGuard<'_, Option<String>>> {
        self.status_path
            .lock()
            .map_err(|_| Error::Poisoned("status node"))
    }

    fn config_slot(&self) -> Result<MutexGuard<'_, Option<Arc<ConfigWatch>>>> {
        self.config_watch
            .lock()
            .map_err(|_| Error::Poisoned("config node"))
    }

    pub(crate) fn status_path(&self) -> Option<String> {
        self.status_slot().ok().and_then(|slot| slot.clone())
    }

    pub(crate) fn config_path(&self) -> Option<String> {
        self.config_slot()
            .ok()
            .and_then(|slot| slot.as_ref().map(|w| w.path.clone()))
    }

    /// No-op if already published. `NodeExists` is fatal only when forced.
    pub(crate) fn publish_status(&self) -> Result<()> {
        let mut slot = self.status_slot()?;
        if slot.is_some() {
            return Ok(());
        }
        let dir = self.layout.status_dir();
        mkdirs(self.store.as_ref(), &dir)?;
        let status = HostStatus {
            sid: self.local.sid.clone(),
            host: self.local.host.clone(),
            status: self.status_source.status(),
        };
        let data = self.codec.encode_status(&status)?;
        let path = child_path(&dir, &self.local.sid);
        match self.store.create(&path, &data, CreateMode::Ephemeral) {
            Ok(path) => {
                info!("published status node {path}");
                *slot = Some(path);
                Ok(())
            }
            Err(err) if err.is_node_exists() && !self.status_force => {
                warn!("status node {path} already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Publishes the effective config and watches it for pushes.
    pub(crate) fn publish_config(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.config_slot()?;
        if slot.is_some() {
            return Ok(());
        }
        let dir = self.layout.config_dir();
        mkdirs(self.store.as_ref(), &dir)?;
        let data = self.codec.encode_config(&self.config_source.snapshot())?;
        let path = child_path(&dir, &self.local.sid);
        match self.store.create(&path, &data, CreateMode::Ephemeral) {
            Ok(path) => {
                let watch = Arc::new(ConfigWatch {
                    path: path.clone(),
                    cell: WatchCell::armed(),
                    publisher: Arc::downgrade(self),
                });
                self.store.exists(&path, Some(watch.clone()))?;
                info!("published config node {path}");
                *slot = Some(watch);
                Ok(())
            }
            Err(err) if err.is_node_exists() && !self.config_force => {
                warn!("config node {path} already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn destroy_status(&self) -> Result<()> {
        let path = self.status_slot()?.take();
        if let Some(path) = path {
            self.delete(&path);
        }
        Ok(())
    }

    pub(crate) fn destroy_config(&self) -> Result<()> {
        let watch = self.config_slot()?.take();
        if let Some(watch) = watch {
            watch.cell.cancel();
            self.delete(&watch.path);
        }
        Ok(())
    }

    fn delete(&self, path: &str) {
        match self.store.delete(path, None) {
            Ok(()) => info!("withdrew {path}"),
            Err(err) if err.is_no_node() => {}
            Err(err) => error!("failed to withdraw {path}: {err}"),
        }
    }

    /// Applies a pushed config, then replaces the node with the effective one.
    fn on_config_pushed(self: &Arc<Self>, watch: &Arc<ConfigWatch>) -> Result<()> {
        // Re-register while reading so a failed republish still sees the next push.
        let data = self.store.get_data(&watch.path, Some(watch.clone()))?;
        match self.codec.decode_config(&data) {
            Ok(pushed) => {
                info!("applying {} pushed config keys", pushed.len());
                if let Err(err) = self.config_source.apply(pushed) {
                    error!("config push to {} rejected: {err}", watch.path);
                }
            }
            Err(err) => error!("unreadable config push at {}: {err}", watch.path),
        }
        self.destroy_config()?;
        self.publish_config()
    }
}

pub(crate) struct ConfigWatch {
    path: String,
    cell: WatchCell,
    publisher: Weak<Publisher>,
}

impl Watcher for ConfigWatch {
    fn process(self: Arc<Self>, event: &WatchedEvent) -> Result<()> {
        if !self.cell.fire() {
            return Ok(());
        }
        let Some(publisher) = self.publisher.upgrade() else {
            return Ok(());
        };
        info!("config watch received {event}");
        match event.kind {
            EventKind::NodeDataChanged => {
                if !self.cell.rearm() {
                    return Ok(());
                }
                publisher
                    .on_config_pushed(&self)
                    .map_err(|err| Error::runtime("config push", err))
            }
            EventKind::NodeDeleted => {
                warn!("config node {} was deleted", self.path);
                Ok(())
            }
            _ => {
                warn!("config watch cannot handle {event}");
                self.cell.rearm();
                publisher
                    .store
                    .exists(&self.path, Some(self.clone()))
                    .map(|_| ())
            }
        }
    }
}
