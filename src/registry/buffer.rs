//! Holds exports until the local endpoint accepts connections.

use std::sync::{Mutex, MutexGuard};

use log::{error, info};

use crate::model::Service;
use crate::snapshot::Handler;
use crate::{Error, Result};

enum BufferState {
    Pending(Vec<(Service, Handler)>),
    Started,
}

pub(crate) struct StartupBuffer {
    state: Mutex<BufferState>,
}

impl StartupBuffer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BufferState::Pending(Vec::new())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BufferState>> {
        self.state.lock().map_err(|_| Error::Poisoned("startup buffer"))
    }

    /// Publishes immediately once started, otherwise queues the export.
    ///
    /// Returns whether the export was published. The lock is held while
    /// publishing so no export overtakes the flush.
    pub(crate) fn offer<F>(&self, service: Service, handler: Handler, publish: F) -> Result<bool>
    where
        F: FnOnce(Service, Handler) -> Result<()>,
    {
        let mut state = self.lock()?;
        match &mut *state {
            BufferState::Started => {
                publish(service, handler)?;
                Ok(true)
            }
            BufferState::Pending(queued) => {
                info!("deferring export of {service} until ready");
                queued.push((service, handler));
                Ok(false)
            }
        }
    }

    /// Flushes queued exports in insertion order, exactly once.
    ///
    /// Every entry is attempted; the first failure is returned after the
    /// buffer has been marked started.
    pub(crate) fn reach<F>(&self, mut publish: F) -> Result<usize>
    where
        F: FnMut(Service, Handler) -> Result<()>,
    {
        let mut state = self.lock()?;
        let queued = match std::mem::replace(&mut *state, BufferState::Started) {
            BufferState::Started => return Ok(0),
            BufferState::Pending(queued) => queued,
        };
        let total = queued.len();
        let mut first_err = None;
        for (service, handler) in queued {
            let label = service.to_string();
            if let Err(err) = publish(service, handler) {
                error!("deferred export of {label} failed: {err}");
                first_err.get_or_insert(err);
            }
        }
        info!("flushed {total} deferred exports");
        match first_err {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.lock()
            .map(|s| matches!(*s, BufferState::Started))
            .unwrap_or(false)
    }

    pub(crate) fn pending(&self) -> usize {
        match self.lock().as_deref() {
            Ok(BufferState::Pending(queued)) => queued.len(),
            _ => 0,
        }
    }
}
