//! Lifecycle of a single registered watch.
//!
//! A store watch is one-shot, so every watcher that wants to keep observing a
//! node re-registers from inside its own callback. The transitions below make
//! that explicit: an event is only handled by an `Armed` watch, re-arming
//! happens before the re-registering read, and cancellation is terminal so a
//! late notification for a replaced or withdrawn watch is dropped.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Armed,
    Fired,
    Cancelled,
}

impl WatchState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WatchState::Armed,
            1 => WatchState::Fired,
            _ => WatchState::Cancelled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WatchState::Armed => 0,
            WatchState::Fired => 1,
            WatchState::Cancelled => 2,
        }
    }
}

#[derive(Debug)]
pub(crate) struct WatchCell {
    state: AtomicU8,
}

impl WatchCell {
    pub(crate) fn armed() -> Self {
        Self {
            state: AtomicU8::new(WatchState::Armed.as_u8()),
        }
    }

    pub(crate) fn state(&self) -> WatchState {
        WatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: WatchState, to: WatchState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Armed -> Fired`. False means the event must be dropped.
    pub(crate) fn fire(&self) -> bool {
        self.transition(WatchState::Armed, WatchState::Fired)
    }

    /// `Fired -> Armed`. False if the watch was cancelled meanwhile.
    pub(crate) fn rearm(&self) -> bool {
        self.transition(WatchState::Fired, WatchState::Armed)
    }

    pub(crate) fn cancel(&self) {
        self.state
            .store(WatchState::Cancelled.as_u8(), Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state() == WatchState::Cancelled
    }
}
