//! Deadline-ordered queue of subscriptions waiting to be attempted again.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::model::Service;
use crate::{Error, Result};

/// A subscription to re-attempt once `deadline` has passed.
#[derive(Debug, Clone)]
pub struct Reinstall {
    pub service: Service,
    pub deadline: Instant,
    /// Failed attempts so far, the initial subscribe included.
    pub attempt: u32,
    seq: u64,
}

impl PartialEq for Reinstall {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Reinstall {}

impl PartialOrd for Reinstall {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Reinstall {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<Reinstall>>,
    next_seq: u64,
    closed: bool,
}

pub struct RetryQueue {
    delay: Duration,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl RetryQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state.lock().map_err(|_| Error::Poisoned("retry queue"))
    }

    /// Queues `service` for `now + delay` and returns the deadline.
    pub fn schedule(&self, service: Service, attempt: u32) -> Result<Instant> {
        let deadline = Instant::now() + self.delay;
        let mut state = self.lock()?;
        if state.closed {
            return Err(Error::Closed);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(Reinstall {
            service,
            deadline,
            attempt,
            seq,
        }));
        drop(state);
        self.ready.notify_one();
        Ok(deadline)
    }

    /// Blocks until the earliest entry is due, the timeout elapses, or the
    /// queue is closed. Only due entries are returned.
    pub fn poll(&self, timeout: Duration) -> Result<Option<Reinstall>> {
        let give_up = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if state.closed {
                return Ok(None);
            }
            let now = Instant::now();
            let head = state.heap.peek().map(|Reverse(entry)| entry.deadline);
            let wake = match head {
                Some(deadline) if deadline <= now => {
                    return Ok(state.heap.pop().map(|Reverse(entry)| entry));
                }
                Some(deadline) => deadline.min(give_up),
                None => give_up,
            };
            if now >= give_up {
                return Ok(None);
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, wake.saturating_duration_since(now))
                .map_err(|_| Error::Poisoned("retry queue"))?;
            state = guard;
        }
    }

    /// Wakes every waiter; later `schedule` calls fail with `Closed`.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Queued services with their deadlines, earliest first.
    pub fn pending(&self) -> Vec<(Service, Instant)> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut entries: Vec<&Reinstall> = state.heap.iter().map(|Reverse(e)| e).collect();
        entries.sort();
        entries
            .into_iter()
            .map(|e| (e.service.clone(), e.deadline))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.heap.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn deadline_is_now_plus_delay() {
        let queue = RetryQueue::new(Duration::from_millis(30_000));
        let before = Instant::now();
        let deadline = queue.schedule(Service::new("svc", "v1"), 1).unwrap();
        let offset = deadline.duration_since(before);
        assert!(offset >= Duration::from_millis(30_000));
        assert!(offset < Duration::from_millis(31_000));
        assert_eq!(queue.pending().len(), 1);
    }

    #[test]
    fn poll_times_out_before_deadline() {
        let queue = RetryQueue::new(Duration::from_secs(30));
        queue.schedule(Service::new("svc", "v1"), 1).unwrap();
        assert!(queue.poll(Duration::from_millis(20)).unwrap().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn entries_pop_in_deadline_order() {
        let queue = RetryQueue::new(Duration::from_millis(5));
        queue.schedule(Service::new("a", "1"), 1).unwrap();
        queue.schedule(Service::new("b", "1"), 1).unwrap();
        let first = queue.poll(Duration::from_secs(1)).unwrap().unwrap();
        let second = queue.poll(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(first.service.name, "a");
        assert_eq!(second.service.name, "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn close_wakes_blocked_poll() {
        let queue = Arc::new(RetryQueue::new(Duration::from_secs(30)));
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.poll(Duration::from_secs(60)))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        let started = Instant::now();
        assert!(waiter.join().unwrap().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(queue.schedule(Service::new("a", "1"), 1), Err(Error::Closed)));
    }
}
