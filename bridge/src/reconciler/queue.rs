//! Keyed work queue.
//!
//! - Adding a key that is already queued is a no-op (coalescing).
//! - A key handed to a worker is not handed out again until `done`.
//! - Adding a key while it is being processed marks it dirty; `done`
//!   re-queues it once.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::cluster::ObjectKey;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    shut_down: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the key was already waiting and this call
    /// coalesced into it, or when the queue is shut down.
    pub fn add(&self, key: ObjectKey) -> bool {
        let mut state = self.state.lock();
        if state.shut_down {
            return false;
        }
        if state.processing.contains(&key) {
            return state.dirty.insert(key);
        }
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
            true
        } else {
            debug!("coalesced duplicate enqueue of {}", key);
            false
        }
    }

    /// Add `key` after `delay` without blocking the caller.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking state so a concurrent
            // `add` or `shutdown` cannot slip between the two.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` finished; re-queue it if it was added while processing.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shut_down && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out work and wake every waiting worker.
    pub fn shutdown(&self) {
        self.state.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    pub fn is_processing(&self, key: &ObjectKey) -> bool {
        self.state.lock().processing.contains(key)
    }
}
