//! Deduplicating work queue with per-key in-flight tracking.
//!
//! The queue guarantees that for any key there is at most one pending item
//! and at most one in-flight item at any moment. An `add` that collides with
//! a pending item is dropped; one that collides with an in-flight item marks
//! the key dirty so the *latest* item is re-enqueued when the in-flight one
//! is acknowledged. This is what serializes reconciliation per task: a task
//! with an outstanding change is never dispatched a second one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::task::Change;

/// Items that carry a stable dedup key.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Change {
    fn key(&self) -> &str {
        &self.task_key
    }
}

/// The queue the informer feeds and the change consumer drains.
pub type ChangeQueue = DedupQueue<Change>;

struct QueueState<T> {
    pending: VecDeque<T>,
    pending_keys: HashSet<String>,
    in_flight: HashSet<String>,
    /// Latest item added while its key was in flight; re-enqueued on `done`.
    dirty: HashMap<String, T>,
    shutting_down: bool,
}

pub struct DedupQueue<T> {
    state: Mutex<QueueState<T>>,
    item_ready: Notify,
    drain_step: Notify,
}

impl<T: Keyed> Default for DedupQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Keyed> DedupQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                pending_keys: HashSet::new(),
                in_flight: HashSet::new(),
                dirty: HashMap::new(),
                shutting_down: false,
            }),
            item_ready: Notify::new(),
            drain_step: Notify::new(),
        }
    }

    /// Enqueue `item` unless its key is already outstanding. Returns whether
    /// the key was already pending or in flight (in which case nothing new
    /// was appended). After shutdown the queue refuses items and reports
    /// them as existing; callers observe the closed state through `get`.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.lock_state();
        if state.shutting_down {
            return true;
        }
        let key = item.key().to_string();
        if state.pending_keys.contains(&key) {
            return true;
        }
        if state.in_flight.contains(&key) {
            state.dirty.insert(key, item);
            return true;
        }
        state.pending_keys.insert(key);
        state.pending.push_back(item);
        metrics::gauge!("taskfleet_change_queue_depth").set(state.pending.len() as f64);
        drop(state);
        self.item_ready.notify_waiters();
        false
    }

    /// Wait for the next item, moving it from pending to in flight. Returns
    /// `None` once the queue is shut down and has nothing left to serve;
    /// during a draining shutdown, pending items are still handed out.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            // Register before checking state, so a notify between the check
            // and the await is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.lock_state();
                if let Some(item) = state.pending.pop_front() {
                    let key = item.key().to_string();
                    state.pending_keys.remove(&key);
                    state.in_flight.insert(key);
                    metrics::gauge!("taskfleet_change_queue_depth").set(state.pending.len() as f64);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Acknowledge the in-flight item for `key`. If the key went dirty while
    /// in flight, the latest item is re-enqueued, unless the queue is
    /// shutting down, in which case the divergence is left to be re-detected
    /// after restart.
    pub fn done(&self, key: &str) {
        let mut requeued = false;
        {
            let mut state = self.lock_state();
            state.in_flight.remove(key);
            let dirty_item = state.dirty.remove(key);
            if let Some(item) = dirty_item {
                if !state.shutting_down {
                    state.pending_keys.insert(key.to_string());
                    state.pending.push_back(item);
                    requeued = true;
                }
            }
        }
        if requeued {
            self.item_ready.notify_waiters();
        }
        self.drain_step.notify_waiters();
    }

    /// True while `key` has a pending or in-flight item.
    pub fn exists(&self, key: &str) -> bool {
        let state = self.lock_state();
        state.pending_keys.contains(key) || state.in_flight.contains(key)
    }

    /// Immediate shutdown: discard pending work and wake every `get` caller.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock_state();
            state.shutting_down = true;
            state.pending.clear();
            state.pending_keys.clear();
            state.dirty.clear();
        }
        self.item_ready.notify_waiters();
        self.drain_step.notify_waiters();
    }

    /// Draining shutdown: refuse new items from this moment, keep serving
    /// pending ones, and resolve once pending and in-flight are both empty.
    pub async fn shut_down_with_drain(&self) {
        {
            let mut state = self.lock_state();
            state.shutting_down = true;
        }
        // Getters parked on an empty queue must observe the shutdown.
        self.item_ready.notify_waiters();
        loop {
            let notified = self.drain_step.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock_state();
                if state.pending.is_empty() && state.in_flight.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Snapshot of the pending backlog, for observability and tests.
    pub fn pending_len(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Snapshot of the in-flight count, for observability and tests.
    pub fn in_flight_len(&self) -> usize {
        self.lock_state().in_flight.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().expect("dedup queue lock poisoned")
    }
}
