//! In-process waiter registry.
//!
//! Shared across every mutex instance in the process (one per [`crate::Context`]).
//! Release notifications arrive from the [`crate::watcher::Watcher`] and are
//! dispatched here to exactly the head-of-line waiter for the released name,
//! which then retries acquisition -- invoking every waiter on a release would
//! cause a thundering herd, and head-of-line dispatch is what gives informal
//! FIFO ordering within a process (§5, "Ordering").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

/// A registered waiter: an opaque id plus the handle used to wake it.
struct Entry {
    id: u64,
    notify: Arc<Notify>,
}

/// A handle returned by [`SignalQueue::register`]. Dropping it without
/// calling [`Waiter::unregister`] leaves a stale entry in the queue until a
/// release (harmless: a woken task that finds nothing to do just re-registers
/// or returns), so callers should still unregister promptly on timeout.
pub struct Waiter {
    name: String,
    id: u64,
    notify: Arc<Notify>,
}

impl Waiter {
    /// Wait until woken (by a release dispatch or a forced resubscribe wakeup).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Name this waiter is registered against.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// `full name -> ordered waiters` map.
#[derive(Default)]
pub struct SignalQueue {
    waiters: DashMap<String, VecDeque<Entry>>,
    next_id: AtomicU64,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tail-of-queue waiter for `name`.
    pub fn register(&self, name: &str) -> Waiter {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        self.waiters
            .entry(name.to_string())
            .or_default()
            .push_back(Entry {
                id,
                notify: notify.clone(),
            });
        Waiter {
            name: name.to_string(),
            id,
            notify,
        }
    }

    /// Remove a specific waiter (used on timeout, so a waiter that gave up
    /// doesn't receive a stale wakeup later and re-register pointlessly).
    pub fn unregister(&self, waiter: &Waiter) {
        if let Some(mut queue) = self.waiters.get_mut(&waiter.name) {
            queue.retain(|e| e.id != waiter.id);
            if queue.is_empty() {
                drop(queue);
                self.waiters.remove(&waiter.name);
            }
        }
    }

    /// Wake exactly the head-of-line waiter for `name`, if any. Returns
    /// whether anyone was woken.
    pub fn wake_head(&self, name: &str) -> bool {
        let Some(mut queue) = self.waiters.get_mut(name) else {
            return false;
        };
        if let Some(entry) = queue.pop_front() {
            entry.notify.notify_one();
            if queue.is_empty() {
                drop(queue);
                self.waiters.remove(name);
            }
            true
        } else {
            false
        }
    }

    /// Wake every queued waiter on every name. Used when the watcher
    /// resubscribes after an outage, to cover releases that were missed
    /// while offline.
    pub fn wake_all(&self) {
        for entry in self.waiters.iter() {
            for waiter in entry.value() {
                waiter.notify.notify_one();
            }
        }
    }

    /// Drop all entries, used on fork (the child inherits no local waiters).
    pub fn clear(&self) {
        self.waiters.clear();
    }

    /// Whether anyone is currently waiting on `name`.
    pub fn has_waiters(&self, name: &str) -> bool {
        self.waiters.get(name).is_some()
    }

    /// Total number of distinct names with at least one waiter.
    pub fn waiting_names(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wakes_only_head_of_line() {
        let q = SignalQueue::new();
        let a = q.register("r");
        let b = q.register("r");

        assert!(q.wake_head("r"));

        tokio::time::timeout(std::time::Duration::from_millis(50), a.notified())
            .await
            .expect("first waiter should be woken");

        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), b.notified())
            .await
            .is_err());

        assert!(q.wake_head("r"));
        tokio::time::timeout(std::time::Duration::from_millis(50), b.notified())
            .await
            .expect("second waiter woken on next release");
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let q = SignalQueue::new();
        let a = q.register("r");
        q.unregister(&a);
        assert!(!q.has_waiters("r"));
        assert!(!q.wake_head("r"));
    }

    #[tokio::test]
    async fn wake_all_notifies_every_waiter() {
        let q = SignalQueue::new();
        let a = q.register("r1");
        let b = q.register("r2");
        q.wake_all();
        tokio::time::timeout(std::time::Duration::from_millis(50), a.notified())
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(50), b.notified())
            .await
            .unwrap();
    }
}
