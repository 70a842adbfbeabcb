//! Handler Protocol: the acquire/release/refresh algorithms, exposed behind
//! one trait with two interchangeable implementations (§4.2-§4.4).
//!
//! Polymorphism is expressed as a trait with two impls chosen once at
//! [`crate::setup`], not as a mixin -- callers hold an `Arc<dyn Handler>` and
//! never know which variant backs it.

pub mod optimistic;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{MutexError, MutexResult};
use crate::lease::Lease;
use crate::signal::SignalQueue;
use crate::store::Store;
use crate::watcher::Watcher;

/// The well-known pub/sub channel both handlers publish releases on.
pub const RELEASE_CHANNEL: &str = "redis_mutex:release";

/// Common contract shared by the optimistic and scripted handlers (§4.2).
#[async_trait]
pub trait Handler: Send + Sync {
    /// One-shot, all-or-nothing claim attempt. Must not leave partial state
    /// behind on failure (invariant: multi-lock atomicity).
    async fn try_lock(&self, names: &[String], owner: &str, lease_ttl: Duration) -> MutexResult<bool>;

    /// Release only names whose stored value still names this owner;
    /// publishes the released set and returns it. `None` means nothing was
    /// owned (idempotent unlock).
    async fn unlock(&self, names: &[String], owner: &str) -> MutexResult<Option<Vec<String>>>;

    /// Extend deadlines, only if still owned.
    async fn refresh(&self, names: &[String], owner: &str, lease_ttl: Duration) -> MutexResult<bool>;

    /// Whether `refresh` can re-claim a lease whose deadline has already
    /// passed but which still names this owner (§6.3).
    fn can_refresh_expired(&self) -> bool;

    /// Shared accessors so the default `lock` below can be implemented once.
    fn store(&self) -> &Store;
    fn signal_queue(&self) -> &Arc<SignalQueue>;
    fn watcher(&self) -> &Arc<Watcher>;

    /// Block until acquired, every requested name's prior lease has expired
    /// (triggering a retry), or `block_timeout` elapses.
    ///
    /// Open Question #1 resolved: a multi-name lock registers its waiter
    /// callback against only the first name, matching the upstream source.
    /// This can delay wakeup when only a later name is released early, but a
    /// failed retry always falls through to the timeout-hint retry below, so
    /// it bounds worst-case latency rather than losing wakeups.
    async fn lock(
        &self,
        names: &[String],
        owner: &str,
        lease_ttl: Duration,
        block_timeout: Option<Duration>,
    ) -> MutexResult<bool> {
        if let Some(held) = self.deadlocked_on(names, owner).await? {
            return Err(MutexError::Deadlock {
                owner: owner.to_string(),
                name: held,
            });
        }

        let deadline = block_timeout.map(|d| tokio::time::Instant::now() + d);

        loop {
            if self.try_lock(names, owner, lease_ttl).await? {
                return Ok(true);
            }

            if let Some(held) = self.deadlocked_on(names, owner).await? {
                return Err(MutexError::Deadlock {
                    owner: owner.to_string(),
                    name: held,
                });
            }

            let primary = &names[0];
            let waiter = self.signal_queue().register(primary);
            let retry_hint = self.earliest_deadline_hint(names).await.unwrap_or(Duration::from_secs(1));

            let wait_result = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        self.signal_queue().unregister(&waiter);
                        return Ok(false);
                    }
                    tokio::select! {
                        _ = waiter.notified() => true,
                        _ = tokio::time::sleep(retry_hint.min(remaining)) => true,
                        _ = tokio::time::sleep(remaining) => false,
                    }
                }
                None => {
                    tokio::select! {
                        _ = waiter.notified() => true,
                        _ = tokio::time::sleep(retry_hint) => true,
                    }
                }
            };

            self.signal_queue().unregister(&waiter);

            if !wait_result {
                return Ok(false);
            }
        }
    }

    /// Whether `owner` already holds any requested name with a live lease.
    async fn deadlocked_on(&self, names: &[String], owner: &str) -> MutexResult<Option<String>> {
        for name in names {
            if let Some(raw) = self.store().get(name).await? {
                let lease = Lease::decode(&raw)?;
                if !lease.is_expired() && lease.owner == owner {
                    return Ok(Some(name.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Earliest remaining time-to-live among currently held requested names,
    /// used as a retry-without-wakeup hint so a missed pub/sub message never
    /// stalls a waiter past the holder's own lease expiring.
    async fn earliest_deadline_hint(&self, names: &[String]) -> MutexResult<Option<Duration>> {
        let mut earliest: Option<f64> = None;
        for name in names {
            if let Some(raw) = self.store().get(name).await? {
                if let Ok(lease) = Lease::decode(&raw) {
                    earliest = Some(earliest.map_or(lease.deadline, |e: f64| e.min(lease.deadline)));
                }
            }
        }
        Ok(earliest.map(|deadline| {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs_f64();
            let remaining = (deadline - now).max(0.0);
            // small jitter so many processes racing the same expiry don't
            // all retry in lockstep
            let jitter = rand::thread_rng().gen_range(0.0..0.05);
            Duration::from_secs_f64(remaining + jitter)
        }))
    }
}
