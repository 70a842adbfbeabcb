//! Optimistic handler (§4.3): no server-side scripting, just `SET NX`,
//! `GET`, and `WATCH`/`MULTI`/`EXEC`-guarded compare-and-set/delete.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::MutexResult;
use crate::handler::{Handler, RELEASE_CHANNEL};
use crate::lease::Lease;
use crate::signal::SignalQueue;
use crate::store::Store;
use crate::watcher::Watcher;
use crate::wire;

pub struct OptimisticHandler {
    store: Store,
    signal_queue: Arc<SignalQueue>,
    watcher: Arc<Watcher>,
}

impl OptimisticHandler {
    pub fn new(store: Store, signal_queue: Arc<SignalQueue>, watcher: Arc<Watcher>) -> Self {
        Self {
            store,
            signal_queue,
            watcher,
        }
    }

    /// Attempt to claim a single name, returning whether it succeeded.
    async fn claim_one(&self, name: &str, owner: &str, lease_ttl: Duration) -> MutexResult<bool> {
        let lease = Lease::new(owner, lease_ttl);
        if self.store.set_if_absent(name, &lease.encode(), lease_ttl).await? {
            return Ok(true);
        }

        let Some(existing_raw) = self.store.get(name).await? else {
            // raced with a concurrent delete between SETNX and GET; retry once
            return Ok(self.store.set_if_absent(name, &lease.encode(), lease_ttl).await?);
        };

        let existing = Lease::decode(&existing_raw)?;
        if !existing.is_expired() {
            return Ok(false);
        }

        // lease has expired but is still present: guarded takeover
        Ok(self
            .store
            .compare_and_set(name, &existing_raw, &lease.encode(), lease_ttl)
            .await?)
    }
}

#[async_trait]
impl Handler for OptimisticHandler {
    async fn try_lock(&self, names: &[String], owner: &str, lease_ttl: Duration) -> MutexResult<bool> {
        let mut claimed = Vec::with_capacity(names.len());

        for name in names {
            if self.claim_one(name, owner, lease_ttl).await? {
                claimed.push(name.clone());
            } else {
                // roll back everything this attempt claimed -- no partial state survives
                for held in &claimed {
                    self.store.delete(held).await?;
                }
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn unlock(&self, names: &[String], owner: &str) -> MutexResult<Option<Vec<String>>> {
        let mut released = Vec::new();

        for name in names {
            let Some(raw) = self.store.get(name).await? else {
                continue;
            };
            let lease = Lease::decode(&raw)?;
            if lease.owner != owner {
                continue;
            }
            if self.store.compare_and_delete(name, &raw).await? {
                released.push(name.clone());
            }
        }

        if released.is_empty() {
            return Ok(None);
        }

        self.store
            .publish(RELEASE_CHANNEL, &wire::encode_names(&released))
            .await?;
        Ok(Some(released))
    }

    async fn refresh(&self, names: &[String], owner: &str, lease_ttl: Duration) -> MutexResult<bool> {
        // Verify every name is owned and unexpired before writing any of
        // them: the optimistic handler refuses a refresh if any lease has
        // already expired, even one this owner still nominally holds.
        let mut raws = Vec::with_capacity(names.len());
        for name in names {
            let Some(raw) = self.store.get(name).await? else {
                return Ok(false);
            };
            let lease = Lease::decode(&raw)?;
            if lease.owner != owner || lease.is_expired() {
                return Ok(false);
            }
            raws.push(raw);
        }

        let new_lease = Lease::new(owner, lease_ttl);
        for (name, raw) in names.iter().zip(raws.iter()) {
            if !self.store.compare_and_set(name, raw, &new_lease.encode(), lease_ttl).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn can_refresh_expired(&self) -> bool {
        false
    }

    fn store(&self) -> &Store {
        &self.store
    }

    fn signal_queue(&self) -> &Arc<SignalQueue> {
        &self.signal_queue
    }

    fn watcher(&self) -> &Arc<Watcher> {
        &self.watcher
    }
}
