//! Mutex Facade (§4.1): the user-facing object. Immutable names/lease/block
//! timeout/owner-override, delegating the actual protocol to whichever
//! `Handler` the process was set up with.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::instrument;

use crate::config::{self, Context};
use crate::error::{MutexError, MutexResult};
use crate::identity;

/// Options accepted by [`Mutex::new`].
#[derive(Default)]
pub struct MutexOptions {
    /// Explicit name(s). When empty, one is auto-generated.
    pub name: Vec<String>,
    /// Default block timeout for `lock`/`synchronize`/`sleep`. `None` means
    /// wait forever.
    pub block: Option<Duration>,
    /// Lease duration; must be greater than zero if supplied.
    pub expire: Option<Duration>,
    /// Namespace prefix, overriding the process default.
    pub ns: Option<String>,
    /// Owner identity override, e.g. so every task servicing one inbound
    /// connection shares ownership.
    pub owner: Option<String>,
}

/// A distributed advisory mutex over one or more namespaced resource names.
///
/// Constructing one is cheap (no I/O); the store isn't touched until `lock`,
/// `try_lock`, `unlock`, `locked`, `owned`, or `refresh` is called.
pub struct Mutex {
    names: Vec<String>,
    ns: Option<String>,
    expire_timeout: Duration,
    block_timeout: Option<Duration>,
    owner_override: Option<String>,
    ctx: Arc<Context>,
    /// Tasks parked in `sleep`, keyed by the same identifier `wakeup` is
    /// called with, so an external collaborator (a condition variable built
    /// on top of this mutex) can resume a specific sleeper.
    sleepers: DashMap<String, Arc<tokio::sync::Notify>>,
}

impl Mutex {
    /// Construct a mutex over `options.name` (or an auto-generated name).
    /// Fails with `ConfigurationError` if `setup` has not run.
    pub async fn new(options: MutexOptions) -> MutexResult<Self> {
        let ctx = config::context().await?;

        if let Some(expire) = options.expire {
            if expire.is_zero() {
                return Err(MutexError::Configuration(
                    "expire must be greater than zero".into(),
                ));
            }
        }

        let ns = options.ns.or_else(|| ctx.default_ns.clone());

        let raw_names = if options.name.is_empty() {
            vec![ctx.name_generator.next()]
        } else {
            options.name
        };

        let mut seen = HashSet::new();
        let mut full_names = Vec::with_capacity(raw_names.len());
        for name in &raw_names {
            if !seen.insert(name.clone()) {
                return Err(MutexError::Configuration(format!(
                    "duplicate name in multi-lock: {name:?}"
                )));
            }
            full_names.push(full_name(ns.as_deref(), name));
        }

        Ok(Self {
            names: full_names,
            ns,
            expire_timeout: options.expire.unwrap_or(ctx.default_expire),
            block_timeout: options.block,
            owner_override: options.owner,
            ctx,
            sleepers: DashMap::new(),
        })
    }

    /// Namespace-qualified names this instance locks, in the order given.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Effective namespace prefix, if any.
    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    /// Lease duration used for acquisitions and refreshes.
    pub fn expire_timeout(&self) -> Duration {
        self.expire_timeout
    }

    /// Default block timeout (`None` = wait forever).
    pub fn block_timeout(&self) -> Option<Duration> {
        self.block_timeout
    }

    fn owner(&self) -> String {
        identity::owner_identity(self.owner_override.as_deref())
    }

    /// Attempt acquisition, waiting up to `block_timeout` (falling back to
    /// `self.block_timeout`, falling back to forever). `Ok(false)` on
    /// timeout; `Err(DeadlockError)` if the current owner already holds any
    /// of `self.names`.
    #[instrument(skip(self), fields(names = ?self.names))]
    pub async fn lock(&self, block_timeout: Option<Duration>) -> MutexResult<bool> {
        let owner = self.owner();
        let timeout = block_timeout.or(self.block_timeout);
        self.ctx
            .handler
            .lock(&self.names, &owner, self.expire_timeout, timeout)
            .await
    }

    /// One-shot acquisition attempt; never blocks.
    pub async fn try_lock(&self) -> MutexResult<bool> {
        let owner = self.owner();
        self.ctx
            .handler
            .try_lock(&self.names, &owner, self.expire_timeout)
            .await
    }

    /// Release unconditionally. A no-op (not an error) if not owned.
    pub async fn unlock(&self) -> MutexResult<&Self> {
        let owner = self.owner();
        self.ctx.handler.unlock(&self.names, &owner).await?;
        Ok(self)
    }

    /// Release unconditionally, returning the names actually released, or
    /// `None` if nothing was owned.
    pub async fn unlock_bang(&self) -> MutexResult<Option<Vec<String>>> {
        let owner = self.owner();
        self.ctx.handler.unlock(&self.names, &owner).await
    }

    /// Whether any of `self.names` is currently held by anyone.
    pub async fn locked(&self) -> MutexResult<bool> {
        for name in &self.names {
            if let Some(raw) = self.ctx.handler.store().get(name).await? {
                let lease = crate::lease::Lease::decode(&raw)?;
                if !lease.is_expired() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Whether *all* of `self.names` are held by this instance's owner
    /// identity with an unexpired lease.
    pub async fn owned(&self) -> MutexResult<bool> {
        let owner = self.owner();
        for name in &self.names {
            match self.ctx.handler.store().get(name).await? {
                Some(raw) => {
                    let lease = crate::lease::Lease::decode(&raw)?;
                    if lease.owner != owner || lease.is_expired() {
                        return Ok(false);
                    }
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Extend the lease deadline. `false` if ownership was already lost; the
    /// optimistic handler additionally refuses if any lease already expired
    /// ([`Mutex::can_refresh_expired`] reports which applies).
    pub async fn refresh(&self, new_expire: Option<Duration>) -> MutexResult<bool> {
        let owner = self.owner();
        let ttl = new_expire.unwrap_or(self.expire_timeout);
        self.ctx.handler.refresh(&self.names, &owner, ttl).await
    }

    /// Whether the active handler can refresh a lease whose deadline has
    /// already passed, provided it still names this owner.
    pub fn can_refresh_expired(&self) -> bool {
        self.ctx.handler.can_refresh_expired()
    }

    /// Lock, run `body`, and unlock on every exit path (including panics
    /// unwinding through `body`, via the guard below). Fails with
    /// `TimeoutError` if acquisition itself times out.
    pub async fn synchronize<F, Fut, T>(&self, block_timeout: Option<Duration>, body: F) -> MutexResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let timeout = block_timeout.or(self.block_timeout);
        if !self.lock(block_timeout).await? {
            return Err(MutexError::Timeout(timeout.unwrap_or(Duration::MAX)));
        }

        struct UnlockGuard<'a>(&'a Mutex);
        impl Drop for UnlockGuard<'_> {
            fn drop(&mut self) {
                let mutex = self.0;
                // best-effort: spawn the release so Drop stays synchronous
                let owner = mutex.owner();
                let ctx = Arc::clone(&mutex.ctx);
                let names = mutex.names.clone();
                tokio::spawn(async move {
                    let _ = ctx.handler.unlock(&names, &owner).await;
                });
            }
        }
        let _guard = UnlockGuard(self);

        Ok(body().await)
    }

    /// Release the lock, suspend until `timeout` elapses or another task
    /// calls [`Mutex::wakeup`] with this call's identifier, then reacquire.
    /// Fails with `TimeoutError` if reacquisition itself times out. This is
    /// the full surface an external condition-variable type needs.
    pub async fn sleep(&self, timeout: Option<Duration>) -> MutexResult<()> {
        let owner = self.owner();
        let waiter_key = owner.clone();
        let notify = Arc::new(tokio::sync::Notify::new());
        self.sleepers.insert(waiter_key.clone(), Arc::clone(&notify));

        self.ctx.handler.unlock(&self.names, &owner).await?;

        match timeout {
            Some(d) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(d) => {}
                }
            }
            None => notify.notified().await,
        }

        self.sleepers.remove(&waiter_key);

        let reacquired = self.lock(self.block_timeout).await?;
        if !reacquired {
            return Err(MutexError::Timeout(self.block_timeout.unwrap_or(Duration::MAX)));
        }
        Ok(())
    }

    /// Like [`Mutex::sleep`], but runs `body` after releasing the lock and
    /// before waiting -- the hook an external condition-variable type needs
    /// to signal other waiters while not holding the lock itself.
    pub async fn sleep_and<F, Fut>(&self, timeout: Option<Duration>, body: F) -> MutexResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let owner = self.owner();
        let waiter_key = owner.clone();
        let notify = Arc::new(tokio::sync::Notify::new());
        self.sleepers.insert(waiter_key.clone(), Arc::clone(&notify));

        self.ctx.handler.unlock(&self.names, &owner).await?;
        body().await;

        match timeout {
            Some(d) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(d) => {}
                }
            }
            None => notify.notified().await,
        }

        self.sleepers.remove(&waiter_key);

        let reacquired = self.lock(self.block_timeout).await?;
        if !reacquired {
            return Err(MutexError::Timeout(self.block_timeout.unwrap_or(Duration::MAX)));
        }
        Ok(())
    }

    /// If `task` is currently parked in [`Mutex::sleep`], wake it.
    pub fn wakeup(&self, task: &str) {
        if let Some((_, notify)) = self.sleepers.remove(task) {
            notify.notify_one();
        }
    }
}

fn full_name(ns: Option<&str>, name: &str) -> String {
    match ns {
        Some(ns) if !ns.is_empty() => format!("{ns}:{name}"),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::full_name;

    #[test]
    fn full_name_joins_namespace() {
        assert_eq!(full_name(Some("app"), "r"), "app:r");
        assert_eq!(full_name(None, "r"), "r");
        assert_eq!(full_name(Some(""), "r"), "r");
    }
}
