//! # redis_mutex
//!
//! A distributed advisory mutex over a Redis-like store, coordinating
//! exclusive access to named resources across machines, processes, and
//! lightweight concurrent tasks ("owners"). A single acquisition may span
//! one or many names atomically, which is what keeps incremental,
//! one-name-at-a-time acquisition from deadlocking callers against each
//! other.
//!
//! ## Architecture
//!
//! - `config`: process-wide setup -- connection pool, default lease/namespace,
//!   chosen handler, process identity.
//! - `identity`: the `"<process-uuid>$<pid>$<task-id>"` owner scheme.
//! - `signal`: in-process waiter registry (the Signal Queue).
//! - `watcher`: the single pub/sub subscription that turns store release
//!   notifications into local wakeups, with reconnect and fork recovery.
//! - `handler`: the acquire/release/refresh protocol, in optimistic and
//!   server-script variants behind one trait.
//! - `mutex`: the user-facing `Mutex` facade.
//! - `store` / `pool`: the store command surface and connection pooling.
//!
//! ## Example
//!
//! ```no_run
//! use redis_mutex::{setup, Mutex, MutexOptions, SetupOptions};
//!
//! # async fn run() -> redis_mutex::MutexResult<()> {
//! setup(SetupOptions {
//!     url: Some("redis://127.0.0.1:6379".to_string()),
//!     ..Default::default()
//! })
//! .await?;
//!
//! let lock = Mutex::new(MutexOptions {
//!     name: vec!["invoice:42".to_string()],
//!     ..Default::default()
//! })
//! .await?;
//!
//! lock.synchronize(None, || async {
//!     // critical section
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod autogen;
mod config;
mod error;
mod handler;
mod identity;
mod lease;
mod mutex;
mod pool;
mod signal;
mod store;
mod watcher;
mod wire;

pub use config::{setup, HandlerKind, SetupOptions};
pub use error::{MutexError, MutexResult};
pub use mutex::{Mutex, MutexOptions};
pub use pool::{ConnectionPool, DeadpoolConnectionPool};
pub use watcher::ReconnectMax;

/// `true` once [`setup`] has completed successfully.
pub async fn ready() -> bool {
    config::ready().await
}

/// Whether the process watcher is currently subscribed.
pub async fn watching() -> MutexResult<bool> {
    Ok(config::context().await?.watcher.is_watching().await)
}

/// Restart the watcher (after a fork, or after an explicit [`stop_watcher`]).
pub async fn start_watcher() -> MutexResult<()> {
    config::context().await?.watcher.start().await
}

/// Unsubscribe the watcher. Refuses if waiters are still queued unless
/// `force`.
pub async fn stop_watcher(force: bool) -> MutexResult<()> {
    config::context().await?.watcher.stop(force).await
}

/// Which handler variant the process resolved to (after `auto` detection).
pub async fn handler_kind() -> MutexResult<HandlerKind> {
    Ok(config::context().await?.resolved_handler_kind)
}

/// Whether the active handler can refresh a lease whose deadline has already
/// passed, provided it still names the caller's owner.
pub async fn can_refresh_expired() -> MutexResult<bool> {
    Ok(config::context().await?.handler.can_refresh_expired())
}
