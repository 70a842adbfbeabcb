//! Error types surfaced by the mutex facade and handler protocol.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by any public operation on [`crate::Mutex`] or [`crate::setup`].
///
/// Transient store errors encountered while the background watcher is
/// reconnecting are never surfaced here -- they are retried internally until
/// `reconnect_max` is exhausted, at which point callers simply stop receiving
/// wakeups and fall back to their own `block_timeout`.
#[derive(Debug, Error)]
pub enum MutexError {
    /// Raised before [`crate::setup`] has run, for an unknown `handler`
    /// option, a non-positive `expire`, or a missing connection-pool class.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The current owner already holds one of the requested names.
    #[error("deadlock: owner {owner:?} already holds {name:?}")]
    Deadlock {
        /// Owner identity that attempted the reentrant acquisition.
        owner: String,
        /// Name already held.
        name: String,
    },

    /// `block_timeout` elapsed before the lock (or reacquisition in
    /// [`crate::Mutex::sleep`]) could be obtained.
    #[error("timed out after {0:?} waiting for lock")]
    Timeout(Duration),

    /// A lease value could not be parsed, a script failed for a reason other
    /// than a missing script, or the watcher could not be established during
    /// [`crate::setup`].
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A store round trip failed outside the watcher's own retry loop (e.g.
    /// during `try_lock`, `unlock`, or `refresh`).
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Failed to check out a pooled connection.
    #[error("connection pool error: {0}")]
    Pool(String),
}

/// Convenience alias used throughout the crate.
pub type MutexResult<T> = Result<T, MutexError>;
