//! Primitive store commands consumed by both handlers.
//!
//! Every method checks out its own pooled connection and returns it
//! immediately; callers never hold a connection across an `.await` point
//! they don't control. `compare_and_set`/`compare_and_delete` use
//! `WATCH`/`MULTI`/`EXEC` so the guard aborts cleanly on concurrent change
//! rather than racing.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;

use crate::error::MutexResult;
use crate::pool::ConnectionPool;

/// Store commands needed by the handler protocol. Modeled after Redis, but
/// kept narrow enough that a different store could implement it.
pub struct Store {
    pool: Arc<dyn ConnectionPool>,
}

impl Store {
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self { pool }
    }

    /// `SET key value NX PX ttl` -- true if the key was absent and got set.
    pub async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> MutexResult<bool> {
        let mut conn = self.pool.get().await?;
        let ok: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await?;
        Ok(ok.is_some())
    }

    /// `GET key`.
    pub async fn get(&self, key: &str) -> MutexResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get(key).await?)
    }

    /// Atomically replace `key`'s value with `new_value` (and reset its
    /// expiry to `ttl`) only if its current value still equals `expected`.
    /// Aborts via `WATCH`/`MULTI`/`EXEC` on concurrent change, which this
    /// reports the same as a value mismatch: `Ok(false)`.
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        ttl: Duration,
    ) -> MutexResult<bool> {
        let mut conn = self.pool.get().await?;
        redis::cmd("WATCH").arg(key).query_async(&mut *conn).await?;

        let current: Option<String> = conn.get(key).await?;
        if current.as_deref() != Some(expected) {
            redis::cmd("UNWATCH").query_async(&mut *conn).await?;
            return Ok(false);
        }

        let result: Option<()> = redis::pipe()
            .atomic()
            .set_ex(key, new_value, ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await?;
        Ok(result.is_some())
    }

    /// Atomically delete `key` only if its current value equals `expected`.
    pub async fn compare_and_delete(&self, key: &str, expected: &str) -> MutexResult<bool> {
        let mut conn = self.pool.get().await?;
        redis::cmd("WATCH").arg(key).query_async(&mut *conn).await?;

        let current: Option<String> = conn.get(key).await?;
        if current.as_deref() != Some(expected) {
            redis::cmd("UNWATCH").query_async(&mut *conn).await?;
            return Ok(false);
        }

        let result: Option<()> = redis::pipe()
            .atomic()
            .del(key)
            .query_async(&mut *conn)
            .await?;
        Ok(result.is_some())
    }

    /// Unconditional delete, used to roll back a partial multi-name claim.
    pub async fn delete(&self, key: &str) -> MutexResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Set an absolute expiry (ms since epoch) on an existing key.
    pub async fn pexpire_at(&self, key: &str, at_ms: i64) -> MutexResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("PEXPIREAT")
            .arg(key)
            .arg(at_ms)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    /// Publish `payload` on `channel`.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> MutexResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Probe whether the store supports server-side scripting, by loading a
    /// throwaway script. Used by `handler = auto` at setup time.
    pub async fn supports_scripting(&self) -> bool {
        let Ok(mut conn) = self.pool.get().await else {
            return false;
        };
        redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg("return 1")
            .query_async::<_, String>(&mut *conn)
            .await
            .is_ok()
    }

    pub(crate) fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }
}
