//! Connection pool seam.
//!
//! The pool itself is an external collaborator -- production deployments are
//! expected to bring their own (a shared `deadpool` pool, a pool owned by the
//! host application, etc). This module defines the trait the core consumes
//! and ships one concrete implementation, a thin `deadpool` manager around
//! `redis::Client`, so the crate is usable standalone.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, Object, RecycleResult};
use redis::aio::MultiplexedConnection;

use crate::error::{MutexError, MutexResult};

/// A checked-out store connection, returned to the pool on drop.
pub struct PooledConnection(pub(crate) Object<RedisManager>);

impl std::ops::Deref for PooledConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Abstraction over "somewhere to get a store connection from".
///
/// Every mutex operation checks out a connection for the duration of its
/// call and returns it immediately after; the pool is shared across every
/// mutex instance in the process. The watcher does not use this trait -- its
/// subscription connection is long-lived and cannot share a pooled slot.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Check out a connection, waiting if the pool is momentarily exhausted.
    async fn get(&self) -> MutexResult<PooledConnection>;

    /// Build a fresh, unpooled connection, used by fork recovery (which must
    /// not share file descriptors with the parent).
    async fn dedicated_connection(&self) -> MutexResult<MultiplexedConnection>;

    /// A cheap handle to the underlying store client, used by the watcher to
    /// open (and reopen, on reconnect) its own dedicated subscription
    /// connection -- subscription mode precludes sharing a pooled slot.
    fn client(&self) -> redis::Client;
}

/// `deadpool::managed::Manager` for `redis::Client`.
pub struct RedisManager {
    client: redis::Client,
}

#[async_trait]
impl managed::Manager for RedisManager {
    type Type = MultiplexedConnection;
    type Error = redis::RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_tokio_connection().await
    }

    async fn recycle(
        &self,
        conn: &mut MultiplexedConnection,
        _metrics: &Metrics,
    ) -> RecycleResult<redis::RedisError> {
        redis::cmd("PING").query_async(conn).await?;
        Ok(())
    }
}

/// Default `ConnectionPool` backed by `deadpool`.
pub struct DeadpoolConnectionPool {
    client: redis::Client,
    pool: managed::Pool<RedisManager>,
}

impl DeadpoolConnectionPool {
    /// Build a pool of `size` connections against `url`.
    pub fn new(url: &str, size: usize) -> MutexResult<Arc<Self>> {
        let client = redis::Client::open(url)
            .map_err(|e| MutexError::Configuration(format!("invalid redis url: {e}")))?;
        let manager = RedisManager {
            client: client.clone(),
        };
        let pool = managed::Pool::builder(manager)
            .max_size(size.max(1))
            .build()
            .map_err(|e| MutexError::Configuration(format!("failed to build pool: {e}")))?;
        Ok(Arc::new(Self { client, pool }))
    }

    /// Adopt a pre-built `redis::Client` (used when the caller passes a
    /// `redis` client/pool to `setup` rather than connection parameters).
    pub fn from_client(client: redis::Client, size: usize) -> MutexResult<Arc<Self>> {
        let manager = RedisManager {
            client: client.clone(),
        };
        let pool = managed::Pool::builder(manager)
            .max_size(size.max(1))
            .build()
            .map_err(|e| MutexError::Configuration(format!("failed to build pool: {e}")))?;
        Ok(Arc::new(Self { client, pool }))
    }
}

#[async_trait]
impl ConnectionPool for DeadpoolConnectionPool {
    async fn get(&self) -> MutexResult<PooledConnection> {
        self.pool
            .get()
            .await
            .map(PooledConnection)
            .map_err(|e| MutexError::Pool(e.to_string()))
    }

    async fn dedicated_connection(&self) -> MutexResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(MutexError::Store)
    }

    fn client(&self) -> redis::Client {
        self.client.clone()
    }
}
