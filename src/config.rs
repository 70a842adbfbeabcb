//! Process-wide configuration and the context every mutex instance shares.
//!
//! The Signal Queue, Watcher, default expire/namespace, pool, chosen handler,
//! and process UUID are process-global state; this module is the one
//! explicit place that lives, rather than a handful of hidden statics
//! scattered across the crate (§9, "Process-wide state").

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock as AsyncRwLock;

use crate::error::{MutexError, MutexResult};
use crate::handler::optimistic::OptimisticHandler;
use crate::handler::scripted::ScriptedHandler;
use crate::handler::Handler;
use crate::pool::{ConnectionPool, DeadpoolConnectionPool};
use crate::signal::SignalQueue;
use crate::store::Store;
use crate::watcher::{ReconnectMax, Watcher};

const DEFAULT_EXPIRE_SECS: u64 = 86_400;

/// Which `Handler` implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Probe the store for scripting support at setup time and pick
    /// `Script` if available, `Pure` otherwise.
    Auto,
    /// Force the optimistic (no-scripting) handler.
    Pure,
    /// Force the server-script handler.
    Script,
}

/// Options recognized by [`setup`].
pub struct SetupOptions {
    /// Connection pool size (ignored if `redis` is supplied).
    pub size: usize,
    /// Store connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: Option<String>,
    /// A pre-built pool to adopt instead of `url`/`size`.
    pub redis: Option<Arc<dyn ConnectionPool>>,
    /// Default lease seconds for mutexes that don't override `expire`.
    pub expire: Duration,
    /// Default namespace prefix.
    pub ns: Option<String>,
    /// Which handler to use.
    pub handler: HandlerKind,
    /// Reconnect attempt cap for the watcher.
    pub reconnect_max: ReconnectMax,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            size: 1,
            url: Some("redis://127.0.0.1:6379".to_string()),
            redis: None,
            expire: Duration::from_secs(DEFAULT_EXPIRE_SECS),
            ns: None,
            handler: HandlerKind::Auto,
            reconnect_max: ReconnectMax::default(),
        }
    }
}

/// Process-wide state every [`crate::Mutex`] instance looks up through.
pub struct Context {
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) default_expire: Duration,
    pub(crate) default_ns: Option<String>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) resolved_handler_kind: HandlerKind,
    pub(crate) signal_queue: Arc<SignalQueue>,
    pub(crate) watcher: Arc<Watcher>,
    pub(crate) name_generator: crate::autogen::NameGenerator,
}

static CONTEXT: once_cell::sync::OnceCell<AsyncRwLock<Option<Arc<Context>>>> =
    once_cell::sync::OnceCell::new();

fn context_slot() -> &'static AsyncRwLock<Option<Arc<Context>>> {
    CONTEXT.get_or_init(|| AsyncRwLock::new(None))
}

/// Must be called once before constructing any [`crate::Mutex`]; safe to
/// call again to reconfigure, which stops any running watcher first.
pub async fn setup(options: SetupOptions) -> MutexResult<Arc<Context>> {
    if options.expire.is_zero() {
        return Err(MutexError::Configuration(
            "expire must be greater than zero".into(),
        ));
    }

    let pool = match (&options.redis, &options.url) {
        (Some(pool), _) => Arc::clone(pool),
        (None, Some(url)) => DeadpoolConnectionPool::new(url, options.size)?,
        (None, None) => {
            return Err(MutexError::Configuration(
                "setup requires either `redis` or `url`".into(),
            ))
        }
    };

    {
        let mut slot = context_slot().write().await;
        if let Some(existing) = slot.take() {
            existing.watcher.stop(true).await?;
        }
    }

    let store = Store::new(Arc::clone(&pool));

    let resolved_kind = match options.handler {
        HandlerKind::Auto => {
            if store.supports_scripting().await {
                HandlerKind::Script
            } else {
                HandlerKind::Pure
            }
        }
        other => other,
    };

    let signal_queue = Arc::new(SignalQueue::new());

    let watcher = Watcher::new(
        pool.client(),
        crate::handler::RELEASE_CHANNEL.to_string(),
        Arc::clone(&signal_queue),
        options.reconnect_max,
    );
    watcher
        .start()
        .await
        .map_err(|e| MutexError::Protocol(format!("watcher could not be established at setup: {e}")))?;

    let handler: Arc<dyn Handler> = match resolved_kind {
        HandlerKind::Script => Arc::new(ScriptedHandler::new(
            store,
            Arc::clone(&signal_queue),
            Arc::clone(&watcher),
        )),
        _ => Arc::new(OptimisticHandler::new(
            store,
            Arc::clone(&signal_queue),
            Arc::clone(&watcher),
        )),
    };

    let context = Arc::new(Context {
        pool,
        default_expire: options.expire,
        default_ns: options.ns,
        handler,
        resolved_handler_kind: resolved_kind,
        signal_queue,
        watcher,
        name_generator: crate::autogen::NameGenerator::new(),
    });

    *context_slot().write().await = Some(Arc::clone(&context));
    Ok(context)
}

/// Fetch the current context, failing with `ConfigurationError` if `setup`
/// has not run.
pub async fn context() -> MutexResult<Arc<Context>> {
    context_slot()
        .read()
        .await
        .clone()
        .ok_or_else(|| MutexError::Configuration("setup() has not been called".into()))
}

/// `true` once `setup` has succeeded.
pub async fn ready() -> bool {
    context_slot().read().await.is_some()
}
