//! The single long-lived subscription that turns store release
//! notifications into local wakeups.
//!
//! Exactly one `Watcher` exists per process (invariant 6). It owns a
//! dedicated connection -- subscription mode precludes issuing other
//! commands on it, so it cannot share the pool used by handler operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MutexError, MutexResult};
use crate::signal::SignalQueue;

/// Cap on reconnect attempts before the watcher gives up entirely.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectMax {
    /// Stop retrying after this many consecutive failures.
    Attempts(u32),
    /// Never stop retrying.
    Forever,
}

impl Default for ReconnectMax {
    fn default() -> Self {
        ReconnectMax::Attempts(10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Running,
    GaveUp,
}

/// See module docs.
pub struct Watcher {
    client: redis::Client,
    channel: String,
    signal_queue: Arc<SignalQueue>,
    reconnect_max: ReconnectMax,
    pid: AtomicU32,
    state: RwLock<State>,
    stop: Arc<Notify>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(client: redis::Client, channel: String, signal_queue: Arc<SignalQueue>, reconnect_max: ReconnectMax) -> Arc<Self> {
        Arc::new(Self {
            client,
            channel,
            signal_queue,
            reconnect_max,
            pid: AtomicU32::new(std::process::id()),
            state: RwLock::new(State::Stopped),
            stop: Arc::new(Notify::new()),
            task: RwLock::new(None),
        })
    }

    /// Start (or restart after fork / explicit stop) the subscription loop.
    ///
    /// Validates connectivity synchronously so a watcher that can never be
    /// established surfaces a `ProtocolError` from `setup` itself, rather
    /// than silently retrying forever in the background.
    pub async fn start(self: &Arc<Self>) -> MutexResult<()> {
        self.recover_from_fork_if_needed().await;

        let mut task = self.task.write().await;
        if task.is_some() {
            return Ok(());
        }

        self.client.get_async_connection().await?;

        *self.state.write().await = State::Running;
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run().await }));
        Ok(())
    }

    /// Unsubscribe. Refuses if waiters are still queued unless `force`.
    pub async fn stop(&self, force: bool) -> MutexResult<()> {
        if !force && self.signal_queue.waiting_names() > 0 {
            return Err(MutexError::Protocol(
                "cannot stop watcher: waiters are still queued (pass force=true to override)"
                    .into(),
            ));
        }

        *self.state.write().await = State::Stopped;
        self.stop.notify_waiters();
        if let Some(handle) = self.task.write().await.take() {
            handle.abort();
        }
        Ok(())
    }

    pub async fn is_watching(&self) -> bool {
        *self.state.read().await == State::Running
    }

    /// Detect a fork (pid changed since construction/last start) and, if so,
    /// rebuild the connection and drop local waiters -- the child process
    /// inherits no waiters to wake.
    async fn recover_from_fork_if_needed(&self) {
        let current = std::process::id();
        let previous = self.pid.swap(current, Ordering::SeqCst);
        if previous != current {
            info!(previous, current, "watcher detected fork, resetting signal queue");
            self.signal_queue.clear();
            if let Some(handle) = self.task.write().await.take() {
                handle.abort();
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        loop {
            if *self.state.read().await != State::Running {
                return;
            }

            match self.subscribe_and_listen().await {
                Ok(()) => {
                    // listen loop only returns Ok on explicit stop()
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    warn!(%err, attempt, "watcher subscription lost, will reconnect");

                    if let ReconnectMax::Attempts(max) = self.reconnect_max {
                        if attempt > max {
                            warn!(max, "watcher exhausted reconnect attempts, giving up");
                            *self.state.write().await = State::GaveUp;
                            return;
                        }
                    }

                    let backoff = if attempt == 1 {
                        Duration::from_millis(100)
                    } else {
                        Duration::from_secs(1)
                    };

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.stop.notified() => return,
                    }
                }
            }
        }
    }

    async fn subscribe_and_listen(&self) -> MutexResult<()> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(&self.channel).await?;
        debug!(channel = %self.channel, "watcher (re)subscribed");

        // Any waiter registered while we were offline may have missed its
        // release; wake everyone so they re-poll against current store state.
        self.signal_queue.wake_all();

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(MutexError::Protocol("watcher subscription stream ended".into()));
                    };
                    let payload: Vec<u8> = msg.get_payload()?;
                    self.dispatch(&payload);
                }
                _ = self.stop.notified() => return Ok(()),
            }

            if *self.state.read().await != State::Running {
                return Ok(());
            }
        }
    }

    fn dispatch(&self, payload: &[u8]) {
        match crate::wire::decode_names(payload) {
            Ok(names) => {
                for name in names {
                    self.signal_queue.wake_head(&name);
                }
            }
            Err(err) => warn!(%err, "dropping malformed release message"),
        }
    }
}
