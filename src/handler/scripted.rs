//! Scripted handler (§4.4): one round trip per operation via server-side
//! Lua scripts. `redis::Script::invoke_async` already does the
//! "EVALSHA, fall back to EVAL on NOSCRIPT" dance, so scripts are loaded on
//! first use and invoked by hash thereafter with no extra bookkeeping here.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::Script;

use crate::error::{MutexError, MutexResult};
use crate::handler::{Handler, RELEASE_CHANNEL};
use crate::lease::Lease;
use crate::signal::SignalQueue;
use crate::store::Store;
use crate::watcher::Watcher;

// Lease values share the optimistic handler's "<owner>$<deadline>" encoding
// so a lease claimed by one handler kind is fully legible to the other.
// `string.match(v, "^(.*)%$([^$]+)$")` splits on the *last* '$', since the
// owner identity itself contains '$' separators.

const TRY_LOCK_SCRIPT: &str = r#"
local owner = ARGV[1]
local deadline = ARGV[2]
local ttl_ms = ARGV[3]
local now = tonumber(ARGV[4])
for i, key in ipairs(KEYS) do
    local current = redis.call('GET', key)
    if current then
        local cur_owner, cur_deadline = string.match(current, "^(.*)%$([^$]+)$")
        cur_deadline = tonumber(cur_deadline)
        if cur_owner ~= owner and cur_deadline > now then
            return 0
        end
    end
end
local value = owner .. '$' .. deadline
for i, key in ipairs(KEYS) do
    redis.call('SET', key, value, 'PX', ttl_ms)
end
return 1
"#;

const UNLOCK_SCRIPT: &str = r#"
local owner = ARGV[1]
local channel = ARGV[2]
local released = {}
for i, key in ipairs(KEYS) do
    local current = redis.call('GET', key)
    if current then
        local cur_owner = string.match(current, "^(.*)%$([^$]+)$")
        if cur_owner == owner then
            redis.call('DEL', key)
            table.insert(released, key)
        end
    end
end
if #released > 0 then
    redis.call('PUBLISH', channel, cjson.encode(released))
end
return released
"#;

const REFRESH_SCRIPT: &str = r#"
local owner = ARGV[1]
local deadline = ARGV[2]
local ttl_ms = ARGV[3]
for i, key in ipairs(KEYS) do
    local current = redis.call('GET', key)
    if not current then
        return 0
    end
    local cur_owner = string.match(current, "^(.*)%$([^$]+)$")
    if cur_owner ~= owner then
        return 0
    end
end
local value = owner .. '$' .. deadline
for i, key in ipairs(KEYS) do
    redis.call('SET', key, value, 'PX', ttl_ms)
end
return 1
"#;

pub struct ScriptedHandler {
    store: Store,
    signal_queue: Arc<SignalQueue>,
    watcher: Arc<Watcher>,
    try_lock_script: Script,
    unlock_script: Script,
    refresh_script: Script,
}

impl ScriptedHandler {
    pub fn new(store: Store, signal_queue: Arc<SignalQueue>, watcher: Arc<Watcher>) -> Self {
        Self {
            store,
            signal_queue,
            watcher,
            try_lock_script: Script::new(TRY_LOCK_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
            refresh_script: Script::new(REFRESH_SCRIPT),
        }
    }
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn try_lock(&self, names: &[String], owner: &str, lease_ttl: Duration) -> MutexResult<bool> {
        let lease = Lease::new(owner, lease_ttl);
        let mut conn = self.store.pool().get().await?;

        let invocation = names
            .iter()
            .fold(self.try_lock_script.prepare_invoke(), |inv, name| inv.key(name))
            .arg(owner)
            .arg(lease.deadline)
            .arg(lease_ttl.as_millis() as u64)
            .arg(now_unix());

        let result: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| MutexError::Protocol(format!("try_lock script failed: {e}")))?;
        Ok(result == 1)
    }

    async fn unlock(&self, names: &[String], owner: &str) -> MutexResult<Option<Vec<String>>> {
        let mut conn = self.store.pool().get().await?;

        let invocation = names
            .iter()
            .fold(self.unlock_script.prepare_invoke(), |inv, name| inv.key(name))
            .arg(owner)
            .arg(RELEASE_CHANNEL);

        let released: Vec<String> = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| MutexError::Protocol(format!("unlock script failed: {e}")))?;

        if released.is_empty() {
            Ok(None)
        } else {
            Ok(Some(released))
        }
    }

    async fn refresh(&self, names: &[String], owner: &str, lease_ttl: Duration) -> MutexResult<bool> {
        let new_deadline = now_unix() + lease_ttl.as_secs_f64();
        let mut conn = self.store.pool().get().await?;

        let invocation = names
            .iter()
            .fold(self.refresh_script.prepare_invoke(), |inv, name| inv.key(name))
            .arg(owner)
            .arg(new_deadline)
            .arg(lease_ttl.as_millis() as u64);

        let result: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| MutexError::Protocol(format!("refresh script failed: {e}")))?;
        Ok(result == 1)
    }

    fn can_refresh_expired(&self) -> bool {
        true
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
