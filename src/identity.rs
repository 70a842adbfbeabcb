//! Owner identity: `"<process-uuid>$<process-id>$<task-id>"`.
//!
//! The UUID component guarantees fleet-wide uniqueness; pid and task id are
//! only there to make the identity legible in logs and to scope reentrance
//! detection to "this cooperative task" rather than "this process".

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::OnceCell;
use uuid::Uuid;

static PROCESS_UUID: OnceCell<Uuid> = OnceCell::new();
static FALLBACK_TASK_COUNTER: AtomicU64 = AtomicU64::new(0);

tokio::task_local! {
    static FALLBACK_TASK_ID: u64;
}

/// The process-wide UUID, generated once on first access and stable across
/// repeated [`crate::setup`] calls for the life of the process.
pub fn process_uuid() -> Uuid {
    *PROCESS_UUID.get_or_init(Uuid::new_v4)
}

/// Best-effort identifier for "the cooperative task currently running this
/// code". Tokio does not expose task identity outside its own task context,
/// so tasks spawned via `tokio::spawn` get the runtime's own id; anything
/// else (a plain future polled directly, a non-tokio executor) falls back to
/// a lazily-assigned per-call-stack slot.
fn current_task_identifier() -> String {
    if let Some(id) = tokio::task::try_id() {
        return id.to_string();
    }
    match FALLBACK_TASK_ID.try_with(|id| *id) {
        Ok(id) => format!("fallback-{id}"),
        Err(_) => {
            // Not inside a scoped fallback slot either -- this only happens
            // outside any tokio task; assign a process-unique counter value
            // rather than panic.
            let id = FALLBACK_TASK_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("fallback-{id}")
        }
    }
}

/// Build this call's default owner identity, or the caller's override
/// verbatim if one was configured (e.g. so every task servicing one inbound
/// connection shares ownership).
pub fn owner_identity(override_identity: Option<&str>) -> String {
    if let Some(id) = override_identity {
        return id.to_string();
    }
    format!(
        "{}${}${}",
        process_uuid(),
        std::process::id(),
        current_task_identifier()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_uuid_is_stable() {
        assert_eq!(process_uuid(), process_uuid());
    }

    #[test]
    fn override_is_used_verbatim() {
        assert_eq!(owner_identity(Some("conn-42")), "conn-42");
    }

    #[tokio::test]
    async fn default_identity_has_three_dollar_separated_parts() {
        let id = owner_identity(None);
        assert_eq!(id.matches('$').count(), 2);
    }
}
