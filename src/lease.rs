//! Lease value encoding used by the optimistic handler.
//!
//! `"<owner>$<deadline-unix-float>"`. The scripted handler never parses this
//! itself (its scripts compare owners server-side) but shares the format so a
//! process running the optimistic handler can read a lease claimed by a
//! process running the scripted handler and vice versa.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{MutexError, MutexResult};

/// A parsed lease: who holds it, and when it expires.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// Owner identity string.
    pub owner: String,
    /// Unix timestamp (seconds, fractional) at which the lease expires.
    pub deadline: f64,
}

impl Lease {
    /// Build a lease expiring `ttl` from now.
    pub fn new(owner: impl Into<String>, ttl: std::time::Duration) -> Self {
        Self {
            owner: owner.into(),
            deadline: now_unix() + ttl.as_secs_f64(),
        }
    }

    /// Whether this lease's deadline has passed.
    pub fn is_expired(&self) -> bool {
        now_unix() >= self.deadline
    }

    /// Serialize to the on-wire `"<owner>$<deadline>"` form.
    pub fn encode(&self) -> String {
        format!("{}${}", self.owner, self.deadline)
    }

    /// Parse the on-wire form. A malformed value is a protocol error -- it
    /// means something other than this library wrote the key.
    pub fn decode(raw: &str) -> MutexResult<Self> {
        let (owner, deadline) = raw.rsplit_once('$').ok_or_else(|| {
            MutexError::Protocol(format!("malformed lease value: {raw:?}"))
        })?;
        let deadline: f64 = deadline
            .parse()
            .map_err(|_| MutexError::Protocol(format!("malformed lease deadline: {raw:?}")))?;
        Ok(Self {
            owner: owner.to_string(),
            deadline,
        })
    }
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}
