//! core::state
//!
//! State manager abstraction: the lockable store holding infrastructure state.
//!
//! # Design
//!
//! The engine never touches state storage directly. It asks a
//! [`StateManager`] to take a lock (returning an opaque [`LockId`]), to
//! release it, and to read the latest snapshot. Lock attempts are
//! non-blocking; waiting and retrying is the job of
//! [`crate::core::lock::StateLocker`].
//!
//! Implementations:
//! - [`file::FileStateManager`] - local state file guarded by an OS file lock
//! - [`crate::runs::state::RemoteStateManager`] - workspace lock on the runs API

pub mod file;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from state manager operations.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    /// Someone else holds the lock. Retryable.
    #[error("state is locked{}", holder_suffix(.holder))]
    Locked { holder: Option<Box<LockInfo>> },

    /// Unlock was called with an ID that does not hold the lock.
    #[error("lock id mismatch: expected {expected}, held by {found}")]
    LockMismatch { expected: String, found: String },

    /// Unlock was called on state that is not locked.
    #[error("state is not locked")]
    NotLocked,

    /// The backing store failed.
    #[error("state backend error: {0}")]
    Backend(String),
}

fn holder_suffix(holder: &Option<Box<LockInfo>>) -> String {
    match holder {
        Some(info) => format!(" by {} ({} since {})", info.who, info.operation, info.created),
        None => String::new(),
    }
}

impl StateError {
    /// Whether a lock attempt may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::Locked { .. })
    }
}

/// Opaque identifier of a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is locking state, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Assigned when the info is created for an acquisition attempt.
    pub id: LockId,
    /// Operation name ("plan", "apply", "destroy").
    pub operation: String,
    /// Free-form context, typically the workspace.
    pub info: String,
    /// `user@host` of the locking process.
    pub who: String,
    /// Tool version of the locking process.
    pub version: String,
    pub created: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(operation: impl Into<String>, info: impl Into<String>) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            id: LockId::new(Uuid::new_v4().to_string()),
            operation: operation.into(),
            info: info.into(),
            who: format!("{}@{}", user, host),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: Utc::now(),
        }
    }
}

/// A read-only view of state after an operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub serial: u64,
    pub lineage: String,
    /// Addresses of managed resource instances.
    #[serde(default)]
    pub resources: Vec<String>,
}

impl StateSnapshot {
    pub fn has_managed_resources(&self) -> bool {
        !self.resources.is_empty()
    }
}

/// A lockable state store.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` so a single manager can be shared
/// between the operation task and its watchers.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Try once to take the lock. Returns [`StateError::Locked`] if held.
    async fn lock(&self, info: &LockInfo) -> Result<LockId, StateError>;

    /// Release a lock previously returned by [`StateManager::lock`].
    async fn unlock(&self, id: &LockId) -> Result<(), StateError>;

    /// Read the latest state, if any has been written.
    async fn read_state(&self) -> Result<Option<StateSnapshot>, StateError>;
}
