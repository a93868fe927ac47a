//! core::lock
//!
//! Lock coordinator for state held by a [`StateManager`].
//!
//! # Architecture
//!
//! A [`StateManager`] only offers a non-blocking lock attempt. The
//! [`StateLocker`] turns that into a bounded wait: it retries with
//! exponential backoff until the lock is taken, the timeout elapses, or the
//! operation is cancelled.
//!
//! # Invariants
//!
//! - A zero timeout means exactly one attempt
//! - A successful lock yields a [`HeldLock`] that must be handed back to
//!   [`StateLocker::unlock`]; the token is consumed, so double unlock does
//!   not compile
//! - Dropping a [`HeldLock`] without unlocking is a defect and is logged
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use stratus::core::lock::StateLocker;
//! use stratus::core::state::{file::FileStateManager, LockInfo};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let dir = tempfile::TempDir::new().unwrap();
//! let manager = FileStateManager::new(dir.path());
//! let locker = StateLocker::new(Duration::from_secs(1));
//!
//! let held = locker
//!     .lock(&manager, LockInfo::new("apply", "prod"), &CancellationToken::new())
//!     .await
//!     .unwrap();
//! locker.unlock(&manager, held).await.unwrap();
//! # });
//! ```

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::state::{LockId, LockInfo, StateError, StateManager};

/// First retry delay while waiting for a lock.
const LOCK_RETRY_MIN: Duration = Duration::from_millis(100);

/// Upper bound for the retry delay.
const LOCK_RETRY_MAX: Duration = Duration::from_secs(2);

/// Errors from the lock coordinator.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock could not be taken before the timeout elapsed.
    #[error("Error acquiring the state lock: Lock timeout exceeded")]
    Timeout { holder: Option<Box<LockInfo>> },

    /// The wait was cancelled.
    #[error("state lock acquisition canceled")]
    Canceled,

    /// The state manager failed with a non-retryable error.
    #[error("Error acquiring the state lock: {0}")]
    Acquire(StateError),

    /// Releasing the lock failed.
    #[error("Error releasing the state lock: {0}")]
    Release(StateError),
}

/// Proof that a state lock is held.
///
/// Only [`StateLocker::unlock`] can consume it.
#[derive(Debug)]
#[must_use = "a held lock must be released with StateLocker::unlock"]
pub struct HeldLock {
    id: LockId,
    info: LockInfo,
    released: bool,
}

impl HeldLock {
    pub fn id(&self) -> &LockId {
        &self.id
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if !self.released {
            tracing::error!(
                lock_id = %self.id,
                operation = %self.info.operation,
                "state lock dropped without being released"
            );
        }
    }
}

/// Acquires and releases state locks with timeout and cancellation.
#[derive(Debug, Clone)]
pub struct StateLocker {
    timeout: Duration,
    retry_min: Duration,
    retry_max: Duration,
}

impl StateLocker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retry_min: LOCK_RETRY_MIN,
            retry_max: LOCK_RETRY_MAX,
        }
    }

    /// Override the retry backoff bounds.
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.retry_min = min;
        self.retry_max = max.max(min);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Take the lock, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// - [`LockError::Timeout`] if the lock is still held when time runs out
    /// - [`LockError::Canceled`] if `cancel` fires while waiting
    /// - [`LockError::Acquire`] for non-retryable manager errors
    pub async fn lock(
        &self,
        manager: &dyn StateManager,
        info: LockInfo,
        cancel: &CancellationToken,
    ) -> Result<HeldLock, LockError> {
        let deadline = Instant::now() + self.timeout;
        let mut delay = self.retry_min;

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Canceled);
            }

            let err = match manager.lock(&info).await {
                Ok(id) => {
                    tracing::debug!(lock_id = %id, operation = %info.operation, "state locked");
                    return Ok(HeldLock {
                        id,
                        info,
                        released: false,
                    });
                }
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(LockError::Acquire(err));
            }
            let holder = match err {
                StateError::Locked { holder } => holder,
                _ => None,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout { holder });
            }
            tracing::debug!(?delay, "state is locked, retrying");

            let wait = delay.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Canceled),
                _ = tokio::time::sleep(wait) => {}
            }
            delay = (delay * 2).min(self.retry_max);
        }
    }

    /// Release a lock taken by [`StateLocker::lock`].
    pub async fn unlock(
        &self,
        manager: &dyn StateManager,
        mut held: HeldLock,
    ) -> Result<(), LockError> {
        held.released = true;
        manager
            .unlock(&held.id)
            .await
            .map_err(LockError::Release)?;
        tracing::debug!(lock_id = %held.id, "state unlocked");
        Ok(())
    }
}
