//! runs::state
//!
//! State manager backed by the runs API.
//!
//! The state lock is the workspace lock on the service, so a remote
//! operation and anyone else using the same workspace exclude each other.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::traits::{ApiError, RunsApi};
use crate::core::state::{LockId, LockInfo, StateError, StateManager, StateSnapshot};

/// Locks and reads a remote workspace's state.
pub struct RemoteStateManager {
    api: Arc<dyn RunsApi>,
    workspace_id: String,
    held: Mutex<Option<LockId>>,
}

impl std::fmt::Debug for RemoteStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStateManager")
            .field("api", &self.api.name())
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

impl RemoteStateManager {
    pub fn new(api: Arc<dyn RunsApi>, workspace_id: impl Into<String>) -> Self {
        Self {
            api,
            workspace_id: workspace_id.into(),
            held: Mutex::new(None),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    fn held(&self) -> Result<std::sync::MutexGuard<'_, Option<LockId>>, StateError> {
        self.held
            .lock()
            .map_err(|_| StateError::Backend("lock bookkeeping poisoned".into()))
    }
}

fn backend(err: ApiError) -> StateError {
    StateError::Backend(err.to_string())
}

#[async_trait]
impl StateManager for RemoteStateManager {
    async fn lock(&self, info: &LockInfo) -> Result<LockId, StateError> {
        let reason = format!("Locked by {} for {}", info.who, info.operation);
        match self.api.lock_workspace(&self.workspace_id, &reason).await {
            Ok(()) => {
                let id = info.id.clone();
                *self.held()? = Some(id.clone());
                tracing::debug!(workspace_id = %self.workspace_id, lock_id = %id, "workspace locked");
                Ok(id)
            }
            Err(ApiError::Conflict(_)) => Err(StateError::Locked { holder: None }),
            Err(e) => Err(backend(e)),
        }
    }

    async fn unlock(&self, id: &LockId) -> Result<(), StateError> {
        {
            let held = self.held()?;
            match held.as_ref() {
                None => return Err(StateError::NotLocked),
                Some(current) if current != id => {
                    return Err(StateError::LockMismatch {
                        expected: id.to_string(),
                        found: current.to_string(),
                    })
                }
                Some(_) => {}
            }
        }
        self.api
            .unlock_workspace(&self.workspace_id)
            .await
            .map_err(backend)?;
        *self.held()? = None;
        tracing::debug!(workspace_id = %self.workspace_id, lock_id = %id, "workspace unlocked");
        Ok(())
    }

    async fn read_state(&self) -> Result<Option<StateSnapshot>, StateError> {
        self.api
            .read_current_state(&self.workspace_id)
            .await
            .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::mock::{FailOn, MockRunsApi};

    fn setup() -> (MockRunsApi, RemoteStateManager) {
        let mock = MockRunsApi::new();
        let ws = mock.add_workspace("acme", "prod");
        let mgr = RemoteStateManager::new(Arc::new(mock.clone()), ws.id);
        (mock, mgr)
    }

    #[tokio::test]
    async fn lock_and_unlock_workspace() {
        let (mock, mgr) = setup();
        let info = LockInfo::new("apply", "prod");
        let id = mgr.lock(&info).await.unwrap();
        assert!(mock.workspace("prod").unwrap().locked);

        let err = mgr.lock(&LockInfo::new("plan", "prod")).await.unwrap_err();
        assert!(err.is_retryable());

        mgr.unlock(&id).await.unwrap();
        assert!(!mock.workspace("prod").unwrap().locked);
    }

    #[tokio::test]
    async fn unlock_requires_matching_id() {
        let (_, mgr) = setup();
        assert!(matches!(
            mgr.unlock(&LockId::new("nope")).await,
            Err(StateError::NotLocked)
        ));

        let id = mgr.lock(&LockInfo::new("apply", "prod")).await.unwrap();
        assert!(matches!(
            mgr.unlock(&LockId::new("other")).await,
            Err(StateError::LockMismatch { .. })
        ));
        mgr.unlock(&id).await.unwrap();
    }

    #[tokio::test]
    async fn transport_errors_are_not_retryable() {
        let mock = MockRunsApi::new().fail_on(FailOn::LockWorkspace(ApiError::Network(
            "connection reset".into(),
        )));
        let ws = mock.add_workspace("acme", "prod");
        let mgr = RemoteStateManager::new(Arc::new(mock), ws.id);
        let err = mgr.lock(&LockInfo::new("apply", "prod")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn read_state_passes_through() {
        let (mock, mgr) = setup();
        assert!(mgr.read_state().await.unwrap().is_none());
        mock.set_state(
            "ws-prod",
            StateSnapshot {
                serial: 3,
                lineage: "l".into(),
                resources: vec!["null_resource.hello".into()],
            },
        );
        let state = mgr.read_state().await.unwrap().unwrap();
        assert_eq!(state.serial, 3);
    }
}
