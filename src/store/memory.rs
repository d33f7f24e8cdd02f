//! In-memory stores backed by `DashMap`.
//!
//! Used by tests and by hosts that embed the engine without a database. They
//! apply the same lifecycle guard as the Postgres store.

use super::{OperationStore, StoreError, StoreResult, TargetStore};
use crate::models::{LastError, Operation, OperationId, OperationState, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct InMemoryOperationStore {
    operations: Arc<DashMap<OperationId, Operation>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Apply `update` to the stored record; the shard lock is held only for the closure
    fn modify<F>(&self, id: &OperationId, update: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Operation) -> StoreResult<()>,
    {
        let mut entry = self
            .operations
            .get_mut(id)
            .ok_or_else(|| StoreError::operation_not_found(id))?;
        update(entry.value_mut())
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn insert_operation(&self, operation: &Operation) -> StoreResult<()> {
        match self.operations.entry(operation.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                id: operation.id.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(operation.clone());
                Ok(())
            }
        }
    }

    async fn get_operation(&self, id: &OperationId) -> StoreResult<Operation> {
        self.operations
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::operation_not_found(id))
    }

    async fn update_operation_state(
        &self,
        id: &OperationId,
        message: &str,
        state: OperationState,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.modify(id, |op| {
            if !op.state.can_transition_to(state) {
                return Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: op.state,
                    to: state,
                });
            }
            op.state = state;
            op.message = message.to_string();
            op.updated_at = at;
            Ok(())
        })
    }

    async fn transition_operation(
        &self,
        id: &OperationId,
        message: &str,
        stage: &Stage,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.modify(id, |op| {
            if op.state.is_terminal() {
                return Err(StoreError::Terminal {
                    id: id.to_string(),
                    state: op.state,
                });
            }
            op.stage = stage.clone();
            op.message = message.to_string();
            op.last_transition_time = at;
            op.updated_at = at;
            Ok(())
        })
    }

    async fn update_operation_last_error(
        &self,
        id: &OperationId,
        last_error: &LastError,
    ) -> StoreResult<()> {
        self.modify(id, |op| {
            op.last_error = Some(last_error.clone());
            op.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn update_requeue_delay(
        &self,
        id: &OperationId,
        delay: Option<Duration>,
    ) -> StoreResult<()> {
        self.modify(id, |op| {
            op.requeue_delay = delay;
            op.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn update_operation_metadata(
        &self,
        id: &OperationId,
        metadata: &serde_json::Value,
    ) -> StoreResult<()> {
        self.modify(id, |op| {
            op.metadata = metadata.clone();
            op.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn list_active_operations(&self) -> StoreResult<Vec<Operation>> {
        let mut active: Vec<Operation> = self
            .operations
            .iter()
            .filter(|entry| entry.value().state.is_active())
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by_key(|op| op.created_at);
        Ok(active)
    }
}

/// Target records keyed by id
#[derive(Debug, Clone)]
pub struct InMemoryTargetStore<T> {
    targets: Arc<DashMap<String, T>>,
}

impl<T> Default for InMemoryTargetStore<T> {
    fn default() -> Self {
        Self {
            targets: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Clone> InMemoryTargetStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, target_id: impl Into<String>, target: T) {
        self.targets.insert(target_id.into(), target);
    }

    pub fn remove(&self, target_id: &str) -> Option<T> {
        self.targets.remove(target_id).map(|(_, target)| target)
    }
}

#[async_trait]
impl<T> TargetStore<T> for InMemoryTargetStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get_target(&self, target_id: &str) -> StoreResult<T> {
        self.targets
            .get(target_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                entity: "target",
                id: target_id.to_string(),
            })
    }
}
