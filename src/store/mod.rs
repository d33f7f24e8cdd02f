//! # Operation Store
//!
//! Durable persistence the engine relies on. Every call the drivers make is keyed
//! by the single operation id they are processing; the only multi-row query is the
//! startup recovery scan. Writes are last-writer-wins, except that no write may move
//! an operation out of a terminal state.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::models::{LastError, Operation, OperationId, OperationState, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub use memory::{InMemoryOperationStore, InMemoryTargetStore};
#[cfg(feature = "postgres")]
pub use postgres::{PgOperationStore, PgTargetStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Operation '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("Invalid state transition for operation '{id}' from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: OperationState,
        to: OperationState,
    },

    #[error("Operation '{id}' is {state} and can no longer change stage")]
    Terminal { id: String, state: OperationState },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record '{id}': {reason}")]
    Corrupt { id: String, reason: String },

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn operation_not_found(id: &OperationId) -> Self {
        Self::NotFound {
            entity: "operation",
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The write lost against an operation that is already finished
    pub fn is_terminal_conflict(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. } | Self::Terminal { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence of operation records
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Persist a newly accepted operation; must happen before any step runs
    async fn insert_operation(&self, operation: &Operation) -> StoreResult<()>;

    async fn get_operation(&self, id: &OperationId) -> StoreResult<Operation>;

    /// Set the coarse state and message. Rejects transitions out of terminal states.
    async fn update_operation_state(
        &self,
        id: &OperationId,
        message: &str,
        state: OperationState,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Move the operation to `stage` and reset its last transition time to `at`
    async fn transition_operation(
        &self,
        id: &OperationId,
        message: &str,
        stage: &Stage,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn update_operation_last_error(
        &self,
        id: &OperationId,
        last_error: &LastError,
    ) -> StoreResult<()>;

    /// Record the delay the driver asked for, so a restart can honour it
    async fn update_requeue_delay(
        &self,
        id: &OperationId,
        delay: Option<Duration>,
    ) -> StoreResult<()>;

    /// Replace the step-owned metadata object
    async fn update_operation_metadata(
        &self,
        id: &OperationId,
        metadata: &serde_json::Value,
    ) -> StoreResult<()>;

    /// Operations still owned by the engine (pending or in progress); used only by
    /// the startup recovery scan
    async fn list_active_operations(&self) -> StoreResult<Vec<Operation>>;
}

/// Read access to the target records operations act on
#[async_trait]
pub trait TargetStore<T>: Send + Sync {
    async fn get_target(&self, target_id: &str) -> StoreResult<T>;
}
