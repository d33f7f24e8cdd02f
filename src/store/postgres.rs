//! # Postgres Stores
//!
//! `sqlx`-backed implementations of [`OperationStore`] and [`TargetStore`]. Each
//! statement touches one row keyed by id; the terminal-state guard lives in the
//! `WHERE` clause so concurrent writers cannot resurrect a finished operation.

use super::{OperationStore, StoreError, StoreResult, TargetStore};
use crate::models::{LastError, Operation, OperationId, OperationState, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;

const SELECT_OPERATION: &str = r#"
    SELECT id, target_id, kind, state, stage, message,
           last_error_message, last_error_reason, last_error_component,
           requeue_delay_ms, metadata, created_at, updated_at, last_transition_time
    FROM operations
"#;

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: String,
    target_id: String,
    kind: String,
    state: String,
    stage: String,
    message: String,
    last_error_message: Option<String>,
    last_error_reason: Option<String>,
    last_error_component: Option<String>,
    requeue_delay_ms: Option<i64>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_transition_time: DateTime<Utc>,
}

impl TryFrom<OperationRow> for Operation {
    type Error = StoreError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.id.clone(),
            reason,
        };
        let kind = row.kind.parse().map_err(corrupt)?;
        let state = row.state.parse().map_err(corrupt)?;
        let last_error = row.last_error_message.map(|message| LastError {
            message,
            reason: row.last_error_reason,
            component: row.last_error_component,
        });

        Ok(Operation {
            id: OperationId::from(row.id),
            target_id: row.target_id,
            kind,
            state,
            stage: Stage::new(row.stage),
            message: row.message,
            last_error,
            requeue_delay: row
                .requeue_delay_ms
                .map(|ms| Duration::from_millis(ms.max(0) as u64)),
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_transition_time: row.last_transition_time,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgOperationStore {
    pool: PgPool,
}

impl PgOperationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply the bundled migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn ensure_updated(rows_affected: u64, id: &OperationId) -> StoreResult<()> {
        if rows_affected == 0 {
            return Err(StoreError::operation_not_found(id));
        }
        Ok(())
    }
}

#[async_trait]
impl OperationStore for PgOperationStore {
    async fn insert_operation(&self, operation: &Operation) -> StoreResult<()> {
        let last_error = operation.last_error.as_ref();
        let result = sqlx::query(
            r#"
            INSERT INTO operations (
                id, target_id, kind, state, stage, message,
                last_error_message, last_error_reason, last_error_component,
                requeue_delay_ms, metadata, created_at, updated_at, last_transition_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(operation.id.as_str())
        .bind(&operation.target_id)
        .bind(operation.kind.to_string())
        .bind(operation.state.to_string())
        .bind(operation.stage.as_str())
        .bind(&operation.message)
        .bind(last_error.map(|e| e.message.clone()))
        .bind(last_error.and_then(|e| e.reason.clone()))
        .bind(last_error.and_then(|e| e.component.clone()))
        .bind(operation.requeue_delay.map(|d| d.as_millis() as i64))
        .bind(&operation.metadata)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .bind(operation.last_transition_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                id: operation.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_operation(&self, id: &OperationId) -> StoreResult<Operation> {
        let row: Option<OperationRow> =
            sqlx::query_as(&format!("{SELECT_OPERATION} WHERE id = $1"))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| StoreError::operation_not_found(id))?
            .try_into()
    }

    async fn update_operation_state(
        &self,
        id: &OperationId,
        message: &str,
        state: OperationState,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET state = $2, message = $3, updated_at = $4
            WHERE id = $1
              AND state NOT IN ('succeeded', 'failed')
              AND NOT (state = 'in_progress' AND $2 = 'pending')
            "#,
        )
        .bind(id.as_str())
        .bind(state.to_string())
        .bind(message)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from a rejected transition
            let current = self.get_operation(id).await?;
            debug!(operation_id = %id, from = %current.state, to = %state, "Rejected state transition");
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.state,
                to: state,
            });
        }
        Ok(())
    }

    async fn transition_operation(
        &self,
        id: &OperationId,
        message: &str,
        stage: &Stage,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET stage = $2, message = $3, last_transition_time = $4, updated_at = $4
            WHERE id = $1
              AND state NOT IN ('succeeded', 'failed')
            "#,
        )
        .bind(id.as_str())
        .bind(stage.as_str())
        .bind(message)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get_operation(id).await?;
            return Err(StoreError::Terminal {
                id: id.to_string(),
                state: current.state,
            });
        }
        Ok(())
    }

    async fn update_operation_last_error(
        &self,
        id: &OperationId,
        last_error: &LastError,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET last_error_message = $2, last_error_reason = $3,
                last_error_component = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(&last_error.message)
        .bind(&last_error.reason)
        .bind(&last_error.component)
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(result.rows_affected(), id)
    }

    async fn update_requeue_delay(
        &self,
        id: &OperationId,
        delay: Option<Duration>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE operations SET requeue_delay_ms = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_str())
        .bind(delay.map(|d| d.as_millis() as i64))
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(result.rows_affected(), id)
    }

    async fn update_operation_metadata(
        &self,
        id: &OperationId,
        metadata: &serde_json::Value,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE operations SET metadata = $2, updated_at = now() WHERE id = $1")
                .bind(id.as_str())
                .bind(metadata)
                .execute(&self.pool)
                .await?;

        Self::ensure_updated(result.rows_affected(), id)
    }

    async fn list_active_operations(&self) -> StoreResult<Vec<Operation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            "{SELECT_OPERATION} WHERE state IN ('pending', 'in_progress') ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Operation::try_from).collect()
    }
}

/// Target records stored as JSON payloads in the `targets` table
pub struct PgTargetStore<T> {
    pool: PgPool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PgTargetStore<T> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for PgTargetStore<T> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

#[async_trait]
impl<T> TargetStore<T> for PgTargetStore<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn get_target(&self, target_id: &str) -> StoreResult<T> {
        let payload: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT payload FROM targets WHERE id = $1")
                .bind(target_id)
                .fetch_optional(&self.pool)
                .await?;

        let (payload,) = payload.ok_or_else(|| StoreError::NotFound {
            entity: "target",
            id: target_id.to_string(),
        })?;
        Ok(serde_json::from_value(payload)?)
    }
}
