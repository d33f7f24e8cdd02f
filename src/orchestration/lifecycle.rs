//! # Operation Lifecycle
//!
//! The persistence and classification half of both drivers. The executor and the
//! pipeline manager decide *which* step runs; this module decides what a step's
//! outcome means for the stored operation: advancing the stage, recording a
//! retryable error, completing, or failing permanently and invoking the failure
//! handler exactly once.
//!
//! Store errors are treated as recoverable throughout: the invocation reports a
//! requeue and the next attempt starts again from the persisted record. A write
//! rejected because the operation already finished ends the invocation.

use crate::logging::{log_operation_event, OperationEvent};
use crate::models::{LastError, Operation, OperationId, OperationState, Stage};
use crate::orchestration::error_classifier::StepError;
use crate::orchestration::failure::FailureHandler;
use crate::orchestration::types::ProcessingResult;
use crate::store::{OperationStore, StoreError, StoreResult, TargetStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Message persisted when a stage runs out of time
pub const TIMEOUT_MESSAGE: &str = "timeout while processing operation";

pub(crate) struct OperationLifecycle<T> {
    store: Arc<dyn OperationStore>,
    targets: Arc<dyn TargetStore<T>>,
    failure_handler: Arc<dyn FailureHandler<T>>,
}

impl<T> Clone for OperationLifecycle<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            targets: Arc::clone(&self.targets),
            failure_handler: Arc::clone(&self.failure_handler),
        }
    }
}

impl<T: Send + Sync + 'static> OperationLifecycle<T> {
    pub(crate) fn new(
        store: Arc<dyn OperationStore>,
        targets: Arc<dyn TargetStore<T>>,
        failure_handler: Arc<dyn FailureHandler<T>>,
    ) -> Self {
        Self {
            store,
            targets,
            failure_handler,
        }
    }

    /// Load the operation. A missing operation cannot make progress and is
    /// dropped; every other store error asks for a retry.
    pub(crate) async fn load(
        &self,
        id: &OperationId,
        retry_delay: Duration,
    ) -> Result<Operation, ProcessingResult> {
        match self.store.get_operation(id).await {
            Ok(operation) => Ok(operation),
            Err(e) if e.is_not_found() => {
                warn!(operation_id = %id, "Operation not found, dropping it from the queue");
                Err(ProcessingResult::done())
            }
            Err(e) => {
                warn!(operation_id = %id, error = %e, "Unable to load operation, will retry");
                Err(ProcessingResult::requeue_after(retry_delay))
            }
        }
    }

    /// Load the record the operation acts on
    pub(crate) async fn load_target(
        &self,
        operation: &Operation,
        retry_delay: Duration,
    ) -> Result<T, ProcessingResult> {
        self.targets
            .get_target(&operation.target_id)
            .await
            .map_err(|e| {
                warn!(
                    operation_id = %operation.id,
                    target_id = %operation.target_id,
                    error = %e,
                    "Unable to load target record, will retry"
                );
                ProcessingResult::requeue_after(retry_delay)
            })
    }

    /// Pending -> InProgress on the first invocation
    pub(crate) async fn begin(&self, operation: &mut Operation) -> StoreResult<()> {
        if operation.state != OperationState::Pending {
            return Ok(());
        }
        let message = format!("Operation started at stage {}", operation.stage);
        self.store
            .update_operation_state(&operation.id, &message, OperationState::InProgress, Utc::now())
            .await?;
        operation.state = OperationState::InProgress;
        operation.message = message;
        Ok(())
    }

    /// Move to `stage` and restart the stage clock
    pub(crate) async fn advance(&self, operation: &mut Operation, stage: &Stage) -> StoreResult<()> {
        let now = Utc::now();
        let message = if stage.is_finished() {
            "All stages completed".to_string()
        } else {
            format!("Processing stage {stage}")
        };
        self.store
            .transition_operation(&operation.id, &message, stage, now)
            .await?;

        debug!(operation_id = %operation.id, from = %operation.stage, to = %stage, "Stage transition");
        operation.stage = stage.clone();
        operation.message = message;
        operation.last_transition_time = now;
        Ok(())
    }

    /// Mark the operation succeeded; the stage must already be finished or is moved there
    pub(crate) async fn complete(
        &self,
        operation: &mut Operation,
        retry_delay: Duration,
    ) -> ProcessingResult {
        if !operation.stage.is_finished() {
            if let Err(e) = self.advance(operation, &Stage::FINISHED).await {
                return self.store_failure(operation, e, retry_delay);
            }
        }

        match self
            .store
            .update_operation_state(
                &operation.id,
                "Operation succeeded",
                OperationState::Succeeded,
                Utc::now(),
            )
            .await
        {
            Ok(()) => {
                operation.state = OperationState::Succeeded;
                log_operation_event(
                    &operation.id,
                    operation.kind,
                    &operation.stage,
                    OperationEvent::Succeeded,
                    None,
                );
                ProcessingResult::done()
            }
            Err(e) => self.store_failure(operation, e, retry_delay),
        }
    }

    /// Record a recoverable step error and retry the same stage after `delay`.
    /// The stage clock is left running.
    pub(crate) async fn retry(
        &self,
        operation: &Operation,
        step_error: &StepError,
        delay: Duration,
    ) -> ProcessingResult {
        warn!(
            operation_id = %operation.id,
            stage = %operation.stage,
            error = %format!("{:#}", step_error.inner()),
            retry_in_ms = delay.as_millis() as u64,
            "Recoverable step error, retrying stage"
        );

        if let Err(e) = self
            .store
            .update_operation_last_error(&operation.id, &step_error.to_last_error())
            .await
        {
            warn!(operation_id = %operation.id, error = %e, "Unable to persist last error");
        }
        self.remember_delay(operation, delay).await;
        ProcessingResult::requeue_after(delay)
    }

    /// Persist the delay the driver asked for; failures only cost restart accuracy
    pub(crate) async fn remember_delay(&self, operation: &Operation, delay: Duration) {
        let delay = (!delay.is_zero()).then_some(delay);
        if operation.requeue_delay == delay {
            return;
        }
        if let Err(e) = self.store.update_requeue_delay(&operation.id, delay).await {
            warn!(operation_id = %operation.id, error = %e, "Unable to persist requeue delay");
        }
    }

    /// Permanently fail the operation and run the failure handler once.
    ///
    /// The handler only runs after `failed` is persisted. If persisting fails the
    /// invocation is retried; if the operation is already terminal another
    /// invocation got there first and nothing else happens.
    pub(crate) async fn fail(
        &self,
        operation: &mut Operation,
        target: &T,
        last_error: LastError,
        event: OperationEvent,
        retry_delay: Duration,
    ) -> ProcessingResult {
        if let Err(e) = self
            .store
            .update_operation_last_error(&operation.id, &last_error)
            .await
        {
            warn!(operation_id = %operation.id, error = %e, "Unable to persist last error");
        }

        let result = self
            .store
            .update_operation_state(
                &operation.id,
                &last_error.message,
                OperationState::Failed,
                Utc::now(),
            )
            .await;

        match result {
            Ok(()) => {}
            Err(e) if e.is_terminal_conflict() => {
                warn!(operation_id = %operation.id, error = %e, "Operation already terminal");
                return ProcessingResult::done();
            }
            Err(e) => return self.store_failure(operation, e, retry_delay),
        }

        operation.state = OperationState::Failed;
        operation.message = last_error.message.clone();
        operation.last_error = Some(last_error);

        log_operation_event(
            &operation.id,
            operation.kind,
            &operation.stage,
            event,
            Some(&operation.message),
        );

        if let Err(e) = self
            .failure_handler
            .handle_failure(operation, target)
            .await
        {
            error!(
                operation_id = %operation.id,
                handler = self.failure_handler.handler_name(),
                error = %format!("{e:#}"),
                "Failure handler returned an error"
            );
        }

        ProcessingResult::done()
    }

    /// Non-recoverable step error
    pub(crate) async fn abort(
        &self,
        operation: &mut Operation,
        target: &T,
        step_error: &StepError,
        retry_delay: Duration,
    ) -> ProcessingResult {
        error!(
            operation_id = %operation.id,
            stage = %operation.stage,
            error = %format!("{:#}", step_error.inner()),
            "Non-recoverable step error, aborting operation"
        );
        self.fail(
            operation,
            target,
            step_error.to_last_error(),
            OperationEvent::Failed,
            retry_delay,
        )
        .await
    }

    /// Stage exceeded its time limit without progress
    pub(crate) async fn time_out(
        &self,
        operation: &mut Operation,
        target: &T,
        time_limit: Duration,
        retry_delay: Duration,
    ) -> ProcessingResult {
        error!(
            operation_id = %operation.id,
            stage = %operation.stage,
            time_limit_ms = time_limit.as_millis() as u64,
            "Stage exceeded its time limit"
        );
        let last_error = LastError::new(TIMEOUT_MESSAGE)
            .with_reason("timeout")
            .with_component(operation.stage.to_string());
        self.fail(
            operation,
            target,
            last_error,
            OperationEvent::TimedOut,
            retry_delay,
        )
        .await
    }

    /// Stage persisted or returned that no step is registered for
    pub(crate) async fn reject_stage(
        &self,
        operation: &mut Operation,
        target: &T,
        stage: &Stage,
        retry_delay: Duration,
    ) -> ProcessingResult {
        let last_error = LastError::new(format!(
            "stage '{stage}' is not valid for {} operations",
            operation.kind
        ))
        .with_reason("invalid_stage");
        self.fail(
            operation,
            target,
            last_error,
            OperationEvent::Failed,
            retry_delay,
        )
        .await
    }

    pub(crate) fn store_failure(
        &self,
        operation: &Operation,
        error: StoreError,
        retry_delay: Duration,
    ) -> ProcessingResult {
        if error.is_terminal_conflict() {
            warn!(operation_id = %operation.id, error = %error, "Operation already terminal");
            return ProcessingResult::done();
        }
        warn!(
            operation_id = %operation.id,
            error = %error,
            "Store error while processing operation, will retry"
        );
        ProcessingResult::requeue_after(retry_delay)
    }
}

/// The stage's budget is spent once the time since its last transition reaches the limit
pub(crate) fn stage_timed_out(operation: &Operation, time_limit: Duration) -> bool {
    operation.time_in_stage(Utc::now()) >= time_limit
}
