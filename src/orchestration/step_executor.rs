//! # Stage Executor
//!
//! Single-stage driver: each invocation loads the operation, looks up the step
//! registered for its current stage, runs that one step and persists the outcome.
//! Multi-stage progress happens across invocations, with the queue re-delivering
//! the operation after the delay the step asked for.
//!
//! ## Invocation
//!
//! 1. Load the operation and its target (store errors requeue after the retry delay)
//! 2. Terminal operations are done; pending ones move to in progress
//! 3. Resolve the step for the current stage; an unknown stage fails the operation
//! 4. Fail with a timeout if the stage has been current for longer than the step allows
//! 5. Run the step and classify its result
//!
//! A step's time limit covers the whole stage across retries. A single run that
//! overruns it is logged, not preempted; the next invocation observes the timeout.

use crate::config::ExecutorConfig;
use crate::models::{Operation, OperationId, OperationKind};
use crate::orchestration::failure::FailureHandler;
use crate::orchestration::lifecycle::{stage_timed_out, OperationLifecycle};
use crate::orchestration::registry::StageRegistry;
use crate::orchestration::types::{OperationProcessor, ProcessingResult, StageResult};
use crate::store::{OperationStore, TargetStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn, Span};

pub struct StageExecutor<T> {
    kind: OperationKind,
    registry: Arc<StageRegistry<T>>,
    lifecycle: OperationLifecycle<T>,
    retry_delay: Duration,
}

impl<T: Send + Sync + 'static> StageExecutor<T> {
    pub fn new(
        kind: OperationKind,
        registry: Arc<StageRegistry<T>>,
        store: Arc<dyn OperationStore>,
        targets: Arc<dyn TargetStore<T>>,
        failure_handler: Arc<dyn FailureHandler<T>>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            kind,
            registry,
            lifecycle: OperationLifecycle::new(store, targets, failure_handler),
            retry_delay: config.retry_delay(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn registry(&self) -> &StageRegistry<T> {
        &self.registry
    }

    /// Delay applied after recoverable step errors and store errors
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> OperationProcessor for StageExecutor<T> {
    #[instrument(
        name = "stage_executor",
        skip(self, operation_id),
        fields(operation_id = %operation_id, kind = %self.kind, stage = tracing::field::Empty)
    )]
    async fn process(&self, operation_id: &OperationId) -> ProcessingResult {
        let mut operation = match self.lifecycle.load(operation_id, self.retry_delay).await {
            Ok(operation) => operation,
            Err(result) => return result,
        };
        Span::current().record("stage", operation.stage.as_str());

        if operation.kind != self.kind {
            error!(
                operation_kind = %operation.kind,
                "Operation delivered to the executor of another kind, dropping it"
            );
            return ProcessingResult::done();
        }

        if operation.state.is_terminal() {
            debug!(state = %operation.state, "Operation already terminal");
            return ProcessingResult::done();
        }

        let target = match self.lifecycle.load_target(&operation, self.retry_delay).await {
            Ok(target) => target,
            Err(result) => return result,
        };

        if let Err(e) = self.lifecycle.begin(&mut operation).await {
            return self
                .lifecycle
                .store_failure(&operation, e, self.retry_delay);
        }

        if operation.stage.is_finished() {
            return self
                .lifecycle
                .complete(&mut operation, self.retry_delay)
                .await;
        }

        let Some(step) = self.registry.get(&operation.stage).cloned() else {
            let stage = operation.stage.clone();
            warn!(stage = %stage, "No step registered for stage");
            return self
                .lifecycle
                .reject_stage(&mut operation, &target, &stage, self.retry_delay)
                .await;
        };

        let time_limit = step.time_limit();
        if stage_timed_out(&operation, time_limit) {
            return self
                .lifecycle
                .time_out(&mut operation, &target, time_limit, self.retry_delay)
                .await;
        }

        let started = Instant::now();
        let outcome = step.run(&target, &operation).await;
        let elapsed = started.elapsed();
        if elapsed > time_limit {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                time_limit_ms = time_limit.as_millis() as u64,
                "Step run exceeded its time limit"
            );
        }

        match outcome {
            Ok(result) => self.apply(operation, &target, result).await,
            Err(e) if e.is_recoverable() => {
                self.lifecycle
                    .retry(&operation, &e, self.retry_delay)
                    .await
            }
            Err(e) => {
                self.lifecycle
                    .abort(&mut operation, &target, &e, self.retry_delay)
                    .await
            }
        }
    }
}

impl<T: Send + Sync + 'static> StageExecutor<T> {
    async fn apply(
        &self,
        mut operation: Operation,
        target: &T,
        result: StageResult,
    ) -> ProcessingResult {
        if !self.registry.is_valid_stage(&result.stage) {
            warn!(next_stage = %result.stage, "Step returned a stage with no registered step");
            return self
                .lifecycle
                .reject_stage(&mut operation, target, &result.stage, self.retry_delay)
                .await;
        }

        let delay = if result.stage == operation.stage && result.delay.is_zero() {
            debug!(
                stage = %operation.stage,
                "Step stayed at its stage without a delay, waiting the retry delay"
            );
            self.retry_delay
        } else {
            result.delay
        };

        if result.stage != operation.stage {
            if let Err(e) = self.lifecycle.advance(&mut operation, &result.stage).await {
                return self
                    .lifecycle
                    .store_failure(&operation, e, self.retry_delay);
            }
        }

        if operation.stage.is_finished() {
            return self
                .lifecycle
                .complete(&mut operation, self.retry_delay)
                .await;
        }

        self.lifecycle.remember_delay(&operation, delay).await;
        debug!(
            next_stage = %operation.stage,
            delay_ms = delay.as_millis() as u64,
            "Step completed, requeueing"
        );
        ProcessingResult::requeue_after(delay)
    }
}
