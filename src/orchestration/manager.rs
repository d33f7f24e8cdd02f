//! # Pipeline Manager
//!
//! Multi-step driver: each invocation runs the initialisation step and then the
//! pipeline's steps in weight order, starting from the step the operation last
//! reached. Progress is persisted as the operation's stage after every step, so a
//! restarted process resumes at the first step that has not completed.
//!
//! A step returning a non-zero delay ends the invocation without advancing; the
//! same step runs again when the queue re-delivers the operation. Delays reported
//! to the queue are divided by the manager's speed factor.

use crate::config::ManagerConfig;
use crate::models::{Operation, OperationId, OperationKind, Stage};
use crate::orchestration::error_classifier::StepError;
use crate::orchestration::failure::FailureHandler;
use crate::orchestration::lifecycle::{stage_timed_out, OperationLifecycle};
use crate::orchestration::pipeline::Pipeline;
use crate::orchestration::types::{
    OperationProcessor, ProcessingResult, SpeedFactor, StageResult, Step,
};
use crate::store::{OperationStore, TargetStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn, Span};

pub struct PipelineManager<T> {
    kind: OperationKind,
    pipeline: Arc<Pipeline<T>>,
    lifecycle: OperationLifecycle<T>,
    retry_delay: Duration,
    speed_factor: SpeedFactor,
}

impl<T: Send + Sync + 'static> PipelineManager<T> {
    pub fn new(
        kind: OperationKind,
        pipeline: Arc<Pipeline<T>>,
        store: Arc<dyn OperationStore>,
        targets: Arc<dyn TargetStore<T>>,
        failure_handler: Arc<dyn FailureHandler<T>>,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            kind,
            pipeline,
            lifecycle: OperationLifecycle::new(store, targets, failure_handler),
            retry_delay: config.retry_delay(),
            speed_factor: SpeedFactor::new(config.speed_factor),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn pipeline(&self) -> &Pipeline<T> {
        &self.pipeline
    }

    /// Divide every delay reported to the queue by `factor`
    pub fn speed_up(&self, factor: u32) {
        info!(kind = %self.kind, factor, "Pipeline manager speed factor changed");
        self.speed_factor.set(factor);
    }

    pub fn speed_factor(&self) -> u32 {
        self.speed_factor.get()
    }

    fn requeue_after(&self, delay: Duration) -> ProcessingResult {
        ProcessingResult::requeue_after(self.speed_factor.scale(delay))
    }

    async fn run_step(
        &self,
        step: &Arc<dyn Step<T>>,
        target: &T,
        operation: &Operation,
    ) -> Result<StageResult, StepError> {
        let name = step.name();
        let time_limit = step.time_limit();
        debug!(step = %name, "Running pipeline step");

        let started = Instant::now();
        let outcome = step.run(target, operation).await;
        let elapsed = started.elapsed();
        if elapsed > time_limit {
            warn!(
                step = %name,
                elapsed_ms = elapsed.as_millis() as u64,
                time_limit_ms = time_limit.as_millis() as u64,
                "Step run exceeded its time limit"
            );
        }
        outcome
    }

    /// Outcome of a step error: the run stops either way
    async fn handle_error(
        &self,
        operation: &mut Operation,
        target: &T,
        step_error: StepError,
    ) -> ProcessingResult {
        if step_error.is_recoverable() {
            let result = self
                .lifecycle
                .retry(operation, &step_error, self.retry_delay)
                .await;
            return self.requeue_after(result.delay);
        }
        self.lifecycle
            .abort(operation, target, &step_error, self.retry_delay)
            .await
    }

    async fn postpone(&self, operation: &Operation, step: &Stage, delay: Duration) -> ProcessingResult {
        debug!(
            step = %step,
            delay_ms = delay.as_millis() as u64,
            "Step asked to be retried later"
        );
        self.lifecycle.remember_delay(operation, delay).await;
        self.requeue_after(delay)
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> OperationProcessor for PipelineManager<T> {
    #[instrument(
        name = "pipeline_manager",
        skip(self, operation_id),
        fields(operation_id = %operation_id, kind = %self.kind, stage = tracing::field::Empty)
    )]
    async fn process(&self, operation_id: &OperationId) -> ProcessingResult {
        let mut operation = match self.lifecycle.load(operation_id, self.retry_delay).await {
            Ok(operation) => operation,
            Err(result) => return self.requeue_scaled(result),
        };
        Span::current().record("stage", operation.stage.as_str());

        if operation.kind != self.kind {
            error!(
                operation_kind = %operation.kind,
                "Operation delivered to the manager of another kind, dropping it"
            );
            return ProcessingResult::done();
        }

        if operation.state.is_terminal() {
            debug!(state = %operation.state, "Operation already terminal");
            return ProcessingResult::done();
        }

        let target = match self.lifecycle.load_target(&operation, self.retry_delay).await {
            Ok(target) => target,
            Err(result) => return self.requeue_scaled(result),
        };

        if let Err(e) = self.lifecycle.begin(&mut operation).await {
            let result = self
                .lifecycle
                .store_failure(&operation, e, self.retry_delay);
            return self.requeue_scaled(result);
        }

        if operation.stage.is_finished() {
            let result = self
                .lifecycle
                .complete(&mut operation, self.retry_delay)
                .await;
            return self.requeue_scaled(result);
        }

        let Some(start) = self.pipeline.position(&operation.stage) else {
            let stage = operation.stage.clone();
            warn!(stage = %stage, "Stage is not part of the pipeline");
            return self
                .lifecycle
                .reject_stage(&mut operation, &target, &stage, self.retry_delay)
                .await;
        };

        let init = self.pipeline.init_step();
        let at_init = operation.stage == init.name();
        let current = if at_init {
            init
        } else {
            &self.pipeline.steps()[start].step
        };
        let time_limit = current.time_limit();
        if stage_timed_out(&operation, time_limit) {
            return self
                .lifecycle
                .time_out(&mut operation, &target, time_limit, self.retry_delay)
                .await;
        }

        match self.run_step(init, &target, &operation).await {
            Ok(result) if !result.delay.is_zero() => {
                return self.postpone(&operation, &init.name(), result.delay).await;
            }
            Ok(_) => {}
            Err(e) => return self.handle_error(&mut operation, &target, e).await,
        }

        if at_init {
            let next = self
                .pipeline
                .steps()
                .first()
                .map(|ws| ws.step.name())
                .unwrap_or(Stage::FINISHED);
            if next.is_finished() {
                let result = self
                    .lifecycle
                    .complete(&mut operation, self.retry_delay)
                    .await;
                return self.requeue_scaled(result);
            }
            if let Err(e) = self.lifecycle.advance(&mut operation, &next).await {
                let result = self
                    .lifecycle
                    .store_failure(&operation, e, self.retry_delay);
                return self.requeue_scaled(result);
            }
        }

        for (index, weighted) in self.pipeline.steps().iter().enumerate().skip(start) {
            Span::current().record("stage", operation.stage.as_str());

            match self.run_step(&weighted.step, &target, &operation).await {
                Ok(result) if !result.delay.is_zero() => {
                    return self
                        .postpone(&operation, &weighted.step.name(), result.delay)
                        .await;
                }
                Ok(_) => {}
                Err(e) => return self.handle_error(&mut operation, &target, e).await,
            }

            let next = self.pipeline.stage_after(index);
            if next.is_finished() {
                break;
            }
            if let Err(e) = self.lifecycle.advance(&mut operation, &next).await {
                let result = self
                    .lifecycle
                    .store_failure(&operation, e, self.retry_delay);
                return self.requeue_scaled(result);
            }
        }

        let result = self
            .lifecycle
            .complete(&mut operation, self.retry_delay)
            .await;
        self.requeue_scaled(result)
    }
}

impl<T: Send + Sync + 'static> PipelineManager<T> {
    fn requeue_scaled(&self, result: ProcessingResult) -> ProcessingResult {
        if result.requeue {
            self.requeue_after(result.delay)
        } else {
            result
        }
    }
}
