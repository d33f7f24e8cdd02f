//! Shared types of the step contract and the driver/queue boundary.

use crate::models::{Operation, OperationId, Stage};
use crate::orchestration::error_classifier::StepError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Outcome of a successful step run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    /// Stage to run next; [`Stage::FINISHED`] completes the operation
    pub stage: Stage,
    /// Wait before running `stage`
    pub delay: Duration,
}

impl StageResult {
    pub fn new(stage: Stage, delay: Duration) -> Self {
        Self { stage, delay }
    }

    /// Move to `stage` immediately.
    ///
    /// Returning the current stage this way does not spin: the executor waits
    /// its retry delay before running the stage again.
    pub fn proceed(stage: Stage) -> Self {
        Self::new(stage, Duration::ZERO)
    }

    /// Same as [`StageResult::new`]; names the intent of polling `stage` again
    /// after `delay`
    pub fn retry_after(stage: Stage, delay: Duration) -> Self {
        Self::new(stage, delay)
    }

    /// No more steps
    pub fn finished() -> Self {
        Self::proceed(Stage::FINISHED)
    }
}

/// Outcome of one driver invocation, handed back to the queue. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingResult {
    pub requeue: bool,
    pub delay: Duration,
}

impl ProcessingResult {
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: true,
            delay,
        }
    }

    pub fn done() -> Self {
        Self {
            requeue: false,
            delay: Duration::ZERO,
        }
    }
}

/// A unit of pipeline work.
///
/// `run` must tolerate being invoked again with the same pre-state: a crash
/// between the step succeeding and its new stage being persisted re-runs it.
/// Steps log through `tracing`; the driver runs them inside a span carrying the
/// operation id, kind and stage.
#[async_trait]
pub trait Step<T>: Send + Sync {
    /// Stage this step is bound to
    fn name(&self) -> Stage;

    /// How long the operation may stay in this stage without progress
    fn time_limit(&self) -> Duration;

    async fn run(&self, target: &T, operation: &Operation) -> Result<StageResult, StepError>;
}

/// Driver invoked by a queue worker for one operation id
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    async fn process(&self, operation_id: &OperationId) -> ProcessingResult;
}

/// Divisor applied to wall-clock delays; lets tests run multi-minute polling
/// logic quickly without changing ordering or retry decisions.
#[derive(Debug)]
pub struct SpeedFactor(AtomicU32);

impl SpeedFactor {
    pub fn new(factor: u32) -> Self {
        Self(AtomicU32::new(factor.max(1)))
    }

    /// Factors below 1 are clamped to 1
    pub fn set(&self, factor: u32) {
        self.0.store(factor.max(1), Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn scale(&self, delay: Duration) -> Duration {
        delay / self.get()
    }
}

impl Default for SpeedFactor {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_result_constructors() {
        let next = StageResult::proceed(Stage::from_static("wait"));
        assert_eq!(next.delay, Duration::ZERO);

        let poll = StageResult::retry_after(Stage::from_static("wait"), Duration::from_secs(30));
        assert_eq!(poll.delay, Duration::from_secs(30));

        assert!(StageResult::finished().stage.is_finished());
    }

    #[test]
    fn test_speed_factor_scales_delays() {
        let factor = SpeedFactor::default();
        assert_eq!(factor.scale(Duration::from_secs(60)), Duration::from_secs(60));

        factor.set(60);
        assert_eq!(factor.scale(Duration::from_secs(60)), Duration::from_secs(1));

        factor.set(0);
        assert_eq!(factor.get(), 1);
    }
}
