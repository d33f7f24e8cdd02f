//! Weighted pipeline manager: ordering, delays, resume and short-circuit on
//! permanent failure.

mod common;

use common::{wait_for_state, wait_until, Fixture, Outcome, RecordingFailureHandler, ScriptedStep};
use kcp_engine::config::ManagerConfig;
use kcp_engine::models::{Instance, OperationKind};
use kcp_engine::orchestration::{
    OperationProcessor, OperationQueue, Pipeline, PipelineManager, ProcessingResult,
    TIMEOUT_MESSAGE,
};
use kcp_engine::store::OperationStore;
use kcp_engine::OperationState;
use std::sync::Arc;
use std::time::{Duration, Instant};

const RETRY: Duration = Duration::from_millis(10);

fn manager(
    fixture: &Fixture,
    pipeline: Pipeline<Instance>,
    handler: Arc<RecordingFailureHandler>,
) -> PipelineManager<Instance> {
    PipelineManager::new(
        OperationKind::Upgrade,
        Arc::new(pipeline),
        fixture.operations.clone(),
        fixture.targets.clone(),
        handler,
        &ManagerConfig {
            retry_delay_ms: RETRY.as_millis() as u64,
            speed_factor: 1,
        },
    )
}

struct ThreeSteps {
    init: Arc<ScriptedStep>,
    first: Arc<ScriptedStep>,
    second: Arc<ScriptedStep>,
    third: Arc<ScriptedStep>,
}

impl ThreeSteps {
    fn new(second: ScriptedStep) -> Self {
        Self {
            init: ScriptedStep::new("init", Outcome::Finish).shared(),
            first: ScriptedStep::new("first", Outcome::Finish).shared(),
            second: second.shared(),
            third: ScriptedStep::new("third", Outcome::Finish).shared(),
        }
    }

    fn pipeline(&self) -> Pipeline<Instance> {
        // registered out of order; weights decide
        Pipeline::<Instance>::builder_shared(self.init.clone())
            .shared_step(3, self.third.clone(), true)
            .shared_step(1, self.first.clone(), true)
            .shared_step(2, self.second.clone(), true)
            .build()
            .unwrap()
    }
}

#[tokio::test]
async fn test_delay_stops_run_without_advancing() {
    let fixture = Fixture::new();
    let steps = ThreeSteps::new(
        ScriptedStep::new("second", Outcome::Finish).then(Outcome::Wait(Duration::from_millis(10))),
    );
    let handler = Arc::new(RecordingFailureHandler::new());
    let manager = manager(&fixture, steps.pipeline(), handler.clone());
    let operation = fixture.insert(OperationKind::Upgrade, "init").await;

    let first_run = manager.process(&operation.id).await;
    assert_eq!(first_run, ProcessingResult::requeue_after(Duration::from_millis(10)));
    let stored = fixture.get(&operation.id).await;
    assert_eq!(stored.stage.as_str(), "second");
    assert_eq!(stored.state, OperationState::InProgress);
    assert_eq!(steps.third.calls(), 0);

    let second_run = manager.process(&operation.id).await;
    assert_eq!(second_run, ProcessingResult::done());
    let stored = fixture.get(&operation.id).await;
    assert_eq!(stored.state, OperationState::Succeeded);
    assert!(stored.stage.is_finished());

    assert_eq!(steps.init.calls(), 2, "init runs on every invocation");
    assert_eq!(steps.first.calls(), 1, "completed steps are not repeated");
    assert_eq!(steps.second.calls(), 2);
    assert_eq!(steps.third.calls(), 1);
    assert_eq!(handler.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_reinvokes_after_step_delay() {
    let fixture = Fixture::new();
    let steps = ThreeSteps::new(
        ScriptedStep::new("second", Outcome::Finish).then(Outcome::Wait(Duration::from_millis(10))),
    );
    let manager = Arc::new(manager(
        &fixture,
        steps.pipeline(),
        Arc::new(RecordingFailureHandler::new()),
    ));
    let queue = OperationQueue::new("upgrade", manager);
    queue.run(2).unwrap();

    let operation = fixture.insert(OperationKind::Upgrade, "init").await;
    let started = Instant::now();
    queue.add(operation.id.clone());

    let finished = wait_for_state(
        fixture.operations.as_ref(),
        &operation.id,
        OperationState::Succeeded,
        Duration::from_secs(5),
    )
    .await;

    assert!(started.elapsed() >= Duration::from_millis(10));
    assert!(finished.stage.is_finished());
    assert_eq!(steps.third.calls(), 1);
    assert_eq!(steps.second.calls(), 2);

    wait_until(Duration::from_secs(1), || queue.statistics().finished == 1).await;
    let stats = queue.statistics();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.finished, 1);
    queue.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_disabled_step_never_runs() {
    let fixture = Fixture::new();
    let init = ScriptedStep::new("init", Outcome::Finish).shared();
    let enabled = ScriptedStep::new("enabled", Outcome::Finish).shared();
    let disabled = ScriptedStep::new("disabled", Outcome::NonRecoverable("must not run")).shared();
    let pipeline = Pipeline::<Instance>::builder_shared(init)
        .shared_step(1, disabled.clone(), false)
        .shared_step(2, enabled.clone(), true)
        .build()
        .unwrap();
    let handler = Arc::new(RecordingFailureHandler::new());
    let manager = manager(&fixture, pipeline, handler.clone());
    let operation = fixture.insert(OperationKind::Upgrade, "init").await;

    assert_eq!(manager.process(&operation.id).await, ProcessingResult::done());
    assert_eq!(fixture.get(&operation.id).await.state, OperationState::Succeeded);
    assert_eq!(disabled.calls(), 0);
    assert_eq!(enabled.calls(), 1);
    assert_eq!(handler.call_count(), 0);
}

#[tokio::test]
async fn test_non_recoverable_error_short_circuits_pipeline() {
    let fixture = Fixture::new();
    let steps = ThreeSteps::new(ScriptedStep::new("second", Outcome::NonRecoverable("cluster gone")));
    let handler = Arc::new(RecordingFailureHandler::new());
    let manager = manager(&fixture, steps.pipeline(), handler.clone());
    let operation = fixture.insert(OperationKind::Upgrade, "init").await;

    assert_eq!(manager.process(&operation.id).await, ProcessingResult::done());

    let stored = fixture.get(&operation.id).await;
    assert_eq!(stored.state, OperationState::Failed);
    assert_eq!(stored.stage.as_str(), "second");
    assert_eq!(stored.message, "cluster gone");
    assert_eq!(steps.third.calls(), 0);
    assert_eq!(handler.call_count(), 1);
}

#[tokio::test]
async fn test_recoverable_error_retries_current_step() {
    let fixture = Fixture::new();
    let steps = ThreeSteps::new(
        ScriptedStep::new("second", Outcome::Finish).then(Outcome::Recoverable("timeout talking to provisioner")),
    );
    let manager = manager(
        &fixture,
        steps.pipeline(),
        Arc::new(RecordingFailureHandler::new()),
    );
    let operation = fixture.insert(OperationKind::Upgrade, "init").await;

    assert_eq!(
        manager.process(&operation.id).await,
        ProcessingResult::requeue_after(RETRY)
    );
    let stored = fixture.get(&operation.id).await;
    assert_eq!(stored.stage.as_str(), "second");
    assert!(stored.last_error.is_some());

    assert_eq!(manager.process(&operation.id).await, ProcessingResult::done());
    assert_eq!(steps.first.calls(), 1);
    assert_eq!(steps.third.calls(), 1);
}

#[tokio::test]
async fn test_resume_skips_completed_steps() {
    let fixture = Fixture::new();
    let steps = ThreeSteps::new(ScriptedStep::new("second", Outcome::Finish));
    let manager = manager(
        &fixture,
        steps.pipeline(),
        Arc::new(RecordingFailureHandler::new()),
    );
    // as left behind by a process that crashed while running the third step
    let operation = fixture.insert(OperationKind::Upgrade, "third").await;
    fixture
        .operations
        .update_operation_state(
            &operation.id,
            "Processing stage third",
            OperationState::InProgress,
            chrono::Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(manager.process(&operation.id).await, ProcessingResult::done());
    assert_eq!(steps.first.calls(), 0);
    assert_eq!(steps.second.calls(), 0);
    assert_eq!(steps.third.calls(), 1);
    assert_eq!(fixture.get(&operation.id).await.state, OperationState::Succeeded);
}

#[tokio::test]
async fn test_stage_timeout_fails_before_running_steps() {
    let fixture = Fixture::new();
    let steps = ThreeSteps::new(
        ScriptedStep::new("second", Outcome::Finish).with_time_limit(Duration::ZERO),
    );
    let handler = Arc::new(RecordingFailureHandler::new());
    let manager = manager(&fixture, steps.pipeline(), handler.clone());
    let operation = fixture.insert(OperationKind::Upgrade, "second").await;

    assert_eq!(manager.process(&operation.id).await, ProcessingResult::done());

    let stored = fixture.get(&operation.id).await;
    assert_eq!(stored.state, OperationState::Failed);
    assert_eq!(stored.message, TIMEOUT_MESSAGE);
    assert_eq!(steps.init.calls(), 0);
    assert_eq!(steps.second.calls(), 0);
    assert_eq!(handler.call_count(), 1);
}

#[tokio::test]
async fn test_speed_up_scales_reported_delays() {
    let fixture = Fixture::new();
    let steps = ThreeSteps::new(
        ScriptedStep::new("second", Outcome::Finish).then(Outcome::Wait(Duration::from_secs(60))),
    );
    let manager = manager(
        &fixture,
        steps.pipeline(),
        Arc::new(RecordingFailureHandler::new()),
    );
    manager.speed_up(60);
    let operation = fixture.insert(OperationKind::Upgrade, "init").await;

    assert_eq!(
        manager.process(&operation.id).await,
        ProcessingResult::requeue_after(Duration::from_secs(1))
    );
    assert_eq!(
        fixture.get(&operation.id).await.requeue_delay,
        Some(Duration::from_secs(60)),
        "the persisted delay is the unscaled one"
    );
}

#[tokio::test]
async fn test_init_step_delay_postpones_pipeline() {
    let fixture = Fixture::new();
    let init = ScriptedStep::new("init", Outcome::Finish)
        .then(Outcome::Wait(Duration::from_millis(5)))
        .shared();
    let only = ScriptedStep::new("only", Outcome::Finish).shared();
    let pipeline = Pipeline::<Instance>::builder_shared(init.clone())
        .shared_step(1, only.clone(), true)
        .build()
        .unwrap();
    let manager = manager(&fixture, pipeline, Arc::new(RecordingFailureHandler::new()));
    let operation = fixture.insert(OperationKind::Upgrade, "init").await;

    assert_eq!(
        manager.process(&operation.id).await,
        ProcessingResult::requeue_after(Duration::from_millis(5))
    );
    assert_eq!(fixture.get(&operation.id).await.stage.as_str(), "init");
    assert_eq!(only.calls(), 0);

    assert_eq!(manager.process(&operation.id).await, ProcessingResult::done());
    assert_eq!(only.calls(), 1);
}
