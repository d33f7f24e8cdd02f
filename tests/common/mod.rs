//! Shared fixtures for the integration tests: scripted steps, a recording failure
//! handler, in-memory store setup and polling helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use kcp_engine::models::{Instance, Operation, OperationId, OperationKind, Stage};
use kcp_engine::orchestration::{FailureHandler, StageResult, Step, StepError};
use kcp_engine::store::{InMemoryOperationStore, InMemoryTargetStore, OperationStore};
use kcp_engine::OperationState;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const INSTANCE_ID: &str = "instance-1";

/// What a scripted step does on one run
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Move to the named stage
    Proceed(&'static str),
    Finish,
    /// Stay at the current stage and come back after the delay
    Wait(Duration),
    Recoverable(&'static str),
    NonRecoverable(&'static str),
}

/// Step that plays back a script, then repeats a fallback outcome forever
pub struct ScriptedStep {
    name: &'static str,
    time_limit: Duration,
    run_time: Duration,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedStep {
    pub fn new(name: &'static str, fallback: Outcome) -> Self {
        Self {
            name,
            time_limit: Duration::from_secs(60),
            run_time: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Queue an outcome to play before the fallback
    pub fn then(self, outcome: Outcome) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    /// Make every run take `run_time`
    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent runs observed
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step<Instance> for ScriptedStep {
    fn name(&self) -> Stage {
        Stage::from_static(self.name)
    }

    fn time_limit(&self) -> Duration {
        self.time_limit
    }

    async fn run(&self, _target: &Instance, operation: &Operation) -> Result<StageResult, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.run_time.is_zero() {
            tokio::time::sleep(self.run_time).await;
        }
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.active.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Outcome::Proceed(stage) => Ok(StageResult::proceed(Stage::from_static(stage))),
            Outcome::Finish => Ok(StageResult::finished()),
            Outcome::Wait(delay) => Ok(StageResult::retry_after(operation.stage.clone(), delay)),
            Outcome::Recoverable(message) => {
                Err(StepError::from(anyhow::anyhow!("{message}")))
            }
            Outcome::NonRecoverable(message) => {
                Err(StepError::non_recoverable(anyhow::anyhow!("{message}")).with_reason("test"))
            }
        }
    }
}

/// Failure handler that records every operation it was invoked for
#[derive(Default)]
pub struct RecordingFailureHandler {
    calls: Mutex<Vec<Operation>>,
    fail: bool,
}

impl RecordingFailureHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler whose own cleanup fails
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<Operation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl FailureHandler<Instance> for RecordingFailureHandler {
    async fn handle_failure(&self, operation: &Operation, _target: &Instance) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(operation.clone());
        if self.fail {
            anyhow::bail!("cleanup backend unavailable");
        }
        Ok(())
    }
}

pub struct Fixture {
    pub operations: Arc<InMemoryOperationStore>,
    pub targets: Arc<InMemoryTargetStore<Instance>>,
}

impl Fixture {
    /// Stores with one instance registered under [`INSTANCE_ID`]
    pub fn new() -> Self {
        let targets = Arc::new(InMemoryTargetStore::new());
        targets.insert(
            INSTANCE_ID,
            Instance::new(INSTANCE_ID, "global-account", "subaccount", "aws"),
        );
        Self {
            operations: Arc::new(InMemoryOperationStore::new()),
            targets,
        }
    }

    /// Persist a pending operation at `stage`
    pub async fn insert(&self, kind: OperationKind, stage: &'static str) -> Operation {
        let operation = Operation::new(kind, INSTANCE_ID, Stage::from_static(stage));
        self.operations.insert_operation(&operation).await.unwrap();
        operation
    }

    pub async fn get(&self, id: &OperationId) -> Operation {
        self.operations.get_operation(id).await.unwrap()
    }
}

/// Poll the store until the operation reaches `state`
pub async fn wait_for_state(
    store: &dyn OperationStore,
    id: &OperationId,
    state: OperationState,
    timeout: Duration,
) -> Operation {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let operation = store.get_operation(id).await.unwrap();
        if operation.state == state {
            return operation;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "operation {id} stuck in {} at stage {}",
            operation.state,
            operation.stage
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until `condition` holds
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
