//! # Stage Registry
//!
//! Keyed collection of steps for the single-stage executor: "which step runs for
//! stage S". Registries are plain values built by the host application at startup
//! and passed to the executor, so there is no process-wide step table.

use crate::error::{EngineError, EngineResult};
use crate::models::Stage;
use crate::orchestration::types::Step;
use std::collections::HashMap;
use std::sync::Arc;

pub struct StageRegistry<T> {
    initial_stage: Stage,
    steps: HashMap<Stage, Arc<dyn Step<T>>>,
}

impl<T> StageRegistry<T> {
    pub fn builder() -> StageRegistryBuilder<T> {
        StageRegistryBuilder::default()
    }

    /// Stage new operations of this kind start at
    pub fn initial_stage(&self) -> &Stage {
        &self.initial_stage
    }

    pub fn get(&self, stage: &Stage) -> Option<&Arc<dyn Step<T>>> {
        self.steps.get(stage)
    }

    /// A stage is valid if a step is registered for it or it is the finished stage
    pub fn is_valid_stage(&self, stage: &Stage) -> bool {
        stage.is_finished() || self.steps.contains_key(stage)
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.steps.keys()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<T> std::fmt::Debug for StageRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<&str> = self.steps.keys().map(Stage::as_str).collect();
        stages.sort_unstable();
        f.debug_struct("StageRegistry")
            .field("initial_stage", &self.initial_stage)
            .field("stages", &stages)
            .finish()
    }
}

pub struct StageRegistryBuilder<T> {
    initial_stage: Option<Stage>,
    steps: Vec<Arc<dyn Step<T>>>,
}

impl<T> Default for StageRegistryBuilder<T> {
    fn default() -> Self {
        Self {
            initial_stage: None,
            steps: Vec::new(),
        }
    }
}

impl<T> StageRegistryBuilder<T> {
    /// Register a step under its own name. The first step registered is the
    /// initial stage unless [`Self::initial_stage`] says otherwise.
    pub fn step(mut self, step: impl Step<T> + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn shared_step(mut self, step: Arc<dyn Step<T>>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn initial_stage(mut self, stage: impl Into<Stage>) -> Self {
        self.initial_stage = Some(stage.into());
        self
    }

    pub fn build(self) -> EngineResult<StageRegistry<T>> {
        let mut steps: HashMap<Stage, Arc<dyn Step<T>>> = HashMap::with_capacity(self.steps.len());
        let first = self.steps.first().map(|step| step.name());

        for step in self.steps {
            let name = step.name();
            if name.is_finished() {
                return Err(EngineError::Registry(format!(
                    "stage '{name}' is reserved for completed operations"
                )));
            }
            if steps.insert(name.clone(), step).is_some() {
                return Err(EngineError::Registry(format!(
                    "stage '{name}' registered twice"
                )));
            }
        }

        let initial_stage = self
            .initial_stage
            .or(first)
            .ok_or_else(|| EngineError::Registry("registry has no steps".to_string()))?;
        if !steps.contains_key(&initial_stage) {
            return Err(EngineError::Registry(format!(
                "initial stage '{initial_stage}' has no registered step"
            )));
        }

        Ok(StageRegistry {
            initial_stage,
            steps,
        })
    }
}
