//! # Weighted Pipeline
//!
//! Ordered step list for the [`PipelineManager`](crate::orchestration::manager::PipelineManager).
//! An initialisation step always runs first; the remaining steps run in ascending
//! weight order (registration order breaks ties). Steps registered with
//! `enabled = false` are dropped at build time, so they are never invoked and
//! never affect timing.

use crate::error::{EngineError, EngineResult};
use crate::models::Stage;
use crate::orchestration::types::Step;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// A step bound to its position in the pipeline
pub struct WeightedStep<T> {
    pub weight: u32,
    pub step: Arc<dyn Step<T>>,
}

impl<T> Clone for WeightedStep<T> {
    fn clone(&self) -> Self {
        Self {
            weight: self.weight,
            step: Arc::clone(&self.step),
        }
    }
}

pub struct Pipeline<T> {
    init: Arc<dyn Step<T>>,
    steps: Vec<WeightedStep<T>>,
}

impl<T> Pipeline<T> {
    pub fn builder(init: impl Step<T> + 'static) -> PipelineBuilder<T> {
        PipelineBuilder {
            init: Arc::new(init),
            steps: Vec::new(),
        }
    }

    /// Start a pipeline whose initialisation step is shared with other owners
    pub fn builder_shared(init: Arc<dyn Step<T>>) -> PipelineBuilder<T> {
        PipelineBuilder {
            init,
            steps: Vec::new(),
        }
    }

    pub fn init_step(&self) -> &Arc<dyn Step<T>> {
        &self.init
    }

    /// Enabled steps in execution order (initialisation step excluded)
    pub fn steps(&self) -> &[WeightedStep<T>] {
        &self.steps
    }

    /// Stage new operations of this kind start at
    pub fn initial_stage(&self) -> Stage {
        self.init.name()
    }

    /// Index into [`Self::steps`] the operation resumes at, or `None` if `stage`
    /// is not part of this pipeline. The initialisation stage resumes at 0.
    pub fn position(&self, stage: &Stage) -> Option<usize> {
        if *stage == self.init.name() {
            return Some(0);
        }
        self.steps.iter().position(|ws| ws.step.name() == *stage)
    }

    /// Stage that follows the step at `index`
    pub fn stage_after(&self, index: usize) -> Stage {
        self.steps
            .get(index + 1)
            .map(|ws| ws.step.name())
            .unwrap_or(Stage::FINISHED)
    }

    pub fn is_valid_stage(&self, stage: &Stage) -> bool {
        stage.is_finished() || self.position(stage).is_some()
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let order: Vec<(u32, Stage)> = self
            .steps
            .iter()
            .map(|ws| (ws.weight, ws.step.name()))
            .collect();
        f.debug_struct("Pipeline")
            .field("init", &self.init.name())
            .field("steps", &order)
            .finish()
    }
}

struct Registration<T> {
    weight: u32,
    step: Arc<dyn Step<T>>,
    enabled: bool,
}

pub struct PipelineBuilder<T> {
    init: Arc<dyn Step<T>>,
    steps: Vec<Registration<T>>,
}

impl<T> PipelineBuilder<T> {
    /// Register an always-enabled step at `weight`
    pub fn step(self, weight: u32, step: impl Step<T> + 'static) -> Self {
        self.step_if(weight, step, true)
    }

    /// Register a step gated by a feature flag
    pub fn step_if(mut self, weight: u32, step: impl Step<T> + 'static, enabled: bool) -> Self {
        self.steps.push(Registration {
            weight,
            step: Arc::new(step),
            enabled,
        });
        self
    }

    pub fn shared_step(mut self, weight: u32, step: Arc<dyn Step<T>>, enabled: bool) -> Self {
        self.steps.push(Registration {
            weight,
            step,
            enabled,
        });
        self
    }

    pub fn build(self) -> EngineResult<Pipeline<T>> {
        let mut seen = HashSet::new();
        let init_name = self.init.name();
        if init_name.is_finished() {
            return Err(EngineError::Registry(format!(
                "stage '{init_name}' is reserved for completed operations"
            )));
        }
        seen.insert(init_name);

        // Names must be unique across disabled steps too: a stage persisted
        // under one configuration must mean the same step under another.
        for registration in &self.steps {
            let name = registration.step.name();
            if name.is_finished() {
                return Err(EngineError::Registry(format!(
                    "stage '{name}' is reserved for completed operations"
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(EngineError::Registry(format!(
                    "stage '{name}' registered twice"
                )));
            }
        }

        let mut steps: Vec<WeightedStep<T>> = self
            .steps
            .into_iter()
            .filter(|registration| {
                if !registration.enabled {
                    debug!(stage = %registration.step.name(), "Skipping disabled pipeline step");
                }
                registration.enabled
            })
            .map(|registration| WeightedStep {
                weight: registration.weight,
                step: registration.step,
            })
            .collect();
        // stable: equal weights keep registration order
        steps.sort_by_key(|ws| ws.weight);

        Ok(Pipeline {
            init: self.init,
            steps,
        })
    }
}
