//! # Operation Engine
//!
//! Wires stores, drivers and queues into one engine: one queue per registered
//! operation kind, each feeding either a [`StageExecutor`] (stage registry) or a
//! [`PipelineManager`] (weighted pipeline).
//!
//! ## Lifecycle
//!
//! 1. Build with [`OperationEngine::builder`], registering one driver per kind
//! 2. [`OperationEngine::start`] runs the recovery scan and starts the workers
//! 3. [`OperationEngine::submit`] persists new operations and queues them
//! 4. [`OperationEngine::shutdown`] stops every queue cooperatively
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kcp_engine::config::EngineConfig;
//! use kcp_engine::models::{Instance, OperationKind};
//! use kcp_engine::orchestration::{OperationEngine, StageRegistry};
//! use kcp_engine::store::{InMemoryOperationStore, InMemoryTargetStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(registry: StageRegistry<Instance>) -> kcp_engine::error::EngineResult<()> {
//! let targets = Arc::new(InMemoryTargetStore::<Instance>::new());
//! let engine = OperationEngine::<Instance>::builder(
//!     EngineConfig::default(),
//!     Arc::new(InMemoryOperationStore::new()),
//!     targets,
//! )
//! .executor(OperationKind::Provision, registry)
//! .build()?;
//!
//! engine.start().await?;
//! let operation = engine.new_operation(OperationKind::Provision, "instance-1")?;
//! engine.submit(operation).await?;
//! engine.shutdown(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{Operation, OperationId, OperationKind, Stage};
use crate::orchestration::failure::{FailureHandler, NoopFailureHandler};
use crate::orchestration::manager::PipelineManager;
use crate::orchestration::pipeline::Pipeline;
use crate::orchestration::queue::OperationQueue;
use crate::orchestration::recovery::{RecoveryScan, RecoverySummary};
use crate::orchestration::registry::StageRegistry;
use crate::orchestration::step_executor::StageExecutor;
use crate::orchestration::types::OperationProcessor;
use crate::store::{OperationStore, TargetStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

enum Driver<T> {
    Executor(Arc<StageExecutor<T>>),
    Manager(Arc<PipelineManager<T>>),
}

impl<T: Send + Sync + 'static> Driver<T> {
    fn initial_stage(&self) -> Stage {
        match self {
            Driver::Executor(executor) => executor.registry().initial_stage().clone(),
            Driver::Manager(manager) => manager.pipeline().initial_stage(),
        }
    }

    fn processor(&self) -> Arc<dyn OperationProcessor> {
        match self {
            Driver::Executor(executor) => executor.clone(),
            Driver::Manager(manager) => manager.clone(),
        }
    }
}

pub struct OperationEngine<T> {
    config: EngineConfig,
    store: Arc<dyn OperationStore>,
    drivers: HashMap<OperationKind, Driver<T>>,
    queues: HashMap<OperationKind, Arc<OperationQueue>>,
}

impl<T: Send + Sync + 'static> OperationEngine<T> {
    pub fn builder(
        config: EngineConfig,
        store: Arc<dyn OperationStore>,
        targets: Arc<dyn TargetStore<T>>,
    ) -> OperationEngineBuilder<T> {
        OperationEngineBuilder {
            config,
            store,
            targets,
            default_failure_handler: Arc::new(NoopFailureHandler),
            failure_handlers: HashMap::new(),
            registrations: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    /// Kinds with a registered driver
    pub fn kinds(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.drivers.keys().copied()
    }

    /// Resubmit unfinished operations, then start the workers of every queue
    pub async fn start(&self) -> EngineResult<RecoverySummary> {
        info!(kinds = self.queues.len(), "🚀 ENGINE: Starting operation engine");

        let summary = if self.config.recovery.enabled {
            RecoveryScan::new(Arc::clone(&self.store))
                .run(&self.queues)
                .await?
        } else {
            info!("Startup recovery disabled in configuration");
            RecoverySummary::default()
        };

        for (kind, queue) in &self.queues {
            queue.run(self.config.queues.for_kind(*kind).workers)?;
        }

        info!("✅ ENGINE: Operation engine started");
        Ok(summary)
    }

    /// Build a pending operation positioned at the initial stage of `kind`
    pub fn new_operation(
        &self,
        kind: OperationKind,
        target_id: impl Into<String>,
    ) -> EngineResult<Operation> {
        let driver = self
            .drivers
            .get(&kind)
            .ok_or(EngineError::MissingDriver(kind))?;
        Ok(Operation::new(kind, target_id, driver.initial_stage()))
    }

    /// Persist a new operation and queue it
    pub async fn submit(&self, operation: Operation) -> EngineResult<OperationId> {
        let queue = self
            .queues
            .get(&operation.kind)
            .ok_or(EngineError::MissingDriver(operation.kind))?;

        self.store.insert_operation(&operation).await?;
        info!(
            operation_id = %operation.id,
            kind = %operation.kind,
            target_id = %operation.target_id,
            "Operation submitted"
        );
        queue.add(operation.id.clone());
        Ok(operation.id)
    }

    /// Queue an already persisted operation
    pub fn enqueue(&self, kind: OperationKind, id: OperationId) -> EngineResult<()> {
        let queue = self.queue(kind).ok_or(EngineError::MissingDriver(kind))?;
        queue.add(id);
        Ok(())
    }

    pub fn queue(&self, kind: OperationKind) -> Option<&Arc<OperationQueue>> {
        self.queues.get(&kind)
    }

    /// Divide wait intervals of every kind by `factor`.
    ///
    /// Pipeline managers report delays already scaled, so their queues keep a
    /// factor of one; executor kinds are scaled by their queue.
    pub fn speed_up(&self, factor: u32) {
        for (kind, driver) in &self.drivers {
            match driver {
                Driver::Manager(manager) => manager.speed_up(factor),
                Driver::Executor(_) => {
                    if let Some(queue) = self.queues.get(kind) {
                        queue.speed_up(factor);
                    }
                }
            }
        }
    }

    /// Stop every queue; the first failure is returned after all were asked to stop
    pub async fn shutdown(&self, timeout: Duration) -> EngineResult<()> {
        info!("🛑 ENGINE: Shutting down operation engine");
        let mut first_error = None;

        for queue in self.queues.values() {
            if let Err(e) = queue.shutdown(timeout).await {
                warn!(queue = queue.name(), error = %e, "Queue shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

enum Registration<T> {
    Executor(OperationKind, StageRegistry<T>),
    Pipeline(OperationKind, Pipeline<T>),
}

impl<T> Registration<T> {
    fn kind(&self) -> OperationKind {
        match self {
            Registration::Executor(kind, _) | Registration::Pipeline(kind, _) => *kind,
        }
    }
}

pub struct OperationEngineBuilder<T> {
    config: EngineConfig,
    store: Arc<dyn OperationStore>,
    targets: Arc<dyn TargetStore<T>>,
    default_failure_handler: Arc<dyn FailureHandler<T>>,
    failure_handlers: HashMap<OperationKind, Arc<dyn FailureHandler<T>>>,
    registrations: Vec<Registration<T>>,
}

impl<T: Send + Sync + 'static> OperationEngineBuilder<T> {
    /// Drive `kind` one stage per invocation
    pub fn executor(mut self, kind: OperationKind, registry: StageRegistry<T>) -> Self {
        self.registrations
            .push(Registration::Executor(kind, registry));
        self
    }

    /// Drive `kind` through a weighted pipeline
    pub fn pipeline(mut self, kind: OperationKind, pipeline: Pipeline<T>) -> Self {
        self.registrations
            .push(Registration::Pipeline(kind, pipeline));
        self
    }

    /// Handler for kinds without their own
    pub fn failure_handler(mut self, handler: Arc<dyn FailureHandler<T>>) -> Self {
        self.default_failure_handler = handler;
        self
    }

    pub fn failure_handler_for(
        mut self,
        kind: OperationKind,
        handler: Arc<dyn FailureHandler<T>>,
    ) -> Self {
        self.failure_handlers.insert(kind, handler);
        self
    }

    pub fn build(self) -> EngineResult<OperationEngine<T>> {
        self.config.validate()?;

        let mut drivers = HashMap::new();
        let mut queues = HashMap::new();

        for registration in self.registrations {
            let kind = registration.kind();
            if drivers.contains_key(&kind) {
                return Err(EngineError::Registry(format!(
                    "operation kind '{kind}' has more than one driver"
                )));
            }

            let failure_handler = self
                .failure_handlers
                .get(&kind)
                .cloned()
                .unwrap_or_else(|| Arc::clone(&self.default_failure_handler));

            let driver = match registration {
                Registration::Executor(_, registry) => Driver::Executor(Arc::new(StageExecutor::new(
                    kind,
                    Arc::new(registry),
                    Arc::clone(&self.store),
                    Arc::clone(&self.targets),
                    failure_handler,
                    &self.config.executor,
                ))),
                Registration::Pipeline(_, pipeline) => {
                    Driver::Manager(Arc::new(PipelineManager::new(
                        kind,
                        Arc::new(pipeline),
                        Arc::clone(&self.store),
                        Arc::clone(&self.targets),
                        failure_handler,
                        &self.config.manager,
                    )))
                }
            };

            queues.insert(
                kind,
                Arc::new(OperationQueue::new(kind.to_string(), driver.processor())),
            );
            drivers.insert(kind, driver);
        }

        if drivers.is_empty() {
            return Err(EngineError::Registry(
                "no operation kinds registered".to_string(),
            ));
        }

        Ok(OperationEngine {
            config: self.config,
            store: self.store,
            drivers,
            queues,
        })
    }
}
