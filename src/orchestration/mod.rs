//! # Orchestration Engine
//!
//! Drives long-running operations through their stages.
//!
//! ## Core Components
//!
//! - **Step**: one unit of pipeline work, bound to a stage name and a time limit
//! - **StageExecutor**: runs exactly one step per invocation, keyed by the operation's stage
//! - **PipelineManager**: runs a weighted list of steps, resuming at the persisted stage
//! - **OperationQueue**: bounded worker pool with deduplication and delayed re-enqueue
//! - **FailureHandler**: compensating actions invoked once when an operation fails
//! - **RecoveryScan**: resubmits unfinished operations at startup
//! - **OperationEngine**: wires one queue and driver per operation kind
//!
//! ## Error Classification
//!
//! Step errors are recoverable unless explicitly wrapped with
//! [`StepError::non_recoverable`]. Recoverable errors retry the same stage after a
//! short delay; non-recoverable errors fail the operation permanently.

pub mod core;
pub mod error_classifier;
pub mod failure;
mod lifecycle;
pub mod manager;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod step_executor;
pub mod types;

pub use self::core::{OperationEngine, OperationEngineBuilder};
pub use error_classifier::{FailureKind, StepError};
pub use failure::{CompositeFailureHandler, FailureHandler, NoopFailureHandler};
pub use lifecycle::TIMEOUT_MESSAGE;
pub use manager::PipelineManager;
pub use pipeline::{Pipeline, PipelineBuilder, WeightedStep};
pub use queue::{OperationQueue, QueueStatistics};
pub use recovery::{RecoveryScan, RecoverySummary};
pub use registry::{StageRegistry, StageRegistryBuilder};
pub use step_executor::StageExecutor;
pub use types::{OperationProcessor, ProcessingResult, SpeedFactor, StageResult, Step};
