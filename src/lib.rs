#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # KCP Engine
//!
//! Staged operation engine for a managed Kubernetes control plane.
//!
//! ## Overview
//!
//! Provisioning, deprovisioning, updating and upgrading a managed cluster are
//! long-running operations built from many steps, each of which may call slow or
//! unreliable backends. This crate persists every operation's progress as a named
//! stage so that any process restart resumes work exactly where it left off.
//!
//! ## Architecture
//!
//! - **Steps** do the work of one stage and return the next stage plus a delay
//! - **Drivers** ([`orchestration::StageExecutor`], [`orchestration::PipelineManager`])
//!   run steps, enforce per-stage time limits and classify errors
//! - **Queues** ([`orchestration::OperationQueue`]) bound concurrency per operation
//!   kind and guarantee at most one worker per operation at a time
//! - **Stores** ([`store::OperationStore`]) persist operations; in-memory and
//!   PostgreSQL implementations are provided
//!
//! ## Module Organization
//!
//! - [`models`] - Operation, stage and target records
//! - [`state_machine`] - Operation lifecycle states and legal transitions
//! - [`store`] - Operation and target persistence
//! - [`orchestration`] - Step contract, drivers, queues, recovery and engine wiring
//! - [`config`] - Layered TOML configuration
//! - [`logging`] - Structured logging initialisation
//! - [`error`] - Structured error handling
//!
//! ## Testing
//!
//! All tests run against the in-memory stores:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod store;

pub use config::{ConfigManager, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use models::{Instance, LastError, Operation, OperationId, OperationKind, Stage};
pub use orchestration::{
    OperationEngine, OperationQueue, Pipeline, StageRegistry, StageResult, Step, StepError,
};
pub use state_machine::OperationState;
