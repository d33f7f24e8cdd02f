//! # Failure Handlers
//!
//! Collaborators invoked once per operation when it fails permanently, either from
//! a non-recoverable step error or a stage timeout. The driver calls the handler
//! after the `failed` state is persisted and before the worker is released. A
//! handler error is logged and never changes the operation's outcome.

use crate::models::Operation;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

#[async_trait]
pub trait FailureHandler<T>: Send + Sync {
    /// Compensating actions and status reporting for a failed operation
    async fn handle_failure(&self, operation: &Operation, target: &T) -> anyhow::Result<()>;

    fn handler_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Does nothing; for operation kinds without cleanup
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFailureHandler;

#[async_trait]
impl<T: Sync> FailureHandler<T> for NoopFailureHandler {
    async fn handle_failure(&self, operation: &Operation, _target: &T) -> anyhow::Result<()> {
        info!(operation_id = %operation.id, "No failure handler configured");
        Ok(())
    }

    fn handler_name(&self) -> &'static str {
        "noop"
    }
}

/// Fans a failure out to several handlers (cleanup, status reporters, ...).
///
/// Every handler runs even if an earlier one fails; the first error is returned
/// after all of them have been invoked.
pub struct CompositeFailureHandler<T> {
    handlers: Vec<Arc<dyn FailureHandler<T>>>,
}

impl<T> CompositeFailureHandler<T> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn FailureHandler<T>>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<T> Default for CompositeFailureHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Sync> FailureHandler<T> for CompositeFailureHandler<T> {
    async fn handle_failure(&self, operation: &Operation, target: &T) -> anyhow::Result<()> {
        let mut first_error = None;

        for handler in &self.handlers {
            if let Err(e) = handler.handle_failure(operation, target).await {
                error!(
                    operation_id = %operation.id,
                    handler = handler.handler_name(),
                    error = %format!("{e:#}"),
                    "Failure handler returned an error"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handler_name(&self) -> &'static str {
        "composite"
    }
}
