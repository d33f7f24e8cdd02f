//! # Engine Errors
//!
//! Crate-level error type for everything that is not a step failure: store access,
//! configuration, queue lifecycle and engine wiring. Step failures have their own
//! classification in [`crate::orchestration::error_classifier`].

use crate::config::ConfigurationError;
use crate::models::OperationKind;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("No driver registered for operation kind '{0}'")]
    MissingDriver(OperationKind),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
