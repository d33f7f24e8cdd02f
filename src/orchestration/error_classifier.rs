//! # Step Error Classification
//!
//! Two-tier failure model for step errors.
//!
//! Any error a step returns is **recoverable** unless the step explicitly wraps it
//! with [`StepError::non_recoverable`]. Recoverable errors retry the same stage
//! after a short fixed delay, bounded in aggregate by the stage's time limit.
//! Non-recoverable errors abort the operation immediately and hand it to the
//! failure handler.
//!
//! ## Usage
//!
//! ```rust
//! use kcp_engine::orchestration::error_classifier::{FailureKind, StepError};
//!
//! // `?` on an anyhow error yields a recoverable failure
//! fn call_provisioner() -> Result<(), StepError> {
//!     Err(anyhow::anyhow!("connection reset"))?
//! }
//!
//! let err = call_provisioner().unwrap_err();
//! assert_eq!(err.kind(), FailureKind::Recoverable);
//!
//! let quota = StepError::non_recoverable(anyhow::anyhow!("quota exceeded"))
//!     .with_reason("quota_exceeded")
//!     .with_component("provisioner");
//! assert!(!quota.is_recoverable());
//! ```

use crate::models::LastError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Whether a failed step may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failure - the same stage is retried
    Recoverable,
    /// Permanent failure - the operation is aborted
    NonRecoverable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recoverable => write!(f, "recoverable"),
            Self::NonRecoverable => write!(f, "non_recoverable"),
        }
    }
}

/// Error returned by a step
#[derive(Debug, Error)]
#[error("{source}")]
pub struct StepError {
    kind: FailureKind,
    #[source]
    source: anyhow::Error,
    reason: Option<String>,
    component: Option<String>,
}

impl StepError {
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self::with_kind(FailureKind::Recoverable, err.into())
    }

    /// Opt into the permanent-failure path
    pub fn non_recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self::with_kind(FailureKind::NonRecoverable, err.into())
    }

    fn with_kind(kind: FailureKind, source: anyhow::Error) -> Self {
        Self {
            kind,
            source,
            reason: None,
            component: None,
        }
    }

    /// Machine-readable reason code, e.g. `quota_exceeded`
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Component the failure originated from, e.g. `provisioner`
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind == FailureKind::Recoverable
    }

    /// The wrapped error, without classification
    pub fn inner(&self) -> &anyhow::Error {
        &self.source
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    /// Last-error record persisted on the operation
    pub fn to_last_error(&self) -> LastError {
        LastError {
            message: format!("{:#}", self.source),
            reason: self.reason.clone(),
            component: self.component.clone(),
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}
