//! # Data Models
//!
//! Operation records persisted by the operation store and the default target
//! record type.

pub mod instance;
pub mod operation;

pub use crate::state_machine::OperationState;
pub use instance::Instance;
pub use operation::{LastError, Operation, OperationId, OperationKind, Stage};
