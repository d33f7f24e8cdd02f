// Operation lifecycle states
//
// The engine only ever moves an operation forward through these states; stores
// enforce the same rule when persisting.

pub mod states;

pub use states::OperationState;
