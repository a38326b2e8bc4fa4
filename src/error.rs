//! The error taxonomy surfaced by every fallible operation.

use thiserror::Error;

/// Errors produced by the library. The set is closed: every failure an
/// operation can report maps to exactly one of these variants, and errors
/// reach the API boundary unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DdError {
    #[error("insufficient memory")]
    InsufficientMemory,
    #[error("invalid variable")]
    InvalidVariable,
    #[error("invalid level")]
    InvalidLevel,
    #[error("invalid assignment")]
    InvalidAssignment,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("operand type mismatch")]
    TypeMismatch,
    #[error("operands belong to different domains")]
    DomainMismatch,
    #[error("operands belong to different forests")]
    ForestMismatch,
    #[error("not implemented")]
    NotImplemented,
    #[error("unknown operation")]
    UnknownOperation,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("miscellaneous error")]
    Miscellaneous,
}

pub type Result<T> = std::result::Result<T, DdError>;
