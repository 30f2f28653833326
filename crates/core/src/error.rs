//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (state
/// transitions, quantity guards, argument validation). Infrastructure concerns
/// belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An operation was attempted from a status that does not permit it.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// A decrease would make a quantity negative.
    #[error("insufficient quantity: available {available}, requested {requested}")]
    InsufficientQuantity { available: u64, requested: u64 },

    /// A purchase-order line reception would exceed the ordered quantity.
    #[error(
        "reception exceeds ordered quantity: ordered {ordered}, already received {received}, requested {requested}"
    )]
    ExceedsOrderedQuantity {
        ordered: u64,
        received: u64,
        requested: u64,
    },

    /// An argument was rejected at construction time.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found: {0}")]
    NotFound(String),

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn transition(msg: impl Into<String>) -> Self {
        Self::InvalidStateTransition(msg.into())
    }

    pub fn insufficient(available: u64, requested: u64) -> Self {
        Self::InsufficientQuantity {
            available,
            requested,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
