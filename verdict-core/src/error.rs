//! Error types for registration-time failures
//!
//! Evaluation-time failures travel as [`crate::Value`] errors through the
//! expression algebra and never surface here. These types cover programmer
//! errors raised when wiring the engine together: broker registration
//! collisions, invalid specifications, and constraint handler gaps.

use thiserror::Error;

/// Broker registration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("attribute finder collision: '{fqn}' overlaps a registered specification")]
    AttributeFinderCollision { fqn: String },

    #[error("function collision: '{fqn}' overlaps a registered specification")]
    FunctionCollision { fqn: String },

    #[error("invalid function specification for '{fqn}': {reason}")]
    InvalidFunctionSpecification { fqn: String, reason: String },

    #[error("document '{id}' is invalid and cannot be indexed: {reason}")]
    InvalidDocument { id: String, reason: String },
}

/// Constraint handler bundling errors. An unhandled obligation is fail-closed:
/// the caller must degrade the decision to `DENY`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("no handler registered for obligation: {obligation}")]
    UnhandledObligation { obligation: String },

    #[error("obligation handler failed: {reason}")]
    ObligationFailed { reason: String },
}

/// An unrecognized combining algorithm name in PDP configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown combining algorithm: {0}")]
pub struct UnknownAlgorithmError(pub String);

/// Master error type for VERDICT registration and configuration failures.
#[derive(Debug, Clone, Error)]
pub enum VerdictError {
    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("constraint error: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("configuration error: {0}")]
    Configuration(#[from] UnknownAlgorithmError),
}

/// Result type alias for VERDICT operations.
pub type VerdictResult<T> = Result<T, VerdictError>;
