//! Domain error model.

use thiserror::Error;

use crate::id::RequestId;
use crate::request::RequestStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of the request lifecycle
/// (validation, unknown ids, forbidden transitions). Storage concerns belong in
/// the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty command name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced request does not exist.
    #[error("no such request: {0}")]
    NoSuchRequest(RequestId),

    /// The request's current status forbids the attempted operation.
    #[error("request {id} cannot {action} while {from}")]
    InvalidStateTransition {
        id: RequestId,
        from: RequestStatus,
        action: &'static str,
    },

    /// An identifier or enum value failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A configuration value is out of range or malformed.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_transition(id: RequestId, from: RequestStatus, action: &'static str) -> Self {
        Self::InvalidStateTransition { id, from, action }
    }
}
