//! Engine-level error taxonomy.
//!
//! Errors from the synchronous API (submission, cancellation, configuration,
//! queries) are returned to the caller. Failures inside a worker never cross
//! the thread boundary: they are recorded as [`ErrorRecord`]s and reflected in
//! the request status, and the variants below are only used to format them.
//!
//! [`ErrorRecord`]: forgeexec_core::ErrorRecord

use thiserror::Error;

use forgeexec_commands::ResolutionError;
use forgeexec_core::{DomainError, RequestId, RequestStatus};

use crate::config::ConfigError;
use crate::store::StoreError;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Operation referenced an unknown request id.
    #[error("no such request: {0}")]
    NoSuchRequest(RequestId),

    /// The request's current status forbids the operation.
    #[error("request {id} cannot {action} while {status}")]
    InvalidStateTransition {
        id: RequestId,
        status: RequestStatus,
        action: &'static str,
    },

    /// The worker pool is not running (or failed to come up).
    #[error("executor not started: {0}")]
    EngineNotStarted(String),

    /// No command is registered under the request's name.
    #[error("command resolution failed: {0}")]
    CommandResolution(#[from] ResolutionError),

    /// The command reported a failure or panicked.
    #[error("command execution failed: {0}")]
    CommandExecution(String),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Caller input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The request store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DomainError> for ExecutorError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                ExecutorError::Validation(msg)
            }
            DomainError::NoSuchRequest(id) => ExecutorError::NoSuchRequest(id),
            DomainError::InvalidStateTransition { id, from, action } => {
                ExecutorError::InvalidStateTransition {
                    id,
                    status: from,
                    action,
                }
            }
            DomainError::Configuration(msg) => ExecutorError::Configuration(msg),
        }
    }
}

impl From<ConfigError> for ExecutorError {
    fn from(value: ConfigError) -> Self {
        ExecutorError::Configuration(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_engine_taxonomy() {
        let id = RequestId::new();

        let err: ExecutorError =
            DomainError::invalid_transition(id, RequestStatus::Running, "be cancelled").into();
        assert!(matches!(
            err,
            ExecutorError::InvalidStateTransition { status: RequestStatus::Running, .. }
        ));
        assert_eq!(
            err.to_string(),
            format!("request {id} cannot be cancelled while RUNNING")
        );

        let err: ExecutorError = DomainError::NoSuchRequest(id).into();
        assert!(matches!(err, ExecutorError::NoSuchRequest(x) if x == id));

        let err: ExecutorError = DomainError::configuration("pool size must be > 0").into();
        assert!(matches!(err, ExecutorError::Configuration(_)));
    }

    #[test]
    fn resolution_failure_message() {
        let err = ExecutorError::from(ResolutionError::Unknown("Foo".to_string()));
        assert_eq!(
            err.to_string(),
            "command resolution failed: no command registered for 'Foo'"
        );
    }
}
