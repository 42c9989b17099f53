use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use forgeexec_core::{CommandContext, ErrorRecord, Request, RequestId, RequestStatus, WorkerId};

pub type StoreResult<T> = Result<T, StoreError>;

/// Request store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("request already exists: {0}")]
    AlreadyExists(RequestId),
    #[error("failed to decode stored record: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of an execution, applied by [`RequestStore::update_outcome`].
///
/// Each variant maps to exactly one edge out of RUNNING. Error records travel
/// with the outcome so the status change and the append happen together.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeWrite {
    /// RUNNING → DONE.
    Done { response: Option<CommandContext> },
    /// RUNNING → QUEUED with a replacement context; not a retry.
    Rescheduled {
        context: CommandContext,
        fire_time: DateTime<Utc>,
    },
    /// RUNNING → RETRYING, `retry_count + 1`.
    Retrying {
        fire_time: DateTime<Utc>,
        error: ErrorRecord,
    },
    /// RUNNING → ERROR.
    Failed { error: ErrorRecord },
}

impl OutcomeWrite {
    pub fn target_status(&self) -> RequestStatus {
        match self {
            OutcomeWrite::Done { .. } => RequestStatus::Done,
            OutcomeWrite::Rescheduled { .. } => RequestStatus::Queued,
            OutcomeWrite::Retrying { .. } => RequestStatus::Retrying,
            OutcomeWrite::Failed { .. } => RequestStatus::Error,
        }
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            OutcomeWrite::Retrying { error, .. } | OutcomeWrite::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Result of a status-gated cancellation.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelResult {
    Cancelled(Request),
    NotFound,
    /// The request exists but its status forbids cancellation.
    NotCancellable(RequestStatus),
}

/// Mutation side of the store: admission, claim, outcome, cancellation.
///
/// Implementations must make `claim`, `update_outcome` and `cancel` atomic
/// with respect to each other and to [`RequeueStore`] operations, across every
/// process sharing the store.
pub trait RequestStore: Send + Sync {
    /// Verify the store is reachable and its schema present.
    fn ensure_ready(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Persist a new request.
    fn insert(&self, request: Request) -> StoreResult<RequestId>;

    /// Claimable requests with `fire_time <= now`, earliest first
    /// (`fire_time`, then `id`), at most `limit`.
    fn eligible(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Request>>;

    /// Compare-and-set claim: succeeds only if the request is still in
    /// `expected`. Returns the claimed request, or `None` on a lost race.
    fn claim(
        &self,
        id: RequestId,
        expected: RequestStatus,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Request>>;

    /// Apply an execution outcome if `owner` still holds the claim.
    ///
    /// Returns `false` (and writes nothing) when the claim was lost.
    fn update_outcome(
        &self,
        id: RequestId,
        owner: &WorkerId,
        outcome: OutcomeWrite,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// QUEUED | RETRYING → CANCELLED, as one status-gated write.
    fn cancel(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<CancelResult>;
}

/// Read side of the store.
pub trait RequestQuery: Send + Sync {
    fn get(&self, id: RequestId) -> StoreResult<Option<Request>>;

    fn all_requests(&self) -> StoreResult<Vec<Request>>;

    fn requests_by_status(&self, statuses: &[RequestStatus]) -> StoreResult<Vec<Request>>;

    /// Claimable requests whose `fire_time` is still in the future.
    fn future_queued(&self, now: DateTime<Utc>) -> StoreResult<Vec<Request>>;

    /// Claimable requests that are due at `now`.
    fn pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<Request>>;

    fn pending_by_id(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<Option<Request>>;

    fn by_business_key(&self, key: &str) -> StoreResult<Vec<Request>>;

    fn errors(&self) -> StoreResult<Vec<ErrorRecord>>;

    fn errors_for(&self, id: RequestId) -> StoreResult<Vec<ErrorRecord>>;
}

/// Administrative purge.
pub trait RequestAdmin: Send + Sync {
    /// Delete every request in a terminal status. Returns the count.
    fn clear_all_requests(&self) -> StoreResult<usize>;

    /// Delete every error record. Returns the count.
    fn clear_all_errors(&self) -> StoreResult<usize>;
}

/// Optional capability: force RUNNING requests back to QUEUED.
pub trait RequeueStore: Send + Sync {
    /// Requeue every RUNNING request last updated before `cutoff`.
    fn requeue_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Requeue one request if it is RUNNING. Returns whether it was.
    fn requeue_by_id(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<bool>;
}

impl<S: RequestStore + ?Sized> RequestStore for Arc<S> {
    fn ensure_ready(&self) -> StoreResult<()> {
        (**self).ensure_ready()
    }

    fn insert(&self, request: Request) -> StoreResult<RequestId> {
        (**self).insert(request)
    }

    fn eligible(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Request>> {
        (**self).eligible(now, limit)
    }

    fn claim(
        &self,
        id: RequestId,
        expected: RequestStatus,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Request>> {
        (**self).claim(id, expected, owner, now)
    }

    fn update_outcome(
        &self,
        id: RequestId,
        owner: &WorkerId,
        outcome: OutcomeWrite,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        (**self).update_outcome(id, owner, outcome, now)
    }

    fn cancel(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<CancelResult> {
        (**self).cancel(id, now)
    }
}

impl<S: RequestQuery + ?Sized> RequestQuery for Arc<S> {
    fn get(&self, id: RequestId) -> StoreResult<Option<Request>> {
        (**self).get(id)
    }

    fn all_requests(&self) -> StoreResult<Vec<Request>> {
        (**self).all_requests()
    }

    fn requests_by_status(&self, statuses: &[RequestStatus]) -> StoreResult<Vec<Request>> {
        (**self).requests_by_status(statuses)
    }

    fn future_queued(&self, now: DateTime<Utc>) -> StoreResult<Vec<Request>> {
        (**self).future_queued(now)
    }

    fn pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<Request>> {
        (**self).pending(now)
    }

    fn pending_by_id(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<Option<Request>> {
        (**self).pending_by_id(id, now)
    }

    fn by_business_key(&self, key: &str) -> StoreResult<Vec<Request>> {
        (**self).by_business_key(key)
    }

    fn errors(&self) -> StoreResult<Vec<ErrorRecord>> {
        (**self).errors()
    }

    fn errors_for(&self, id: RequestId) -> StoreResult<Vec<ErrorRecord>> {
        (**self).errors_for(id)
    }
}

impl<S: RequestAdmin + ?Sized> RequestAdmin for Arc<S> {
    fn clear_all_requests(&self) -> StoreResult<usize> {
        (**self).clear_all_requests()
    }

    fn clear_all_errors(&self) -> StoreResult<usize> {
        (**self).clear_all_errors()
    }
}

impl<S: RequeueStore + ?Sized> RequeueStore for Arc<S> {
    fn requeue_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<usize> {
        (**self).requeue_stale(cutoff, now)
    }

    fn requeue_by_id(&self, id: RequestId, now: DateTime<Utc>) -> StoreResult<bool> {
        (**self).requeue_by_id(id, now)
    }
}
