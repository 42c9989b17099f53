//! Request record, its status state machine, and error records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::CommandContext;
use crate::error::{DomainError, DomainResult};
use crate::id::{ErrorId, RequestId, WorkerId};

/// Lifecycle status of a request.
///
/// ```text
/// QUEUED   --claim-->       RUNNING
/// QUEUED   --cancel-->      CANCELLED
/// RETRYING --claim-->       RUNNING
/// RETRYING --cancel-->      CANCELLED
/// RUNNING  --success-->     DONE
/// RUNNING  --failure-->     RETRYING | ERROR
/// RUNNING  --reschedule-->  QUEUED
/// RUNNING  --sweep-->       QUEUED
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Queued,
    Running,
    Retrying,
    Done,
    Error,
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 6] = [
        RequestStatus::Queued,
        RequestStatus::Running,
        RequestStatus::Retrying,
        RequestStatus::Done,
        RequestStatus::Error,
        RequestStatus::Cancelled,
    ];

    /// Statuses a worker may claim from.
    pub const CLAIMABLE: [RequestStatus; 2] = [RequestStatus::Queued, RequestStatus::Retrying];

    /// Statuses that never change again.
    pub const TERMINAL: [RequestStatus; 3] = [
        RequestStatus::Done,
        RequestStatus::Error,
        RequestStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "QUEUED",
            RequestStatus::Running => "RUNNING",
            RequestStatus::Retrying => "RETRYING",
            RequestStatus::Done => "DONE",
            RequestStatus::Error => "ERROR",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Done | RequestStatus::Error | RequestStatus::Cancelled
        )
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, RequestStatus::Queued | RequestStatus::Retrying)
    }

    /// The single source of truth for allowed status transitions.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Retrying, Running)
                | (Retrying, Cancelled)
                | (Running, Done)
                | (Running, Retrying)
                | (Running, Error)
                | (Running, Queued)
        )
    }
}

impl core::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown request status '{s}'")))
    }
}

/// A durable record of one scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub command_name: String,
    pub context: CommandContext,
    pub business_key: Option<String>,
    pub status: RequestStatus,
    /// Earliest instant at which the request may be claimed.
    pub fire_time: DateTime<Utc>,
    /// Worker holding the claim; only set while RUNNING.
    pub owner: Option<WorkerId>,
    /// Completed retry attempts.
    pub retry_count: u32,
    /// Completion data returned by the command on success.
    pub response: Option<CommandContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Create a new QUEUED request.
    pub fn new(
        command_name: impl Into<String>,
        context: CommandContext,
        fire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RequestId::new(),
            command_name: command_name.into(),
            context,
            business_key: None,
            status: RequestStatus::Queued,
            fire_time,
            owner: None,
            retry_count: 0,
            response: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    /// Ready to be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.fire_time <= now
    }

    /// Held by `owner` (outcome writes are only accepted in this case).
    pub fn is_owned_by(&self, owner: &WorkerId) -> bool {
        self.status == RequestStatus::Running && self.owner.as_ref() == Some(owner)
    }

    fn transition(
        &mut self,
        next: RequestStatus,
        action: &'static str,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.id, self.status, action));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// QUEUED | RETRYING → RUNNING, recording the owner.
    pub fn claim(&mut self, owner: WorkerId, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(RequestStatus::Running, "be claimed", now)?;
        self.owner = Some(owner);
        Ok(())
    }

    /// RUNNING → DONE.
    pub fn complete(&mut self, response: Option<CommandContext>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(RequestStatus::Done, "complete", now)?;
        self.owner = None;
        self.response = response;
        Ok(())
    }

    /// RUNNING → QUEUED as a workflow continuation; `retry_count` is untouched.
    pub fn reschedule(
        &mut self,
        context: CommandContext,
        fire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.transition(RequestStatus::Queued, "be rescheduled", now)?;
        self.owner = None;
        self.context = context;
        self.fire_time = fire_time;
        Ok(())
    }

    /// RUNNING → RETRYING after a failure, counting the attempt.
    pub fn retry(&mut self, fire_time: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(RequestStatus::Retrying, "be retried", now)?;
        self.owner = None;
        self.retry_count += 1;
        self.fire_time = fire_time;
        Ok(())
    }

    /// RUNNING → ERROR once retries are exhausted (or the command is unknown).
    pub fn fail(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(RequestStatus::Error, "fail", now)?;
        self.owner = None;
        Ok(())
    }

    /// QUEUED | RETRYING → CANCELLED.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(RequestStatus::Cancelled, "be cancelled", now)?;
        self.owner = None;
        Ok(())
    }

    /// RUNNING → QUEUED, disowning whichever worker held the claim.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != RequestStatus::Running {
            return Err(DomainError::invalid_transition(self.id, self.status, "be requeued"));
        }
        self.transition(RequestStatus::Queued, "be requeued", now)?;
        self.owner = None;
        Ok(())
    }
}

/// Diagnostic record of one failed execution attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: ErrorId,
    pub request_id: RequestId,
    pub message: String,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(
        request_id: RequestId,
        message: impl Into<String>,
        detail: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ErrorId::new(),
            request_id,
            message: message.into(),
            detail,
            occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn queued() -> Request {
        let now = Utc::now();
        Request::new("test", CommandContext::new(), now, now)
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in RequestStatus::ALL {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert_eq!("retrying".parse::<RequestStatus>().unwrap(), RequestStatus::Retrying);
        assert!(matches!(
            "PAUSED".parse::<RequestStatus>(),
            Err(DomainError::Validation(msg)) if msg.contains("PAUSED")
        ));
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in RequestStatus::TERMINAL {
            for to in RequestStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be forbidden");
            }
        }
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut req = queued();
        let owner = WorkerId::new("w-1");
        let now = Utc::now();

        req.claim(owner.clone(), now).unwrap();
        assert_eq!(req.status, RequestStatus::Running);
        assert!(req.is_owned_by(&owner));

        let response = CommandContext::new().with("ok", true);
        req.complete(Some(response.clone()), now).unwrap();
        assert_eq!(req.status, RequestStatus::Done);
        assert_eq!(req.owner, None);
        assert_eq!(req.response, Some(response));
    }

    #[test]
    fn retry_counts_and_reschedule_does_not() {
        let mut req = queued();
        let now = Utc::now();
        let later = now + Duration::seconds(5);

        req.claim(WorkerId::new("w"), now).unwrap();
        req.retry(later, now).unwrap();
        assert_eq!(req.status, RequestStatus::Retrying);
        assert_eq!(req.retry_count, 1);
        assert_eq!(req.fire_time, later);

        req.claim(WorkerId::new("w"), later).unwrap();
        let next_step = CommandContext::new().with("step", 2);
        req.reschedule(next_step.clone(), later, later).unwrap();
        assert_eq!(req.status, RequestStatus::Queued);
        assert_eq!(req.retry_count, 1);
        assert_eq!(req.context, next_step);
    }

    #[test]
    fn cancel_only_before_claim() {
        let mut req = queued();
        let now = Utc::now();
        req.claim(WorkerId::new("w"), now).unwrap();

        let err = req.cancel(now).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidStateTransition { from: RequestStatus::Running, .. }
        ));
        assert_eq!(req.status, RequestStatus::Running);

        let mut fresh = queued();
        fresh.cancel(now).unwrap();
        assert_eq!(fresh.status, RequestStatus::Cancelled);
    }

    #[test]
    fn requeue_requires_running() {
        let mut req = queued();
        let now = Utc::now();
        assert!(req.requeue(now).is_err());

        req.claim(WorkerId::new("w"), now).unwrap();
        req.requeue(now).unwrap();
        assert_eq!(req.status, RequestStatus::Queued);
        assert_eq!(req.owner, None);
    }

    #[test]
    fn eligibility_honours_fire_time() {
        let now = Utc::now();
        let req = Request::new("later", CommandContext::new(), now + Duration::hours(1), now);
        assert!(!req.is_eligible(now));
        assert!(req.is_eligible(now + Duration::hours(1)));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_status() -> impl Strategy<Value = RequestStatus> {
            prop::sample::select(RequestStatus::ALL.to_vec())
        }

        proptest! {
            /// Property: a status only ever changes along an allowed edge.
            #[test]
            fn operations_respect_state_machine(ops in prop::collection::vec(0u8..7, 0..40)) {
                let mut req = queued();
                let now = Utc::now();
                for op in ops {
                    let before = req.status;
                    let result = match op {
                        0 => req.claim(WorkerId::new("w"), now),
                        1 => req.complete(None, now),
                        2 => req.reschedule(CommandContext::new(), now, now),
                        3 => req.retry(now, now),
                        4 => req.fail(now),
                        5 => req.cancel(now),
                        _ => req.requeue(now),
                    };
                    match result {
                        Ok(()) => prop_assert!(before.can_transition_to(req.status)),
                        Err(_) => prop_assert_eq!(before, req.status),
                    }
                    prop_assert_eq!(req.owner.is_some(), req.status == RequestStatus::Running);
                }
            }

            #[test]
            fn only_claimable_statuses_reach_running(from in any_status()) {
                prop_assert_eq!(from.can_transition_to(RequestStatus::Running), from.is_claimable());
            }
        }
    }
}
