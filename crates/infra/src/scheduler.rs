//! Request admission and pre-claim cancellation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use forgeexec_core::{Clock, CommandContext, Request, RequestId};

use crate::error::{ExecutorError, ExecutorResult};
use crate::store::{CancelResult, RequestStore};

/// A request to be admitted, with optional business key and fire time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub command_name: String,
    pub context: CommandContext,
    pub business_key: Option<String>,
    /// `None` means "as soon as possible".
    pub fire_time: Option<DateTime<Utc>>,
}

impl ScheduleRequest {
    pub fn new(command_name: impl Into<String>, context: CommandContext) -> Self {
        Self {
            command_name: command_name.into(),
            context,
            business_key: None,
            fire_time: None,
        }
    }

    pub fn business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn fire_at(mut self, fire_time: DateTime<Utc>) -> Self {
        self.fire_time = Some(fire_time);
        self
    }
}

/// Writes new requests and cancels pending ones.
///
/// Command names are not checked against any registry here: the worker that
/// eventually claims the request may live in another process with a different
/// registry. An unknown name surfaces as an error record at execution time.
pub struct Scheduler<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S: RequestStore> Scheduler<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Schedule `command_name` to run as soon as a worker is free.
    pub fn schedule(&self, command_name: &str, context: CommandContext) -> ExecutorResult<RequestId> {
        self.schedule_request(ScheduleRequest::new(command_name, context))
    }

    /// Schedule `command_name` to run no earlier than `fire_time`.
    pub fn schedule_at(
        &self,
        command_name: &str,
        fire_time: DateTime<Utc>,
        context: CommandContext,
    ) -> ExecutorResult<RequestId> {
        self.schedule_request(ScheduleRequest::new(command_name, context).fire_at(fire_time))
    }

    pub fn schedule_request(&self, request: ScheduleRequest) -> ExecutorResult<RequestId> {
        if request.command_name.trim().is_empty() {
            return Err(ExecutorError::Validation("command name must not be empty".to_string()));
        }

        let now = self.clock.now();
        let fire_time = request.fire_time.unwrap_or(now);
        let mut record = Request::new(request.command_name, request.context, fire_time, now);
        record.business_key = request.business_key;

        let id = self.store.insert(record)?;
        info!(
            request_id = %id,
            fire_time = %fire_time,
            delayed = fire_time > now,
            "request scheduled"
        );
        Ok(id)
    }

    /// Cancel a request that has not been claimed yet.
    pub fn cancel(&self, id: RequestId) -> ExecutorResult<()> {
        match self.store.cancel(id, self.clock.now())? {
            CancelResult::Cancelled(request) => {
                info!(request_id = %id, command = %request.command_name, "request cancelled");
                Ok(())
            }
            CancelResult::NotFound => Err(ExecutorError::NoSuchRequest(id)),
            CancelResult::NotCancellable(status) => {
                debug!(request_id = %id, status = %status, "cancel refused");
                Err(ExecutorError::InvalidStateTransition {
                    id,
                    status,
                    action: "be cancelled",
                })
            }
        }
    }
}
