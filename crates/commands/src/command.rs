use std::time::Duration;

use serde::{Deserialize, Serialize};

use forgeexec_core::{CommandContext, RequestId};

/// What a command sees of the request it is executing.
///
/// Commands receive a read-only view; the only way to change the stored
/// context is to return [`CommandOutcome::Reschedule`].
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub request_id: RequestId,
    pub command_name: &'a str,
    pub business_key: Option<&'a str>,
    /// Retry attempts already made (0 on the first execution).
    pub retry_count: u32,
    pub context: &'a CommandContext,
}

/// A unit of business logic executed by a worker.
///
/// ## Execution model
///
/// `execute` is called synchronously on a worker thread and occupies that
/// worker for its full duration. There is no interruption: a command that runs
/// past the staleness threshold is disowned (its request requeued) but keeps
/// running, and whatever it returns afterwards is discarded.
///
/// ## Outcomes
///
/// - `Success`: the request becomes DONE, optionally storing completion data.
/// - `Reschedule`: a new step of a multi-phase job; not counted as a retry.
/// - `Failure`: routed through the retry policy and recorded as an error.
///
/// A panic is caught by the worker and treated as a `Failure`.
///
/// Any `Fn(&Invocation) -> CommandOutcome` closure is a command.
pub trait Command: Send + Sync + 'static {
    fn execute(&self, invocation: &Invocation<'_>) -> CommandOutcome;
}

impl<F> Command for F
where
    F: Fn(&Invocation<'_>) -> CommandOutcome + Send + Sync + 'static,
{
    fn execute(&self, invocation: &Invocation<'_>) -> CommandOutcome {
        self(invocation)
    }
}

/// Result of one command execution.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Completed; optional completion data is stored as the request response.
    Success(Option<CommandContext>),
    /// Continue as a new step with `context` after `delay`.
    Reschedule {
        context: CommandContext,
        delay: Duration,
    },
    /// Failed; eligible for retry.
    Failure(CommandFailure),
}

impl CommandOutcome {
    pub fn success() -> Self {
        Self::Success(None)
    }

    pub fn success_with(response: CommandContext) -> Self {
        Self::Success(Some(response))
    }

    pub fn reschedule(context: CommandContext, delay: Duration) -> Self {
        Self::Reschedule { context, delay }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(CommandFailure::new(message))
    }

    pub fn failure_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Failure(CommandFailure::new(message).with_detail(detail))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CommandOutcome::Success(_) => "success",
            CommandOutcome::Reschedule { .. } => "reschedule",
            CommandOutcome::Failure(_) => "failure",
        }
    }
}

impl<E> From<Result<(), E>> for CommandOutcome
where
    E: std::error::Error,
{
    fn from(value: Result<(), E>) -> Self {
        match value {
            Ok(()) => CommandOutcome::success(),
            Err(err) => CommandOutcome::Failure(CommandFailure::from_error(&err)),
        }
    }
}

/// Diagnostic payload of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub message: String,
    pub detail: Option<String>,
}

impl CommandFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Message from the error itself, detail from its `source()` chain.
    pub fn from_error(err: &dyn std::error::Error) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            message: err.to_string(),
            detail: (!chain.is_empty()).then(|| format!("caused by: {}", chain.join(": "))),
        }
    }
}

impl core::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message)
    }
}
