//! Poll-claim-execute-apply workers.
//!
//! A [`Worker`] performs one cycle per [`Worker::run_once`] call; the pool's
//! threads are plain loops around it. Every write a worker makes after the
//! claim is conditional on still owning the request, so a worker whose claim
//! was swept away cannot clobber the request's newer state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use forgeexec_commands::{CommandOutcome, CommandRegistry, Invocation};
use forgeexec_core::{Clock, ErrorRecord, Request, RequestId, WorkerId};

use crate::config::{ConfigHandle, ExecutorConfig};
use crate::error::{ExecutorError, ExecutorResult};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{OutcomeWrite, RequestStore};

/// Poll rounds per cycle before reporting idle when every claim is lost.
const CLAIM_ROUNDS: usize = 3;

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub rescheduled: u64,
    pub retried: u64,
    pub failed: u64,
    /// Outcomes discarded because the claim had been swept away.
    pub disowned: u64,
    pub requeued: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

pub(crate) type SharedStats = Arc<Mutex<ExecutorStats>>;

pub(crate) fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut ExecutorStats)) {
    f(&mut stats.lock().unwrap_or_else(|p| p.into_inner()));
}

/// How a processed request left RUNNING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Done,
    Rescheduled,
    Retrying,
    Error,
    /// The claim was lost mid-execution; the outcome was not written.
    Disowned,
}

/// Result of one worker cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStep {
    /// Nothing eligible (or every claim attempt lost its race).
    Idle,
    Processed {
        request_id: RequestId,
        command_name: String,
        disposition: Disposition,
    },
}

/// One executor of the pool.
pub struct Worker<S> {
    id: WorkerId,
    store: Arc<S>,
    registry: Arc<CommandRegistry>,
    retry_policy: Arc<dyn RetryPolicy>,
    clock: Arc<dyn Clock>,
    config: ConfigHandle,
    stats: SharedStats,
}

impl<S: RequestStore + 'static> Worker<S> {
    pub(crate) fn new(
        id: WorkerId,
        store: Arc<S>,
        registry: Arc<CommandRegistry>,
        retry_policy: Arc<dyn RetryPolicy>,
        clock: Arc<dyn Clock>,
        config: ConfigHandle,
        stats: SharedStats,
    ) -> Self {
        Self {
            id,
            store,
            registry,
            retry_policy,
            clock,
            config,
            stats,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Poll, claim at most one request, execute it and write its outcome.
    pub fn run_once(&self) -> ExecutorResult<WorkerStep> {
        let config = self.config.snapshot();

        let Some(request) = self.claim_next(&config)? else {
            return Ok(WorkerStep::Idle);
        };

        debug!(
            worker = %self.id,
            request_id = %request.id,
            command = %request.command_name,
            retry_count = request.retry_count,
            "claimed request"
        );

        update_stats(&self.stats, |s| s.current_running += 1);
        let result = self.process(&request, &config);
        update_stats(&self.stats, |s| {
            s.current_running = s.current_running.saturating_sub(1);
            if let Ok(disposition) = &result {
                s.processed += 1;
                match disposition {
                    Disposition::Done => s.succeeded += 1,
                    Disposition::Rescheduled => s.rescheduled += 1,
                    Disposition::Retrying => s.retried += 1,
                    Disposition::Error => s.failed += 1,
                    Disposition::Disowned => s.disowned += 1,
                }
            }
        });

        Ok(WorkerStep::Processed {
            request_id: request.id,
            command_name: request.command_name,
            disposition: result?,
        })
    }

    fn claim_next(&self, config: &ExecutorConfig) -> ExecutorResult<Option<Request>> {
        for _ in 0..CLAIM_ROUNDS {
            let now = self.clock.now();
            let candidates = self.store.eligible(now, config.poll_batch)?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                if let Some(claimed) = self.store.claim(candidate.id, candidate.status, &self.id, now)? {
                    return Ok(Some(claimed));
                }
                debug!(worker = %self.id, request_id = %candidate.id, "claim lost");
            }
        }
        Ok(None)
    }

    fn process(&self, request: &Request, config: &ExecutorConfig) -> ExecutorResult<Disposition> {
        let command = match self.registry.resolve(&request.command_name) {
            Ok(command) => command,
            Err(err) => {
                let message = ExecutorError::from(err).to_string();
                warn!(
                    worker = %self.id,
                    request_id = %request.id,
                    command = %request.command_name,
                    error = %message,
                    "command resolution failed"
                );
                let now = self.clock.now();
                let error = ErrorRecord::new(request.id, message, None, now);
                return self.write(request, OutcomeWrite::Failed { error }, Disposition::Error, now);
            }
        };

        let invocation = Invocation {
            request_id: request.id,
            command_name: &request.command_name,
            business_key: request.business_key.as_deref(),
            retry_count: request.retry_count,
            context: &request.context,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| command.execute(&invocation)))
            .unwrap_or_else(|payload| {
                CommandOutcome::failure(format!("command panicked: {}", panic_message(&*payload)))
            });

        let now = self.clock.now();
        match outcome {
            CommandOutcome::Success(response) => {
                self.write(request, OutcomeWrite::Done { response }, Disposition::Done, now)
            }
            CommandOutcome::Reschedule { context, delay } => {
                let fire_time = after(now, delay);
                debug!(request_id = %request.id, fire_time = %fire_time, "command rescheduled itself");
                self.write(
                    request,
                    OutcomeWrite::Rescheduled { context, fire_time },
                    Disposition::Rescheduled,
                    now,
                )
            }
            CommandOutcome::Failure(failure) => {
                let error = ErrorRecord::new(request.id, failure.message.clone(), failure.detail, now);
                let decision = self.retry_policy.decide(
                    request.retry_count,
                    config.retries,
                    config.retry_base_delay(),
                );

                match decision {
                    RetryDecision::RetryAfter { attempt, delay } => {
                        let fire_time = after(now, delay);
                        warn!(
                            worker = %self.id,
                            request_id = %request.id,
                            command = %request.command_name,
                            error = %failure.message,
                            attempt,
                            max_retries = config.retries,
                            fire_time = %fire_time,
                            "command failed, retrying"
                        );
                        self.write(
                            request,
                            OutcomeWrite::Retrying { fire_time, error },
                            Disposition::Retrying,
                            now,
                        )
                    }
                    RetryDecision::GiveUp => {
                        error!(
                            worker = %self.id,
                            request_id = %request.id,
                            command = %request.command_name,
                            error = %failure.message,
                            retry_count = request.retry_count,
                            "command failed, retries exhausted"
                        );
                        self.write(request, OutcomeWrite::Failed { error }, Disposition::Error, now)
                    }
                }
            }
        }
    }

    fn write(
        &self,
        request: &Request,
        outcome: OutcomeWrite,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> ExecutorResult<Disposition> {
        if self.store.update_outcome(request.id, &self.id, outcome, now)? {
            if disposition == Disposition::Done {
                info!(worker = %self.id, request_id = %request.id, command = %request.command_name, "request done");
            }
            Ok(disposition)
        } else {
            debug!(
                worker = %self.id,
                request_id = %request.id,
                "claim lost during execution, outcome discarded"
            );
            Ok(Disposition::Disowned)
        }
    }

    /// Run the worker on its own thread until shutdown is requested.
    pub(crate) fn spawn(self) -> ExecutorResult<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(self.id.to_string())
            .spawn(move || worker_loop(self, shutdown_rx))
            .map_err(|e| ExecutorError::EngineNotStarted(format!("failed to spawn worker thread: {e}")))?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn worker_loop<S: RequestStore + 'static>(worker: Worker<S>, shutdown_rx: mpsc::Receiver<()>) {
    info!(worker = %worker.id, "worker started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let idle = match worker.run_once() {
            Ok(WorkerStep::Idle) => true,
            Ok(WorkerStep::Processed { .. }) => false,
            Err(e) => {
                error!(worker = %worker.id, error = %e, "worker cycle failed");
                true
            }
        };

        if idle && wait_or_shutdown(&shutdown_rx, worker.config.snapshot().poll_wait()) {
            break;
        }
    }

    info!(worker = %worker.id, "worker stopped");
}

/// Sleep for `wait`, returning `true` early if shutdown was requested.
pub(crate) fn wait_or_shutdown(shutdown_rx: &mpsc::Receiver<()>, wait: Duration) -> bool {
    !matches!(shutdown_rx.recv_timeout(wait), Err(mpsc::RecvTimeoutError::Timeout))
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to stop and join a background thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Ask the thread to stop without waiting for it.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Request shutdown and wait for the thread to finish its current cycle.
    pub fn shutdown(mut self) {
        self.request_shutdown();
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!("background thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.request_shutdown();
        self.join_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffRetryPolicy;
    use crate::store::{InMemoryRequestStore, RequestQuery};
    use forgeexec_core::{CommandContext, ManualClock, RequestStatus};

    struct Fixture {
        store: Arc<InMemoryRequestStore>,
        clock: ManualClock,
        stats: SharedStats,
        worker: Worker<InMemoryRequestStore>,
    }

    fn fixture(registry: CommandRegistry, config: ExecutorConfig) -> Fixture {
        let store = InMemoryRequestStore::arc();
        let clock = ManualClock::starting_now();
        let stats = SharedStats::default();
        let worker = Worker::new(
            WorkerId::new("test-worker"),
            store.clone(),
            Arc::new(registry),
            Arc::new(BackoffRetryPolicy::default()),
            Arc::new(clock.clone()),
            ConfigHandle::new(config),
            stats.clone(),
        );
        Fixture {
            store,
            clock,
            stats,
            worker,
        }
    }

    fn enqueue(f: &Fixture, name: &str, context: CommandContext) -> RequestId {
        let now = f.clock.now();
        f.store.insert(Request::new(name, context, now, now)).unwrap()
    }

    fn disposition(step: WorkerStep) -> Disposition {
        match step {
            WorkerStep::Processed { disposition, .. } => disposition,
            WorkerStep::Idle => panic!("expected a processed request"),
        }
    }

    #[test]
    fn idle_when_nothing_is_due() {
        let f = fixture(CommandRegistry::new(), ExecutorConfig::default());
        assert_eq!(f.worker.run_once().unwrap(), WorkerStep::Idle);
    }

    #[test]
    fn success_stores_response() {
        let registry = CommandRegistry::new().with("echo", |inv: &Invocation<'_>| {
            CommandOutcome::success_with(inv.context.clone().with("echoed", true))
        });
        let f = fixture(registry, ExecutorConfig::default());
        let id = enqueue(&f, "echo", CommandContext::new().with("n", 7));

        assert_eq!(disposition(f.worker.run_once().unwrap()), Disposition::Done);

        let request = f.store.get(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Done);
        assert_eq!(request.owner, None);
        let response = request.response.unwrap();
        assert_eq!(response.get_i64("n"), Some(7));
        assert_eq!(response.get("echoed"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn panics_are_failures() {
        let registry = CommandRegistry::new().with("explode", |_: &Invocation<'_>| -> CommandOutcome {
            panic!("kaboom")
        });
        let f = fixture(registry, ExecutorConfig::default().with_retries(0));
        let id = enqueue(&f, "explode", CommandContext::new());

        assert_eq!(disposition(f.worker.run_once().unwrap()), Disposition::Error);

        let errors = f.store.errors_for(id).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "command panicked: kaboom");
    }

    #[test]
    fn failure_schedules_retry_after_backoff() {
        let registry = CommandRegistry::new()
            .with("flaky", |_: &Invocation<'_>| CommandOutcome::failure_with_detail("timeout", "upstream slow"));
        let f = fixture(registry, ExecutorConfig::default().with_retries(2).with_retry_delay(5));
        let id = enqueue(&f, "flaky", CommandContext::new());
        let t0 = f.clock.now();

        assert_eq!(disposition(f.worker.run_once().unwrap()), Disposition::Retrying);

        let request = f.store.get(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Retrying);
        assert_eq!(request.retry_count, 1);
        assert_eq!(request.fire_time, t0 + chrono::Duration::seconds(5));

        let errors = f.store.errors_for(id).unwrap();
        assert_eq!(errors[0].detail.as_deref(), Some("upstream slow"));

        // Not due yet.
        assert_eq!(f.worker.run_once().unwrap(), WorkerStep::Idle);
    }

    #[test]
    fn unknown_command_goes_straight_to_error() {
        let f = fixture(CommandRegistry::new(), ExecutorConfig::default().with_retries(5));
        let id = enqueue(&f, "Foo", CommandContext::new());

        assert_eq!(disposition(f.worker.run_once().unwrap()), Disposition::Error);

        let request = f.store.get(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Error);
        assert_eq!(request.retry_count, 0);
        let errors = f.store.errors_for(id).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Foo"));
    }

    #[test]
    fn stats_track_dispositions() {
        let registry = CommandRegistry::new()
            .with("ok", |_: &Invocation<'_>| CommandOutcome::success())
            .with("bad", |_: &Invocation<'_>| CommandOutcome::failure("no"));
        let f = fixture(registry, ExecutorConfig::default().with_retries(0));
        enqueue(&f, "ok", CommandContext::new());
        enqueue(&f, "bad", CommandContext::new());

        while f.worker.run_once().unwrap() != WorkerStep::Idle {}

        let stats = f.stats.lock().unwrap().clone();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.current_running, 0);
    }

    #[test]
    fn spawned_worker_stops_promptly() {
        let f = fixture(
            CommandRegistry::new(),
            ExecutorConfig::default().with_poll_interval(60),
        );
        let handle = f.worker.spawn().unwrap();

        let started = std::time::Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
