//! Engine facade: lifecycle, runtime configuration, submission, queries and
//! administration over one store.
//!
//! ## Lifecycle
//!
//! `start()` and `stop()` are idempotent. `start()` first requeues stale
//! RUNNING requests left behind by a previous run (unless sweeping is
//! disabled), then checks the store and spawns `pool_size` worker threads plus
//! the periodic sweeper. If any step fails the engine stays inactive, the
//! failure is logged, and a later `start()` tries again.
//!
//! ## Sharing
//!
//! There is no global instance. An `Engine` is an explicit handle; wrap it in
//! an `Arc` to share it. Dropping an active engine stops it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use forgeexec_commands::CommandRegistry;
use forgeexec_core::{
    Clock, CommandContext, ErrorRecord, Request, RequestId, RequestStatus, SystemClock, TimeUnit,
    WorkerId,
};

use crate::config::{ConfigHandle, ExecutorConfig};
use crate::error::{ExecutorError, ExecutorResult};
use crate::retry::{BackoffRetryPolicy, RetryPolicy};
use crate::scheduler::{ScheduleRequest, Scheduler};
use crate::store::{RequestAdmin, RequestQuery, RequestStore, RequeueStore};
use crate::sweeper::Sweeper;
use crate::worker::{ExecutorStats, SharedStats, Worker, WorkerHandle};

/// Running threads of an active engine.
struct ActivePool {
    workers: Vec<WorkerHandle>,
    sweeper: Option<WorkerHandle>,
    started: Instant,
}

impl Drop for ActivePool {
    fn drop(&mut self) {
        // Signal everyone before joining anyone.
        for handle in self.workers.iter().chain(self.sweeper.iter()) {
            handle.request_shutdown();
        }
        for handle in self.workers.drain(..).chain(self.sweeper.take()) {
            handle.shutdown();
        }
    }
}

pub struct EngineBuilder<S> {
    store: Arc<S>,
    registry: Arc<CommandRegistry>,
    requeue: Option<Arc<dyn RequeueStore>>,
    clock: Arc<dyn Clock>,
    retry_policy: Arc<dyn RetryPolicy>,
    config: ExecutorConfig,
}

impl<S> EngineBuilder<S>
where
    S: RequestStore + RequestQuery + RequestAdmin + 'static,
{
    pub fn registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn shared_registry(mut self, registry: Arc<CommandRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Enable requeue operations and the sweeper through `store`.
    pub fn requeue_store(mut self, store: Arc<dyn RequeueStore>) -> Self {
        self.requeue = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ExecutorResult<Engine<S>> {
        self.config.validate()?;

        let config = ConfigHandle::new(self.config);
        Ok(Engine {
            scheduler: Scheduler::new(self.store.clone(), self.clock.clone()),
            store: self.store,
            registry: self.registry,
            requeue: self.requeue,
            clock: self.clock,
            retry_policy: self.retry_policy,
            config,
            stats: SharedStats::default(),
            pool: Mutex::new(None),
        })
    }
}

impl<S> EngineBuilder<S>
where
    S: RequestStore + RequestQuery + RequestAdmin + RequeueStore + 'static,
{
    /// Use the main store for requeue operations too.
    pub fn requeue_from_store(mut self) -> Self {
        let store: Arc<dyn RequeueStore> = self.store.clone();
        self.requeue = Some(store);
        self
    }
}

/// Command execution engine.
pub struct Engine<S> {
    store: Arc<S>,
    registry: Arc<CommandRegistry>,
    requeue: Option<Arc<dyn RequeueStore>>,
    clock: Arc<dyn Clock>,
    retry_policy: Arc<dyn RetryPolicy>,
    config: ConfigHandle,
    scheduler: Scheduler<S>,
    stats: SharedStats,
    pool: Mutex<Option<ActivePool>>,
}

impl<S> Engine<S>
where
    S: RequestStore + RequestQuery + RequestAdmin + 'static,
{
    /// Builder with a system clock, fixed-delay retries, default config and
    /// no requeue capability.
    pub fn builder(store: Arc<S>) -> EngineBuilder<S> {
        EngineBuilder {
            store,
            registry: Arc::new(CommandRegistry::new()),
            requeue: None,
            clock: Arc::new(SystemClock),
            retry_policy: Arc::new(BackoffRetryPolicy::default()),
            config: ExecutorConfig::default(),
        }
    }

    /// Engine over a store that also supports requeue.
    pub fn new(store: Arc<S>, registry: CommandRegistry, config: ExecutorConfig) -> ExecutorResult<Self>
    where
        S: RequeueStore,
    {
        Self::builder(store)
            .registry(registry)
            .config(config)
            .requeue_from_store()
            .build()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    fn pool(&self) -> MutexGuard<'_, Option<ActivePool>> {
        self.pool.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ---- lifecycle ----

    /// Start the worker pool and sweeper. No-op if already active.
    pub fn start(&self) {
        let mut pool = self.pool();
        if pool.is_some() {
            debug!("executor already active");
            return;
        }

        match self.launch() {
            Ok(active) => {
                let config = self.config.snapshot();
                info!(
                    executor = %config.name,
                    pool_size = active.workers.len(),
                    sweeper = active.sweeper.is_some(),
                    poll_interval = config.poll_interval,
                    unit = config.time_unit.as_str(),
                    "executor started"
                );
                *pool = Some(active);
            }
            Err(e) => {
                let err = ExecutorError::EngineNotStarted(e.to_string());
                warn!(error = %err, "executor failed to start; it stays inactive");
            }
        }
    }

    fn launch(&self) -> ExecutorResult<ActivePool> {
        let config = self.config.snapshot();

        if config.max_running_time >= 0 {
            self.requeue(None)?;
        }
        self.store.ensure_ready()?;

        let mut active = ActivePool {
            workers: Vec::with_capacity(config.pool_size),
            sweeper: None,
            started: Instant::now(),
        };
        for index in 0..config.pool_size {
            let worker = self.new_worker(WorkerId::for_slot(&config.name, index));
            active.workers.push(worker.spawn()?);
        }
        if let Some(sweeper) = self.sweeper() {
            active.sweeper = Some(sweeper.spawn()?);
        }

        Ok(active)
    }

    /// Stop and join every thread. No-op if inactive.
    pub fn stop(&self) {
        let Some(active) = self.pool().take() else {
            debug!("executor already stopped");
            return;
        };
        drop(active);
        info!(executor = %self.config.snapshot().name, "executor stopped");
    }

    pub fn is_active(&self) -> bool {
        self.pool().is_some()
    }

    /// Worker thread count and whether a sweeper runs, while active.
    #[cfg(test)]
    pub(crate) fn pool_shape(&self) -> Option<(usize, bool)> {
        self.pool()
            .as_ref()
            .map(|active| (active.workers.len(), active.sweeper.is_some()))
    }

    /// Pool counters, accumulated across restarts; uptime of the current run.
    pub fn stats(&self) -> ExecutorResult<ExecutorStats> {
        let pool = self.pool();
        let active = pool
            .as_ref()
            .ok_or_else(|| ExecutorError::EngineNotStarted("executor is not running".to_string()))?;

        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone();
        stats.uptime_secs = active.started.elapsed().as_secs();
        Ok(stats)
    }

    /// A worker sharing this engine's store, registry, policy and config, to
    /// be driven manually with [`Worker::run_once`].
    pub fn worker(&self, id: impl Into<String>) -> Worker<S> {
        self.new_worker(WorkerId::new(id))
    }

    fn new_worker(&self, id: WorkerId) -> Worker<S> {
        Worker::new(
            id,
            self.store.clone(),
            self.registry.clone(),
            self.retry_policy.clone(),
            self.clock.clone(),
            self.config.clone(),
            self.stats.clone(),
        )
    }

    fn sweeper(&self) -> Option<Sweeper> {
        self.requeue.as_ref().map(|store| {
            Sweeper::new(
                store.clone(),
                self.clock.clone(),
                self.config.clone(),
                self.stats.clone(),
            )
        })
    }

    // ---- submission ----

    pub fn scheduler(&self) -> Scheduler<S> {
        self.scheduler.clone()
    }

    pub fn schedule(&self, command_name: &str, context: CommandContext) -> ExecutorResult<RequestId> {
        self.scheduler.schedule(command_name, context)
    }

    pub fn schedule_at(
        &self,
        command_name: &str,
        fire_time: DateTime<Utc>,
        context: CommandContext,
    ) -> ExecutorResult<RequestId> {
        self.scheduler.schedule_at(command_name, fire_time, context)
    }

    pub fn schedule_request(&self, request: ScheduleRequest) -> ExecutorResult<RequestId> {
        self.scheduler.schedule_request(request)
    }

    pub fn cancel(&self, id: RequestId) -> ExecutorResult<()> {
        self.scheduler.cancel(id)
    }

    // ---- recovery ----

    /// Bulk requeue of stale RUNNING requests; see [`Sweeper::sweep`].
    /// Returns 0 when the store has no requeue capability.
    pub fn requeue(&self, older_than: Option<i64>) -> ExecutorResult<usize> {
        match self.sweeper() {
            Some(sweeper) => sweeper.sweep(older_than),
            None => {
                debug!("requeue not supported by this store");
                Ok(0)
            }
        }
    }

    /// Force one RUNNING request back to QUEUED. Returns `false` when it was
    /// not RUNNING or the store has no requeue capability.
    pub fn requeue_by_id(&self, id: RequestId) -> ExecutorResult<bool> {
        match self.sweeper() {
            Some(sweeper) => sweeper.requeue_by_id(id),
            None => {
                debug!(request_id = %id, "requeue not supported by this store");
                Ok(false)
            }
        }
    }

    // ---- configuration ----

    pub fn config(&self) -> ExecutorConfig {
        self.config.snapshot()
    }

    pub fn poll_interval(&self) -> u64 {
        self.config.snapshot().poll_interval
    }

    pub fn set_poll_interval(&self, interval: u64) -> ExecutorResult<()> {
        Ok(self.config.update(|c| c.poll_interval = interval)?)
    }

    pub fn time_unit(&self) -> TimeUnit {
        self.config.snapshot().time_unit
    }

    pub fn set_time_unit(&self, unit: TimeUnit) -> ExecutorResult<()> {
        Ok(self.config.update(|c| c.time_unit = unit)?)
    }

    pub fn retries(&self) -> u32 {
        self.config.snapshot().retries
    }

    pub fn set_retries(&self, retries: u32) -> ExecutorResult<()> {
        Ok(self.config.update(|c| c.retries = retries)?)
    }

    pub fn retry_delay(&self) -> u64 {
        self.config.snapshot().retry_delay
    }

    pub fn set_retry_delay(&self, delay: u64) -> ExecutorResult<()> {
        Ok(self.config.update(|c| c.retry_delay = delay)?)
    }

    pub fn pool_size(&self) -> usize {
        self.config.snapshot().pool_size
    }

    /// Takes effect on the next `start()`.
    pub fn set_pool_size(&self, size: usize) -> ExecutorResult<()> {
        Ok(self.config.update(|c| c.pool_size = size)?)
    }

    pub fn max_running_time(&self) -> i64 {
        self.config.snapshot().max_running_time
    }

    pub fn set_max_running_time(&self, threshold: i64) -> ExecutorResult<()> {
        Ok(self.config.update(|c| c.max_running_time = threshold)?)
    }

    pub fn sweep_interval(&self) -> u64 {
        self.config.snapshot().sweep_interval
    }

    pub fn set_sweep_interval(&self, interval: u64) -> ExecutorResult<()> {
        Ok(self.config.update(|c| c.sweep_interval = interval)?)
    }

    // ---- queries ----

    /// QUEUED and RETRYING requests, due or not.
    pub fn queued(&self) -> ExecutorResult<Vec<Request>> {
        self.by_status(&RequestStatus::CLAIMABLE)
    }

    pub fn future_queued(&self) -> ExecutorResult<Vec<Request>> {
        Ok(self.store.future_queued(self.clock.now())?)
    }

    pub fn running(&self) -> ExecutorResult<Vec<Request>> {
        self.by_status(&[RequestStatus::Running])
    }

    pub fn completed(&self) -> ExecutorResult<Vec<Request>> {
        self.by_status(&[RequestStatus::Done])
    }

    pub fn in_error(&self) -> ExecutorResult<Vec<Request>> {
        self.by_status(&[RequestStatus::Error])
    }

    pub fn cancelled(&self) -> ExecutorResult<Vec<Request>> {
        self.by_status(&[RequestStatus::Cancelled])
    }

    /// Claimable requests that are due now.
    pub fn pending(&self) -> ExecutorResult<Vec<Request>> {
        Ok(self.store.pending(self.clock.now())?)
    }

    pub fn pending_by_id(&self, id: RequestId) -> ExecutorResult<Option<Request>> {
        Ok(self.store.pending_by_id(id, self.clock.now())?)
    }

    pub fn by_business_key(&self, key: &str) -> ExecutorResult<Vec<Request>> {
        Ok(self.store.by_business_key(key)?)
    }

    pub fn request_by_id(&self, id: RequestId) -> ExecutorResult<Option<Request>> {
        Ok(self.store.get(id)?)
    }

    pub fn all_requests(&self) -> ExecutorResult<Vec<Request>> {
        Ok(self.store.all_requests()?)
    }

    pub fn requests_by_status(&self, statuses: &[RequestStatus]) -> ExecutorResult<Vec<Request>> {
        self.by_status(statuses)
    }

    fn by_status(&self, statuses: &[RequestStatus]) -> ExecutorResult<Vec<Request>> {
        Ok(self.store.requests_by_status(statuses)?)
    }

    pub fn all_errors(&self) -> ExecutorResult<Vec<ErrorRecord>> {
        Ok(self.store.errors()?)
    }

    pub fn errors_by_request_id(&self, id: RequestId) -> ExecutorResult<Vec<ErrorRecord>> {
        Ok(self.store.errors_for(id)?)
    }

    // ---- administration ----

    /// Delete every DONE, ERROR and CANCELLED request.
    pub fn clear_all_requests(&self) -> ExecutorResult<usize> {
        let count = self.store.clear_all_requests()?;
        info!(count, "cleared terminal requests");
        Ok(count)
    }

    pub fn clear_all_errors(&self) -> ExecutorResult<usize> {
        let count = self.store.clear_all_errors()?;
        info!(count, "cleared error records");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRequestStore;
    use forgeexec_core::ManualClock;

    fn engine() -> Engine<InMemoryRequestStore> {
        Engine::new(
            InMemoryRequestStore::arc(),
            CommandRegistry::new(),
            ExecutorConfig::default().with_name("engine-test"),
        )
        .unwrap()
    }

    #[test]
    fn build_rejects_invalid_config() {
        let result = Engine::builder(InMemoryRequestStore::arc())
            .config(ExecutorConfig::default().with_pool_size(0))
            .build();
        assert!(matches!(result, Err(ExecutorError::Configuration(_))));
    }

    #[test]
    fn stats_require_active_engine() {
        let engine = engine();
        assert!(matches!(engine.stats(), Err(ExecutorError::EngineNotStarted(_))));

        engine.start();
        assert_eq!(engine.stats().unwrap().processed, 0);

        engine.stop();
        assert!(engine.stats().is_err());
    }

    #[test]
    fn setters_validate() {
        let engine = engine();

        engine.set_retries(9).unwrap();
        engine.set_time_unit(TimeUnit::Milliseconds).unwrap();
        engine.set_max_running_time(-1).unwrap();
        assert_eq!(engine.retries(), 9);
        assert_eq!(engine.time_unit(), TimeUnit::Milliseconds);
        assert_eq!(engine.max_running_time(), -1);

        assert!(matches!(engine.set_pool_size(0), Err(ExecutorError::Configuration(_))));
        assert!(matches!(engine.set_poll_interval(0), Err(ExecutorError::Configuration(_))));
        assert_eq!(engine.pool_size(), 1);
    }

    #[test]
    fn requeue_without_capability_is_a_no_op() {
        let clock = ManualClock::starting_now();
        let store = InMemoryRequestStore::arc();
        let engine = Engine::builder(store.clone())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        let id = engine.schedule("job", CommandContext::new()).unwrap();
        store
            .claim(id, RequestStatus::Queued, &WorkerId::new("w"), clock.now())
            .unwrap();
        clock.advance(chrono::Duration::days(1));

        assert_eq!(engine.requeue(Some(0)).unwrap(), 0);
        assert!(!engine.requeue_by_id(id).unwrap());
        assert_eq!(engine.running().unwrap().len(), 1);
    }

    #[test]
    fn pool_size_applies_on_next_start() {
        let engine = engine();
        engine.start();
        engine.set_pool_size(3).unwrap();
        assert_eq!(engine.pool().as_ref().map(|p| p.workers.len()), Some(1));

        engine.stop();
        engine.start();
        assert_eq!(engine.pool().as_ref().map(|p| p.workers.len()), Some(3));
        engine.stop();
    }
}
