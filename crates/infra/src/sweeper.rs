//! Reclaim of requests stuck in RUNNING.
//!
//! A worker that dies (or hangs) mid-execution leaves its request RUNNING
//! forever. The sweeper puts such requests back to QUEUED once their
//! `updated_at` is older than the staleness threshold. The original execution
//! is not interrupted; when it finishes, its outcome write fails the owner
//! check and is discarded.

use std::sync::{mpsc, Arc};
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use forgeexec_core::{Clock, RequestId};

use crate::config::ConfigHandle;
use crate::error::{ExecutorError, ExecutorResult};
use crate::store::RequeueStore;
use crate::worker::{update_stats, wait_or_shutdown, SharedStats, WorkerHandle};

pub struct Sweeper {
    store: Arc<dyn RequeueStore>,
    clock: Arc<dyn Clock>,
    config: ConfigHandle,
    stats: SharedStats,
}

impl Sweeper {
    pub(crate) fn new(
        store: Arc<dyn RequeueStore>,
        clock: Arc<dyn Clock>,
        config: ConfigHandle,
        stats: SharedStats,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            stats,
        }
    }

    /// Requeue RUNNING requests older than `older_than` time units.
    ///
    /// `None` uses the configured threshold, where a negative value means
    /// sweeping is disabled and nothing is touched. An explicit negative value
    /// is rejected.
    pub fn sweep(&self, older_than: Option<i64>) -> ExecutorResult<usize> {
        let config = self.config.snapshot();
        let threshold = match older_than {
            Some(t) if t < 0 => {
                return Err(ExecutorError::Configuration(format!(
                    "requeue threshold must not be negative, got {t}"
                )));
            }
            Some(t) => t,
            None if config.max_running_time < 0 => return Ok(0),
            None => config.max_running_time,
        };

        let now = self.clock.now();
        let cutoff = now
            .checked_sub_signed(config.time_unit.chrono(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let count = self.store.requeue_stale(cutoff, now)?;
        if count > 0 {
            update_stats(&self.stats, |s| s.requeued += count as u64);
            info!(
                count,
                threshold,
                unit = config.time_unit.as_str(),
                "requeued stale running requests"
            );
        } else {
            debug!(threshold, "no stale running requests");
        }
        Ok(count)
    }

    /// Force one RUNNING request back to QUEUED regardless of age.
    pub fn requeue_by_id(&self, id: RequestId) -> ExecutorResult<bool> {
        let requeued = self.store.requeue_by_id(id, self.clock.now())?;
        if requeued {
            update_stats(&self.stats, |s| s.requeued += 1);
            info!(request_id = %id, "request requeued");
        }
        Ok(requeued)
    }

    /// Sweep every `sweep_interval` until shutdown.
    pub(crate) fn spawn(self) -> ExecutorResult<WorkerHandle> {
        let name = format!("{}-sweeper", self.config.snapshot().name);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || sweeper_loop(self, &name, shutdown_rx))
            .map_err(|e| ExecutorError::EngineNotStarted(format!("failed to spawn sweeper thread: {e}")))?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn sweeper_loop(sweeper: Sweeper, name: &str, shutdown_rx: mpsc::Receiver<()>) {
    info!(sweeper = name, "sweeper started");

    while !wait_or_shutdown(&shutdown_rx, sweeper.config.snapshot().sweep_wait()) {
        if let Err(e) = sweeper.sweep(None) {
            error!(sweeper = name, error = %e, "sweep failed");
        }
    }

    info!(sweeper = name, "sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::store::{InMemoryRequestStore, RequestQuery, RequestStore};
    use chrono::Duration;
    use forgeexec_core::{CommandContext, ManualClock, Request, RequestStatus, TimeUnit, WorkerId};

    fn running(store: &InMemoryRequestStore, at: DateTime<Utc>) -> RequestId {
        let id = store.insert(Request::new("job", CommandContext::new(), at, at)).unwrap();
        store
            .claim(id, RequestStatus::Queued, &WorkerId::new("w"), at)
            .unwrap()
            .unwrap();
        id
    }

    fn sweeper(config: ExecutorConfig) -> (Sweeper, Arc<InMemoryRequestStore>, ManualClock) {
        let store = InMemoryRequestStore::arc();
        let clock = ManualClock::starting_now();
        let sweeper = Sweeper::new(
            store.clone(),
            Arc::new(clock.clone()),
            ConfigHandle::new(config),
            SharedStats::default(),
        );
        (sweeper, store, clock)
    }

    #[test]
    fn sweeps_only_past_threshold() {
        let (sweeper, store, clock) = sweeper(ExecutorConfig::default());
        let id = running(&store, clock.now());

        clock.advance(Duration::seconds(599));
        assert_eq!(sweeper.sweep(None).unwrap(), 0);

        clock.advance(Duration::seconds(2));
        assert_eq!(sweeper.sweep(None).unwrap(), 1);

        let request = store.get(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Queued);
        assert_eq!(request.owner, None);
    }

    #[test]
    fn explicit_threshold_uses_time_unit() {
        let (sweeper, store, clock) =
            sweeper(ExecutorConfig::default().with_time_unit(TimeUnit::Minutes));
        running(&store, clock.now());

        clock.advance(Duration::minutes(3));
        assert_eq!(sweeper.sweep(Some(5)).unwrap(), 0);
        assert_eq!(sweeper.sweep(Some(2)).unwrap(), 1);
    }

    #[test]
    fn negative_thresholds() {
        let (sweeper, store, clock) = sweeper(ExecutorConfig::default().with_max_running_time(-1));
        running(&store, clock.now() - Duration::days(1));

        assert_eq!(sweeper.sweep(None).unwrap(), 0);
        assert!(matches!(sweeper.sweep(Some(-5)), Err(ExecutorError::Configuration(_))));
        assert_eq!(sweeper.sweep(Some(0)).unwrap(), 1);
    }

    #[test]
    fn requeue_by_id_ignores_non_running() {
        let (sweeper, store, clock) = sweeper(ExecutorConfig::default());
        let id = running(&store, clock.now());

        assert!(sweeper.requeue_by_id(id).unwrap());
        assert!(!sweeper.requeue_by_id(id).unwrap());
        assert!(!sweeper.requeue_by_id(RequestId::new()).unwrap());
        assert_eq!(sweeper.stats.lock().unwrap().requeued, 1);
    }
}
