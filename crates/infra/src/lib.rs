//! Infrastructure layer: request stores, worker pool, sweeper and the engine
//! facade that ties them together.

pub mod config;
pub mod engine;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sweeper;
pub mod worker;


pub use config::{ConfigError, ConfigHandle, ExecutorConfig};
pub use engine::{Engine, EngineBuilder};
pub use error::{ExecutorError, ExecutorResult};
pub use retry::{BackoffRetryPolicy, BackoffStrategy, RetryDecision, RetryPolicy};
pub use scheduler::{ScheduleRequest, Scheduler};
pub use store::{
    CancelResult, InMemoryRequestStore, OutcomeWrite, PostgresRequestStore, RequestAdmin,
    RequestQuery, RequestStore, RequeueStore, StoreError, StoreResult,
};
pub use sweeper::Sweeper;
pub use worker::{Disposition, ExecutorStats, Worker, WorkerHandle, WorkerStep};
