//! Request store boundary.
//!
//! The executor never touches storage directly: it goes through the traits in
//! [`r#trait`]. Two adapters ship with the crate: an in-memory store for tests
//! and single-process deployments, and a Postgres store that is safe to share
//! between processes.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryRequestStore;
pub use postgres::PostgresRequestStore;
pub use r#trait::{
    CancelResult, OutcomeWrite, RequestAdmin, RequestQuery, RequestStore, RequeueStore,
    StoreError, StoreResult,
};
