//! `forgeexec-core`: executor domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the request record and its status state machine, error records,
//! time units and the clock abstraction.

pub mod context;
pub mod error;
pub mod id;
pub mod request;
pub mod time;

pub use context::CommandContext;
pub use error::{DomainError, DomainResult};
pub use id::{ErrorId, RequestId, WorkerId};
pub use request::{ErrorRecord, Request, RequestStatus};
pub use time::{Clock, ManualClock, SystemClock, TimeUnit};
