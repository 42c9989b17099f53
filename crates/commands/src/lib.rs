//! Commands executed by the engine and the registry that resolves them by name.

pub mod command;
pub mod registry;

pub use command::{Command, CommandFailure, CommandOutcome, Invocation};
pub use registry::{CommandRegistry, ResolutionError};
