//! Conflict analysis, scheduling and parallel block execution.

pub mod conflict;
mod dag;
pub mod executor;
pub mod scheduler;

pub use conflict::{ConflictAnalyzer, Constraints, Endpoint};
pub use executor::{
    BlockExecutor, ExecutorConfig, Outcome, RequestHandler, SessionContext, MAX_CALL_DEPTH,
};
pub use scheduler::ExecutionScheduler;
