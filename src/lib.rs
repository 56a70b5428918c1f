//! Deterministic parallel execution core for a smart-contract runtime.
//!
//! A block of requests declares its memory footprint up front; conflict
//! analysis turns the declarations into a dependency DAG, and a worker pool
//! drains the DAG so that causally unordered requests run concurrently while
//! every validator observes the same final state. Mutations are buffered in
//! versioned cells and only flushed to chunk storage when a request
//! completes, so reverts and nested-call rollbacks never touch the heap.
//!
//! The crate is collaborator-agnostic: chunk loading, block transport and
//! consensus all live elsewhere and talk to this core through
//! [`types::RequestDescriptor`], [`memory::ChunkIndex`] and the responses
//! returned by [`execution::BlockExecutor`].

pub mod execution;
pub mod memory;
pub mod types;

pub use execution::{BlockExecutor, ExecutionScheduler, ExecutorConfig, Outcome, RequestHandler};
pub use memory::{AccessError, ChunkIndex, MemoryModifier};
pub use types::{
    AccessBlockInfo, AccessType, AppId, BlockError, ChunkId, FullId, RequestDescriptor, RequestId,
    Response,
};
