//! Parallel block execution.
//!
//! The executor drives a built scheduler with a pool of scoped worker
//! threads. Each worker pulls a runnable request, assembles its memory view,
//! dispatches to the handler registered for the called application and
//! retires the request with a response. Completed requests flush their
//! mutations; reverted and failed ones leave the heap untouched. Because the
//! scheduler only releases causally ordered requests, workers never need a
//! lock around chunk state.

use crate::execution::scheduler::ExecutionScheduler;
use crate::memory::{AccessError, MemoryModifier, VersionToken};
use crate::types::{status, AppId, BlockError, RequestDescriptor, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hard cap on nested handler calls within one request.
pub const MAX_CALL_DEPTH: u32 = 16;

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub worker_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
        }
    }
}

/// How a handler finished, with its response payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Success: mutations flush to the heap.
    Complete(Vec<u8>),

    /// Deliberate rollback: the response is kept, the mutations are not.
    Revert(Vec<u8>),
}

/// Per-request execution state handed to handlers.
///
/// Wraps the request's memory view together with its gas meter and the
/// nested-call bookkeeping. A nested call is bracketed by `enter_call` and
/// either `exit_call` or `rollback_call`; the version token captured on
/// entry scopes the callee's mutations.
pub struct SessionContext<'a> {
    modifier: &'a mut MemoryModifier,
    gas_left: u64,
    call_depth: u32,
}

impl<'a> SessionContext<'a> {
    fn new(modifier: &'a mut MemoryModifier, gas: u64) -> Self {
        Self {
            modifier,
            gas_left: gas,
            call_depth: 0,
        }
    }

    pub fn modifier(&mut self) -> &mut MemoryModifier {
        self.modifier
    }

    pub fn gas_left(&self) -> u64 {
        self.gas_left
    }

    pub fn consume_gas(&mut self, amount: u64) -> Result<(), AccessError> {
        if amount > self.gas_left {
            self.gas_left = 0;
            return Err(AccessError::OutOfGas);
        }
        self.gas_left -= amount;
        Ok(())
    }

    /// Enter a nested call frame, capturing its rollback token.
    pub fn enter_call(&mut self) -> Result<VersionToken, AccessError> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(AccessError::CallDepthOverflow);
        }
        let token = self.modifier.save_version()?;
        self.call_depth += 1;
        Ok(token)
    }

    /// Leave the current frame, keeping its mutations.
    pub fn exit_call(&mut self) {
        debug_assert!(self.call_depth > 0);
        self.call_depth = self.call_depth.saturating_sub(1);
    }

    /// Leave the current frame, discarding everything since its token.
    pub fn rollback_call(&mut self, token: VersionToken) -> Result<(), AccessError> {
        self.modifier.restore_version(token)?;
        self.call_depth = self.call_depth.saturating_sub(1);
        Ok(())
    }
}

/// Application logic invoked for requests addressed to one app id.
pub trait RequestHandler: Send + Sync {
    fn handle(
        &self,
        session: &mut SessionContext<'_>,
        request: &RequestDescriptor,
    ) -> Result<Outcome, AccessError>;
}

impl<F> RequestHandler for F
where
    F: Fn(&mut SessionContext<'_>, &RequestDescriptor) -> Result<Outcome, AccessError>
        + Send
        + Sync,
{
    fn handle(
        &self,
        session: &mut SessionContext<'_>,
        request: &RequestDescriptor,
    ) -> Result<Outcome, AccessError> {
        self(session, request)
    }
}

pub struct BlockExecutor {
    config: ExecutorConfig,
    handlers: HashMap<AppId, Arc<dyn RequestHandler>>,
}

impl BlockExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler(&mut self, app: AppId, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(app, handler);
    }

    /// Build the execution DAG and drain it with the worker pool.
    ///
    /// Fails without running anything when the block is structurally invalid;
    /// individual request failures are reported through response statuses
    /// instead.
    pub fn execute_block(
        &self,
        scheduler: &mut ExecutionScheduler,
    ) -> Result<Vec<Response>, BlockError> {
        scheduler.build_exec_dag()?;
        debug!(
            requests = scheduler.request_count(),
            workers = self.config.worker_threads,
            "executing block"
        );

        let scheduler: &ExecutionScheduler = scheduler;
        std::thread::scope(|scope| {
            for _ in 0..self.config.worker_threads.max(1) {
                scope.spawn(|| self.worker(scheduler));
            }
        });
        Ok(scheduler.responses())
    }

    fn worker(&self, scheduler: &ExecutionScheduler) {
        while let Some(request) = scheduler.next_request() {
            let response = self.run_one(scheduler, &request);
            scheduler.submit_result(response);
        }
    }

    fn run_one(&self, scheduler: &ExecutionScheduler, request: &RequestDescriptor) -> Response {
        let Some(handler) = self.handlers.get(&request.called_app) else {
            warn!(request = request.id, app = ?request.called_app, "no handler registered");
            return Response {
                request_id: request.id,
                status: status::NOT_FOUND,
                payload: Vec::new(),
            };
        };

        let mut modifier = match scheduler.build_modifier_for(request.id) {
            Ok(modifier) => modifier,
            Err(err) => {
                warn!(request = request.id, error = %err, "memory view assembly failed");
                return Response {
                    request_id: request.id,
                    status: status::INTERNAL_ERROR,
                    payload: err.to_string().into_bytes(),
                };
            }
        };

        // The entry token scopes the whole request; a fresh counter cannot
        // overflow here.
        let entry = match modifier.save_version() {
            Ok(token) => token,
            Err(err) => {
                return Response {
                    request_id: request.id,
                    status: status::INTERNAL_ERROR,
                    payload: err.to_string().into_bytes(),
                }
            }
        };

        let mut session = SessionContext::new(&mut modifier, request.gas);
        match handler.handle(&mut session, request) {
            Ok(Outcome::Complete(payload)) => {
                modifier.write_to_heap();
                Response {
                    request_id: request.id,
                    status: status::OK,
                    payload,
                }
            }
            Ok(Outcome::Revert(payload)) => {
                // Best effort: the entry token is always restorable.
                if let Err(err) = modifier.restore_version(entry) {
                    warn!(request = request.id, error = %err, "revert restore failed");
                }
                Response {
                    request_id: request.id,
                    status: status::BAD_REQUEST,
                    payload,
                }
            }
            Err(err) => {
                debug!(request = request.id, error = %err, "request failed");
                let status = match err {
                    AccessError::CallDepthOverflow => status::LOOP_DETECTED,
                    _ => status::INTERNAL_ERROR,
                };
                Response {
                    request_id: request.id,
                    status,
                    payload: err.to_string().into_bytes(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Chunk, ChunkIndex};
    use crate::types::{AccessBlockInfo, AccessMap, AccessType, ChunkId, FullId, RequestId};

    const APP: AppId = AppId(1);
    const CHUNK: ChunkId = ChunkId(10);

    fn access_map(id: RequestId, blocks: Vec<(i32, i32, AccessType)>) -> AccessMap {
        let mut map = AccessMap::new();
        map.entry(APP).or_default().insert(
            CHUNK,
            blocks
                .into_iter()
                .map(|(offset, size, access)| AccessBlockInfo::new(offset, size, access, id))
                .collect(),
        );
        map
    }

    fn request(id: RequestId, blocks: Vec<(i32, i32, AccessType)>) -> RequestDescriptor {
        RequestDescriptor {
            id,
            called_app: APP,
            payload: Vec::new(),
            gas: 1_000_000,
            access_map: access_map(id, blocks),
            adjacency: Default::default(),
        }
    }

    fn scheduler_with_chunk(
        content: &[u8],
        requests: Vec<RequestDescriptor>,
    ) -> (Arc<ChunkIndex>, ExecutionScheduler) {
        let index = Arc::new(ChunkIndex::new());
        let chunk = Arc::new(Chunk::new(content.len()));
        chunk.set_size(content.len() as i32);
        chunk.write(0, content);
        index.add_chunk(FullId::new(APP, CHUNK), chunk).unwrap();

        let mut scheduler = ExecutionScheduler::new(requests.len() as u32, Arc::clone(&index));
        for request in requests {
            scheduler.add_request(request).unwrap();
        }
        (index, scheduler)
    }

    fn executor_with(
        threads: usize,
        handler: impl Fn(&mut SessionContext<'_>, &RequestDescriptor) -> Result<Outcome, AccessError>
            + Send
            + Sync
            + 'static,
    ) -> BlockExecutor {
        let mut executor = BlockExecutor::new(ExecutorConfig {
            worker_threads: threads,
        });
        executor.register_handler(APP, Arc::new(handler));
        executor
    }

    fn heap_u64(index: &ChunkIndex, offset: usize) -> u64 {
        let content = index.get_chunk(FullId::new(APP, CHUNK)).unwrap().content();
        u64::from_le_bytes(content[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn completed_request_flushes_mutations() {
        let (index, mut scheduler) = scheduler_with_chunk(
            &100u64.to_le_bytes(),
            vec![request(0, vec![(0, 8, AccessType::Writable)])],
        );
        let executor = executor_with(1, |session, _| {
            session.modifier().load_context(APP);
            session.modifier().load_chunk(CHUNK)?;
            let balance: u64 = session.modifier().load(0)?;
            session.modifier().store(0, balance + 23)?;
            Ok(Outcome::Complete(Vec::new()))
        });

        let responses = executor.execute_block(&mut scheduler).unwrap();
        assert_eq!(responses[0].status, status::OK);
        assert_eq!(heap_u64(&index, 0), 123);
    }

    #[test]
    fn reverted_request_leaves_heap_untouched() {
        let (index, mut scheduler) = scheduler_with_chunk(
            &100u64.to_le_bytes(),
            vec![request(0, vec![(0, 8, AccessType::Writable)])],
        );
        let executor = executor_with(1, |session, _| {
            session.modifier().load_context(APP);
            session.modifier().load_chunk(CHUNK)?;
            session.modifier().store::<u64>(0, 0)?;
            Ok(Outcome::Revert(b"insufficient balance".to_vec()))
        });

        let responses = executor.execute_block(&mut scheduler).unwrap();
        assert_eq!(responses[0].status, status::BAD_REQUEST);
        assert_eq!(responses[0].payload, b"insufficient balance");
        assert_eq!(heap_u64(&index, 0), 100);
    }

    #[test]
    fn access_violation_discards_and_reports() {
        let (index, mut scheduler) = scheduler_with_chunk(
            &100u64.to_le_bytes(),
            vec![request(0, vec![(0, 8, AccessType::ReadOnly)])],
        );
        let executor = executor_with(1, |session, _| {
            session.modifier().load_context(APP);
            session.modifier().load_chunk(CHUNK)?;
            session.modifier().store::<u64>(0, 7)?;
            Ok(Outcome::Complete(Vec::new()))
        });

        let responses = executor.execute_block(&mut scheduler).unwrap();
        assert_eq!(responses[0].status, status::INTERNAL_ERROR);
        assert_eq!(heap_u64(&index, 0), 100);
    }

    #[test]
    fn missing_handler_yields_not_found() {
        let (_, mut scheduler) = scheduler_with_chunk(
            &[0u8; 8],
            vec![request(0, vec![(0, 8, AccessType::ReadOnly)])],
        );
        let executor = BlockExecutor::new(ExecutorConfig { worker_threads: 1 });

        let responses = executor.execute_block(&mut scheduler).unwrap();
        assert_eq!(responses[0].status, status::NOT_FOUND);
    }

    #[test]
    fn call_depth_overflow_maps_to_loop_detected() {
        let (_, mut scheduler) = scheduler_with_chunk(
            &[0u8; 8],
            vec![request(0, vec![(0, 8, AccessType::ReadOnly)])],
        );
        let executor = executor_with(1, |session, _| {
            loop {
                session.enter_call()?;
            }
        });

        let responses = executor.execute_block(&mut scheduler).unwrap();
        assert_eq!(responses[0].status, status::LOOP_DETECTED);
    }

    #[test]
    fn nested_call_rollback_is_scoped() {
        let (index, mut scheduler) = scheduler_with_chunk(
            &[0u8; 16],
            vec![request(0, vec![(0, 16, AccessType::Writable)])],
        );
        let executor = executor_with(1, |session, _| {
            session.modifier().load_context(APP);
            session.modifier().load_chunk(CHUNK)?;
            session.modifier().store::<u64>(0, 11)?;

            let token = session.enter_call()?;
            session.modifier().store_at::<u64>(0, 8, 22)?;
            assert_eq!(session.modifier().load_at::<u64>(0, 8), Ok(22));
            session.rollback_call(token)?;
            assert_eq!(session.modifier().load_at::<u64>(0, 8), Ok(0));

            Ok(Outcome::Complete(Vec::new()))
        });

        let responses = executor.execute_block(&mut scheduler).unwrap();
        assert_eq!(responses[0].status, status::OK);
        assert_eq!(heap_u64(&index, 0), 11);
        assert_eq!(heap_u64(&index, 8), 0);
    }

    #[test]
    fn out_of_gas_fails_the_request() {
        let (index, mut scheduler) = scheduler_with_chunk(
            &[0u8; 8],
            vec![RequestDescriptor {
                gas: 10,
                ..request(0, vec![(0, 8, AccessType::Writable)])
            }],
        );
        let executor = executor_with(1, |session, _| {
            session.modifier().load_context(APP);
            session.modifier().load_chunk(CHUNK)?;
            session.modifier().store::<u64>(0, 7)?;
            session.consume_gas(100)?;
            Ok(Outcome::Complete(Vec::new()))
        });

        let responses = executor.execute_block(&mut scheduler).unwrap();
        assert_eq!(responses[0].status, status::INTERNAL_ERROR);
        assert_eq!(heap_u64(&index, 0), 0);
    }

    #[test]
    fn parallel_additive_requests_accumulate() {
        let count = 16u32;
        let requests: Vec<RequestDescriptor> = (0..count)
            .map(|id| request(id, vec![(0, 8, AccessType::IntAdditive)]))
            .collect();
        let (index, mut scheduler) = scheduler_with_chunk(&1000u64.to_le_bytes(), requests);

        let executor = executor_with(4, |session, request| {
            session.modifier().load_context(APP);
            session.modifier().load_chunk(CHUNK)?;
            session.modifier().add_int::<u64>(0, (request.id + 1) as u64)?;
            Ok(Outcome::Complete(Vec::new()))
        });

        let responses = executor.execute_block(&mut scheduler).unwrap();
        assert_eq!(responses.len(), count as usize);
        assert!(responses.iter().all(|r| r.status == status::OK));
        let expected: u64 = 1000 + (1..=count as u64).sum::<u64>();
        assert_eq!(heap_u64(&index, 0), expected);
    }
}
