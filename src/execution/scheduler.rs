//! Conflict-aware request scheduling.
//!
//! The scheduler turns a block's requests into an execution DAG: declared
//! adjacency edges plus the edges conflict analysis derives, with clique
//! junction nodes materialized as synthetic DAG nodes. Workers pull runnable
//! requests from a FIFO ready queue and report results back; retiring a
//! request atomically releases its successors. The whole DAG is checked for
//! cycles before anything runs, so a cyclic block fails as a unit and no
//! request observes partial effects.

use crate::execution::conflict::{validate_access_map, ConflictAnalyzer, Endpoint};
use crate::execution::dag::{is_acyclic, recount_in_degrees, DagNode, ReadyQueue};
use crate::memory::{ChunkIndex, MemoryModifier};
use crate::types::{BlockError, RequestDescriptor, RequestId, Response};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub struct ExecutionScheduler {
    index: Arc<ChunkIndex>,
    requests: Vec<Option<Arc<RequestDescriptor>>>,
    nodes: Vec<DagNode>,
    request_count: u32,
    pending: AtomicUsize,
    queue: ReadyQueue,
    responses: Mutex<Vec<Option<Response>>>,
}

impl ExecutionScheduler {
    /// Scheduler for a block of exactly `request_count` requests with dense
    /// ids `0..request_count`.
    pub fn new(request_count: u32, index: Arc<ChunkIndex>) -> Self {
        Self {
            index,
            requests: vec![None; request_count as usize],
            nodes: Vec::new(),
            request_count,
            pending: AtomicUsize::new(0),
            queue: ReadyQueue::new(),
            responses: Mutex::new(vec![None; request_count as usize]),
        }
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    pub fn chunk_index(&self) -> &Arc<ChunkIndex> {
        &self.index
    }

    /// Register one request. Ids outside the block or already taken fail.
    pub fn add_request(&mut self, request: RequestDescriptor) -> Result<(), BlockError> {
        if request.id >= self.request_count {
            return Err(BlockError::UnknownRequest(request.id));
        }
        let slot = &mut self.requests[request.id as usize];
        if slot.is_some() {
            return Err(BlockError::DuplicateRequest(request.id));
        }
        *slot = Some(Arc::new(request));
        Ok(())
    }

    /// Seal one request: validate its access map and adjacency eagerly so a
    /// malformed request is caught as soon as it is complete rather than at
    /// DAG construction. `build_exec_dag` finalizes any remaining requests
    /// itself.
    pub fn finalize_request(&mut self, id: RequestId) -> Result<(), BlockError> {
        let request = self
            .requests
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(BlockError::UnknownRequest(id))?;

        for &succ in &request.adjacency {
            if succ >= self.request_count {
                return Err(BlockError::UnknownRequest(succ));
            }
            if succ == id {
                return Err(BlockError::CycleDetected);
            }
        }
        validate_access_map(request)
    }

    /// Build and verify the execution DAG, then seed the ready queue.
    ///
    /// Fails the block on a missing request, a malformed access map or a
    /// cyclic dependency graph. No request runs if this returns an error.
    pub fn build_exec_dag(&mut self) -> Result<(), BlockError> {
        let result = self.try_build_dag();
        if result.is_err() {
            // Failed blocks must still drain: wake every waiting worker.
            self.queue.shutdown();
        }
        result
    }

    fn try_build_dag(&mut self) -> Result<(), BlockError> {
        let requests: Vec<Arc<RequestDescriptor>> = self
            .requests
            .iter()
            .enumerate()
            .map(|(id, slot)| {
                slot.clone()
                    .ok_or(BlockError::UnknownRequest(id as RequestId))
            })
            .collect::<Result<_, _>>()?;

        let constraints = ConflictAnalyzer::new(&requests).analyze()?;
        debug!(
            requests = requests.len(),
            derived_edges = constraints.edges.len(),
            cliques = constraints.cliques.len(),
            "execution dag built"
        );

        let n = self.request_count;
        let total = n as usize + 2 * constraints.cliques.len();
        let mut nodes: Vec<DagNode> = (0..total).map(|_| DagNode::new()).collect();

        // Junction node ids: entry at n + 2i, exit right after it.
        let entry = |i: u32| n + 2 * i;
        let exit = |i: u32| n + 2 * i + 1;

        for request in &requests {
            for &succ in &request.adjacency {
                if succ >= n {
                    return Err(BlockError::UnknownRequest(succ));
                }
                if succ == request.id {
                    return Err(BlockError::CycleDetected);
                }
                nodes[request.id as usize].successors.push(succ);
            }
        }

        for (i, members) in constraints.cliques.iter().enumerate() {
            let i = i as u32;
            for &member in members {
                nodes[entry(i) as usize].successors.push(member);
                nodes[member as usize].successors.push(exit(i));
            }
        }

        let resolve = |endpoint: Endpoint| -> u32 {
            match endpoint {
                Endpoint::Request(id) => id,
                Endpoint::CliqueEntry(i) => entry(i),
                Endpoint::CliqueExit(i) => exit(i),
            }
        };
        for &(from, to) in &constraints.edges {
            nodes[resolve(from) as usize].successors.push(resolve(to));
        }

        for node in &mut nodes {
            node.successors.sort_unstable();
            node.successors.dedup();
        }
        recount_in_degrees(&mut nodes);

        if !is_acyclic(&nodes) {
            return Err(BlockError::CycleDetected);
        }

        self.nodes = nodes;
        self.pending.store(n as usize, Ordering::Release);
        if n == 0 {
            self.queue.shutdown();
            return Ok(());
        }

        // Seed in ascending id order; junction nodes with no remaining
        // predecessors retire immediately and release their members.
        for id in 0..self.nodes.len() as u32 {
            if self.nodes[id as usize].in_degree.load(Ordering::Relaxed) == 0 {
                self.node_ready(id);
            }
        }
        Ok(())
    }

    /// Pull the next runnable request; `None` once the block is drained.
    pub fn next_request(&self) -> Option<Arc<RequestDescriptor>> {
        let id = self.queue.next()?;
        Some(Arc::clone(
            self.requests[id as usize].as_ref().expect("request registered"),
        ))
    }

    /// Per-request memory view assembled from the declared access map.
    pub fn build_modifier_for(&self, id: RequestId) -> Result<MemoryModifier, BlockError> {
        let request = self.requests[id as usize]
            .as_ref()
            .ok_or(BlockError::UnknownRequest(id))?;
        MemoryModifier::new(&request.access_map, &self.index)
    }

    /// Record one request's outcome and release its successors.
    pub fn submit_result(&self, response: Response) {
        trace!(request = response.request_id, status = response.status, "request retired");
        let id = response.request_id;
        self.responses.lock()[id as usize] = Some(response);

        for i in 0..self.nodes[id as usize].successors.len() {
            let succ = self.nodes[id as usize].successors[i];
            self.release(succ);
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.shutdown();
        }
    }

    /// Collected responses in request-id order. Call after the drain.
    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().iter().flatten().cloned().collect()
    }

    fn release(&self, node: u32) {
        let before = self.nodes[node as usize].in_degree.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "node {node} released past its in-degree");
        if before == 1 {
            self.node_ready(node);
        }
    }

    /// A node with no unfinished predecessors: requests enter the ready
    /// queue, junction nodes retire on the spot.
    fn node_ready(&self, node: u32) {
        if node < self.request_count {
            self.queue.push(node);
        } else {
            for i in 0..self.nodes[node as usize].successors.len() {
                let succ = self.nodes[node as usize].successors[i];
                self.release(succ);
            }
        }
    }
}
