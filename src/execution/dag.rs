//! Dependency-graph plumbing for the scheduler.
//!
//! Nodes live in one dense arena indexed by node id: request nodes first,
//! clique junction nodes after them. Edges are stored forward-only as sorted
//! successor lists; in-degrees are atomic so workers can retire nodes without
//! a lock.

use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicI32, Ordering};

/// One node of the execution DAG.
pub(crate) struct DagNode {
    /// Sorted, deduplicated successor node ids.
    pub successors: Vec<u32>,

    /// Remaining unfinished predecessors.
    pub in_degree: AtomicI32,
}

impl DagNode {
    pub fn new() -> Self {
        Self {
            successors: Vec::new(),
            in_degree: AtomicI32::new(0),
        }
    }
}

/// Recompute every node's in-degree from the successor lists.
pub(crate) fn recount_in_degrees(nodes: &mut [DagNode]) {
    let mut counts = vec![0i32; nodes.len()];
    for node in nodes.iter() {
        for &succ in &node.successors {
            counts[succ as usize] += 1;
        }
    }
    for (node, count) in nodes.iter_mut().zip(counts) {
        *node.in_degree.get_mut() = count;
    }
}

/// Kahn count over a scratch copy of the in-degrees. The graph is a DAG iff
/// every node is reachable by repeatedly removing zero-in-degree nodes.
pub(crate) fn is_acyclic(nodes: &[DagNode]) -> bool {
    let mut degrees: Vec<i32> = nodes
        .iter()
        .map(|node| node.in_degree.load(Ordering::Relaxed))
        .collect();
    let mut stack: Vec<u32> = (0..nodes.len() as u32)
        .filter(|&id| degrees[id as usize] == 0)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = stack.pop() {
        visited += 1;
        for &succ in &nodes[id as usize].successors {
            degrees[succ as usize] -= 1;
            if degrees[succ as usize] == 0 {
                stack.push(succ);
            }
        }
    }
    visited == nodes.len()
}

const SHUTDOWN: u32 = u32::MAX;

/// Multi-consumer FIFO of runnable request ids.
///
/// Draining in arrival order keeps single-threaded execution deterministic.
/// The shutdown sentinel is re-sent on receipt so every waiting worker
/// eventually observes it.
pub(crate) struct ReadyQueue {
    tx: Sender<u32>,
    rx: Receiver<u32>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, id: u32) {
        debug_assert_ne!(id, SHUTDOWN);
        let _ = self.tx.send(id);
    }

    /// Block until a request id is available; `None` once drained.
    pub fn next(&self) -> Option<u32> {
        match self.rx.recv() {
            Ok(SHUTDOWN) => {
                let _ = self.tx.send(SHUTDOWN);
                None
            }
            Ok(id) => Some(id),
            Err(_) => None,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SHUTDOWN);
    }
}
