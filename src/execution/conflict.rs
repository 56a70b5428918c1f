//! Conflict analysis over declared access maps.
//!
//! The analyzer never looks at chunk contents. It merges the access blocks
//! every request declared for each chunk, sweeps them in offset order and
//! derives ordering constraints between requests whose blocks overlap
//! incompatibly. Compatible groups (co-readers, or additive accumulators on
//! the same cell) that collectively collide with one conflictor are reported
//! as cliques so the scheduler can wire them through a single pair of
//! junction nodes instead of a quadratic edge fan.
//!
//! Reserved negative offsets cover conservative ranges: an existence proof
//! covers only itself, a size read covers the size word, and a resize
//! declaration covers the size word plus every offset the resize could
//! expose or cut off.

use crate::types::{
    AccessBlockInfo, AccessType, BlockError, FullId, RequestDescriptor, RequestId,
    EXISTENCE_OFFSET, RESIZE_OFFSET, SIZE_READ_OFFSET,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One end of a derived ordering edge. Clique endpoints refer to the
/// junction nodes the scheduler materializes for `Constraints::cliques`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Endpoint {
    Request(RequestId),
    CliqueEntry(u32),
    CliqueExit(u32),
}

/// Result of conflict analysis: execution-order constraints for one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Compatible groups, each wired entry -> member -> exit by the
    /// scheduler. Members are sorted and distinct.
    pub cliques: Vec<Vec<RequestId>>,

    /// Derived edges: the source must complete before the target starts.
    pub edges: Vec<(Endpoint, Endpoint)>,
}

/// Compatibility class of one access block.
///
/// Blocks sharing a non-unique key may run concurrently even when their
/// covered ranges overlap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum CompatKey {
    ReadLike,
    Additive { offset: i32, size: i32 },
    Unique(u32),
}

struct SweepBlock {
    start: i64,
    end: i64,
    request: RequestId,
    key: CompatKey,
}

/// Byte range a block's declaration covers for conflict purposes.
fn covered_range(block: &AccessBlockInfo) -> (i64, i64) {
    match block.offset {
        EXISTENCE_OFFSET => (-3, -2),
        SIZE_READ_OFFSET => (-2, -1),
        RESIZE_OFFSET => {
            if block.size > 0 {
                // Expansion may expose anything below the upper bound.
                (-2, block.size as i64)
            } else {
                // Shrinking may cut off anything above the lower bound.
                (-2, i64::MAX)
            }
        }
        offset => (offset as i64, offset as i64 + block.size as i64),
    }
}

/// Structural checks on one request's declared map: sorted offsets, no
/// intra-request overlap, sane reserved declarations.
pub fn validate_access_map(request: &RequestDescriptor) -> Result<(), BlockError> {
    let malformed = |reason: String| BlockError::MalformedAccessMap {
        request: request.id,
        reason,
    };
    for chunk_map in request.access_map.values() {
        for blocks in chunk_map.values() {
            let mut prev: Option<&AccessBlockInfo> = None;
            for block in blocks {
                if block.request != request.id {
                    return Err(malformed(format!(
                        "block at offset {} owned by request {}",
                        block.offset, block.request
                    )));
                }
                if block.offset < EXISTENCE_OFFSET {
                    return Err(malformed(format!(
                        "invalid reserved offset {}",
                        block.offset
                    )));
                }
                match block.offset {
                    RESIZE_OFFSET if block.access != AccessType::Writable => {
                        return Err(malformed(format!(
                            "resize declaration must be Writable, got {:?}",
                            block.access
                        )));
                    }
                    SIZE_READ_OFFSET if block.access != AccessType::ReadOnly => {
                        return Err(malformed(format!(
                            "size read declaration must be ReadOnly, got {:?}",
                            block.access
                        )));
                    }
                    EXISTENCE_OFFSET if block.access != AccessType::CheckOnly => {
                        return Err(malformed(format!(
                            "existence declaration must be CheckOnly, got {:?}",
                            block.access
                        )));
                    }
                    SIZE_READ_OFFSET | EXISTENCE_OFFSET if block.size < 0 => {
                        return Err(malformed(format!(
                            "negative size at offset {}",
                            block.offset
                        )));
                    }
                    offset if offset >= 0 && block.size <= 0 => {
                        return Err(malformed(format!(
                            "non-positive size at offset {offset}"
                        )));
                    }
                    _ => {}
                }
                if let Some(prev) = prev {
                    if block.offset <= prev.offset {
                        return Err(malformed("blocks not sorted by offset".into()));
                    }
                    if prev.offset >= 0
                        && prev.offset as i64 + prev.size as i64 > block.offset as i64
                    {
                        return Err(malformed(format!(
                            "blocks at offsets {} and {} overlap",
                            prev.offset, block.offset
                        )));
                    }
                }
                prev = Some(block);
            }
        }
    }
    Ok(())
}

pub struct ConflictAnalyzer<'a> {
    requests: &'a [Arc<RequestDescriptor>],
}

impl<'a> ConflictAnalyzer<'a> {
    pub fn new(requests: &'a [Arc<RequestDescriptor>]) -> Self {
        Self { requests }
    }

    /// Run the full analysis. Fails the block on any malformed access map.
    pub fn analyze(&self) -> Result<Constraints, BlockError> {
        self.validate()?;

        let mut constraints = Constraints::default();
        let mut request_edges: BTreeSet<(RequestId, RequestId)> = BTreeSet::new();
        let mut seen_cliques: BTreeSet<(Vec<RequestId>, RequestId, bool)> = BTreeSet::new();

        for (_, blocks) in self.collect_chunk_blocks() {
            self.analyze_chunk(
                &blocks,
                &mut constraints,
                &mut request_edges,
                &mut seen_cliques,
            );
        }

        for (from, to) in request_edges {
            constraints
                .edges
                .push((Endpoint::Request(from), Endpoint::Request(to)));
        }
        constraints.edges.sort();
        constraints.edges.dedup();
        Ok(constraints)
    }

    fn validate(&self) -> Result<(), BlockError> {
        for request in self.requests {
            validate_access_map(request)?;
        }
        Ok(())
    }

    /// Merge all requests' blocks per chunk, sorted by (start, owner).
    fn collect_chunk_blocks(&self) -> BTreeMap<FullId, Vec<SweepBlock>> {
        let mut per_chunk: BTreeMap<FullId, Vec<SweepBlock>> = BTreeMap::new();
        let mut unique_seq = 0u32;

        for request in self.requests {
            for (&app, chunk_map) in &request.access_map {
                for (&chunk_id, blocks) in chunk_map {
                    let entry = per_chunk.entry(FullId::new(app, chunk_id)).or_default();
                    for block in blocks {
                        let (start, end) = covered_range(block);
                        let key = match block.access {
                            AccessType::ReadOnly | AccessType::CheckOnly
                                if block.offset != RESIZE_OFFSET =>
                            {
                                CompatKey::ReadLike
                            }
                            AccessType::IntAdditive if block.offset >= 0 => CompatKey::Additive {
                                offset: block.offset,
                                size: block.size,
                            },
                            _ => {
                                unique_seq += 1;
                                CompatKey::Unique(unique_seq)
                            }
                        };
                        entry.push(SweepBlock {
                            start,
                            end,
                            request: request.id,
                            key,
                        });
                    }
                }
            }
        }

        for blocks in per_chunk.values_mut() {
            blocks.sort_by_key(|b| (b.start, b.request));
        }
        per_chunk
    }

    /// Sweep one chunk's merged blocks and emit constraints.
    fn analyze_chunk(
        &self,
        blocks: &[SweepBlock],
        constraints: &mut Constraints,
        request_edges: &mut BTreeSet<(RequestId, RequestId)>,
        seen_cliques: &mut BTreeSet<(Vec<RequestId>, RequestId, bool)>,
    ) {
        // Pairwise collisions between overlapping, incompatible blocks of
        // different requests, as (lower index, higher index).
        let mut collisions: BTreeSet<(usize, usize)> = BTreeSet::new();
        let mut active: Vec<usize> = Vec::new();

        for (j, block) in blocks.iter().enumerate() {
            active.retain(|&i| blocks[i].end > block.start);
            for &i in &active {
                let other = &blocks[i];
                if other.request == block.request {
                    continue;
                }
                let compatible = other.key == block.key
                    && !matches!(block.key, CompatKey::Unique(_));
                if !compatible {
                    collisions.insert((i, j));
                }
            }
            active.push(j);
        }

        // Group each block's collision partners by compatibility class.
        // Groups of two or more requests become cliques against the block's
        // owner; everything left falls through to plain pairwise edges.
        let mut neighbors: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &(i, j) in &collisions {
            neighbors.entry(i).or_default().push(j);
            neighbors.entry(j).or_default().push(i);
        }

        let mut consumed: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (&w, partners) in &neighbors {
            let conflictor = blocks[w].request;
            let mut groups: BTreeMap<CompatKey, Vec<usize>> = BTreeMap::new();
            for &n in partners {
                let pair = (w.min(n), w.max(n));
                if consumed.contains(&pair) {
                    continue;
                }
                if !matches!(blocks[n].key, CompatKey::Unique(_)) {
                    groups.entry(blocks[n].key).or_default().push(n);
                }
            }

            for member_blocks in groups.values() {
                let members: BTreeSet<RequestId> =
                    member_blocks.iter().map(|&n| blocks[n].request).collect();
                if members.len() < 2 {
                    continue;
                }
                // Declared adjacency with the conflictor already orders some
                // member; the junction shortcut would fight that ordering.
                if members
                    .iter()
                    .any(|&m| self.declared_ordered(m, conflictor))
                {
                    continue;
                }
                let all_before = members.iter().all(|&m| m < conflictor);
                let all_after = members.iter().all(|&m| m > conflictor);
                if !all_before && !all_after {
                    continue;
                }

                for &n in member_blocks {
                    consumed.insert((w.min(n), w.max(n)));
                }
                let members: Vec<RequestId> = members.into_iter().collect();
                if !seen_cliques.insert((members.clone(), conflictor, all_before)) {
                    continue;
                }
                let idx = constraints.cliques.len() as u32;
                constraints.cliques.push(members);
                if all_before {
                    constraints
                        .edges
                        .push((Endpoint::CliqueExit(idx), Endpoint::Request(conflictor)));
                } else {
                    constraints
                        .edges
                        .push((Endpoint::Request(conflictor), Endpoint::CliqueEntry(idx)));
                }
            }
        }

        for &(i, j) in &collisions {
            if consumed.contains(&(i, j)) {
                continue;
            }
            let (x, y) = (blocks[i].request, blocks[j].request);
            if self.declared_ordered(x, y) {
                continue;
            }
            request_edges.insert((x.min(y), x.max(y)));
        }
    }

    /// Whether declared adjacency already orders the pair, in either
    /// direction.
    fn declared_ordered(&self, x: RequestId, y: RequestId) -> bool {
        self.requests[x as usize].adjacency.contains(&y)
            || self.requests[y as usize].adjacency.contains(&x)
    }
}
