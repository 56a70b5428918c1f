//! Persistent storage chunks and the block-scoped chunk index.
//!
//! A chunk is a zero-initialized, resizable byte region owned by the storage
//! layer. The core never allocates or frees chunks; it reads and writes
//! within the bounds a request declared. Chunks are always addressed by
//! [`FullId`] through a [`ChunkIndex`], never by pointer.

use crate::types::{BlockError, FullId};
use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

struct Body {
    bytes: Vec<u8>,
    size: i32,
}

/// One storage chunk: a capacity-bounded byte buffer with a logical size.
///
/// New chunks are zero-initialized so that contract execution is
/// deterministic across validators. The logical size is what `writeToHeap`
/// flushes clip against; capacity only grows lazily behind it.
pub struct Chunk {
    body: RwLock<Body>,
}

impl Chunk {
    /// Create an empty chunk with the given initial capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            body: RwLock::new(Body {
                bytes: vec![0u8; capacity],
                size: 0,
            }),
        }
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> i32 {
        self.body.read().size
    }

    /// Set the logical size, growing the zero-filled buffer if needed.
    pub fn set_size(&self, size: i32) {
        let mut body = self.body.write();
        let size = size.max(0);
        if size as usize > body.bytes.len() {
            body.bytes.resize(size as usize, 0);
        }
        body.size = size;
    }

    /// Copy chunk content at `offset` into `buf`, zero-filling past capacity.
    pub fn read(&self, offset: u32, buf: &mut [u8]) {
        let body = self.body.read();
        let start = (offset as usize).min(body.bytes.len());
        let end = (offset as usize + buf.len()).min(body.bytes.len());
        let available = end - start;
        buf[..available].copy_from_slice(&body.bytes[start..end]);
        buf[available..].fill(0);
    }

    /// Overwrite chunk content at `offset`, growing the buffer if needed.
    ///
    /// Only version flushes call this; the conflict graph guarantees no two
    /// concurrently running requests write overlapping ranges.
    pub fn write(&self, offset: u32, data: &[u8]) {
        let mut body = self.body.write();
        let end = offset as usize + data.len();
        if end > body.bytes.len() {
            body.bytes.resize(end, 0);
        }
        body.bytes[offset as usize..end].copy_from_slice(data);
    }

    /// Add a little-endian delta onto the bytes at `offset`, with carry.
    ///
    /// Atomic under the chunk lock: concurrent additive flushes from
    /// causally unordered requests commute instead of losing updates.
    pub fn add(&self, offset: u32, delta: &[u8]) {
        let mut body = self.body.write();
        let end = offset as usize + delta.len();
        if end > body.bytes.len() {
            body.bytes.resize(end, 0);
        }
        let mut carry = 0u16;
        for (dst, src) in body.bytes[offset as usize..end].iter_mut().zip(delta) {
            let sum = *dst as u16 + *src as u16 + carry;
            *dst = sum as u8;
            carry = sum >> 8;
        }
    }

    /// SHA-256 digest over the logical content, for the commit boundary.
    pub fn digest(&self) -> [u8; 32] {
        let body = self.body.read();
        let len = (body.size.max(0) as usize).min(body.bytes.len());
        let mut hasher = Sha256::new();
        hasher.update(body.size.to_le_bytes());
        hasher.update(&body.bytes[..len]);
        hasher.finalize().into()
    }

    /// Snapshot of the logical content (for tests and commit dumps).
    pub fn content(&self) -> Vec<u8> {
        let body = self.body.read();
        let len = (body.size.max(0) as usize).min(body.bytes.len());
        body.bytes[..len].to_vec()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.read();
        f.debug_struct("Chunk")
            .field("size", &body.size)
            .field("capacity", &body.bytes.len())
            .finish()
    }
}

/// Block-scoped arena of chunks addressed by stable id.
///
/// Built by the storage collaborator from the pages a block touches; shared
/// read-only by the scheduler while it builds request memory views.
pub struct ChunkIndex {
    chunks: DashMap<FullId, Arc<Chunk>>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self {
            chunks: DashMap::new(),
        }
    }

    /// Register a chunk under its full id.
    pub fn add_chunk(&self, id: FullId, chunk: Arc<Chunk>) -> Result<(), BlockError> {
        use dashmap::mapref::entry::Entry;
        match self.chunks.entry(id) {
            Entry::Occupied(_) => Err(BlockError::DuplicateChunk(id)),
            Entry::Vacant(slot) => {
                slot.insert(chunk);
                Ok(())
            }
        }
    }

    /// Look up a chunk by id.
    pub fn get_chunk(&self, id: FullId) -> Result<Arc<Chunk>, BlockError> {
        self.chunks
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(BlockError::ChunkNotFound(id))
    }

    pub fn contains(&self, id: FullId) -> bool {
        self.chunks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Digest of one chunk by id.
    pub fn digest(&self, id: FullId) -> Result<[u8; 32], BlockError> {
        Ok(self.get_chunk(id)?.digest())
    }

    /// Per-chunk digests in ascending id order, for the commit boundary.
    pub fn digests(&self) -> Vec<(FullId, [u8; 32])> {
        let mut out: Vec<_> = self
            .chunks
            .iter()
            .map(|entry| (*entry.key(), entry.value().digest()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

impl Default for ChunkIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppId, ChunkId};

    fn full_id(app: u64, chunk: u64) -> FullId {
        FullId::new(AppId(app), ChunkId(chunk))
    }

    #[test]
    fn new_chunk_is_zeroed() {
        let chunk = Chunk::new(64);
        let mut buf = [0xFFu8; 16];
        chunk.read(0, &mut buf);
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(chunk.size(), 0);
        assert_eq!(format!("{chunk:?}"), "Chunk { size: 0, capacity: 64 }");
    }

    #[test]
    fn read_past_capacity_zero_fills() {
        let chunk = Chunk::new(4);
        chunk.write(0, &[1, 2, 3, 4]);
        let mut buf = [0xFFu8; 8];
        chunk.read(2, &mut buf);
        assert_eq!(buf, [3, 4, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn resize_grows_zero_filled() {
        let chunk = Chunk::new(0);
        chunk.set_size(8);
        assert_eq!(chunk.size(), 8);
        assert_eq!(chunk.content(), vec![0u8; 8]);

        chunk.write(4, &[9, 9]);
        chunk.set_size(6);
        assert_eq!(chunk.content(), vec![0, 0, 0, 0, 9, 9]);
    }

    #[test]
    fn add_carries_across_bytes() {
        let chunk = Chunk::new(8);
        chunk.write(0, &0x00FFu64.to_le_bytes());
        chunk.add(0, &0x0001u64.to_le_bytes());
        let mut buf = [0u8; 8];
        chunk.read(0, &mut buf);
        assert_eq!(u64::from_le_bytes(buf), 0x0100);

        chunk.add(0, &u64::MAX.to_le_bytes());
        chunk.read(0, &mut buf);
        assert_eq!(u64::from_le_bytes(buf), 0x0100u64.wrapping_sub(1));
    }

    #[test]
    fn digest_tracks_logical_size() {
        let a = Chunk::new(32);
        let b = Chunk::new(64);
        a.set_size(4);
        b.set_size(4);
        a.write(0, &[7, 7, 7, 7]);
        b.write(0, &[7, 7, 7, 7]);
        // Same logical content, different capacities.
        assert_eq!(a.digest(), b.digest());

        b.write(2, &[8, 8]);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn index_lookup_and_duplicates() {
        let index = ChunkIndex::new();
        let id = full_id(1, 10);
        index.add_chunk(id, Arc::new(Chunk::new(16))).unwrap();

        assert!(index.contains(id));
        assert!(index.get_chunk(id).is_ok());
        assert_eq!(
            index.get_chunk(full_id(1, 11)).unwrap_err(),
            BlockError::ChunkNotFound(full_id(1, 11))
        );
        assert!(index.add_chunk(id, Arc::new(Chunk::new(16))).is_err());
    }

    #[test]
    fn digests_are_sorted_by_id() {
        let index = ChunkIndex::new();
        index.add_chunk(full_id(2, 0), Arc::new(Chunk::new(4))).unwrap();
        index.add_chunk(full_id(1, 9), Arc::new(Chunk::new(4))).unwrap();
        index.add_chunk(full_id(1, 3), Arc::new(Chunk::new(4))).unwrap();

        let ids: Vec<FullId> = index.digests().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![full_id(1, 3), full_id(1, 9), full_id(2, 0)]);
    }
}
