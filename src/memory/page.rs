//! Storage pages and chunk migration.
//!
//! A page holds one native chunk plus any migrant chunks that were moved in
//! from other pages. Migration is an explicit ownership transfer keyed by
//! chunk id; a page whose native chunk still hosts migrants cannot give the
//! native away. Page loading, delta application and Merkle digests belong to
//! the storage collaborator; only the ownership rules live here.

use crate::memory::chunk::Chunk;
use crate::types::{BlockError, FullId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A block-versioned page: one native chunk plus migrants keyed by full id.
pub struct Page {
    block_number: u64,
    native: Option<Arc<Chunk>>,
    migrants: BTreeMap<FullId, Arc<Chunk>>,
}

impl Page {
    /// Create a fresh page for the given block, with an empty native chunk.
    pub fn new(block_number: u64) -> Self {
        Self {
            block_number,
            native: Some(Arc::new(Chunk::new(0))),
            migrants: BTreeMap::new(),
        }
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn native(&self) -> Option<&Arc<Chunk>> {
        self.native.as_ref()
    }

    pub fn migrants(&self) -> &BTreeMap<FullId, Arc<Chunk>> {
        &self.migrants
    }

    /// Move a chunk into this page as a migrant.
    pub fn add_migrant(&mut self, id: FullId, chunk: Arc<Chunk>) -> Result<(), BlockError> {
        match self.migrants.entry(id) {
            std::collections::btree_map::Entry::Occupied(_) => Err(BlockError::MigrantExists(id)),
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(chunk);
                Ok(())
            }
        }
    }

    /// Take a migrant chunk out of this page.
    pub fn extract_migrant(&mut self, id: FullId) -> Result<Arc<Chunk>, BlockError> {
        self.migrants.remove(&id).ok_or(BlockError::NotAMigrant(id))
    }

    /// Take the native chunk out of this page.
    ///
    /// Only legal while the page hosts no migrants; afterwards the page
    /// becomes a moved page in the storage collaborator's tree.
    pub fn extract_native(&mut self) -> Result<Arc<Chunk>, BlockError> {
        if !self.migrants.is_empty() {
            return Err(BlockError::PageHasMigrants);
        }
        self.native.take().ok_or(BlockError::PageHasMigrants)
    }
}

/// Transfer one chunk between two pages by id.
pub fn migrate_chunk(
    from: &mut Page,
    from_native_id: FullId,
    to: &mut Page,
    chunk_id: FullId,
) -> Result<(), BlockError> {
    let chunk = if chunk_id == from_native_id {
        from.extract_native()?
    } else {
        from.extract_migrant(chunk_id)?
    };
    to.add_migrant(chunk_id, chunk)
}
