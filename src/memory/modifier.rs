//! Per-request memory views.
//!
//! A [`MemoryModifier`] is the only interface a request handler has to
//! persistent state. It is assembled by the scheduler from the request's
//! declared access map: one [`ChunkView`] per declared chunk, one
//! [`VersionedCell`] per declared block. The modifier owns the request's
//! version counter, so nested call frames can save a token before invoking a
//! callee and roll the whole frame back on failure. Nothing reaches the
//! chunks themselves until `write_to_heap` runs after a successful
//! execution.

use crate::memory::cell::{AccessError, CellValue, VersionedCell, VersionToken, MAX_VERSION};
use crate::memory::chunk::ChunkIndex;
use crate::types::{
    AccessBlockInfo, AccessMap, AccessType, AppId, BlockError, ChunkId, FullId, Operation,
    EXISTENCE_OFFSET, RESIZE_OFFSET, SIZE_READ_OFFSET,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Declared resizability of one chunk within one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizingType {
    /// Size may grow up to the declared upper bound.
    Expandable { upper_bound: i32 },

    /// Size may shrink down to the declared lower bound.
    Shrinkable { lower_bound: i32 },

    /// Size is observable but fixed.
    ReadOnly,

    /// Not even the size is observable; the chunk was declared for conflict
    /// analysis only (or just for an existence proof).
    NonAccessible,
}

/// One request's view of one chunk: the declared cells plus size handling.
pub struct ChunkView {
    chunk: Arc<crate::memory::chunk::Chunk>,
    cells: BTreeMap<i32, VersionedCell>,
    size_cell: Option<VersionedCell>,
    resizing: ResizingType,
    initial_size: i32,
}

impl ChunkView {
    /// Build a view from the sorted block list one request declared for this
    /// chunk. Reserved negative offsets configure size access; non-negative
    /// offsets become content cells.
    pub fn new(chunk: Arc<crate::memory::chunk::Chunk>, blocks: &[AccessBlockInfo]) -> Self {
        let mut cells = BTreeMap::new();
        let mut resizing = ResizingType::NonAccessible;
        let mut size_readable = false;

        for block in blocks {
            match block.offset {
                EXISTENCE_OFFSET => {}
                SIZE_READ_OFFSET => size_readable = true,
                // A resize declaration only grants what its access mode
                // carries; anything but Writable degrades to a size read.
                RESIZE_OFFSET if block.access != AccessType::Writable => {
                    size_readable = true;
                }
                RESIZE_OFFSET => {
                    resizing = if block.size > 0 {
                        ResizingType::Expandable {
                            upper_bound: block.size,
                        }
                    } else {
                        ResizingType::Shrinkable {
                            lower_bound: -block.size,
                        }
                    };
                }
                offset => {
                    cells.insert(
                        offset,
                        VersionedCell::new(Arc::clone(&chunk), offset, block.size, block.access),
                    );
                }
            }
        }

        let size_cell = match (size_readable, resizing) {
            (_, ResizingType::Expandable { .. }) | (_, ResizingType::Shrinkable { .. }) => {
                Some(VersionedCell::size_word(
                    Arc::clone(&chunk),
                    AccessType::Writable,
                ))
            }
            (true, _) => {
                resizing = ResizingType::ReadOnly;
                Some(VersionedCell::size_word(
                    Arc::clone(&chunk),
                    AccessType::ReadOnly,
                ))
            }
            (false, _) => None,
        };

        let initial_size = chunk.size();
        Self {
            chunk,
            cells,
            size_cell,
            resizing,
            initial_size,
        }
    }

    pub fn resizing(&self) -> ResizingType {
        self.resizing
    }

    fn cell_at(&mut self, offset: i32) -> Result<&mut VersionedCell, AccessError> {
        self.cells
            .get_mut(&offset)
            .ok_or(AccessError::UndefinedBlock { offset })
    }

    pub fn load<T: CellValue>(
        &mut self,
        version: u16,
        offset: i32,
        index: u32,
    ) -> Result<T, AccessError> {
        self.cell_at(offset)?.read(version, index)
    }

    pub fn store<T: CellValue>(
        &mut self,
        version: u16,
        offset: i32,
        index: u32,
        value: T,
    ) -> Result<(), AccessError> {
        self.cell_at(offset)?.write(version, index, value)
    }

    pub fn add_int<T: CellValue>(
        &mut self,
        version: u16,
        offset: i32,
        delta: T,
    ) -> Result<(), AccessError> {
        self.cell_at(offset)?.add_int(version, delta)
    }

    /// Whether a `size`-byte block at `offset` lies within the chunk's
    /// current logical bounds. The probe itself must be declared: undeclared
    /// offsets, non-checkable cells and probes past the declared window are
    /// violations, not `false` answers, so every range the caller can reason
    /// about was also visible to conflict analysis.
    pub fn is_valid(&mut self, version: u16, offset: i32, size: u32) -> Result<bool, AccessError> {
        let current_size = self.current_size(version);
        let cell = self
            .cells
            .get(&offset)
            .ok_or(AccessError::UndefinedBlock { offset })?;
        if cell.access().denies(Operation::Check) {
            return Err(AccessError::OperationDenied {
                offset,
                access: cell.access(),
                op: Operation::Check,
            });
        }
        if size as i64 > cell.size() as i64 {
            return Err(AccessError::OutOfBounds {
                index: 0,
                len: size,
                size: cell.size(),
            });
        }
        Ok(offset as i64 + size as i64 <= current_size as i64)
    }

    /// Current logical size of the chunk as this request sees it.
    pub fn chunk_size(&mut self, version: u16) -> Result<i32, AccessError> {
        match &mut self.size_cell {
            Some(cell) => cell.read(version, 0),
            None => Err(AccessError::OperationDenied {
                offset: SIZE_READ_OFFSET,
                access: AccessType::NonAccessible,
                op: Operation::Read,
            }),
        }
    }

    /// Resize the chunk within the declared direction and bound. A new size
    /// of zero deletes the chunk at flush time.
    pub fn update_chunk_size(&mut self, version: u16, new_size: i32) -> Result<(), AccessError> {
        let allowed = match self.resizing {
            ResizingType::Expandable { upper_bound } => {
                new_size >= self.initial_size && new_size <= upper_bound
            }
            ResizingType::Shrinkable { lower_bound } => {
                (new_size <= self.initial_size && new_size >= lower_bound) || new_size == 0
            }
            ResizingType::ReadOnly | ResizingType::NonAccessible => {
                return Err(AccessError::ResizeDenied)
            }
        };
        if !allowed {
            return Err(AccessError::ResizeDenied);
        }
        let cell = self.size_cell.as_mut().expect("resizable views carry a size cell");
        cell.poke_i32(version, new_size);
        Ok(())
    }

    fn current_size(&mut self, version: u16) -> i32 {
        match &mut self.size_cell {
            Some(cell) if cell.is_mutated() => cell.peek_i32(version),
            _ => self.initial_size,
        }
    }

    /// Discard all mutations newer than `version` across every cell.
    fn sync_to(&mut self, version: u16) {
        for cell in self.cells.values_mut() {
            cell.sync_to(version);
        }
        if let Some(cell) = &mut self.size_cell {
            cell.sync_to(version);
        }
    }

    /// Flush surviving mutations into the chunk. The size update applies
    /// first so content writes clip against the final bounds.
    fn write_to_heap(&mut self, version: u16) {
        self.sync_to(version);

        let final_size = self.current_size(version);
        if final_size != self.initial_size {
            self.chunk.set_size(final_size);
        }
        for cell in self.cells.values() {
            cell.write_to_heap(final_size);
        }
    }
}

/// The full memory view of one request across all its declared chunks.
///
/// The version counter protocol: `save_version` returns the current counter
/// and bumps it, so mutations made afterwards are newer than the token.
/// `restore_version(t)` discards every mutation recorded after `t`; token 0
/// always recovers the pristine pre-execution state.
pub struct MemoryModifier {
    current_version: u16,
    chunks: BTreeMap<AppId, BTreeMap<ChunkId, ChunkView>>,
    current_app: Option<AppId>,
    current_chunk: Option<(AppId, ChunkId)>,
}

impl MemoryModifier {
    /// Assemble the view for one request from its access map. Every declared
    /// chunk must already be present in the index.
    pub fn new(access_map: &AccessMap, index: &ChunkIndex) -> Result<Self, BlockError> {
        let mut chunks: BTreeMap<AppId, BTreeMap<ChunkId, ChunkView>> = BTreeMap::new();
        for (&app, chunk_map) in access_map {
            let views = chunks.entry(app).or_default();
            for (&chunk_id, blocks) in chunk_map {
                let chunk = index.get_chunk(FullId::new(app, chunk_id))?;
                views.insert(chunk_id, ChunkView::new(chunk, blocks));
            }
        }
        Ok(Self {
            current_version: 0,
            chunks,
            current_app: None,
            current_chunk: None,
        })
    }

    pub fn version(&self) -> u16 {
        self.current_version
    }

    /// Select the application context for subsequent chunk loads.
    pub fn load_context(&mut self, app: AppId) {
        self.current_app = Some(app);
        self.current_chunk = None;
    }

    /// Select a chunk of the current application context.
    pub fn load_chunk(&mut self, chunk_id: ChunkId) -> Result<(), AccessError> {
        let app = self.current_app.ok_or(AccessError::ContextNotLoaded)?;
        let declared = self
            .chunks
            .get(&app)
            .map_or(false, |views| views.contains_key(&chunk_id));
        if !declared {
            return Err(AccessError::UndeclaredChunk);
        }
        self.current_chunk = Some((app, chunk_id));
        Ok(())
    }

    fn view(&mut self) -> Result<&mut ChunkView, AccessError> {
        let (app, chunk) = self.current_chunk.ok_or(AccessError::ChunkNotLoaded)?;
        Ok(self
            .chunks
            .get_mut(&app)
            .and_then(|views| views.get_mut(&chunk))
            .expect("loaded chunk exists"))
    }

    pub fn load<T: CellValue>(&mut self, offset: i32) -> Result<T, AccessError> {
        self.load_at(offset, 0)
    }

    pub fn load_at<T: CellValue>(&mut self, offset: i32, index: u32) -> Result<T, AccessError> {
        let version = self.current_version;
        self.view()?.load(version, offset, index)
    }

    pub fn store<T: CellValue>(&mut self, offset: i32, value: T) -> Result<(), AccessError> {
        self.store_at(offset, 0, value)
    }

    pub fn store_at<T: CellValue>(
        &mut self,
        offset: i32,
        index: u32,
        value: T,
    ) -> Result<(), AccessError> {
        let version = self.current_version;
        self.view()?.store(version, offset, index, value)
    }

    pub fn add_int<T: CellValue>(&mut self, offset: i32, delta: T) -> Result<(), AccessError> {
        let version = self.current_version;
        self.view()?.add_int(version, offset, delta)
    }

    pub fn is_valid(&mut self, offset: i32, size: u32) -> Result<bool, AccessError> {
        let version = self.current_version;
        self.view()?.is_valid(version, offset, size)
    }

    pub fn chunk_size(&mut self) -> Result<i32, AccessError> {
        let version = self.current_version;
        self.view()?.chunk_size(version)
    }

    pub fn update_chunk_size(&mut self, new_size: i32) -> Result<(), AccessError> {
        let version = self.current_version;
        self.view()?.update_chunk_size(version, new_size)
    }

    /// Capture a rollback token and advance the version counter.
    pub fn save_version(&mut self) -> Result<VersionToken, AccessError> {
        if self.current_version == MAX_VERSION {
            return Err(AccessError::VersionOverflow);
        }
        let token = self.current_version;
        self.current_version += 1;
        Ok(token)
    }

    /// Roll every chunk view back to `token`, discarding newer mutations.
    pub fn restore_version(&mut self, token: VersionToken) -> Result<(), AccessError> {
        if token > self.current_version {
            return Err(AccessError::InvalidVersion(token));
        }
        for views in self.chunks.values_mut() {
            for view in views.values_mut() {
                view.sync_to(token);
            }
        }
        self.current_version = token;
        Ok(())
    }

    /// Flush all surviving mutations into the chunks. Call exactly once,
    /// after the request completed successfully.
    pub fn write_to_heap(&mut self) {
        let version = self.current_version;
        for views in self.chunks.values_mut() {
            for view in views.values_mut() {
                view.write_to_heap(version);
            }
        }
    }
}
