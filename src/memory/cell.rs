//! Versioned memory cells.
//!
//! A [`VersionedCell`] is one access-controlled window over a chunk with a
//! copy-on-first-write snapshot history. All mutations are buffered in the
//! snapshot list; nothing touches the chunk until the owning request commits
//! and the final contents are flushed. Snapshots are materialized lazily: the
//! first mutation at a version copies the then-current content, so repeated
//! nested save/restore cycles stay cheap and restoring to version zero always
//! recovers the pristine pre-execution bytes.

use crate::memory::chunk::Chunk;
use crate::types::{AccessType, Operation};
use std::sync::Arc;
use thiserror::Error;

/// Upper bound on per-execution version counters.
pub const MAX_VERSION: u16 = 30_000;

/// Token returned by `save_version`, consumed by `restore_version`.
pub type VersionToken = u16;

/// Request-fatal memory access failures.
///
/// Every variant is an `AccessViolation` in the collaborator taxonomy except
/// `VersionOverflow`, `OutOfGas` and `CallDepthOverflow`, which surface as
/// failed executions rather than reverts.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("no access block is defined at offset {offset}")]
    UndefinedBlock { offset: i32 },

    #[error("{op:?} not permitted on {access:?} block at offset {offset}")]
    OperationDenied {
        offset: i32,
        access: AccessType,
        op: Operation,
    },

    #[error("additive operand width {got} does not match block size {expected}")]
    WidthMismatch { expected: i32, got: usize },

    #[error("access of size {len} at index {index} exceeds block size {size}")]
    OutOfBounds { index: u32, len: u32, size: i32 },

    #[error("version limit reached")]
    VersionOverflow,

    #[error("restoring an invalid version {0}")]
    InvalidVersion(u16),

    #[error("no chunk is loaded")]
    ChunkNotLoaded,

    #[error("chunk was not declared in the access map")]
    UndeclaredChunk,

    #[error("no app context is loaded")]
    ContextNotLoaded,

    #[error("chunk is not resizable in the requested direction")]
    ResizeDenied,

    #[error("out of gas")]
    OutOfGas,

    #[error("max call depth reached")]
    CallDepthOverflow,
}

/// Fixed-width integer values storable in a cell, little-endian on the wire.
pub trait CellValue: Copy {
    const WIDTH: usize;

    fn write_le(self, buf: &mut [u8]);
    fn read_le(buf: &[u8]) -> Self;
    fn wrapping_add(self, other: Self) -> Self;
}

macro_rules! impl_cell_value {
    ($($t:ty),*) => {$(
        impl CellValue for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn write_le(self, buf: &mut [u8]) {
                buf[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(buf: &[u8]) -> Self {
                <$t>::from_le_bytes(buf[..Self::WIDTH].try_into().expect("width checked"))
            }

            fn wrapping_add(self, other: Self) -> Self {
                <$t>::wrapping_add(self, other)
            }
        }
    )*};
}

impl_cell_value!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128);

/// Where a cell's pristine bytes live.
#[derive(Clone, Copy, Debug)]
enum CellLocation {
    /// A window of the chunk's content at the given byte offset.
    Content { offset: u32 },

    /// The chunk's logical size word.
    SizeWord,
}

struct Snapshot {
    number: u16,
    content: Box<[u8]>,
}

/// One access-controlled memory window with snapshot history.
///
/// Invariant: snapshot version numbers are strictly increasing; the current
/// content is the newest snapshot, or the pristine chunk bytes when no
/// snapshot exists.
pub struct VersionedCell {
    chunk: Arc<Chunk>,
    location: CellLocation,
    declared_offset: i32,
    size: i32,
    access: AccessType,
    snapshots: Vec<Snapshot>,
}

impl VersionedCell {
    /// Cell over a content window of `chunk`.
    pub fn new(chunk: Arc<Chunk>, offset: i32, size: i32, access: AccessType) -> Self {
        debug_assert!(offset >= 0 && size >= 0);
        Self {
            chunk,
            location: CellLocation::Content {
                offset: offset as u32,
            },
            declared_offset: offset,
            size,
            access,
            snapshots: Vec::new(),
        }
    }

    /// Cell over the chunk's size word (4 bytes, declared at offset -1).
    pub fn size_word(chunk: Arc<Chunk>, access: AccessType) -> Self {
        Self {
            chunk,
            location: CellLocation::SizeWord,
            declared_offset: crate::types::RESIZE_OFFSET,
            size: 4,
            access,
            snapshots: Vec::new(),
        }
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn access(&self) -> AccessType {
        self.access
    }

    /// Whether a block of at least `required` bytes is declared and checkable.
    pub fn is_valid(&self, required: u32) -> bool {
        self.size >= required as i32 && !self.access.denies(Operation::Check)
    }

    /// Typed load at `index` within the cell.
    pub fn read<T: CellValue>(&mut self, version: u16, index: u32) -> Result<T, AccessError> {
        self.check(Operation::Read)?;
        self.check_bounds(index, T::WIDTH as u32)?;
        self.sync_to(version);

        let mut buf = vec![0u8; T::WIDTH];
        self.current_content(index, &mut buf);
        Ok(T::read_le(&buf))
    }

    /// Typed store at `index`, recorded against `version`.
    pub fn write<T: CellValue>(
        &mut self,
        version: u16,
        index: u32,
        value: T,
    ) -> Result<(), AccessError> {
        self.check(Operation::Write)?;
        self.check_bounds(index, T::WIDTH as u32)?;
        self.sync_to(version);
        self.ensure_snapshot(version);

        let content = &mut self.snapshots.last_mut().expect("snapshot ensured").content;
        value.write_le(&mut content[index as usize..]);
        Ok(())
    }

    /// Accumulate an integer delta. The operand width must equal the cell
    /// width. Additive cells accumulate from zero; the pre-block value is
    /// only combined at flush time, which keeps sibling accumulators
    /// commutative.
    pub fn add_int<T: CellValue>(&mut self, version: u16, delta: T) -> Result<(), AccessError> {
        self.check(Operation::IntAdd)?;
        if T::WIDTH as i32 != self.size {
            return Err(AccessError::WidthMismatch {
                expected: self.size,
                got: T::WIDTH,
            });
        }
        self.sync_to(version);

        let current = match self.snapshots.last() {
            Some(snapshot) => T::read_le(&snapshot.content),
            None => T::read_le(&vec![0u8; T::WIDTH]),
        };
        let updated = current.wrapping_add(delta);

        if self.snapshots.last().map(|s| s.number) != Some(version) {
            self.snapshots.push(Snapshot {
                number: version,
                content: vec![0u8; self.size as usize].into_boxed_slice(),
            });
        }
        let content = &mut self.snapshots.last_mut().expect("snapshot ensured").content;
        updated.write_le(content);
        Ok(())
    }

    /// Discard all mutations recorded after `version`.
    pub fn sync_to(&mut self, version: u16) {
        while matches!(self.snapshots.last(), Some(s) if s.number > version) {
            self.snapshots.pop();
        }
    }

    /// Whether the cell holds any surviving mutation.
    pub fn is_mutated(&self) -> bool {
        !self.snapshots.is_empty()
    }

    /// Internal unchecked read of the cell as an `i32`, used for chunk-size
    /// bookkeeping where declared access does not apply.
    pub(crate) fn peek_i32(&mut self, version: u16) -> i32 {
        self.sync_to(version);
        let mut buf = [0u8; 4];
        self.current_content(0, &mut buf);
        i32::from_le_bytes(buf)
    }

    /// Internal unchecked store, used for chunk-size bookkeeping.
    pub(crate) fn poke_i32(&mut self, version: u16, value: i32) {
        self.sync_to(version);
        self.ensure_snapshot(version);
        let content = &mut self.snapshots.last_mut().expect("snapshot ensured").content;
        value.write_le(content);
    }

    /// Flush the final content back to the chunk, clipped to `chunk_size`.
    ///
    /// Additive cells flush as a little-endian delta addition over the
    /// persistent bytes; everything else overwrites. Callers must have
    /// synced the cell to the final execution version first.
    pub(crate) fn write_to_heap(&self, chunk_size: i32) {
        let Some(last) = self.snapshots.last() else {
            return;
        };
        let CellLocation::Content { offset } = self.location else {
            return;
        };

        let writable = (chunk_size as i64 - offset as i64).clamp(0, self.size as i64) as usize;
        if writable == 0 {
            return;
        }

        if self.access == AccessType::IntAdditive {
            self.chunk.add(offset, &last.content[..writable]);
        } else {
            self.chunk.write(offset, &last.content[..writable]);
        }
    }

    fn check(&self, op: Operation) -> Result<(), AccessError> {
        if self.access.denies(op) {
            return Err(AccessError::OperationDenied {
                offset: self.declared_offset,
                access: self.access,
                op,
            });
        }
        Ok(())
    }

    fn check_bounds(&self, index: u32, len: u32) -> Result<(), AccessError> {
        if index as i64 + len as i64 > self.size as i64 {
            return Err(AccessError::OutOfBounds {
                index,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Copy the current content at `index` into `buf`.
    fn current_content(&self, index: u32, buf: &mut [u8]) {
        match self.snapshots.last() {
            Some(snapshot) => {
                let start = index as usize;
                buf.copy_from_slice(&snapshot.content[start..start + buf.len()]);
            }
            None => match self.location {
                CellLocation::Content { offset } => self.chunk.read(offset + index, buf),
                CellLocation::SizeWord => {
                    let bytes = self.chunk.size().to_le_bytes();
                    buf.copy_from_slice(&bytes[index as usize..index as usize + buf.len()]);
                }
            },
        }
    }

    /// Copy-on-first-write: materialize a snapshot for `version` from the
    /// current content unless one already exists.
    fn ensure_snapshot(&mut self, version: u16) {
        debug_assert!(self.snapshots.last().map_or(true, |s| s.number <= version));
        if self.snapshots.last().map(|s| s.number) == Some(version) {
            return;
        }
        let mut content = vec![0u8; self.size as usize].into_boxed_slice();
        self.current_content(0, &mut content);
        self.snapshots.push(Snapshot {
            number: version,
            content,
        });
    }
}
