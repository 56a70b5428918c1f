//! Versioned memory model: chunks, pages, cells and per-request views.

pub mod cell;
pub mod chunk;
pub mod modifier;
pub mod page;

pub use cell::{AccessError, CellValue, VersionToken, VersionedCell, MAX_VERSION};
pub use chunk::{Chunk, ChunkIndex};
pub use modifier::{ChunkView, MemoryModifier, ResizingType};
pub use page::{migrate_chunk, Page};
