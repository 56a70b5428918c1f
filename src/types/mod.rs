//! Core type definitions for the Vertex execution core.
//!
//! All fundamental identifiers and wire-shaped structures are defined here
//! with explicit layouts and invariant documentation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Application identifier (upper half of a chunk's 128-bit address).
#[derive(Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct AppId(pub u64);

/// Chunk identifier local to one application (lower half of the address).
#[derive(Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

/// Full 128-bit chunk address: `(app, chunk)`.
///
/// The storage collaborator resolves this to physical pages; the core only
/// ever addresses chunks through this id, never through pointers.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FullId {
    pub app: AppId,
    pub chunk: ChunkId,
}

impl FullId {
    pub fn new(app: AppId, chunk: ChunkId) -> Self {
        Self { app, chunk }
    }
}

impl fmt::Debug for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppId(0x{})", hex::encode(self.0.to_be_bytes()))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId(0x{})", hex::encode(self.0.to_be_bytes()))
    }
}

impl fmt::Debug for FullId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FullId(0x{}:0x{})",
            hex::encode(self.app.0.to_be_bytes()),
            hex::encode(self.chunk.0.to_be_bytes())
        )
    }
}

/// Dense per-block request identifier (`0..request_count`).
pub type RequestId = u32;

// ============================================================================
// ACCESS DECLARATIONS
// ============================================================================

/// Memory operation categories checked against an access type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    IntAdd,
    Check,
}

/// Declared access mode of one memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    /// Loads and existence checks only.
    ReadOnly,

    /// Loads, stores and existence checks.
    Writable,

    /// Commutative integer accumulation of the cell's exact width; no loads
    /// or stores. Safe to share between causally unordered requests.
    IntAdditive,

    /// Existence/size checks only; proves the block is declared without
    /// granting any data access.
    CheckOnly,

    /// No operation permitted. Declares the region for conflict analysis
    /// purposes only.
    NonAccessible,
}

impl AccessType {
    /// Whether this access mode forbids the given operation.
    pub fn denies(&self, op: Operation) -> bool {
        !matches!(
            (self, op),
            (AccessType::ReadOnly, Operation::Read)
                | (AccessType::ReadOnly, Operation::Check)
                | (AccessType::Writable, Operation::Read)
                | (AccessType::Writable, Operation::Write)
                | (AccessType::Writable, Operation::Check)
                | (AccessType::IntAdditive, Operation::IntAdd)
                | (AccessType::IntAdditive, Operation::Check)
                | (AccessType::CheckOnly, Operation::Check)
        )
    }
}

/// Reserved offset declaring chunk resizing. The block's `size` field holds
/// the bound: positive for an expandable chunk (upper bound), negative for a
/// shrinkable one (magnitude is the lower bound).
pub const RESIZE_OFFSET: i32 = -1;

/// Reserved offset declaring read access to a chunk's size word.
pub const SIZE_READ_OFFSET: i32 = -2;

/// Reserved offset declaring an existence proof for the chunk.
pub const EXISTENCE_OFFSET: i32 = -3;

/// One declared access window within a chunk.
///
/// The *only* region of the chunk the owning request may touch, and how.
/// Negative offsets are reserved chunk-level declarations (see the
/// `*_OFFSET` constants).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessBlockInfo {
    pub offset: i32,
    pub size: i32,
    pub access: AccessType,
    pub request: RequestId,
}

impl AccessBlockInfo {
    pub fn new(offset: i32, size: i32, access: AccessType, request: RequestId) -> Self {
        Self {
            offset,
            size,
            access,
            request,
        }
    }
}

/// Per-request declared memory footprint: app -> chunk -> sorted block list.
pub type AccessMap = BTreeMap<AppId, BTreeMap<ChunkId, Vec<AccessBlockInfo>>>;

// ============================================================================
// REQUESTS AND RESPONSES
// ============================================================================

/// One contract invocation request, immutable once finalized for a block.
///
/// `adjacency` lists declared successors: ids that must not start before this
/// request completes. Conflict analysis derives further ordering edges from
/// `access_map`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub id: RequestId,

    /// Application whose handler executes this request.
    pub called_app: AppId,

    /// Raw request payload, opaque to the core.
    pub payload: Vec<u8>,

    /// Execution-cost budget; the core only carries it as a scheduling hook.
    pub gas: u64,

    /// Declared memory footprint; block lists sorted ascending by offset.
    pub access_map: AccessMap,

    /// Declared successor ids.
    pub adjacency: BTreeSet<RequestId>,
}

/// Result of one request's execution, returned to the commit collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub request_id: RequestId,
    pub status: u16,
    pub payload: Vec<u8>,
}

/// Collaborator-facing status codes.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL_ERROR: u16 = 500;
    pub const LOOP_DETECTED: u16 = 508;
}

// ============================================================================
// BLOCK-LEVEL ERRORS
// ============================================================================

/// Fatal conditions that invalidate an entire block before execution.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("dependency graph contains a cycle")]
    CycleDetected,

    #[error("malformed access map for request {request}: {reason}")]
    MalformedAccessMap { request: RequestId, reason: String },

    #[error("duplicate request id {0}")]
    DuplicateRequest(RequestId),

    #[error("unknown request id {0}")]
    UnknownRequest(RequestId),

    #[error("chunk {0:?} not present in the index")]
    ChunkNotFound(FullId),

    #[error("chunk {0:?} already present in the index")]
    DuplicateChunk(FullId),

    #[error("migrant {0:?} already exists in the page")]
    MigrantExists(FullId),

    #[error("chunk {0:?} is not a migrant of the page")]
    NotAMigrant(FullId),

    #[error("cannot migrate the native chunk of a page still holding migrants")]
    PageHasMigrants,

    #[error("scheduler misuse: {0}")]
    SchedulerState(&'static str),
}
