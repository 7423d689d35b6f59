//! Error types for every layer of the allocator.
//!
//! Block-level failures ([`BlockError`]) are ordinary values that the
//! collection reacts to by trying the next block. Only [`AllocationError`]
//! reaches callers of the [`Allocator`](super::Allocator).

use thiserror::Error;

use super::{
    device::MemoryTypeIndex,
    suballocation::{MemoryId, SlotId, SuballocationKind},
};

/// Failure reported by the device abstraction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The heap backing the memory type has no room for the request.
    #[error("device heap for memory type {memory_type} cannot fit {size} bytes")]
    OutOfDeviceMemory {
        /// Memory type the allocation was attempted from
        memory_type: MemoryTypeIndex,
        /// Requested size in bytes
        size: u64,
    },

    /// The device rejected the request for another reason.
    #[error("device allocation failed: {0}")]
    Other(String),
}

/// Block-local outcome of a placement attempt or free.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The block has no contiguous range that can hold the request.
    #[error("block cannot fit {requested} bytes ({available} bytes free)")]
    OutOfBlockSpace {
        /// Requested size in bytes
        requested: u64,
        /// Total free bytes in the block
        available: u64,
    },

    /// A candidate free range failed the alignment or page-sharing check.
    #[error("candidate at offset {offset} conflicts with alignment or buffer-image granularity")]
    AlignmentOrGranularityConflict {
        /// Offset of the rejected free range
        offset: u64,
    },

    /// No live suballocation starts at the given offset.
    #[error("no live suballocation at offset {offset}")]
    UnknownOffset {
        /// Offset presented to free
        offset: u64,
    },

    /// The slot named by a handle has since been freed or reused.
    #[error("stale suballocation handle (slot {}, generation {})", slot.index, slot.generation)]
    StaleSuballocation {
        /// The stale slot id
        slot: SlotId,
    },

    /// No block in the collection is backed by the given memory.
    #[error("memory {0} is not owned by this collection")]
    UnknownMemory(MemoryId),
}

/// Errors surfaced by [`Allocator`](super::Allocator) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// The device could not provide backing memory. Never retried internally.
    #[error("device out of memory while allocating {size} bytes for memory type {memory_type}")]
    DeviceOutOfMemory {
        /// Memory type the request targeted
        memory_type: MemoryTypeIndex,
        /// Size of the device allocation that failed
        size: u64,
        /// Underlying device failure
        #[source]
        source: DeviceError,
    },

    /// No existing block fits and the configuration forbids creating one.
    #[error("memory type {memory_type} pool exhausted for {size} bytes and new blocks are disabled")]
    PoolExhausted {
        /// Memory type the request targeted
        memory_type: MemoryTypeIndex,
        /// Requested size in bytes
        size: u64,
    },

    /// A pooled request is larger than the preferred block size and the
    /// configuration neither routes it privately nor grows blocks for it.
    #[error("request of {size} bytes exceeds block size {block_size} and oversized blocks are rejected")]
    RequestExceedsBlockSize {
        /// Requested size in bytes
        size: u64,
        /// Preferred block size of the memory type
        block_size: u64,
    },

    /// A free named memory that is not live in this allocator. This is a
    /// double free, a stale handle, or a handle from another allocator.
    #[error("invalid free of memory {memory_id} at offset {offset} (memory type {memory_type}): {reason}")]
    InvalidFreeRequest {
        /// Memory type named by the request
        memory_type: MemoryTypeIndex,
        /// Backing memory named by the request
        memory_id: MemoryId,
        /// Offset named by the request
        offset: u64,
        /// Why the request was rejected
        reason: String,
    },

    /// The request itself is malformed.
    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    /// The allocator configuration or device properties are unusable.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Problems loading or validating an [`AllocatorConfig`](super::config::AllocatorConfig).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The JSON text could not be parsed.
    #[error("failed to parse allocator config: {0}")]
    Parse(String),

    /// A field holds a value the allocator cannot work with.
    #[error("field `{field}` is invalid: {reason}")]
    InvalidValue {
        /// Name of the offending field
        field: &'static str,
        /// Description of the constraint
        reason: String,
    },
}

impl From<serde_json::Error> for ConfigError {
    fn from(error: serde_json::Error) -> Self {
        ConfigError::Parse(error.to_string())
    }
}

/// First invariant violation found by a `validate()` pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A suballocation does not start where the previous one ended.
    #[error("suballocation expected at offset {expected} but found at {found}")]
    OffsetMismatch {
        /// Offset implied by the preceding suballocations
        expected: u64,
        /// Offset actually recorded
        found: u64,
    },

    /// A suballocation has zero size.
    #[error("zero-sized suballocation at offset {offset}")]
    ZeroSizedSuballocation {
        /// Offset of the empty entry
        offset: u64,
    },

    /// Two neighbouring suballocations are both free.
    #[error("adjacent free suballocations at offset {offset} were not merged")]
    UnmergedFreeNeighbours {
        /// Offset of the second free entry
        offset: u64,
    },

    /// The suballocations do not end at the block size.
    #[error("suballocations cover {covered} bytes of a {size}-byte block")]
    FinalSizeMismatch {
        /// Bytes covered by the sequence
        covered: u64,
        /// Size of the block
        size: u64,
    },

    /// Tracked free size differs from the sum of free entries.
    #[error("tracked free size {tracked} differs from computed {computed}")]
    FreeSizeMismatch {
        /// Aggregate kept by the block
        tracked: u64,
        /// Aggregate recomputed from the entries
        computed: u64,
    },

    /// Tracked free count differs from the number of free entries.
    #[error("tracked free count {tracked} differs from computed {computed}")]
    FreeCountMismatch {
        /// Count kept by the block
        tracked: usize,
        /// Count recomputed from the entries
        computed: usize,
    },

    /// The free-list does not hold exactly the registrable free entries.
    #[error("free-list holds {registered} entries, expected {expected}")]
    FreeListCountMismatch {
        /// Entries in the free-list
        registered: usize,
        /// Free entries at or above the registration threshold
        expected: usize,
    },

    /// The free-list references an allocated or undersized entry.
    #[error("free-list entry at offset {offset} is {kind:?} with size {size}")]
    FreeListEntryInvalid {
        /// Offset of the referenced entry
        offset: u64,
        /// Size of the referenced entry
        size: u64,
        /// Kind of the referenced entry
        kind: SuballocationKind,
    },

    /// The free-list references the same free range more than once.
    #[error("free range at offset {offset} is registered twice")]
    FreeListDuplicate {
        /// Offset of the duplicated entry
        offset: u64,
    },

    /// The free-list is not sorted ascending by size.
    #[error("free-list is not sorted by size at position {position}")]
    FreeListUnsorted {
        /// Index of the first out-of-order entry
        position: usize,
    },

    /// The node links of the suballocation sequence are inconsistent.
    #[error("suballocation links are corrupt at slot {slot}")]
    LinkCorrupt {
        /// Slot index where the inconsistency was found
        slot: usize,
    },

    /// The collection's aggregate free size differs from its blocks.
    #[error("collection free size {tracked} differs from block total {computed}")]
    CollectionFreeSizeMismatch {
        /// Aggregate kept by the collection
        tracked: u64,
        /// Sum over the blocks
        computed: u64,
    },
}
