//! Allocation statistics.
//!
//! Everything here is a plain serializable copy taken under the pool locks, so
//! it can be logged as JSON or compared in tests without holding any lock.

use serde::{Deserialize, Serialize};

use super::{
    device::MemoryTypeIndex,
    suballocation::{MemoryId, Suballocation},
};

/// Bookkeeping of one memory block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    /// Identity of the backing memory
    pub memory_id: MemoryId,
    /// Block size in bytes
    pub size: u64,
    /// Free bytes tracked by the block
    pub free_size: u64,
    /// Free ranges tracked by the block
    pub free_count: usize,
    /// Live allocations in the block
    pub allocation_count: usize,
    /// Every suballocation in offset order
    pub suballocations: Vec<Suballocation>,
    /// Registered free ranges in free-list order (ascending size)
    pub free_list: Vec<Suballocation>,
}

/// Usage of one memory type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTypeStats {
    /// The memory type these numbers describe
    pub memory_type: MemoryTypeIndex,
    /// Preferred size of new blocks
    pub preferred_block_size: u64,
    /// Number of pooled blocks
    pub block_count: usize,
    /// Bytes held by pooled blocks
    pub block_bytes: u64,
    /// Free bytes across pooled blocks
    pub free_bytes: u64,
    /// Live pooled allocations
    pub allocation_count: usize,
    /// Largest single free range across pooled blocks
    pub largest_free_range: u64,
    /// Live private allocations
    pub private_count: usize,
    /// Bytes held by private allocations
    pub private_bytes: u64,
}

impl MemoryTypeStats {
    /// Bytes handed out to callers, pooled and private.
    pub fn used_bytes(&self) -> u64 {
        self.block_bytes - self.free_bytes + self.private_bytes
    }

    /// Bytes obtained from the device, pooled and private.
    pub fn device_bytes(&self) -> u64 {
        self.block_bytes + self.private_bytes
    }
}

/// Usage of every memory type of an allocator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// One entry per memory type, in index order
    pub memory_types: Vec<MemoryTypeStats>,
}

impl AllocatorStats {
    /// Total bytes obtained from the device.
    pub fn device_bytes(&self) -> u64 {
        self.memory_types.iter().map(MemoryTypeStats::device_bytes).sum()
    }

    /// Total bytes handed out to callers.
    pub fn used_bytes(&self) -> u64 {
        self.memory_types.iter().map(MemoryTypeStats::used_bytes).sum()
    }

    /// Total live allocations, pooled and private.
    pub fn allocation_count(&self) -> usize {
        self.memory_types
            .iter()
            .map(|stats| stats.allocation_count + stats.private_count)
            .sum()
    }
}
