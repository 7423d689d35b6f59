//! # Block Collection Module
//!
//! All memory blocks of one memory type. The collection routes placement
//! attempts across its blocks and keeps them ordered by descending free space,
//! so new allocations land on the roomiest blocks first and nearly full blocks
//! are left alone.

use log::trace;

use super::{
    device::MemoryTypeIndex,
    error::{BlockError, ValidationError},
    memory_block::MemoryBlock,
    stats::MemoryTypeStats,
    suballocation::{MemoryId, SlotId, SuballocationKind},
};

/// Where a pooled allocation was placed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockAllocation {
    /// Block that received the allocation
    pub memory_id: MemoryId,
    /// Offset inside the block
    pub offset: u64,
    /// Slot of the allocation inside the block
    pub slot: SlotId,
}

/// Names a pooled allocation to release.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockFreeRequest {
    /// Block holding the allocation
    pub memory_id: MemoryId,
    /// Offset of the allocation inside the block
    pub offset: u64,
    /// Size of the allocation, when known; only steers the block search
    pub size: Option<u64>,
    /// Slot of the allocation, when freeing through a handle
    pub slot: Option<SlotId>,
}

/// The blocks of one memory type.
#[derive(Debug)]
pub struct BlockCollection<M> {
    memory_type: MemoryTypeIndex,
    blocks: Vec<MemoryBlock<M>>,
    free_size: u64,
}

impl<M> BlockCollection<M> {
    /// Creates an empty collection for `memory_type`.
    pub fn new(memory_type: MemoryTypeIndex) -> Self {
        Self {
            memory_type,
            blocks: Vec::new(),
            free_size: 0,
        }
    }

    /// The memory type served by this collection.
    pub fn memory_type(&self) -> MemoryTypeIndex {
        self.memory_type
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the collection owns no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Free bytes across all blocks.
    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    /// Iterates the blocks in placement order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryBlock<M>> {
        self.blocks.iter()
    }

    /// Looks up the block backed by `memory_id`.
    pub fn find(&self, memory_id: MemoryId) -> Option<&MemoryBlock<M>> {
        self.blocks.iter().find(|block| block.id() == memory_id)
    }

    /// Places the request in the first block that can hold it.
    ///
    /// Returns `None` when every block reports that it is out of space.
    pub fn try_allocate(
        &mut self,
        buffer_image_granularity: u64,
        size: u64,
        alignment: u64,
        kind: SuballocationKind,
    ) -> Option<BlockAllocation> {
        (0..self.blocks.len()).find_map(|index| {
            self.allocate_from_block(index, buffer_image_granularity, size, alignment, kind)
        })
    }

    /// Places the request in the block at `index` only.
    pub fn allocate_from_block(
        &mut self,
        index: usize,
        buffer_image_granularity: u64,
        size: u64,
        alignment: u64,
        kind: SuballocationKind,
    ) -> Option<BlockAllocation> {
        let block = self.blocks.get_mut(index)?;

        match block.request_suballocation(buffer_image_granularity, size, alignment, kind) {
            Ok(request) => {
                let slot = block.allocate(request, kind, size);
                let memory_id = block.id();
                self.free_size -= size;
                Some(BlockAllocation {
                    memory_id,
                    offset: request.offset(),
                    slot,
                })
            }
            Err(error) => {
                trace!(
                    "memory type {}: block {} skipped: {}",
                    self.memory_type,
                    block.id(),
                    error
                );
                None
            }
        }
    }

    /// Adds a block at the end of the placement order and returns its index.
    pub fn insert_block(&mut self, block: MemoryBlock<M>) -> usize {
        self.free_size += block.free_size();
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    /// Releases a pooled allocation and returns the number of bytes freed.
    ///
    /// Large frees search from the back of the placement order, where the
    /// fuller blocks that typically hold large allocations sit. The search
    /// direction has no effect on the result.
    pub fn free(&mut self, request: BlockFreeRequest) -> Result<u64, BlockError> {
        let from_back = request
            .size
            .is_some_and(|size| size > self.free_size / 2);
        let matches = |block: &MemoryBlock<M>| block.id() == request.memory_id;

        let position = if from_back {
            self.blocks.iter().rposition(matches)
        } else {
            self.blocks.iter().position(matches)
        }
        .ok_or(BlockError::UnknownMemory(request.memory_id))?;

        let block = &mut self.blocks[position];
        let freed = match request.slot {
            Some(slot) => block.free_suballocation(slot, request.offset)?,
            None => block.free(request.offset)?,
        };
        self.free_size += freed;

        Ok(freed)
    }

    /// Orders blocks by descending free space and recomputes the aggregate
    /// free size.
    pub fn sort_blocks(&mut self) {
        self.blocks
            .sort_by(|a, b| b.free_size().cmp(&a.free_size()));

        let computed = self.blocks.iter().map(MemoryBlock::free_size).sum();
        debug_assert_eq!(self.free_size, computed);
        self.free_size = computed;
    }

    /// Removes and returns every block without live allocations.
    pub fn remove_empty_blocks(&mut self) -> Vec<MemoryBlock<M>> {
        let (empty, kept): (Vec<_>, Vec<_>) =
            self.blocks.drain(..).partition(MemoryBlock::is_empty);
        self.blocks = kept;
        self.free_size -= empty.iter().map(MemoryBlock::free_size).sum::<u64>();
        empty
    }

    /// Removes and returns every block.
    pub fn drain_blocks(&mut self) -> Vec<MemoryBlock<M>> {
        self.free_size = 0;
        self.blocks.drain(..).collect()
    }

    /// Validates every block and the aggregate free size.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for block in &self.blocks {
            block.validate()?;
        }

        let computed = self.blocks.iter().map(MemoryBlock::free_size).sum();
        if computed != self.free_size {
            return Err(ValidationError::CollectionFreeSizeMismatch {
                tracked: self.free_size,
                computed,
            });
        }

        Ok(())
    }

    /// Writes the pooled half of `stats`.
    pub fn fill_stats(&self, stats: &mut MemoryTypeStats) {
        stats.block_count = self.blocks.len();
        stats.block_bytes = self.blocks.iter().map(MemoryBlock::size).sum();
        stats.free_bytes = self.free_size;
        stats.allocation_count = self.blocks.iter().map(MemoryBlock::allocation_count).sum();
        stats.largest_free_range = self
            .blocks
            .iter()
            .map(MemoryBlock::largest_free_range)
            .max()
            .unwrap_or(0);
    }
}
