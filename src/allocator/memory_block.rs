//! # Memory Block Module
//!
//! A `MemoryBlock` owns one backing device allocation and carves it into
//! suballocations.
//!
//! ## Representation
//!
//! Suballocations live in a slot arena: a dense `Vec` of nodes linked into
//! offset order through `prev`/`next` indices. Slots freed by merging are
//! recycled through a vacancy list, so a node index stays valid for as long as
//! the suballocation it names exists. The free-list stores these indices
//! sorted ascending by size, which allows a best-fit lower-bound search.
//!
//! Every slot carries a generation that advances whenever the slot is freed
//! or vacated. Handles remember the generation they were issued with, so a
//! stale handle is rejected instead of releasing somebody else's memory.
//!
//! ## Invariants
//!
//! After every mutating call:
//! * suballocations are contiguous, start at 0 and end at the block size
//! * no two neighbouring suballocations are both free
//! * `free_size` and `free_count` match the free suballocations
//! * the free-list holds exactly the free suballocations of at least
//!   `min_free_register_size` bytes, sorted ascending by size
//!
//! [`MemoryBlock::validate`] recomputes all of them from scratch.

use std::iter;

use super::{
    error::{BlockError, ValidationError},
    stats::BlockSnapshot,
    suballocation::{
        align_up, are_on_same_page, has_granularity_conflict, MemoryId, SlotId, Suballocation,
        SuballocationKind,
    },
};

/// One entry of the slot arena.
#[derive(Clone, Debug)]
struct Node {
    suballocation: Suballocation,
    prev: Option<usize>,
    next: Option<usize>,
    generation: u32,
    live: bool,
}

/// A verified placement inside a block, produced by
/// [`MemoryBlock::request_suballocation`] and consumed by
/// [`MemoryBlock::allocate`].
///
/// A request is only meaningful for the block that produced it, and only until
/// that block is mutated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SuballocationRequest {
    node: usize,
    offset: u64,
}

impl SuballocationRequest {
    /// Offset the allocation will be placed at.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// A single backing memory region and the suballocations carved out of it.
#[derive(Debug)]
pub struct MemoryBlock<M> {
    id: MemoryId,
    memory: M,
    size: u64,
    nodes: Vec<Node>,
    vacant: Vec<usize>,
    head: usize,
    tail: usize,
    free_list: Vec<usize>,
    free_count: usize,
    free_size: u64,
    allocation_count: usize,
    min_free_register_size: u64,
}

impl<M> MemoryBlock<M> {
    /// Creates a block over `memory` holding a single free suballocation that
    /// spans all `size` bytes.
    ///
    /// Free ranges smaller than `min_free_register_size` are tracked but never
    /// offered for placement.
    pub fn new(id: MemoryId, memory: M, size: u64, min_free_register_size: u64) -> Self {
        debug_assert!(size > 0, "memory blocks cannot be empty");

        let mut block = Self {
            id,
            memory,
            size,
            nodes: Vec::new(),
            vacant: Vec::new(),
            head: 0,
            tail: 0,
            free_list: Vec::new(),
            free_count: 0,
            free_size: 0,
            allocation_count: 0,
            min_free_register_size,
        };

        let index = block.insert_node(Node {
            suballocation: Suballocation {
                offset: 0,
                size,
                kind: SuballocationKind::Free,
            },
            prev: None,
            next: None,
            generation: 0,
            live: true,
        });
        block.head = index;
        block.tail = index;
        block.register_free(index);

        block
    }

    /// Identity of the backing memory.
    pub fn id(&self) -> MemoryId {
        self.id
    }

    /// The backing memory handle.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Consumes the block and returns its backing memory.
    pub fn into_memory(self) -> M {
        self.memory
    }

    /// Total size of the block in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Sum of all free ranges in bytes.
    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    /// Number of free ranges.
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    /// Whether the block holds no allocations at all.
    pub fn is_empty(&self) -> bool {
        self.allocation_count == 0
    }

    /// Size of the largest free range.
    pub fn largest_free_range(&self) -> u64 {
        match self.free_list.last() {
            Some(&index) => self.nodes[index].suballocation.size,
            None => self
                .suballocations()
                .filter(|suballocation| suballocation.kind.is_free())
                .map(|suballocation| suballocation.size)
                .max()
                .unwrap_or(0),
        }
    }

    /// Iterates the suballocations in offset order.
    pub fn suballocations(&self) -> impl Iterator<Item = Suballocation> + '_ {
        iter::successors(Some(self.head), move |&index| self.nodes[index].next)
            .map(move |index| self.nodes[index].suballocation)
    }

    /// Serializable copy of the block's bookkeeping.
    pub fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            memory_id: self.id,
            size: self.size,
            free_size: self.free_size,
            free_count: self.free_count,
            allocation_count: self.allocation_count,
            suballocations: self.suballocations().collect(),
            free_list: self
                .free_list
                .iter()
                .map(|&index| self.nodes[index].suballocation)
                .collect(),
        }
    }

    /// Finds a placement for `size` bytes aligned to `alignment` without
    /// mutating the block.
    ///
    /// The free-list is binary searched for the smallest range that could hold
    /// `size`; that range and every larger one are then verified in turn until
    /// one survives the alignment and granularity checks.
    pub fn request_suballocation(
        &self,
        buffer_image_granularity: u64,
        size: u64,
        alignment: u64,
        kind: SuballocationKind,
    ) -> Result<SuballocationRequest, BlockError> {
        debug_assert!(size > 0);
        debug_assert!(!kind.is_free());

        if self.free_size < size {
            return Err(self.out_of_space(size));
        }

        let start = self
            .free_list
            .partition_point(|&index| self.nodes[index].suballocation.size < size);

        for &node in &self.free_list[start..] {
            if let Ok(offset) =
                self.verify_candidate(node, buffer_image_granularity, size, alignment, kind)
            {
                return Ok(SuballocationRequest { node, offset });
            }
        }

        Err(self.out_of_space(size))
    }

    /// Checks whether the free range starting at `free_offset` can hold the
    /// request and returns the offset it would be placed at.
    pub fn verify_suballocation(
        &self,
        buffer_image_granularity: u64,
        size: u64,
        alignment: u64,
        kind: SuballocationKind,
        free_offset: u64,
    ) -> Result<u64, BlockError> {
        let node = self
            .find_by_offset(free_offset)
            .filter(|&index| self.nodes[index].suballocation.kind.is_free())
            .ok_or(BlockError::UnknownOffset {
                offset: free_offset,
            })?;

        self.verify_candidate(node, buffer_image_granularity, size, alignment, kind)
    }

    /// Commits a request returned by [`request_suballocation`](Self::request_suballocation).
    ///
    /// The chosen free range shrinks to exactly the allocation; leading and
    /// trailing padding become new free ranges.
    pub fn allocate(
        &mut self,
        request: SuballocationRequest,
        kind: SuballocationKind,
        size: u64,
    ) -> SlotId {
        let index = request.node;
        let free = self.nodes[index].suballocation;

        debug_assert!(free.kind.is_free());
        debug_assert!(request.offset >= free.offset);
        debug_assert!(request.offset + size <= free.end());

        let padding_begin = request.offset - free.offset;
        let padding_end = free.size - padding_begin - size;

        self.unregister_free(index);
        self.nodes[index].suballocation = Suballocation {
            offset: request.offset,
            size,
            kind,
        };

        if padding_end > 0 {
            let padding = self.link_after(
                index,
                Suballocation {
                    offset: request.offset + size,
                    size: padding_end,
                    kind: SuballocationKind::Free,
                },
            );
            self.register_free(padding);
        }

        if padding_begin > 0 {
            let padding = self.link_before(
                index,
                Suballocation {
                    offset: free.offset,
                    size: padding_begin,
                    kind: SuballocationKind::Free,
                },
            );
            self.register_free(padding);
        }

        self.allocation_count += 1;

        SlotId {
            index: index as u32,
            generation: self.nodes[index].generation,
        }
    }

    /// Frees the allocation starting exactly at `offset` and returns its size.
    ///
    /// The lookup walks from whichever end of the block is closer to `offset`.
    pub fn free(&mut self, offset: u64) -> Result<u64, BlockError> {
        let index = self
            .find_by_offset(offset)
            .filter(|&index| !self.nodes[index].suballocation.kind.is_free())
            .ok_or(BlockError::UnknownOffset { offset })?;

        Ok(self.release(index))
    }

    /// Frees the allocation named by `slot`, which must still start at `offset`.
    pub fn free_suballocation(&mut self, slot: SlotId, offset: u64) -> Result<u64, BlockError> {
        let index = slot.index as usize;
        let node = self
            .nodes
            .get(index)
            .filter(|node| {
                node.live
                    && node.generation == slot.generation
                    && !node.suballocation.kind.is_free()
            })
            .ok_or(BlockError::StaleSuballocation { slot })?;

        if node.suballocation.offset != offset {
            return Err(BlockError::UnknownOffset { offset });
        }

        Ok(self.release(index))
    }

    /// Recomputes every invariant from scratch and reports the first violation.
    ///
    /// This walks the whole block and is meant for tests and debugging only.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut expected_offset = 0;
        let mut computed_free_size = 0;
        let mut computed_free_count = 0;
        let mut expected_registered = 0;
        let mut previous_free = false;
        let mut visited = 0;
        let mut previous = None;
        let mut cursor = Some(self.head);

        while let Some(index) = cursor {
            let node = self
                .nodes
                .get(index)
                .ok_or(ValidationError::LinkCorrupt { slot: index })?;
            visited += 1;
            if !node.live || node.prev != previous || visited > self.nodes.len() {
                return Err(ValidationError::LinkCorrupt { slot: index });
            }

            let suballocation = node.suballocation;
            if suballocation.offset != expected_offset {
                return Err(ValidationError::OffsetMismatch {
                    expected: expected_offset,
                    found: suballocation.offset,
                });
            }
            if suballocation.size == 0 {
                return Err(ValidationError::ZeroSizedSuballocation {
                    offset: suballocation.offset,
                });
            }

            let free = suballocation.kind.is_free();
            if free && previous_free {
                return Err(ValidationError::UnmergedFreeNeighbours {
                    offset: suballocation.offset,
                });
            }
            previous_free = free;

            if free {
                computed_free_size += suballocation.size;
                computed_free_count += 1;
                if suballocation.size >= self.min_free_register_size {
                    expected_registered += 1;
                }
            }

            expected_offset += suballocation.size;
            previous = Some(index);
            cursor = node.next;
        }

        if previous != Some(self.tail) {
            return Err(ValidationError::LinkCorrupt { slot: self.tail });
        }
        if self.nodes.iter().filter(|node| node.live).count() != visited {
            return Err(ValidationError::LinkCorrupt { slot: self.head });
        }

        if expected_offset != self.size {
            return Err(ValidationError::FinalSizeMismatch {
                covered: expected_offset,
                size: self.size,
            });
        }
        if computed_free_size != self.free_size {
            return Err(ValidationError::FreeSizeMismatch {
                tracked: self.free_size,
                computed: computed_free_size,
            });
        }
        if computed_free_count != self.free_count {
            return Err(ValidationError::FreeCountMismatch {
                tracked: self.free_count,
                computed: computed_free_count,
            });
        }

        if self.free_list.len() != expected_registered {
            return Err(ValidationError::FreeListCountMismatch {
                registered: self.free_list.len(),
                expected: expected_registered,
            });
        }

        let mut last_size = 0;
        let mut registered = vec![false; self.nodes.len()];
        for (position, &index) in self.free_list.iter().enumerate() {
            let node = self
                .nodes
                .get(index)
                .ok_or(ValidationError::LinkCorrupt { slot: index })?;
            let suballocation = node.suballocation;
            if std::mem::replace(&mut registered[index], true) {
                return Err(ValidationError::FreeListDuplicate {
                    offset: suballocation.offset,
                });
            }
            if !node.live
                || !suballocation.kind.is_free()
                || suballocation.size < self.min_free_register_size
            {
                return Err(ValidationError::FreeListEntryInvalid {
                    offset: suballocation.offset,
                    size: suballocation.size,
                    kind: suballocation.kind,
                });
            }
            if suballocation.size < last_size {
                return Err(ValidationError::FreeListUnsorted { position });
            }
            last_size = suballocation.size;
        }

        Ok(())
    }

    fn out_of_space(&self, requested: u64) -> BlockError {
        BlockError::OutOfBlockSpace {
            requested,
            available: self.free_size,
        }
    }

    fn verify_candidate(
        &self,
        node: usize,
        buffer_image_granularity: u64,
        size: u64,
        alignment: u64,
        kind: SuballocationKind,
    ) -> Result<u64, BlockError> {
        let free = self.nodes[node].suballocation;
        debug_assert!(free.kind.is_free());

        if free.size < size {
            return Err(self.out_of_space(size));
        }

        let mut offset = align_up(free.offset, alignment);

        if buffer_image_granularity > 1 {
            let mut previous = self.nodes[node].prev;
            while let Some(index) = previous {
                let neighbour = self.nodes[index].suballocation;
                if !are_on_same_page(
                    neighbour.offset,
                    neighbour.size,
                    offset,
                    buffer_image_granularity,
                ) {
                    break;
                }
                if has_granularity_conflict(neighbour.kind, kind) {
                    offset = align_up(offset, buffer_image_granularity);
                    break;
                }
                previous = self.nodes[index].prev;
            }
        }

        let padding_begin = offset - free.offset;
        if padding_begin + size > free.size {
            return Err(BlockError::AlignmentOrGranularityConflict {
                offset: free.offset,
            });
        }

        if buffer_image_granularity > 1 {
            let mut following = self.nodes[node].next;
            while let Some(index) = following {
                let neighbour = self.nodes[index].suballocation;
                if !are_on_same_page(offset, size, neighbour.offset, buffer_image_granularity) {
                    break;
                }
                if has_granularity_conflict(kind, neighbour.kind) {
                    return Err(BlockError::AlignmentOrGranularityConflict {
                        offset: free.offset,
                    });
                }
                following = self.nodes[index].next;
            }
        }

        Ok(offset)
    }

    fn find_by_offset(&self, offset: u64) -> Option<usize> {
        if offset >= self.size {
            return None;
        }

        let mut cursor = Some(if offset < self.size / 2 {
            self.head
        } else {
            self.tail
        });
        let forward = offset < self.size / 2;

        while let Some(index) = cursor {
            let node = &self.nodes[index];
            let node_offset = node.suballocation.offset;
            if node_offset == offset {
                return Some(index);
            }
            if (forward && node_offset > offset) || (!forward && node_offset < offset) {
                return None;
            }
            cursor = if forward { node.next } else { node.prev };
        }

        None
    }

    /// Marks `index` free, merges it with free neighbours and returns the
    /// size that was released.
    fn release(&mut self, index: usize) -> u64 {
        let size = self.nodes[index].suballocation.size;
        {
            let node = &mut self.nodes[index];
            node.suballocation.kind = SuballocationKind::Free;
            node.generation = node.generation.wrapping_add(1);
        }
        self.allocation_count -= 1;

        let mut merged = index;

        if let Some(next) = self.nodes[merged].next {
            if self.nodes[next].suballocation.kind.is_free() {
                self.unregister_free(next);
                let absorbed = self.nodes[next].suballocation.size;
                self.nodes[merged].suballocation.size += absorbed;
                self.unlink(next);
            }
        }

        if let Some(prev) = self.nodes[merged].prev {
            if self.nodes[prev].suballocation.kind.is_free() {
                self.unregister_free(prev);
                let absorbed = self.nodes[merged].suballocation.size;
                self.nodes[prev].suballocation.size += absorbed;
                self.unlink(merged);
                merged = prev;
            }
        }

        self.register_free(merged);

        size
    }

    fn register_free(&mut self, index: usize) {
        let size = self.nodes[index].suballocation.size;
        self.free_count += 1;
        self.free_size += size;

        if size >= self.min_free_register_size {
            let position = self
                .free_list
                .partition_point(|&other| self.nodes[other].suballocation.size < size);
            self.free_list.insert(position, index);
        }
    }

    fn unregister_free(&mut self, index: usize) {
        let size = self.nodes[index].suballocation.size;
        self.free_count -= 1;
        self.free_size -= size;

        if size >= self.min_free_register_size {
            let start = self
                .free_list
                .partition_point(|&other| self.nodes[other].suballocation.size < size);
            let found = self.free_list[start..]
                .iter()
                .position(|&other| other == index);
            debug_assert!(found.is_some(), "free range missing from the free-list");
            if let Some(position) = found {
                self.free_list.remove(start + position);
            }
        }
    }

    fn insert_node(&mut self, node: Node) -> usize {
        match self.vacant.pop() {
            Some(index) => {
                let generation = self.nodes[index].generation;
                self.nodes[index] = Node { generation, ..node };
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn link_after(&mut self, anchor: usize, suballocation: Suballocation) -> usize {
        let next = self.nodes[anchor].next;
        let index = self.insert_node(Node {
            suballocation,
            prev: Some(anchor),
            next,
            generation: 0,
            live: true,
        });

        self.nodes[anchor].next = Some(index);
        match next {
            Some(next) => self.nodes[next].prev = Some(index),
            None => self.tail = index,
        }

        index
    }

    fn link_before(&mut self, anchor: usize, suballocation: Suballocation) -> usize {
        let prev = self.nodes[anchor].prev;
        let index = self.insert_node(Node {
            suballocation,
            prev,
            next: Some(anchor),
            generation: 0,
            live: true,
        });

        self.nodes[anchor].prev = Some(index);
        match prev {
            Some(prev) => self.nodes[prev].next = Some(index),
            None => self.head = index,
        }

        index
    }

    /// Removes `index` from the sequence and recycles its slot. The node must
    /// have at least one neighbour.
    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => {
                if let Some(next) = next {
                    self.head = next;
                }
            }
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => {
                if let Some(prev) = prev {
                    self.tail = prev;
                }
            }
        }

        let node = &mut self.nodes[index];
        node.live = false;
        node.prev = None;
        node.next = None;
        node.generation = node.generation.wrapping_add(1);
        self.vacant.push(index);
    }
}
