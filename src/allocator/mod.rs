//! # GPU Memory Allocator
//!
//! Carves vertex/index buffers and images out of a small number of large
//! device memory blocks.
//!
//! ## Architecture
//!
//! * `MemoryBlock` owns one backing allocation and its ordered suballocations
//! * `BlockCollection` owns every block of one memory type
//! * `Allocator` owns one collection and one private-allocation table per
//!   memory type, each behind its own lock, and decides where requests go
//!
//! ## Routing
//!
//! A request is served from its own *private* device allocation when the
//! caller forces it or when it is larger than
//! `preferred block size / private_threshold_divisor`; large resources would
//! otherwise fragment the shared blocks. Everything else is placed in the
//! pooled blocks of its memory type, creating a new block when none of the
//! existing ones has room.
//!
//! ## Concurrency
//!
//! Requests against one memory type are serialized by that type's lock;
//! different memory types never contend. Growing a pool calls into the device
//! while holding the lock, so concurrent requests for the same memory type
//! wait for the device.
//!
//! ## Example
//!
//! ```
//! use voxel_memory::allocator::{
//!     host_device::HostDevice, AllocationDetails, Allocator, AllocatorConfig,
//!     MemoryRequirements, SuballocationKind,
//! };
//!
//! let device = HostDevice::new(1024).with_heap(256 * 1024 * 1024, true, 1);
//! let allocator = Allocator::new(device, AllocatorConfig::default()).unwrap();
//!
//! let requirements = MemoryRequirements {
//!     size: 64 * 1024,
//!     alignment: 256,
//!     memory_type: 0,
//! };
//! let handle = allocator
//!     .allocate_memory(&requirements, &AllocationDetails::default(), SuballocationKind::Buffer)
//!     .unwrap();
//! assert_eq!(handle.offset() % 256, 0);
//!
//! allocator.free(&handle).unwrap();
//! ```

pub mod block_collection;
pub mod config;
pub mod device;
pub mod error;
pub mod host_device;
pub mod memory_block;
pub mod stats;
pub mod suballocation;
#[cfg(all(feature = "wgpu_device", not(target_family = "wasm")))]
pub mod wgpu_device;

use std::collections::HashMap;

use log::{debug, error, info, trace, warn};
use web_time::Instant;

use crate::core::MtResource;

pub use block_collection::{BlockAllocation, BlockCollection, BlockFreeRequest};
pub use config::{AllocatorConfig, OversizePolicy};
pub use device::{DeviceMemory, HeapProperties, MemoryTypeIndex};
pub use error::{AllocationError, BlockError, ConfigError, DeviceError, ValidationError};
pub use memory_block::{MemoryBlock, SuballocationRequest};
pub use stats::{AllocatorStats, BlockSnapshot, MemoryTypeStats};
pub use suballocation::{MemoryId, SlotId, Suballocation, SuballocationKind};

/// Size, alignment and memory type a resource needs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Size in bytes
    pub size: u64,
    /// Required alignment of the offset, a power of two
    pub alignment: u64,
    /// Memory type to allocate from
    pub memory_type: MemoryTypeIndex,
}

/// Caller preferences for one allocation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationDetails {
    /// Always give the resource its own device allocation
    pub force_private: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Placement {
    Pooled(SlotId),
    Private,
}

/// A live allocation. Presenting it to [`Allocator::free`] is the only way
/// to release it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AllocationHandle {
    memory_type: MemoryTypeIndex,
    memory_id: MemoryId,
    offset: u64,
    size: u64,
    kind: SuballocationKind,
    placement: Placement,
}

impl AllocationHandle {
    /// Memory type the allocation was served from.
    pub fn memory_type(&self) -> MemoryTypeIndex {
        self.memory_type
    }

    /// Identity of the backing memory.
    pub fn memory_id(&self) -> MemoryId {
        self.memory_id
    }

    /// Offset of the allocation inside its backing memory.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the allocation in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Resource kind the allocation was made for.
    pub fn kind(&self) -> SuballocationKind {
        self.kind
    }

    /// Whether the allocation owns its backing memory exclusively.
    pub fn is_private(&self) -> bool {
        self.placement == Placement::Private
    }
}

/// A backing allocation dedicated to a single resource. Never pooled, split
/// or merged.
#[derive(Debug)]
pub struct PrivateAllocation<M> {
    /// Identity of the backing memory
    pub id: MemoryId,
    /// The backing memory
    pub memory: M,
    /// Size in bytes
    pub size: u64,
    /// Resource kind occupying the memory
    pub kind: SuballocationKind,
}

#[derive(Debug)]
struct MemoryPool<M> {
    blocks: BlockCollection<M>,
    private: HashMap<MemoryId, PrivateAllocation<M>>,
}

#[derive(Debug)]
struct MemoryTypeState<M: Send + Sync> {
    heap: HeapProperties,
    preferred_block_size: u64,
    pool: MtResource<MemoryPool<M>>,
}

/// Suballocating GPU memory allocator.
///
/// Constructed with an injected [`DeviceMemory`] implementation. Shareable
/// across threads (wrap it in an `Arc`); all methods take `&self`.
pub struct Allocator<D: DeviceMemory> {
    device: D,
    config: AllocatorConfig,
    buffer_image_granularity: u64,
    memory_types: Vec<MemoryTypeState<D::Memory>>,
}

impl<D: DeviceMemory> Allocator<D> {
    /// Creates an allocator over `device`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::InvalidConfig`] when `config` fails
    /// validation or the device reports a buffer-image granularity that is not
    /// a power of two.
    pub fn new(device: D, config: AllocatorConfig) -> Result<Self, AllocationError> {
        config.validate()?;

        let buffer_image_granularity = device.buffer_image_granularity();
        if !buffer_image_granularity.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                field: "buffer_image_granularity",
                reason: format!("device reported {buffer_image_granularity}, not a power of two"),
            }
            .into());
        }

        let memory_types: Vec<_> = (0..device.memory_type_count())
            .map(|memory_type| {
                let heap = device.query_heap_properties(memory_type);
                let preferred_block_size = config.preferred_block_size(heap.heap_size);
                debug!(
                    "memory type {}: heap of {} bytes, preferred block size {}",
                    memory_type, heap.heap_size, preferred_block_size
                );

                MemoryTypeState {
                    heap,
                    preferred_block_size,
                    pool: MtResource::new(MemoryPool {
                        blocks: BlockCollection::new(memory_type),
                        private: HashMap::new(),
                    }),
                }
            })
            .collect();

        info!(
            "Allocator initialized with {} memory types, buffer-image granularity {}",
            memory_types.len(),
            buffer_image_granularity
        );

        Ok(Self {
            device,
            config,
            buffer_image_granularity,
            memory_types,
        })
    }

    /// The injected device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The active configuration.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Number of memory types served.
    pub fn memory_type_count(&self) -> u32 {
        self.memory_types.len() as u32
    }

    /// Preferred size of new blocks for `memory_type`.
    pub fn preferred_block_size(&self, memory_type: MemoryTypeIndex) -> Option<u64> {
        self.memory_types
            .get(memory_type as usize)
            .map(|state| state.preferred_block_size)
    }

    /// Heap properties recorded for `memory_type` at construction.
    pub fn heap_properties(&self, memory_type: MemoryTypeIndex) -> Option<HeapProperties> {
        self.memory_types
            .get(memory_type as usize)
            .map(|state| state.heap)
    }

    /// Allocates memory for a resource of `kind`.
    ///
    /// # Errors
    ///
    /// * [`AllocationError::InvalidRequest`] for zero sizes, alignments that
    ///   are not powers of two, unknown memory types or a `Free` kind
    /// * [`AllocationError::DeviceOutOfMemory`] when the device cannot provide
    ///   a new block or private allocation
    /// * [`AllocationError::PoolExhausted`] when no block fits and new blocks
    ///   are disabled
    /// * [`AllocationError::RequestExceedsBlockSize`] when an oversized pooled
    ///   request meets [`OversizePolicy::Reject`]
    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        details: &AllocationDetails,
        kind: SuballocationKind,
    ) -> Result<AllocationHandle, AllocationError> {
        let state = self.validate_request(requirements, kind)?;

        let oversized =
            requirements.size > self.config.private_threshold(state.preferred_block_size);
        if details.force_private || (self.config.allow_private && oversized) {
            self.allocate_private(requirements, kind)
        } else {
            self.allocate_pooled(state, requirements, kind)
        }
    }

    /// Releases an allocation.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::InvalidFreeRequest`] for handles that were
    /// already freed or do not belong to this allocator.
    pub fn free(&self, handle: &AllocationHandle) -> Result<(), AllocationError> {
        let Some(state) = self.memory_types.get(handle.memory_type as usize) else {
            return Err(self.invalid_free(
                handle.memory_type,
                handle.memory_id,
                handle.offset,
                "unknown memory type".to_string(),
            ));
        };

        match handle.placement {
            Placement::Private => {
                let removed = state.pool.get_mut().private.remove(&handle.memory_id);
                match removed {
                    Some(private) => {
                        self.release_private(handle.memory_type, private);
                        Ok(())
                    }
                    None => Err(self.invalid_free(
                        handle.memory_type,
                        handle.memory_id,
                        handle.offset,
                        "no live private allocation".to_string(),
                    )),
                }
            }
            Placement::Pooled(slot) => self.free_pooled(
                state,
                handle.memory_type,
                BlockFreeRequest {
                    memory_id: handle.memory_id,
                    offset: handle.offset,
                    size: Some(handle.size),
                    slot: Some(slot),
                },
            ),
        }
    }

    /// Releases the allocation at `offset` of the backing memory `memory_id`.
    ///
    /// This is the handle-less form of [`free`](Self::free). Private
    /// allocations are addressed with offset `0`.
    pub fn free_at(
        &self,
        memory_type: MemoryTypeIndex,
        memory_id: MemoryId,
        offset: u64,
    ) -> Result<(), AllocationError> {
        let Some(state) = self.memory_types.get(memory_type as usize) else {
            return Err(self.invalid_free(
                memory_type,
                memory_id,
                offset,
                "unknown memory type".to_string(),
            ));
        };

        let private = if offset == 0 {
            state.pool.get_mut().private.remove(&memory_id)
        } else {
            None
        };
        if let Some(private) = private {
            self.release_private(memory_type, private);
            return Ok(());
        }

        self.free_pooled(
            state,
            memory_type,
            BlockFreeRequest {
                memory_id,
                offset,
                size: None,
                slot: None,
            },
        )
    }

    /// The backing memory a live allocation lives in, for binding.
    pub fn memory(&self, handle: &AllocationHandle) -> Option<D::Memory> {
        let state = self.memory_types.get(handle.memory_type as usize)?;
        let pool = state.pool.get();

        match handle.placement {
            Placement::Private => pool
                .private
                .get(&handle.memory_id)
                .map(|private| private.memory.clone()),
            Placement::Pooled(_) => pool
                .blocks
                .find(handle.memory_id)
                .map(|block| block.memory().clone()),
        }
    }

    /// Returns every pooled block of `memory_type` that holds no allocations
    /// to the device and reports how many bytes were released.
    ///
    /// Blocks are never released implicitly; call this when memory pressure
    /// makes it worthwhile.
    pub fn trim(&self, memory_type: MemoryTypeIndex) -> Result<u64, AllocationError> {
        let state = self.memory_types.get(memory_type as usize).ok_or_else(|| {
            AllocationError::InvalidRequest(format!("memory type {memory_type} does not exist"))
        })?;

        let empty_blocks = state.pool.get_mut().blocks.remove_empty_blocks();

        let mut released = 0;
        for block in empty_blocks {
            debug!(
                "memory type {}: returning empty block {} ({} bytes) to the device",
                memory_type,
                block.id(),
                block.size()
            );
            released += block.size();
            self.device.free_device_memory(block.into_memory());
        }

        Ok(released)
    }

    /// [`trim`](Self::trim) for every memory type.
    pub fn trim_all(&self) -> u64 {
        (0..self.memory_type_count())
            .filter_map(|memory_type| self.trim(memory_type).ok())
            .sum()
    }

    /// Usage of every memory type.
    pub fn stats(&self) -> AllocatorStats {
        let memory_types = self
            .memory_types
            .iter()
            .enumerate()
            .map(|(index, state)| {
                let pool = state.pool.get();
                let mut stats = MemoryTypeStats {
                    memory_type: index as MemoryTypeIndex,
                    preferred_block_size: state.preferred_block_size,
                    ..Default::default()
                };
                pool.blocks.fill_stats(&mut stats);
                stats.private_count = pool.private.len();
                stats.private_bytes = pool.private.values().map(|private| private.size).sum();
                stats
            })
            .collect();

        AllocatorStats { memory_types }
    }

    /// Snapshots of every pooled block of `memory_type`, in placement order.
    pub fn block_snapshots(&self, memory_type: MemoryTypeIndex) -> Vec<BlockSnapshot> {
        self.memory_types
            .get(memory_type as usize)
            .map(|state| {
                state
                    .pool
                    .get()
                    .blocks
                    .iter()
                    .map(MemoryBlock::snapshot)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Checks the invariants of every block. Diagnostic only.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for state in &self.memory_types {
            state.pool.get().blocks.validate()?;
        }
        Ok(())
    }

    fn validate_request(
        &self,
        requirements: &MemoryRequirements,
        kind: SuballocationKind,
    ) -> Result<&MemoryTypeState<D::Memory>, AllocationError> {
        if requirements.size == 0 {
            return Err(AllocationError::InvalidRequest(
                "size must be greater than zero".to_string(),
            ));
        }
        if !requirements.alignment.is_power_of_two() {
            return Err(AllocationError::InvalidRequest(format!(
                "alignment {} is not a power of two",
                requirements.alignment
            )));
        }
        if kind.is_free() {
            return Err(AllocationError::InvalidRequest(
                "cannot allocate memory of kind Free".to_string(),
            ));
        }

        self.memory_types
            .get(requirements.memory_type as usize)
            .ok_or_else(|| {
                AllocationError::InvalidRequest(format!(
                    "memory type {} does not exist",
                    requirements.memory_type
                ))
            })
    }

    fn allocate_private(
        &self,
        requirements: &MemoryRequirements,
        kind: SuballocationKind,
    ) -> Result<AllocationHandle, AllocationError> {
        let memory_type = requirements.memory_type;
        let size = requirements.size;
        let memory = self.allocate_from_device(size, memory_type)?;
        let id = MemoryId::unique();

        self.memory_types[memory_type as usize]
            .pool
            .get_mut()
            .private
            .insert(
                id,
                PrivateAllocation {
                    id,
                    memory,
                    size,
                    kind,
                },
            );
        debug!(
            "memory type {}: private allocation {} of {} bytes for {:?}",
            memory_type, id, size, kind
        );

        Ok(AllocationHandle {
            memory_type,
            memory_id: id,
            offset: 0,
            size,
            kind,
            placement: Placement::Private,
        })
    }

    fn allocate_pooled(
        &self,
        state: &MemoryTypeState<D::Memory>,
        requirements: &MemoryRequirements,
        kind: SuballocationKind,
    ) -> Result<AllocationHandle, AllocationError> {
        let MemoryRequirements {
            size,
            alignment,
            memory_type,
        } = *requirements;
        let granularity = self.buffer_image_granularity;
        let mut pool = state.pool.get_mut();

        if let Some(allocation) = pool.blocks.try_allocate(granularity, size, alignment, kind) {
            pool.blocks.sort_blocks();
            return Ok(pooled_handle(memory_type, allocation, size, kind));
        }

        if !self.config.allow_new_blocks {
            return Err(AllocationError::PoolExhausted { memory_type, size });
        }

        let block_size = if size > state.preferred_block_size {
            match self.config.oversize_policy {
                OversizePolicy::GrowBlock => size,
                OversizePolicy::Reject => {
                    return Err(AllocationError::RequestExceedsBlockSize {
                        size,
                        block_size: state.preferred_block_size,
                    })
                }
            }
        } else {
            state.preferred_block_size
        };

        let memory = self.allocate_from_device(block_size, memory_type)?;
        let id = MemoryId::unique();
        let index = pool.blocks.insert_block(MemoryBlock::new(
            id,
            memory,
            block_size,
            self.config.min_free_register_size,
        ));
        debug!(
            "memory type {}: created block {} of {} bytes ({} blocks)",
            memory_type,
            id,
            block_size,
            pool.blocks.len()
        );

        let allocation = pool
            .blocks
            .allocate_from_block(index, granularity, size, alignment, kind)
            .ok_or(AllocationError::PoolExhausted { memory_type, size })?;
        pool.blocks.sort_blocks();

        Ok(pooled_handle(memory_type, allocation, size, kind))
    }

    fn free_pooled(
        &self,
        state: &MemoryTypeState<D::Memory>,
        memory_type: MemoryTypeIndex,
        request: BlockFreeRequest,
    ) -> Result<(), AllocationError> {
        let mut pool = state.pool.get_mut();

        match pool.blocks.free(request) {
            Ok(freed) => {
                pool.blocks.sort_blocks();
                trace!(
                    "memory type {}: freed {} bytes at {} in block {}",
                    memory_type,
                    freed,
                    request.offset,
                    request.memory_id
                );
                Ok(())
            }
            Err(block_error) => {
                drop(pool);
                Err(self.invalid_free(
                    memory_type,
                    request.memory_id,
                    request.offset,
                    block_error.to_string(),
                ))
            }
        }
    }

    fn allocate_from_device(
        &self,
        size: u64,
        memory_type: MemoryTypeIndex,
    ) -> Result<D::Memory, AllocationError> {
        let started = Instant::now();

        match self.device.allocate_device_memory(size, memory_type) {
            Ok(memory) => {
                debug!(
                    "memory type {}: device allocation of {} bytes took {:?}",
                    memory_type,
                    size,
                    started.elapsed()
                );
                Ok(memory)
            }
            Err(source) => {
                warn!(
                    "memory type {}: device allocation of {} bytes failed: {}",
                    memory_type, size, source
                );
                Err(AllocationError::DeviceOutOfMemory {
                    memory_type,
                    size,
                    source,
                })
            }
        }
    }

    fn release_private(&self, memory_type: MemoryTypeIndex, private: PrivateAllocation<D::Memory>) {
        debug!(
            "memory type {}: releasing private allocation {} ({} bytes)",
            memory_type, private.id, private.size
        );
        self.device.free_device_memory(private.memory);
    }

    fn invalid_free(
        &self,
        memory_type: MemoryTypeIndex,
        memory_id: MemoryId,
        offset: u64,
        reason: String,
    ) -> AllocationError {
        let error = AllocationError::InvalidFreeRequest {
            memory_type,
            memory_id,
            offset,
            reason,
        };
        error!("{}", error);
        error
    }

}

impl<D: DeviceMemory> Drop for Allocator<D> {
    fn drop(&mut self) {
        for (memory_type, state) in self.memory_types.iter_mut().enumerate() {
            let pool = state.pool.get_exclusive();
            let blocks = pool.blocks.drain_blocks();

            let live = blocks
                .iter()
                .map(MemoryBlock::allocation_count)
                .sum::<usize>()
                + pool.private.len();
            if live > 0 {
                warn!(
                    "memory type {}: {} allocations still live when the allocator was dropped",
                    memory_type, live
                );
            }

            for block in blocks {
                self.device.free_device_memory(block.into_memory());
            }
            for (_, private) in pool.private.drain() {
                self.device.free_device_memory(private.memory);
            }
        }
    }
}

fn pooled_handle(
    memory_type: MemoryTypeIndex,
    allocation: BlockAllocation,
    size: u64,
    kind: SuballocationKind,
) -> AllocationHandle {
    AllocationHandle {
        memory_type,
        memory_id: allocation.memory_id,
        offset: allocation.offset,
        size,
        kind,
        placement: Placement::Pooled(allocation.slot),
    }
}
