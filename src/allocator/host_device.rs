//! # Host Device Module
//!
//! A simulated device that hands out numbered "memory" objects from heaps with
//! fixed budgets. It lets the allocator run headless (tests, the demo binary,
//! tooling) and records every device call so leaks and double frees show up.

use std::collections::HashMap;

use log::error;

use crate::core::MtResource;

use super::{
    device::{DeviceMemory, HeapProperties, MemoryTypeIndex},
    error::DeviceError,
};

/// A backing allocation handed out by [`HostDevice`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostMemory {
    id: u64,
    size: u64,
    memory_type: MemoryTypeIndex,
}

impl HostMemory {
    /// Device-unique number of the allocation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the allocation in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Memory type the allocation came from.
    pub fn memory_type(&self) -> MemoryTypeIndex {
        self.memory_type
    }
}

/// A simulated heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostHeap {
    /// Budget of the heap in bytes
    pub size: u64,
    /// Reported as device-local memory
    pub device_local: bool,
}

#[derive(Debug, Default)]
struct HostDeviceState {
    next_id: u64,
    heap_usage: Vec<u64>,
    live: HashMap<u64, (usize, u64)>,
    allocation_calls: usize,
    failed_allocations: usize,
}

/// In-process device with budgeted heaps.
///
/// # Examples
///
/// ```
/// use voxel_memory::allocator::{host_device::HostDevice, DeviceMemory};
///
/// let device = HostDevice::new(256)
///     .with_heap(256 * 1024 * 1024, true, 2)
///     .with_heap(64 * 1024 * 1024, false, 1);
///
/// assert_eq!(device.memory_type_count(), 3);
/// let memory = device.allocate_device_memory(4096, 2).unwrap();
/// assert_eq!(device.live_allocation_count(), 1);
/// device.free_device_memory(memory);
/// assert_eq!(device.live_allocation_count(), 0);
/// ```
#[derive(Debug)]
pub struct HostDevice {
    buffer_image_granularity: u64,
    heaps: Vec<HostHeap>,
    memory_type_heaps: Vec<usize>,
    state: MtResource<HostDeviceState>,
}

impl HostDevice {
    /// Creates a device without heaps.
    pub fn new(buffer_image_granularity: u64) -> Self {
        Self {
            buffer_image_granularity,
            heaps: Vec::new(),
            memory_type_heaps: Vec::new(),
            state: MtResource::new(HostDeviceState::default()),
        }
    }

    /// Adds a heap of `size` bytes exposed through `memory_types` new memory
    /// types.
    pub fn with_heap(mut self, size: u64, device_local: bool, memory_types: u32) -> Self {
        let heap = self.heaps.len();
        self.heaps.push(HostHeap { size, device_local });
        self.memory_type_heaps
            .extend((0..memory_types).map(|_| heap));
        self.state.get_exclusive().heap_usage.push(0);
        self
    }

    /// The heap backing `memory_type`.
    pub fn heap(&self, memory_type: MemoryTypeIndex) -> Option<HostHeap> {
        self.memory_type_heaps
            .get(memory_type as usize)
            .map(|&heap| self.heaps[heap])
    }

    /// Backing allocations that have not been freed.
    pub fn live_allocation_count(&self) -> usize {
        self.state.get().live.len()
    }

    /// Bytes of backing allocations that have not been freed.
    pub fn live_bytes(&self) -> u64 {
        self.state.get().live.values().map(|&(_, size)| size).sum()
    }

    /// Bytes currently drawn from `heap`.
    pub fn heap_usage(&self, heap: usize) -> u64 {
        self.state.get().heap_usage.get(heap).copied().unwrap_or(0)
    }

    /// Number of allocation calls made, successful or not.
    pub fn allocation_calls(&self) -> usize {
        self.state.get().allocation_calls
    }

    /// Number of allocation calls that failed.
    pub fn failed_allocations(&self) -> usize {
        self.state.get().failed_allocations
    }
}

impl DeviceMemory for HostDevice {
    type Memory = HostMemory;

    fn memory_type_count(&self) -> u32 {
        self.memory_type_heaps.len() as u32
    }

    fn buffer_image_granularity(&self) -> u64 {
        self.buffer_image_granularity
    }

    fn query_heap_properties(&self, memory_type: MemoryTypeIndex) -> HeapProperties {
        match self.heap(memory_type) {
            Some(heap) => HeapProperties {
                heap_size: heap.size,
                device_local: heap.device_local,
            },
            None => HeapProperties {
                heap_size: 0,
                device_local: false,
            },
        }
    }

    fn allocate_device_memory(
        &self,
        size: u64,
        memory_type: MemoryTypeIndex,
    ) -> Result<Self::Memory, DeviceError> {
        let mut state = self.state.get_mut();
        state.allocation_calls += 1;

        let Some(&heap) = self.memory_type_heaps.get(memory_type as usize) else {
            state.failed_allocations += 1;
            return Err(DeviceError::Other(format!(
                "memory type {memory_type} does not exist"
            )));
        };

        let usage = match state.heap_usage[heap].checked_add(size) {
            Some(usage) if usage <= self.heaps[heap].size => usage,
            _ => {
                state.failed_allocations += 1;
                return Err(DeviceError::OutOfDeviceMemory { memory_type, size });
            }
        };

        state.heap_usage[heap] = usage;
        let id = state.next_id;
        state.next_id += 1;
        state.live.insert(id, (heap, size));

        Ok(HostMemory {
            id,
            size,
            memory_type,
        })
    }

    fn free_device_memory(&self, memory: Self::Memory) {
        let mut state = self.state.get_mut();
        match state.live.remove(&memory.id) {
            Some((heap, size)) => state.heap_usage[heap] -= size,
            None => error!("host device memory {} freed twice", memory.id),
        }
    }
}
