//! The device abstraction the allocator draws backing memory from.
//!
//! The allocator never talks to a graphics API directly. Whatever composes the
//! renderer injects an implementation of [`DeviceMemory`]; the crate ships a
//! simulated [`HostDevice`](super::host_device::HostDevice) and, behind the
//! `wgpu_device` feature, a `wgpu` backed device.

use std::fmt::Debug;

use super::error::DeviceError;

/// Index of a device memory type. Each memory type gets its own block
/// collection and its own lock.
pub type MemoryTypeIndex = u32;

/// Properties of the heap behind a memory type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapProperties {
    /// Size of the heap in bytes
    pub heap_size: u64,
    /// Whether the heap lives in device-local (video) memory
    pub device_local: bool,
}

/// Privileged memory operations performed on behalf of the allocator.
///
/// Implementations must be callable from any thread; the allocator may call
/// [`allocate_device_memory`](Self::allocate_device_memory) while holding one
/// of its pool locks.
pub trait DeviceMemory: Send + Sync {
    /// Handle to one backing device allocation.
    type Memory: Clone + Debug + Send + Sync;

    /// Number of memory types the device exposes.
    fn memory_type_count(&self) -> u32;

    /// Page size below which linear and optimally tiled resources must not
    /// share memory. Must be a power of two; `1` disables the check.
    fn buffer_image_granularity(&self) -> u64;

    /// Describes the heap backing `memory_type`.
    fn query_heap_properties(&self, memory_type: MemoryTypeIndex) -> HeapProperties;

    /// Obtains `size` bytes of backing memory of `memory_type`.
    fn allocate_device_memory(
        &self,
        size: u64,
        memory_type: MemoryTypeIndex,
    ) -> Result<Self::Memory, DeviceError>;

    /// Returns backing memory obtained from
    /// [`allocate_device_memory`](Self::allocate_device_memory).
    fn free_device_memory(&self, memory: Self::Memory);
}

impl<D: DeviceMemory> DeviceMemory for std::sync::Arc<D> {
    type Memory = D::Memory;

    fn memory_type_count(&self) -> u32 {
        (**self).memory_type_count()
    }

    fn buffer_image_granularity(&self) -> u64 {
        (**self).buffer_image_granularity()
    }

    fn query_heap_properties(&self, memory_type: MemoryTypeIndex) -> HeapProperties {
        (**self).query_heap_properties(memory_type)
    }

    fn allocate_device_memory(
        &self,
        size: u64,
        memory_type: MemoryTypeIndex,
    ) -> Result<Self::Memory, DeviceError> {
        (**self).allocate_device_memory(size, memory_type)
    }

    fn free_device_memory(&self, memory: Self::Memory) {
        (**self).free_device_memory(memory)
    }
}
