//! # wgpu Device Module
//!
//! Backs the allocator with real GPU memory through `wgpu`. Each memory type
//! is a set of buffer usages; a backing allocation is one `wgpu::Buffer`
//! created with those usages, and suballocations are byte ranges inside it.
//!
//! `wgpu` does not expose heaps, so every memory type carries the heap size it
//! should be treated as. `wgpu` also never aliases buffers with textures, which
//! makes the buffer-image granularity `1`.

use log::{debug, warn};

use super::{
    device::{DeviceMemory, HeapProperties, MemoryTypeIndex},
    error::DeviceError,
};

/// A memory type backed by buffers of one usage set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WgpuMemoryType {
    /// Usages of every buffer created for this memory type
    pub usage: wgpu::BufferUsages,
    /// Heap size reported for block sizing
    pub heap_size: u64,
    /// Reported as device-local memory
    pub device_local: bool,
}

/// [`DeviceMemory`] implementation over a `wgpu::Device`.
#[derive(Debug)]
pub struct WgpuDevice {
    device: wgpu::Device,
    memory_types: Vec<WgpuMemoryType>,
}

impl WgpuDevice {
    /// Creates a device exposing `memory_types`.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device buffers are created on
    /// * `memory_types` - One entry per memory type, in index order
    pub fn new(device: wgpu::Device, memory_types: Vec<WgpuMemoryType>) -> Self {
        Self {
            device,
            memory_types,
        }
    }

    /// Memory types for geometry: vertex buffers on type `0`, index buffers on
    /// type `1`, both writable from the queue.
    pub fn geometry_memory_types(heap_size: u64) -> Vec<WgpuMemoryType> {
        [wgpu::BufferUsages::VERTEX, wgpu::BufferUsages::INDEX]
            .into_iter()
            .map(|usage| WgpuMemoryType {
                usage: usage | wgpu::BufferUsages::COPY_DST,
                heap_size,
                device_local: true,
            })
            .collect()
    }

    /// The wrapped `wgpu` device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }
}

impl DeviceMemory for WgpuDevice {
    type Memory = wgpu::Buffer;

    fn memory_type_count(&self) -> u32 {
        self.memory_types.len() as u32
    }

    fn buffer_image_granularity(&self) -> u64 {
        1
    }

    fn query_heap_properties(&self, memory_type: MemoryTypeIndex) -> HeapProperties {
        match self.memory_types.get(memory_type as usize) {
            Some(memory) => HeapProperties {
                heap_size: memory.heap_size,
                device_local: memory.device_local,
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
        let memory = self
            .memory_types
            .get(memory_type as usize)
            .ok_or_else(|| DeviceError::Other(format!("memory type {memory_type} does not exist")))?;

        let max_buffer_size = self.device.limits().max_buffer_size;
        if size > max_buffer_size {
            return Err(DeviceError::Other(format!(
                "{size} bytes exceeds the maximum buffer size of {max_buffer_size}"
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Allocator Block"),
            size,
            usage: memory.usage,
            mapped_at_creation: false,
        });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            warn!("wgpu refused a {} byte buffer: {}", size, error);
            buffer.destroy();
            return Err(DeviceError::OutOfDeviceMemory { memory_type, size });
        }

        debug!(
            "created {} byte buffer with usages {:?}",
            size, memory.usage
        );
        Ok(buffer)
    }

    fn free_device_memory(&self, memory: Self::Memory) {
        memory.destroy();
    }
}
