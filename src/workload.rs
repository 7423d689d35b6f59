//! # Chunk Workload Module
//!
//! A randomized stand-in for the renderer's chunk streaming: every chunk
//! uploads a vertex buffer and an index buffer, and every few chunks a texture
//! page is streamed in. Used by the demo binary and by the stress tests.

use fastrand::Rng;
use log::{debug, info};

use crate::allocator::{
    AllocationDetails, AllocationError, AllocationHandle, Allocator, DeviceMemory,
    MemoryRequirements, MemoryTypeIndex, SuballocationKind,
};

const KIB: u64 = 1024;

/// Memory types the workload draws from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkloadMemoryTypes {
    /// Memory type for vertex buffers
    pub vertex: MemoryTypeIndex,
    /// Memory type for index buffers
    pub index: MemoryTypeIndex,
    /// Memory type for textures and miscellaneous resources
    pub image: MemoryTypeIndex,
}

/// Randomized chunk streaming workload.
#[derive(Clone, Debug)]
pub struct ChunkWorkload {
    /// Number of chunks to upload
    pub chunks: usize,
    /// Upper bound of a chunk's vertex buffer size in bytes
    pub max_vertex_bytes: u64,
    /// Upload a texture page every this many chunks
    pub image_interval: usize,
    /// Where each resource goes
    pub memory_types: WorkloadMemoryTypes,
}

impl Default for ChunkWorkload {
    fn default() -> Self {
        Self {
            chunks: 64,
            max_vertex_bytes: 1024 * KIB,
            image_interval: 4,
            memory_types: WorkloadMemoryTypes {
                vertex: 0,
                index: 1,
                image: 2,
            },
        }
    }
}

impl ChunkWorkload {
    /// Uploads every chunk and returns the live handles in upload order.
    ///
    /// Stops at the first allocation failure; handles allocated before the
    /// failure stay live and are owned by the allocator until it is dropped.
    pub fn upload<D: DeviceMemory>(
        &self,
        allocator: &Allocator<D>,
        rng: &mut Rng,
    ) -> Result<Vec<AllocationHandle>, AllocationError> {
        let details = AllocationDetails::default();
        let mut handles = Vec::with_capacity(self.chunks * 2 + self.chunks / self.image_interval.max(1));

        for chunk in 0..self.chunks {
            let vertex_bytes = rng.u64(4 * KIB..=self.max_vertex_bytes.max(4 * KIB));
            // 32-bit indices, six per quad, one quad per four vertices of 32 bytes
            let index_bytes = (vertex_bytes / 32 / 4 * 6 * 4).max(4);

            handles.push(allocator.allocate_memory(
                &MemoryRequirements {
                    size: vertex_bytes,
                    alignment: 256,
                    memory_type: self.memory_types.vertex,
                },
                &details,
                SuballocationKind::Buffer,
            )?);
            handles.push(allocator.allocate_memory(
                &MemoryRequirements {
                    size: index_bytes,
                    alignment: 4,
                    memory_type: self.memory_types.index,
                },
                &details,
                SuballocationKind::Buffer,
            )?);

            if self.image_interval > 0 && chunk % self.image_interval == 0 {
                let kind = SuballocationKind::from_u8(rng.u8(1..5))
                    .unwrap_or(SuballocationKind::ImageOptimal);
                let side = 1u64 << rng.u32(6..11);
                handles.push(allocator.allocate_memory(
                    &MemoryRequirements {
                        size: side * side * 4,
                        alignment: 4 * KIB,
                        memory_type: self.memory_types.image,
                    },
                    &details,
                    kind,
                )?);
            }
        }

        debug!(
            "uploaded {} chunks as {} allocations",
            self.chunks,
            handles.len()
        );
        Ok(handles)
    }
}

/// Frees a random half of `handles` and returns the survivors.
pub fn evict_half<D: DeviceMemory>(
    allocator: &Allocator<D>,
    mut handles: Vec<AllocationHandle>,
    rng: &mut Rng,
) -> Result<Vec<AllocationHandle>, AllocationError> {
    rng.shuffle(&mut handles);
    let survivors = handles.split_off(handles.len() / 2);

    for handle in &handles {
        allocator.free(handle)?;
    }
    info!(
        "evicted {} allocations, {} remain",
        handles.len(),
        survivors.len()
    );

    Ok(survivors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{host_device::HostDevice, AllocatorConfig};

    fn allocator() -> Allocator<HostDevice> {
        let device = HostDevice::new(1024)
            .with_heap(256 * 1024 * KIB, true, 2)
            .with_heap(2048 * 1024 * KIB, true, 1);
        Allocator::new(device, AllocatorConfig::default()).unwrap()
    }

    #[test]
    fn upload_and_evict_keep_every_block_valid() {
        let allocator = allocator();
        let mut rng = Rng::with_seed(7);

        let handles = ChunkWorkload::default().upload(&allocator, &mut rng).unwrap();
        let uploaded = handles.len();
        allocator.validate().unwrap();

        let survivors = evict_half(&allocator, handles, &mut rng).unwrap();

        assert_eq!(survivors.len(), uploaded - uploaded / 2);
        assert_eq!(allocator.stats().allocation_count(), survivors.len());
        allocator.validate().unwrap();
    }

    #[test]
    fn index_buffers_land_on_their_own_memory_type() {
        let allocator = allocator();
        let mut rng = Rng::with_seed(11);
        let workload = ChunkWorkload {
            chunks: 8,
            image_interval: 0,
            ..ChunkWorkload::default()
        };

        let handles = workload.upload(&allocator, &mut rng).unwrap();

        assert_eq!(handles.len(), 16);
        assert!(handles.iter().step_by(2).all(|handle| handle.memory_type() == 0));
        assert!(handles.iter().skip(1).step_by(2).all(|handle| handle.memory_type() == 1));
    }
}
