//! End-to-end allocator behaviour against the simulated host device.

use std::sync::Arc;

use voxel_memory::{
    allocator::{
        host_device::HostDevice, AllocationDetails, AllocationError, AllocationHandle, Allocator,
        AllocatorConfig, AllocatorStats, MemoryRequirements, OversizePolicy, SuballocationKind,
    },
    workload::{evict_half, ChunkWorkload},
};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn geometry_device() -> Arc<HostDevice> {
    Arc::new(
        HostDevice::new(1024)
            .with_heap(256 * MIB, true, 2)
            .with_heap(2048 * MIB, true, 1),
    )
}

fn request(
    allocator: &Allocator<Arc<HostDevice>>,
    size: u64,
    alignment: u64,
    memory_type: u32,
    kind: SuballocationKind,
) -> Result<AllocationHandle, AllocationError> {
    allocator.allocate_memory(
        &MemoryRequirements {
            size,
            alignment,
            memory_type,
        },
        &AllocationDetails::default(),
        kind,
    )
}

#[test]
fn large_request_goes_private_by_default() {
    init_logger();
    let allocator = Allocator::new(geometry_device(), AllocatorConfig::default()).unwrap();

    // Small heap, so the preferred block is 64 MiB and the threshold 32 MiB.
    let handle = request(&allocator, 40 * MIB, 256, 0, SuballocationKind::Buffer).unwrap();

    assert!(handle.is_private());
    let stats = allocator.stats();
    assert_eq!(stats.memory_types[0].block_count, 0);
    assert_eq!(stats.memory_types[0].private_bytes, 40 * MIB);
    assert_eq!(allocator.device().live_bytes(), 40 * MIB);
}

#[test]
fn large_request_is_pooled_when_private_is_disabled() {
    init_logger();
    let config = AllocatorConfig {
        allow_private: false,
        ..AllocatorConfig::default()
    };
    let allocator = Allocator::new(geometry_device(), config).unwrap();

    let handle = request(&allocator, 40 * MIB, 256, 0, SuballocationKind::Buffer).unwrap();
    let oversized = request(&allocator, 80 * MIB, 256, 0, SuballocationKind::Buffer).unwrap();

    assert!(!handle.is_private());
    assert!(!oversized.is_private());
    let sizes: Vec<u64> = allocator
        .block_snapshots(0)
        .iter()
        .map(|snapshot| snapshot.size)
        .collect();
    assert_eq!(sizes.len(), 2);
    assert!(sizes.contains(&(64 * MIB)));
    assert!(sizes.contains(&(80 * MIB)));
    allocator.validate().unwrap();
}

#[test]
fn oversized_pooled_request_can_be_rejected() {
    init_logger();
    let config = AllocatorConfig::from_json(
        r#"{ "allow_private": false, "oversize_policy": "Reject" }"#,
    )
    .unwrap();
    assert_eq!(config.oversize_policy, OversizePolicy::Reject);
    let allocator = Allocator::new(geometry_device(), config).unwrap();

    let error = request(&allocator, 80 * MIB, 256, 0, SuballocationKind::Buffer).unwrap_err();

    assert_eq!(
        error,
        AllocationError::RequestExceedsBlockSize {
            size: 80 * MIB,
            block_size: 64 * MIB
        }
    );
}

#[test]
fn linear_and_optimal_resources_never_share_a_page() {
    init_logger();
    let allocator = Allocator::new(geometry_device(), AllocatorConfig::default()).unwrap();

    let buffer = request(&allocator, 100, 4, 2, SuballocationKind::Buffer).unwrap();
    let image = request(&allocator, 100, 4, 2, SuballocationKind::ImageOptimal).unwrap();
    let linear = request(&allocator, 100, 4, 2, SuballocationKind::Buffer).unwrap();
    let second_image = request(&allocator, 100, 4, 2, SuballocationKind::ImageOptimal).unwrap();

    assert_eq!(buffer.memory_id(), image.memory_id());
    assert_eq!(buffer.offset(), 0);
    // The image is pushed to the next 1 KiB page, the second buffer may still
    // fill the gap behind the first one.
    assert_eq!(image.offset(), 1024);
    assert_eq!(linear.offset(), 100);
    assert_eq!(second_image.offset(), 1124);
    allocator.validate().unwrap();
}

#[test]
fn churn_keeps_statistics_consistent() {
    init_logger();
    let allocator = Allocator::new(geometry_device(), AllocatorConfig::default()).unwrap();
    let mut rng = fastrand::Rng::with_seed(0x5eed);

    let mut live = Vec::new();
    for _ in 0..4 {
        let uploaded = ChunkWorkload::default().upload(&allocator, &mut rng).unwrap();
        live.extend(uploaded);
        live = evict_half(&allocator, live, &mut rng).unwrap();
        allocator.validate().unwrap();
    }

    let stats = allocator.stats();
    assert_eq!(stats.allocation_count(), live.len());
    assert_eq!(
        stats.used_bytes(),
        live.iter().map(AllocationHandle::size).sum::<u64>()
    );
    assert_eq!(stats.device_bytes(), allocator.device().live_bytes());

    for handle in &live {
        allocator.free(handle).unwrap();
    }
    allocator.trim_all();
    assert_eq!(allocator.device().live_allocation_count(), 0);
    assert_eq!(allocator.stats().device_bytes(), 0);
}

#[test]
fn statistics_serialize_as_json() {
    init_logger();
    let allocator = Allocator::new(geometry_device(), AllocatorConfig::default()).unwrap();
    request(&allocator, 4 * KIB, 256, 0, SuballocationKind::Buffer).unwrap();

    let json = serde_json::to_string(&allocator.stats()).unwrap();
    let parsed: AllocatorStats = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed, allocator.stats());
    assert_eq!(parsed.memory_types.len(), 3);
    assert_eq!(parsed.memory_types[0].block_bytes, 64 * MIB);
    assert_eq!(parsed.memory_types[2].preferred_block_size, 256 * MIB);
}

#[test]
fn handles_from_another_allocator_are_rejected() {
    init_logger();
    let first = Allocator::new(geometry_device(), AllocatorConfig::default()).unwrap();
    let second = Allocator::new(geometry_device(), AllocatorConfig::default()).unwrap();

    // Same memory type, size and placement in both allocators.
    let mine = request(&first, 4 * KIB, 256, 0, SuballocationKind::Buffer).unwrap();
    let theirs = request(&second, 4 * KIB, 256, 0, SuballocationKind::Buffer).unwrap();
    let private = first
        .allocate_memory(
            &MemoryRequirements {
                size: 4 * KIB,
                alignment: 256,
                memory_type: 0,
            },
            &AllocationDetails {
                force_private: true,
            },
            SuballocationKind::Buffer,
        )
        .unwrap();
    assert_eq!(mine.offset(), theirs.offset());
    assert_ne!(mine.memory_id(), theirs.memory_id());

    assert!(matches!(
        second.free(&mine),
        Err(AllocationError::InvalidFreeRequest { .. })
    ));
    assert!(matches!(
        second.free(&private),
        Err(AllocationError::InvalidFreeRequest { .. })
    ));
    assert!(matches!(
        second.free_at(0, mine.memory_id(), mine.offset()),
        Err(AllocationError::InvalidFreeRequest { .. })
    ));
    assert!(second.memory(&mine).is_none());
    assert_eq!(second.stats().allocation_count(), 1);

    second.free(&theirs).unwrap();
    first.free(&mine).unwrap();
    first.free(&private).unwrap();
    assert_eq!(first.stats().allocation_count(), 0);
}

#[test]
fn device_exhaustion_leaves_the_allocator_usable() {
    init_logger();
    let device = Arc::new(HostDevice::new(1).with_heap(96 * MIB, true, 1));
    let allocator = Allocator::new(device, AllocatorConfig::default()).unwrap();

    let first = request(&allocator, 30 * MIB, 256, 0, SuballocationKind::Buffer).unwrap();
    let second = request(&allocator, 30 * MIB, 256, 0, SuballocationKind::Buffer).unwrap();
    assert_eq!(first.memory_id(), second.memory_id());

    // The pooled block is full and a second 64 MiB block exceeds the heap.
    assert!(matches!(
        request(&allocator, 8 * MIB, 256, 0, SuballocationKind::Buffer),
        Err(AllocationError::DeviceOutOfMemory { .. })
    ));

    allocator.free(&first).unwrap();
    let retry = request(&allocator, 8 * MIB, 256, 0, SuballocationKind::Buffer).unwrap();
    assert_eq!(retry.memory_id(), first.memory_id());
    allocator.validate().unwrap();
}
