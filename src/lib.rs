#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Voxel Memory
//!
//! GPU memory suballocation for the voxel engine's chunk geometry and
//! textures.
//!
//! Allocating device memory once per vertex buffer does not scale to
//! thousands of chunks: drivers cap the number of live allocations and every
//! allocation is slow. This crate obtains a few large blocks per memory type
//! and carves resources out of them, honouring alignment and the
//! buffer-image granularity rule.
//!
//! ## Key Modules
//!
//! * `allocator` - The allocator, its blocks and the device abstraction
//! * `core` - Concurrency primitives shared by the allocator and devices
//! * `workload` - Randomized chunk streaming used by the demo and the tests
//!
//! ## Usage
//!
//! ```rust
//! use voxel_memory::allocator::{
//!     host_device::HostDevice, AllocationDetails, Allocator, AllocatorConfig,
//!     MemoryRequirements, SuballocationKind,
//! };
//!
//! let device = HostDevice::new(1024).with_heap(256 * 1024 * 1024, true, 2);
//! let allocator = Allocator::new(device, AllocatorConfig::default()).unwrap();
//!
//! let vertices = allocator
//!     .allocate_memory(
//!         &MemoryRequirements { size: 48 * 1024, alignment: 256, memory_type: 0 },
//!         &AllocationDetails::default(),
//!         SuballocationKind::Buffer,
//!     )
//!     .unwrap();
//!
//! allocator.free(&vertices).unwrap();
//! ```
//!
//! ## Demo
//!
//! ```bash
//! RUST_LOG=debug cargo run --release
//! ```
//!
//! Set `VOXEL_MEMORY_CONFIG` to a JSON file to override allocator settings.

use log::{error, info};

use allocator::{host_device::HostDevice, AllocationError, Allocator, AllocatorConfig};
use workload::ChunkWorkload;

pub mod allocator;
pub mod core;
pub mod workload;

const MIB: u64 = 1024 * 1024;

/// Environment variable naming a JSON allocator configuration file.
pub const CONFIG_ENV: &str = "VOXEL_MEMORY_CONFIG";

/// Runs the demo: streams a randomized chunk workload through a simulated
/// device and logs the resulting statistics.
pub fn run() {
    let mut log_builder = env_logger::Builder::new();
    log_builder
        .target(env_logger::Target::Stdout)
        .parse_env("RUST_LOG")
        .init();

    info!("Logger initialized");

    if let Err(error) = run_demo() {
        error!("demo failed: {}", error);
    }
}

fn load_config() -> Result<AllocatorConfig, AllocationError> {
    let Ok(path) = std::env::var(CONFIG_ENV) else {
        return Ok(AllocatorConfig::default());
    };

    let json = std::fs::read_to_string(&path).map_err(|error| {
        allocator::ConfigError::Parse(format!("cannot read {path}: {error}"))
    })?;
    info!("loading allocator config from {}", path);

    Ok(AllocatorConfig::from_json(&json)?)
}

fn run_demo() -> Result<(), AllocationError> {
    let config = load_config()?;

    // Two geometry memory types on a small heap, one image type on a large heap.
    let device = HostDevice::new(1024)
        .with_heap(256 * MIB, true, 2)
        .with_heap(2048 * MIB, true, 1);
    let allocator = Allocator::new(device, config)?;

    let mut rng = fastrand::Rng::new();
    let handles = ChunkWorkload::default().upload(&allocator, &mut rng)?;
    let survivors = workload::evict_half(&allocator, handles, &mut rng)?;

    if let Err(error) = allocator.validate() {
        error!("allocator state is inconsistent: {}", error);
    }

    let released = allocator.trim_all();
    info!(
        "{} allocations live, trimmed {} bytes",
        survivors.len(),
        released
    );

    let stats = allocator.stats();
    match serde_json::to_string(&stats) {
        Ok(json) => info!("{}", json),
        Err(error) => error!("cannot serialize allocator stats: {}", error),
    }

    for handle in &survivors {
        allocator.free(handle)?;
    }
    Ok(())
}
