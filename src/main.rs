//! # Voxel Memory Demo Entry Point
//!
//! Calls into the library's `run()` function, which streams a randomized
//! chunk workload through the allocator and logs its statistics.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release
//! ```

fn main() {
    voxel_memory::run();
}
