//! # Core Module
//!
//! Concurrency primitives shared by the allocator and the device
//! implementations.
//!
//! ## Key Components
//! - `MtResource`: Thread-safe resource with read-write locking, used as the
//!   per-memory-type pool lock and for device bookkeeping state

pub mod mt_resource;

pub use mt_resource::MtResource;
