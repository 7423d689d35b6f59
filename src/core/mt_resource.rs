//! # Multi-threaded Resource Module
//!
//! A read-write locked container for state shared across threads. The
//! allocator keeps one per memory type, and the host device keeps its
//! bookkeeping in one.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A thread-safe resource container with read-write locking.
///
/// `MtResource` is the lock that guards one memory type's pool inside the
/// [`Allocator`](crate::allocator::Allocator). Every mutation (allocate, free,
/// trim) goes through [`get_mut`](Self::get_mut) and is therefore fully
/// serialized; statistics and validation only need [`get`](Self::get) and may
/// run concurrently with each other.
///
/// # Type Parameters
/// - `T`: The type of the contained resource, must be `Send + Sync`
///
/// # Examples
///
/// ```
/// use voxel_memory::core::MtResource;
///
/// let counter = MtResource::new(0u64);
/// *counter.get_mut() += 64;
/// assert_eq!(*counter.get(), 64);
/// ```
///
/// # Panics
/// Both accessors panic if the lock is poisoned. A pool that was being mutated
/// when another thread panicked can no longer be trusted to uphold its
/// invariants, so continuing would risk handing out aliased memory.
#[derive(Debug, Default)]
pub struct MtResource<T: Send + Sync> {
    resource: RwLock<T>,
}

impl<T: Send + Sync> MtResource<T> {
    /// Creates a new `MtResource` containing the given value.
    pub fn new(resource: T) -> Self {
        Self {
            resource: RwLock::new(resource),
        }
    }

    /// Returns a read-only guard that allows reading the contained value.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn get(&self) -> RwLockReadGuard<'_, T> {
        self.resource.read().expect("MtResource lock poisoned")
    }

    /// Returns an exclusive guard that allows modifying the contained value.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn get_mut(&self) -> RwLockWriteGuard<'_, T> {
        self.resource.write().expect("MtResource lock poisoned")
    }

    /// Mutable access without locking, available when the container itself is
    /// uniquely borrowed (for example while the owner is being dropped).
    ///
    /// Poisoning is ignored here so that teardown can still release resources.
    pub fn get_exclusive(&mut self) -> &mut T {
        self.resource
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
