//! # Suballocation Module
//!
//! Value types shared by blocks, collections and the allocator: the resource
//! kind of a suballocation, the suballocation record itself, identities for
//! backing memory and slots, and the alignment and page arithmetic used during
//! placement.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

/// The resource kind occupying a suballocation.
///
/// The kind decides which neighbours may share a buffer-image granularity
/// page. Linear resources (buffers, linear images) may share a page with each
/// other but not with optimally tiled images; `Unknown` conflicts with every
/// allocated kind.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive, Serialize, Deserialize,
)]
pub enum SuballocationKind {
    /// Unused range available for placement.
    Free = 0,

    /// A resource whose tiling is not known to the allocator.
    Unknown = 1,

    /// A buffer (vertex, index, uniform, indirect, staging).
    Buffer = 2,

    /// An image with linear tiling.
    ImageLinear = 3,

    /// An image with optimal (driver-defined) tiling.
    ImageOptimal = 4,
}

impl SuballocationKind {
    /// All kinds that can be requested by callers, in discriminant order.
    pub fn allocatable() -> [SuballocationKind; 4] {
        [
            SuballocationKind::Unknown,
            SuballocationKind::Buffer,
            SuballocationKind::ImageLinear,
            SuballocationKind::ImageOptimal,
        ]
    }

    /// Converts a raw discriminant back into a kind.
    ///
    /// Returns `None` for values outside the enum.
    pub fn from_u8(value: u8) -> Option<Self> {
        num::FromPrimitive::from_u8(value)
    }

    /// Whether the range is unused.
    pub fn is_free(self) -> bool {
        self == SuballocationKind::Free
    }
}

/// Returns `true` if resources of kinds `a` and `b` must not share a page of
/// buffer-image granularity. The relation is symmetric.
pub fn has_granularity_conflict(a: SuballocationKind, b: SuballocationKind) -> bool {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };

    match low {
        SuballocationKind::Free => false,
        SuballocationKind::Unknown => true,
        SuballocationKind::Buffer | SuballocationKind::ImageLinear => {
            high == SuballocationKind::ImageOptimal
        }
        SuballocationKind::ImageOptimal => false,
    }
}

/// A contiguous tagged range inside a memory block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suballocation {
    /// Byte offset from the start of the block
    pub offset: u64,
    /// Size in bytes, never zero
    pub size: u64,
    /// What occupies the range
    pub kind: SuballocationKind,
}

impl Suballocation {
    /// One past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Process-unique identity of one backing device allocation.
///
/// Ids come from one counter shared by every allocator and are never reused,
/// so a handle that names released memory, or memory of another allocator,
/// can never match a live block.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MemoryId(pub u64);

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

impl MemoryId {
    /// Takes the next unused id.
    pub fn unique() -> Self {
        MemoryId(NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Generation-checked reference to a suballocation slot inside a block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    /// Index into the block's slot arena
    pub index: u32,
    /// Generation of the slot when the id was issued
    pub generation: u32,
}

/// Rounds `value` up to a multiple of `alignment`, which must be a power of two.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment`, which must be a power of two.
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Checks whether the last byte of range A and the first byte of B fall on the
/// same page.
///
/// Assumes `a_size > 0` and that A ends at or before `b_offset`.
pub fn are_on_same_page(a_offset: u64, a_size: u64, b_offset: u64, page_size: u64) -> bool {
    debug_assert!(a_size > 0);
    debug_assert!(a_offset + a_size <= b_offset);

    let a_end = a_offset + a_size - 1;
    align_down(a_end, page_size) == align_down(b_offset, page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_conflicts_are_symmetric() {
        let all = [
            SuballocationKind::Free,
            SuballocationKind::Unknown,
            SuballocationKind::Buffer,
            SuballocationKind::ImageLinear,
            SuballocationKind::ImageOptimal,
        ];
        for a in all {
            for b in all {
                assert_eq!(
                    has_granularity_conflict(a, b),
                    has_granularity_conflict(b, a),
                    "{a:?} vs {b:?}"
                );
            }
        }
    }

    #[test]
    fn linear_resources_share_pages() {
        use SuballocationKind::*;

        assert!(!has_granularity_conflict(Buffer, Buffer));
        assert!(!has_granularity_conflict(Buffer, ImageLinear));
        assert!(!has_granularity_conflict(ImageOptimal, ImageOptimal));
        assert!(has_granularity_conflict(Buffer, ImageOptimal));
        assert!(has_granularity_conflict(ImageLinear, ImageOptimal));
        assert!(has_granularity_conflict(Unknown, Unknown));
        assert!(has_granularity_conflict(Unknown, Buffer));
        assert!(!has_granularity_conflict(Free, Unknown));
    }

    #[test]
    fn page_checks() {
        assert!(are_on_same_page(0, 10, 20, 64));
        assert!(!are_on_same_page(0, 64, 64, 64));
        assert!(are_on_same_page(60, 10, 100, 64));
        assert!(!are_on_same_page(0, 10, 128, 64));
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(64, 16), 64);
        assert_eq!(align_down(127, 64), 64);
    }

    #[test]
    fn kinds_convert_from_raw() {
        assert_eq!(SuballocationKind::from_u8(2), Some(SuballocationKind::Buffer));
        assert_eq!(SuballocationKind::from_u8(9), None);
    }
}
