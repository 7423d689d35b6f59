//! Property tests for memory block bookkeeping.
//!
//! Random allocate/free sequences must keep every block invariant intact, never
//! hand out overlapping or misaligned ranges, respect buffer-image granularity,
//! undo exactly when an allocation is released again, and collapse back into
//! one free range once everything is released.

use proptest::prelude::*;
use voxel_memory::allocator::{
    suballocation::{are_on_same_page, has_granularity_conflict},
    MemoryBlock, MemoryId, SlotId, Suballocation, SuballocationKind,
};

const BLOCK_SIZE: u64 = 8192;
const GRANULARITY: u64 = 256;
const MIN_FREE_REGISTER_SIZE: u64 = 16;

#[derive(Clone, Debug)]
enum Op {
    Allocate {
        size: u64,
        alignment: u64,
        kind: SuballocationKind,
    },
    Free {
        pick: usize,
    },
}

#[derive(Clone, Debug)]
struct Live {
    slot: SlotId,
    offset: u64,
    size: u64,
    kind: SuballocationKind,
}

fn kind_strategy() -> impl Strategy<Value = SuballocationKind> {
    prop_oneof![
        Just(SuballocationKind::Unknown),
        Just(SuballocationKind::Buffer),
        Just(SuballocationKind::ImageLinear),
        Just(SuballocationKind::ImageOptimal),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..1024, 0u32..9, kind_strategy()).prop_map(|(size, shift, kind)| Op::Allocate {
            size,
            alignment: 1 << shift,
            kind,
        }),
        2 => any::<usize>().prop_map(|pick| Op::Free { pick }),
    ]
}

fn block() -> MemoryBlock<()> {
    MemoryBlock::new(MemoryId(1), (), BLOCK_SIZE, MIN_FREE_REGISTER_SIZE)
}

fn try_allocate(
    block: &mut MemoryBlock<()>,
    size: u64,
    alignment: u64,
    kind: SuballocationKind,
) -> Option<Live> {
    let request = block
        .request_suballocation(GRANULARITY, size, alignment, kind)
        .ok()?;
    let offset = request.offset();
    let slot = block.allocate(request, kind, size);

    Some(Live {
        slot,
        offset,
        size,
        kind,
    })
}

/// Checks overlap, alignment bookkeeping and granularity between live ranges.
fn check_live_ranges(live: &[Live]) -> Result<(), TestCaseError> {
    let mut sorted: Vec<&Live> = live.iter().collect();
    sorted.sort_by_key(|allocation| allocation.offset);

    for pair in sorted.windows(2) {
        let (lower, upper) = (pair[0], pair[1]);
        prop_assert!(
            lower.offset + lower.size <= upper.offset,
            "{:?} overlaps {:?}",
            lower,
            upper
        );
        if has_granularity_conflict(lower.kind, upper.kind) {
            prop_assert!(
                !are_on_same_page(lower.offset, lower.size, upper.offset, GRANULARITY),
                "{:?} shares a page with {:?}",
                lower,
                upper
            );
        }
    }
    if let Some(last) = sorted.last() {
        prop_assert!(last.offset + last.size <= BLOCK_SIZE);
    }

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn random_sequences_keep_invariants(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        let mut block = block();
        let mut live: Vec<Live> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { size, alignment, kind } => {
                    if let Some(allocation) = try_allocate(&mut block, size, alignment, kind) {
                        prop_assert_eq!(allocation.offset % alignment, 0);
                        live.push(allocation);
                    }
                }
                Op::Free { pick } => {
                    if !live.is_empty() {
                        let allocation = live.swap_remove(pick % live.len());
                        let freed = block
                            .free_suballocation(allocation.slot, allocation.offset)
                            .unwrap();
                        prop_assert_eq!(freed, allocation.size);
                    }
                }
            }

            prop_assert_eq!(block.validate(), Ok(()));
            prop_assert_eq!(block.allocation_count(), live.len());
            prop_assert_eq!(
                block.free_size(),
                BLOCK_SIZE - live.iter().map(|allocation| allocation.size).sum::<u64>()
            );
            check_live_ranges(&live)?;
        }
    }

    #[test]
    fn freeing_everything_in_any_order_restores_one_range(
        sizes in proptest::collection::vec((1u64..600, 0u32..7, kind_strategy()), 1..24),
        order in any::<u64>(),
    ) {
        let mut block = block();
        let mut live: Vec<Live> = sizes
            .into_iter()
            .filter_map(|(size, shift, kind)| try_allocate(&mut block, size, 1 << shift, kind))
            .collect();

        fastrand::Rng::with_seed(order).shuffle(&mut live);
        for allocation in &live {
            block.free(allocation.offset).unwrap();
            prop_assert_eq!(block.validate(), Ok(()));
        }

        prop_assert!(block.is_empty());
        prop_assert_eq!(block.free_size(), BLOCK_SIZE);
        prop_assert_eq!(block.free_count(), 1);
        prop_assert_eq!(block.largest_free_range(), BLOCK_SIZE);
        let suballocations: Vec<_> = block.suballocations().collect();
        prop_assert_eq!(suballocations.len(), 1);
        prop_assert_eq!(suballocations[0].offset, 0);
        prop_assert_eq!(suballocations[0].size, BLOCK_SIZE);
    }

    #[test]
    fn allocate_then_free_restores_the_block(
        setup in proptest::collection::vec((1u64..600, 0u32..7, kind_strategy(), any::<bool>()), 1..24),
        size in 1u64..1024,
        shift in 0u32..9,
        kind in kind_strategy(),
    ) {
        let mut block = block();
        for (size, shift, kind, keep) in setup {
            if let Some(allocation) = try_allocate(&mut block, size, 1 << shift, kind) {
                if !keep {
                    block.free_suballocation(allocation.slot, allocation.offset).unwrap();
                }
            }
        }
        let before = block.snapshot();

        let Some(allocation) = try_allocate(&mut block, size, 1 << shift, kind) else {
            prop_assert_eq!(block.snapshot(), before);
            return Ok(());
        };
        block.free_suballocation(allocation.slot, allocation.offset).unwrap();
        let after = block.snapshot();

        prop_assert_eq!(block.validate(), Ok(()));
        prop_assert_eq!(&after.suballocations, &before.suballocations);
        prop_assert_eq!(after.free_size, before.free_size);
        prop_assert_eq!(after.free_count, before.free_count);
        prop_assert_eq!(after.allocation_count, before.allocation_count);

        let by_size_and_offset = |list: &[Suballocation]| {
            let mut ranges: Vec<(u64, u64)> = list.iter().map(|free| (free.size, free.offset)).collect();
            ranges.sort_unstable();
            ranges
        };
        prop_assert_eq!(
            by_size_and_offset(&after.free_list),
            by_size_and_offset(&before.free_list)
        );
    }

    #[test]
    fn stale_slots_are_always_rejected(
        sizes in proptest::collection::vec(16u64..400, 2..12),
        victim in any::<usize>(),
    ) {
        let mut block = block();
        let live: Vec<Live> = sizes
            .into_iter()
            .filter_map(|size| try_allocate(&mut block, size, 16, SuballocationKind::Buffer))
            .collect();
        prop_assume!(!live.is_empty());

        let allocation = &live[victim % live.len()];
        block.free_suballocation(allocation.slot, allocation.offset).unwrap();
        let before = block.snapshot();

        prop_assert!(block.free_suballocation(allocation.slot, allocation.offset).is_err());
        prop_assert_eq!(block.snapshot(), before);
    }
}
