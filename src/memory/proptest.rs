//! Property-Based Tests for the Free-List Allocator
//!
//! # Test Properties
//!
//! 1. **No spurious failure**: allocations whose blocks fit the arena succeed
//! 2. **No overlap**: live allocations never share bytes
//! 3. **Full recovery**: freeing everything restores one node spanning the arena

#![cfg(test)]

use proptest::prelude::*;

use super::free_list::{FreeList, HEADER_SIZE, NODE_SIZE, TAG_SIZE};

const ARENA: u32 = 4096;

#[derive(Debug, Clone)]
enum Op {
    Alloc(u32),
    Free(usize),
}

// =============================================================================
// Property Strategies
// =============================================================================

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..300).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

fn block_len(size: u32) -> u32 {
    (size + TAG_SIZE).max(NODE_SIZE)
}

fn overlaps(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.0 + b.1 && b.0 < a.0 + a.1
}

// =============================================================================
// Allocation Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: a sequence of allocations whose blocks sum below the usable
    /// size never fails.
    #[test]
    fn prop_alloc_under_capacity_succeeds(sizes in prop::collection::vec(1u32..400, 1..40)) {
        let mut list = FreeList::new(ARENA);
        let usable = ARENA - HEADER_SIZE;
        let mut used = 0u32;

        for size in sizes {
            if used + block_len(size) >= usable {
                break;
            }
            used += block_len(size);
            let offset = list.alloc(size);
            prop_assert!(offset.is_some(), "alloc({}) failed with {} used", size, used);
            prop_assert!(offset.unwrap() >= HEADER_SIZE + TAG_SIZE);
        }
    }

    /// Property: alloc then immediate free restores the remaining size.
    #[test]
    fn prop_alloc_free_round_trip(
        prefix in prop::collection::vec(1u32..200, 0..10),
        size in 1u32..500,
    ) {
        let mut list = FreeList::new(ARENA);
        for s in prefix {
            list.alloc(s);
        }
        let before = list.remaining_size();
        if let Some(offset) = list.alloc(size) {
            prop_assert!(list.free(offset));
        }
        prop_assert_eq!(list.remaining_size(), before);
    }

    /// Property: live payloads never overlap, and freeing everything coalesces
    /// back into a single node.
    #[test]
    fn prop_no_overlap_and_full_recovery(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let mut list = FreeList::new(ARENA);
        let mut live: Vec<(u32, u32)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Some(offset) = list.alloc(size) {
                        let range = (offset, size);
                        for other in &live {
                            prop_assert!(!overlaps(range, *other), "{:?} overlaps {:?}", range, other);
                        }
                        prop_assert!(offset + size <= ARENA);
                        live.push(range);
                    }
                }
                Op::Free(idx) => {
                    if !live.is_empty() {
                        let (offset, _) = live.swap_remove(idx % live.len());
                        prop_assert!(list.free(offset));
                    }
                }
            }
        }

        for (offset, _) in live.drain(..) {
            prop_assert!(list.free(offset));
        }
        prop_assert_eq!(list.remaining_size(), ARENA - HEADER_SIZE);
        prop_assert_eq!(list.free_nodes(), 1);
    }
}
