//! Property-based tests for bounds checks, address translation and the app
//! heap allocator.
//!
//! Uses `proptest` to generate random inputs and verify invariants:
//! - `validate_range` agrees with overflow-free arithmetic, near boundaries too
//! - app -> native -> app translation is the identity on valid offsets
//! - random malloc/free sequences never hand out overlapping blocks

use proptest::prelude::*;
use proptest::sample::Index;
use wasm_sandbox::memory::heap::HEAP_ALIGN;
use wasm_sandbox::memory::{AllocPolicy, HeapAllocator, MemoryInstance, validate_range};
use wasm_sandbox::test_harness::assert_disjoint;

const PAGE: u64 = 65536;

/// Offsets clustered around the end of a memory of `size` bytes.
fn near_boundary(size: u64) -> impl Strategy<Value = u32> {
    let end = size.min(u64::from(u32::MAX)) as i64;
    (-64i64..64).prop_map(move |delta| (end + delta).clamp(0, i64::from(u32::MAX)) as u32)
}

fn policy() -> impl Strategy<Value = AllocPolicy> {
    prop_oneof![Just(AllocPolicy::FirstFit), Just(AllocPolicy::BestFit)]
}

proptest! {
    #[test]
    fn validate_range_matches_wide_arithmetic(pages in 0u64..=4, offset: u32, size: u32) {
        let memory_size = pages * PAGE;
        let expected = u64::from(offset) + u64::from(size) <= memory_size;
        prop_assert_eq!(validate_range(memory_size, offset, size), expected);
    }

    #[test]
    fn validate_range_near_boundary(
        (pages, offset) in (0u64..=4).prop_flat_map(|p| (Just(p), near_boundary(p * PAGE))),
        size in 0u32..128,
    ) {
        let memory_size = pages * PAGE;
        let expected = u64::from(offset) + u64::from(size) <= memory_size;
        prop_assert_eq!(validate_range(memory_size, offset, size), expected);
    }

    #[test]
    fn validate_range_never_wraps(pages in 0u64..65536, size in 1u32..=u32::MAX) {
        prop_assert!(!validate_range(pages * PAGE, u32::MAX, size));
    }

    #[test]
    fn translation_round_trips(offset in 0u32..(2 * PAGE as u32)) {
        let memory = MemoryInstance::create(2, 2, false).expect("memory");
        let view = memory.view();
        let ptr = view.app_to_native(offset).expect("offset in bounds");
        prop_assert_eq!(view.native_to_app(ptr), Some(offset));
        prop_assert!(view.contains_native(ptr, 1));
    }

    #[test]
    fn allocator_blocks_never_overlap(
        ops in prop::collection::vec((any::<bool>(), 1u32..700, any::<Index>()), 1..300),
        policy in policy(),
    ) {
        const BASE: u32 = 4096;
        const SIZE: u32 = 16 * 1024;
        let mut heap = HeapAllocator::new(BASE, SIZE, policy);
        let mut live: Vec<(u32, u32)> = Vec::new();

        for (alloc, size, pick) in ops {
            if alloc || live.is_empty() {
                if let Some(offset) = heap.malloc(size) {
                    prop_assert!(offset >= BASE);
                    prop_assert!(u64::from(offset) + u64::from(size) <= u64::from(BASE + SIZE));
                    prop_assert_eq!(offset % HEAP_ALIGN, 0);
                    live.push((offset, size));
                    assert_disjoint(&live);
                }
            } else {
                let (offset, _) = live.swap_remove(pick.index(live.len()));
                prop_assert!(heap.free(offset).is_ok());
                prop_assert!(heap.free(offset).is_err(), "double free must be detected");
            }
        }

        prop_assert_eq!(heap.stats().live_blocks, live.len());
        for (offset, _) in live {
            prop_assert!(heap.free(offset).is_ok());
        }
        let stats = heap.stats();
        prop_assert_eq!(stats.total_free, stats.total_size);
    }
}
