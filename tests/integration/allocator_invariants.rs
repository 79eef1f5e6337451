#![allow(missing_docs)]

use std::time::{Duration, Instant};

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::primitives::alloc::{AllocationStrategy, Extent, ExtentAllocator};
use strata::types::{PageId, StrataError};

const TOTAL: u64 = 512;

#[derive(Clone, Debug)]
enum Op {
    Alloc(u64, AllocationStrategy),
    Free(usize),
    Coalesce,
}

fn strategy() -> impl Strategy<Value = AllocationStrategy> {
    prop_oneof![
        Just(AllocationStrategy::FirstFit),
        Just(AllocationStrategy::BestFit),
        Just(AllocationStrategy::WorstFit),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..40, strategy()).prop_map(|(n, s)| Op::Alloc(n, s)),
        3 => any::<usize>().prop_map(Op::Free),
        1 => Just(Op::Coalesce),
    ]
}

fn assert_partition(alloc: &ExtentAllocator, live: &[Extent]) {
    let snapshot = alloc.snapshot();
    let mut covered = vec![0u8; snapshot.total_pages as usize];
    covered[0] = 1;
    for extent in snapshot.extents.iter().chain(live) {
        for page in extent.iter_pages() {
            covered[page.0 as usize] += 1;
        }
    }
    assert!(
        covered.iter().all(|&c| c == 1),
        "every page must be free or allocated exactly once"
    );
    for pair in snapshot.extents.windows(2) {
        let end = pair[0].start.0 + pair[0].len;
        assert!(end < pair[1].start.0, "free extents must be sorted and not adjacent");
    }
    let free: u64 = snapshot.extents.iter().map(|e| e.len).sum();
    assert_eq!(alloc.free_pages(), free);
    alloc.check_invariants().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn free_and_allocated_pages_partition_the_file(ops in prop::collection::vec(op(), 1..200)) {
        let alloc = ExtentAllocator::new(1);
        alloc.grow(TOTAL - 1).unwrap();
        let mut live: Vec<Extent> = Vec::new();
        for op in ops {
            match op {
                Op::Alloc(n, s) => match alloc.allocate(n, s) {
                    Ok(extent) => {
                        prop_assert_eq!(extent.len, n);
                        live.push(extent);
                    }
                    Err(StrataError::OutOfSpace { requested }) => {
                        prop_assert_eq!(requested, n);
                        prop_assert!(alloc.largest_extent() < n);
                    }
                    Err(err) => prop_assert!(false, "unexpected error {err}"),
                },
                Op::Free(idx) if !live.is_empty() => {
                    let extent = live.swap_remove(idx % live.len());
                    alloc.free(extent).unwrap();
                }
                Op::Free(_) => {}
                Op::Coalesce => {
                    prop_assert_eq!(alloc.coalesce(), 0);
                }
            }
            assert_partition(&alloc, &live);
        }
        for extent in live.drain(..) {
            alloc.free(extent).unwrap();
        }
        prop_assert_eq!(alloc.extent_count(), 1);
        prop_assert_eq!(alloc.free_pages(), TOTAL - 1);
    }

    #[test]
    fn load_then_coalesce_is_idempotent(lens in prop::collection::vec(1u64..8, 1..40)) {
        // Back-to-back extents loaded unmerged collapse into one.
        let mut extents = Vec::new();
        let mut start = 1;
        for len in &lens {
            extents.push(Extent::new(PageId(start), *len));
            start += len;
        }
        let alloc = ExtentAllocator::with_extents(start, &extents).unwrap();
        prop_assert_eq!(alloc.extent_count(), lens.len());
        alloc.coalesce();
        prop_assert_eq!(alloc.extent_count(), 1);
        prop_assert_eq!(alloc.coalesce(), 0);
        prop_assert_eq!(alloc.largest_extent(), start - 1);
    }
}

#[test]
fn best_fit_from_a_single_thousand_page_extent() {
    let alloc = ExtentAllocator::with_extents(1_001, &[Extent::new(PageId(1), 1_000)]).unwrap();
    let prior = alloc.allocate(1, AllocationStrategy::FirstFit).unwrap();
    alloc.free(prior).unwrap();

    let extent = alloc.allocate(100, AllocationStrategy::BestFit).unwrap();
    assert_eq!(extent.len, 100);
    assert_eq!(alloc.extent_count(), 1);
    assert_eq!(alloc.extents(), vec![Extent::new(PageId(101), 900)]);
    assert!(alloc.is_range_allocated(extent));

    let next = alloc.allocate(10, AllocationStrategy::BestFit).unwrap();
    let overlap = next.start.0 < extent.start.0 + extent.len && extent.start.0 < next.start.0 + next.len;
    assert!(!overlap);
}

fn fragmented(extents: u64) -> ExtentAllocator {
    // Every other page free: `extents` single-page holes plus a large tail.
    let mut free: Vec<Extent> = (0..extents).map(|i| Extent::new(PageId(1 + 2 * i), 1)).collect();
    let tail = 1 + 2 * extents;
    free.push(Extent::new(PageId(tail), 1_000_000));
    ExtentAllocator::with_extents(tail + 1_000_000, &free).unwrap()
}

fn cycle_time(alloc: &ExtentAllocator, rounds: usize) -> Duration {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let strategies = [
        AllocationStrategy::FirstFit,
        AllocationStrategy::BestFit,
        AllocationStrategy::WorstFit,
    ];
    let start = Instant::now();
    for _ in 0..rounds {
        let len = rng.gen_range(2..16);
        let strategy = strategies[rng.gen_range(0..strategies.len())];
        let extent = alloc.allocate(len, strategy).unwrap();
        alloc.free(extent).unwrap();
    }
    start.elapsed()
}

#[test]
fn allocate_free_cycle_scales_sub_linearly() {
    let rounds = 20_000;
    let small = fragmented(2_000);
    let large = fragmented(20_000);
    // Warm both once so allocation of the maps themselves is not measured.
    cycle_time(&small, 1_000);
    cycle_time(&large, 1_000);
    let small_time = cycle_time(&small, rounds).max(Duration::from_micros(1));
    let large_time = cycle_time(&large, rounds);
    let ratio = large_time.as_secs_f64() / small_time.as_secs_f64();
    assert!(
        ratio < 5.0,
        "10x more extents slowed cycles by {ratio:.2}x (small={small_time:?}, large={large_time:?})"
    );
    small.check_invariants().unwrap();
    large.check_invariants().unwrap();
}
