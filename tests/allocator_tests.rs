use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tensor_alloc::error::Error;
use tensor_alloc::memory::{
    create_allocator, AllocRequest, Allocation, BestFit, BestFitAllocator, FirstFit, FirstFitAllocator,
    HeapAllocator, MemberState, MultiBucketAllocator, PlacementKind, PlacementPolicy, Range, RangeAllocator,
    SectionAlloc, SectionTracker,
};
use tensor_alloc::{allocate_tensor, free_tensor, SectionInfo, TensorDesc, TensorStore, TensorTable, Tier};

const HEAP_SIZE: u64 = 1 << 14;

// Random allocate/free traffic; the heap must stay tiled and coalesced
fn stress<P: PlacementPolicy>(mut heap: HeapAllocator<P>, seed: u64) {
    heap.init(HEAP_SIZE, 0);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<(u64, u64)> = Vec::new();

    for _ in 0..2000 {
        if !live.is_empty() && rng.gen_bool(0.4) {
            let (address, size) = live.swap_remove(rng.gen_range(0..live.len()));
            assert_eq!(heap.free(address), size);
        } else {
            let size = rng.gen_range(1..=256u64);
            let alignment = 1u64 << rng.gen_range(0..7);
            let request = AllocRequest::new(size).aligned(alignment).allow_failure(true);
            if let Some(granted) = heap.allocate(&request) {
                assert_eq!(granted.address % alignment, 0);
                assert!(granted.size >= size);
                live.push((granted.address, granted.size));
            }
        }
        heap.check_tiling();
        assert_eq!(heap.currently_used(), live.iter().map(|(_, s)| s).sum::<u64>());
    }

    for (address, _) in live {
        heap.free(address);
    }
    heap.check_tiling();
    assert_eq!(heap.free_ranges(), vec![Range::new(0, HEAP_SIZE)]);
}

#[test]
fn test_random_traffic_keeps_heaps_tiled() {
    for seed in 0..4 {
        stress(FirstFitAllocator::with_policy("first_fit", FirstFit::new(false)), seed);
        stress(FirstFitAllocator::with_policy("cyclic", FirstFit::cyclic()), seed);
        stress(BestFitAllocator::with_policy("best_fit", BestFit::new()), seed);
    }
}

#[test]
fn test_cyclic_allocator_wraps_around() {
    let mut alloc = create_allocator(PlacementKind::Cyclic, "fast");
    alloc.init(1024, 0);
    let next = |alloc: &mut Box<dyn RangeAllocator>| alloc.allocate(&AllocRequest::new(300)).unwrap().address;

    assert_eq!(next(&mut alloc), 0);
    assert_eq!(next(&mut alloc), 300);
    assert_eq!(alloc.free(0), 300);
    assert_eq!(next(&mut alloc), 600);
    assert_eq!(next(&mut alloc), 0);
    assert_eq!(alloc.max_free_contiguous(), 124);
    assert!(alloc.allocate(&AllocRequest::new(300).allow_failure(true)).is_none());
}

#[test]
fn test_cloned_allocator_is_independent() {
    let mut alloc = create_allocator(PlacementKind::BestFit, "slow");
    alloc.init(4096, 0x8000);
    let a = alloc.allocate(&AllocRequest::new(1000)).unwrap();

    let mut copy = alloc.clone();
    copy.allocate(&AllocRequest::new(3000)).unwrap();
    copy.free(a.address);

    assert!(alloc.is_allocated(a.address));
    assert_eq!(alloc.currently_used(), 1000);
    assert_eq!(copy.currently_used(), 3000);
}

fn section_store() -> (TensorTable, usize, usize) {
    let mut store = TensorTable::new();
    let a = store.add(TensorDesc::new("a", 64).in_section(SectionInfo::new(7, 0)));
    let b = store.add(TensorDesc::new("b", 32).in_section(SectionInfo::new(7, 64)));
    (store, a, b)
}

#[test]
fn test_section_members_share_one_allocation() {
    let (mut store, a, b) = section_store();
    let mut tracker = SectionTracker::from_store(&store);
    let mut alloc = create_allocator(PlacementKind::FirstFit, "slow");
    alloc.init(4096, 0x1000);

    allocate_tensor(&mut store, a, Tier::Slow, alloc.as_mut(), false, Some(&mut tracker), None).unwrap();
    allocate_tensor(&mut store, b, Tier::Slow, alloc.as_mut(), false, Some(&mut tracker), None).unwrap();
    assert_eq!(store.placement(a).unwrap().offset, 0x1000);
    assert_eq!(store.placement(b).unwrap().offset, 0x1000 + 64);
    assert_eq!(alloc.currently_used(), 96);
    assert_eq!(tracker.counters(7), Some((0, 2, 0)));

    assert_eq!(free_tensor(&store, a, alloc.as_mut(), Some(&mut tracker)), 0);
    assert_eq!(tracker.section_addr(7), Some(0x1000));
    assert_eq!(free_tensor(&store, b, alloc.as_mut(), Some(&mut tracker)), 96);
    assert_eq!(tracker.section_addr(7), None);
    assert_eq!(tracker.counters(7), Some((0, 0, 2)));
    tracker.verify_all_done();
}

#[test]
fn test_failed_section_allocation_rolls_back() {
    let (mut store, a, _) = section_store();
    let mut tracker = SectionTracker::from_store(&store);
    let mut alloc = create_allocator(PlacementKind::FirstFit, "tiny");
    alloc.init(64, 0);

    let err = allocate_tensor(&mut store, a, Tier::Fast, alloc.as_mut(), true, Some(&mut tracker), None).unwrap_err();
    assert!(matches!(err, Error::AllocationFailed { tensor, .. } if tensor == a));
    assert_eq!(tracker.state(a), Some(MemberState::Unallocated));
    assert_eq!(tracker.counters(7), Some((2, 0, 0)));
    assert!(store.placement(a).is_none());
    tracker.check_consistency();
}

#[test]
fn test_fallback_releases_abandoned_section() {
    let (store, a, b) = section_store();
    let mut tracker = SectionTracker::from_store(&store);

    assert!(matches!(
        tracker.mark_as_alloc(a),
        SectionAlloc::NeedsAllocation { section: 7, size: 96, .. }
    ));
    tracker.set_section_base_addr(7, 0x40);
    // b was never allocated, so the section is not done yet
    assert!(!tracker.mark_as_free(a, false));
    assert_eq!(tracker.state(b), Some(MemberState::Unallocated));

    assert_eq!(tracker.handle_unallocated_fallback(a), Some(0x40));
    assert_eq!(tracker.section_addr(7), None);
    assert_eq!(tracker.counters(7), Some((2, 0, 0)));
    tracker.check_consistency();
}

#[test]
fn test_fallback_returns_section_memory_to_allocator() {
    let (mut store, a, b) = section_store();
    let mut tracker = SectionTracker::from_store(&store);
    let mut alloc = create_allocator(PlacementKind::FirstFit, "slow");
    alloc.init(4096, 0x1000);

    allocate_tensor(&mut store, a, Tier::Slow, alloc.as_mut(), false, Some(&mut tracker), None).unwrap();
    assert_eq!(free_tensor(&store, a, alloc.as_mut(), Some(&mut tracker)), 0);
    assert_eq!(alloc.currently_used(), 96);

    // b gets its own allocation, so the section memory is abandoned
    let base = tracker.handle_unallocated_fallback(a).unwrap();
    assert_eq!(base, 0x1000);
    assert_eq!(alloc.free(base), 96);
    allocate_tensor(&mut store, b, Tier::Slow, alloc.as_mut(), false, None, None).unwrap();
    assert_eq!(store.placement(b).unwrap().offset, 0x1000);
    assert_eq!(alloc.currently_used(), 32);
    tracker.verify_all_done();
}

#[test]
fn test_section_counters_stay_consistent_under_random_traffic() {
    const SECTIONS: [(u64, usize); 3] = [(1, 2), (2, 3), (3, 4)];
    let mut store = TensorTable::new();
    let mut members = Vec::new();
    for (section, count) in SECTIONS {
        for i in 0..count {
            let info = SectionInfo::new(section, 64 * i as u64);
            members.push(store.add(TensorDesc::new(format!("s{}m{}", section, i), 64).in_section(info)));
        }
    }

    let mut tracker = SectionTracker::from_store(&store);
    let mut rng = StdRng::seed_from_u64(7);
    // Base address currently held by each section
    let mut held: BTreeMap<u64, u64> = BTreeMap::new();
    let (mut allocations, mut releases) = (0u64, 0u64);

    for _ in 0..3000 {
        let tensor = members[rng.gen_range(0..members.len())];
        let section = tracker.section_of(tensor).unwrap();
        let base = tracker.section_addr(section);

        let released = match tracker.state(tensor).unwrap() {
            MemberState::Unallocated => {
                match tracker.mark_as_alloc(tensor) {
                    SectionAlloc::NeedsAllocation { .. } if rng.gen_bool(0.2) => {
                        // The allocator had no room
                        assert!(!tracker.mark_as_free(tensor, true));
                    }
                    SectionAlloc::NeedsAllocation { .. } => {
                        allocations += 1;
                        tracker.set_section_base_addr(section, 0x1000 * allocations);
                        assert!(held.insert(section, 0x1000 * allocations).is_none());
                    }
                    SectionAlloc::Offset(address) => {
                        let offset = store.desc(tensor).section.unwrap().offset_from_base;
                        assert_eq!(held.get(&section).copied(), Some(address - offset));
                    }
                }
                None
            }
            MemberState::Allocated => {
                let rollback = rng.gen_bool(0.3);
                tracker.mark_as_free(tensor, rollback).then_some(base).flatten()
            }
            MemberState::Freed if rng.gen_bool(0.5) => tracker.handle_unallocated_fallback(tensor),
            MemberState::Freed => tracker.mark_as_free(tensor, true).then_some(base).flatten(),
        };
        if let Some(address) = released {
            releases += 1;
            assert_eq!(held.remove(&section), Some(address));
        }

        for (section, count) in SECTIONS {
            let (unallocated, allocated, freed) = tracker.counters(section).unwrap();
            assert_eq!(unallocated + allocated + freed, count);
            assert_eq!(tracker.section_addr(section), held.get(&section).copied());
        }
        tracker.check_consistency();
    }

    for &tensor in &members {
        let section = tracker.section_of(tensor).unwrap();
        let base = tracker.section_addr(section);
        let released = match tracker.state(tensor) {
            Some(MemberState::Allocated) => tracker.mark_as_free(tensor, false).then_some(base).flatten(),
            _ => None,
        };
        if let Some(address) = released {
            releases += 1;
            assert_eq!(held.remove(&section), Some(address));
        }
    }
    for &tensor in &members {
        if tracker.state(tensor) == Some(MemberState::Freed) {
            if let Some(address) = tracker.handle_unallocated_fallback(tensor) {
                releases += 1;
                assert_eq!(held.remove(&tracker.section_of(tensor).unwrap()), Some(address));
            }
        }
    }
    assert!(held.is_empty());
    assert_eq!(allocations, releases);
    tracker.verify_all_done();
}

#[test]
#[should_panic(expected = "allocated again after being freed")]
fn test_section_member_cannot_be_revived() {
    let (store, a, b) = section_store();
    let mut tracker = SectionTracker::from_store(&store);
    tracker.mark_as_alloc(a);
    tracker.set_section_base_addr(7, 0);
    tracker.mark_as_alloc(b);
    tracker.mark_as_free(a, false);
    tracker.mark_as_alloc(a);
}

#[test]
fn test_zero_sized_tensor_takes_no_memory() {
    let mut store = TensorTable::new();
    let empty = store.add(TensorDesc::new("empty", 0));
    let mut alloc = create_allocator(PlacementKind::Cyclic, "fast");
    alloc.init(256, 0x200);

    allocate_tensor(&mut store, empty, Tier::Fast, alloc.as_mut(), false, None, None).unwrap();
    assert_eq!(store.placement(empty).unwrap().offset, 0x200);
    assert_eq!(alloc.currently_used(), 0);
    assert_eq!(free_tensor(&store, empty, alloc.as_mut(), None), 0);
}

#[test]
fn test_zero_sized_requests_take_no_memory() {
    let mut heap = HeapAllocator::first_fit("fast", true);
    heap.init(1024, 0x400);
    assert_eq!(heap.allocate(&AllocRequest::new(0)), Some(Allocation { address: 0x400, size: 0 }));
    assert_eq!(heap.currently_used(), 0);
    assert_eq!(heap.allocate(&AllocRequest::new(16)).unwrap().address, 0x400);
    heap.check_tiling();

    let mut pools = MultiBucketAllocator::new(&[256], heap);
    assert_eq!(pools.allocate(&AllocRequest::new(0)).unwrap().size, 0);
    assert_eq!(pools.idle_blocks(), 0);
    assert_eq!(pools.currently_used(), 16);
}

#[test]
fn test_zero_sized_section_is_placed_at_base() {
    let mut store = TensorTable::new();
    let x = store.add(TensorDesc::new("x", 0).in_section(SectionInfo::new(9, 0)));
    let y = store.add(TensorDesc::new("y", 0).in_section(SectionInfo::new(9, 0)));
    let mut tracker = SectionTracker::from_store(&store);
    let mut alloc = create_allocator(PlacementKind::BestFit, "slow");
    alloc.init(256, 0x100);

    allocate_tensor(&mut store, x, Tier::Slow, alloc.as_mut(), false, Some(&mut tracker), None).unwrap();
    allocate_tensor(&mut store, y, Tier::Slow, alloc.as_mut(), false, Some(&mut tracker), None).unwrap();
    assert_eq!(store.placement(x).unwrap().offset, 0x100);
    assert_eq!(store.placement(y).unwrap().offset, 0x100);
    assert_eq!(alloc.currently_used(), 0);

    assert_eq!(free_tensor(&store, x, alloc.as_mut(), Some(&mut tracker)), 0);
    assert_eq!(free_tensor(&store, y, alloc.as_mut(), Some(&mut tracker)), 0);
    tracker.verify_all_done();
    assert_eq!(alloc.max_free_contiguous(), 256);
}

#[test]
fn test_pools_release_idle_blocks_under_pressure() {
    let mut backing = HeapAllocator::first_fit("slow", false);
    backing.init(4096, 0);
    let mut pools = MultiBucketAllocator::new(&[256, 1024], backing);

    let small = pools.allocate(&AllocRequest::new(100)).unwrap();
    assert_eq!((small.address, small.size), (0, 256));
    pools.free(small.address);
    assert_eq!(pools.idle_blocks(), 1);
    assert_eq!(pools.allocate(&AllocRequest::new(200)).unwrap().address, 0);
    pools.free(0);

    // Only fits once the idle block is handed back
    let big = pools.allocate(&AllocRequest::new(4000)).unwrap();
    assert_eq!(big.address, 0);
    assert_eq!(pools.releases(), 1);
    assert_eq!(pools.idle_blocks(), 0);
    assert_eq!(pools.free(big.address), 4000);
}
