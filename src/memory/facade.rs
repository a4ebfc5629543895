//! Entry points used by compiler passes to place and release tensors.
//!
//! `allocate_tensor` and `free_tensor` work on the real tensor behind any
//! alias, route section members through the section tracker, and write
//! the committed placement back into the tensor store.

use crate::error::{Error, Result};
use crate::memory::allocator::{AllocRequest, RangeAllocator};
use crate::memory::liveness::Lifetime;
use crate::memory::section::{SectionAlloc, SectionTracker};
use crate::model::{Placement, TensorDesc, TensorId, TensorStore, Tier};

/// Find an address for `desc` without touching the tensor store.
///
/// Zero-sized tensors take no memory and are placed at the allocator base.
pub(crate) fn place_tensor(
    desc: &TensorDesc,
    allocator: &mut dyn RangeAllocator,
    allow_failure: bool,
    tracker: Option<&mut SectionTracker>,
    lifetime: Option<Lifetime>,
) -> Option<u64> {
    if let Some(tracker) = tracker.filter(|t| t.is_member(desc.id)) {
        return place_section_member(desc, allocator, allow_failure, tracker);
    }

    if desc.padded_size() == 0 {
        return Some(allocator.base());
    }

    let request = AllocRequest::new(desc.size)
        .aligned(desc.alignment)
        .with_offset(desc.offset)
        .allow_failure(allow_failure);
    let granted = match lifetime {
        Some(lifetime) => allocator.allocate_with_lifetime(&request, lifetime),
        None => allocator.allocate(&request),
    };
    granted.map(|a| a.address)
}

fn place_section_member(
    desc: &TensorDesc,
    allocator: &mut dyn RangeAllocator,
    allow_failure: bool,
    tracker: &mut SectionTracker,
) -> Option<u64> {
    let offset_from_base = desc.section.map_or(0, |s| s.offset_from_base);
    match tracker.mark_as_alloc(desc.id) {
        SectionAlloc::Offset(address) => Some(address),
        SectionAlloc::NeedsAllocation { section, size: 0, .. } => {
            let base = allocator.base();
            tracker.set_section_base_addr(section, base);
            Some(base + offset_from_base)
        }
        SectionAlloc::NeedsAllocation { section, size, alignment } => {
            let request = AllocRequest::new(size)
                .aligned(alignment)
                .allow_failure(allow_failure);
            match allocator.allocate(&request) {
                Some(granted) => {
                    tracker.set_section_base_addr(section, granted.address);
                    Some(granted.address + offset_from_base)
                }
                None => {
                    tracker.mark_as_free(desc.id, true);
                    None
                }
            }
        }
    }
}

/// Release the memory held by `desc` at `address`, returning the bytes
/// given back to the allocator (0 while a section is still in use).
pub(crate) fn release_tensor(
    desc: &TensorDesc,
    address: u64,
    allocator: &mut dyn RangeAllocator,
    tracker: Option<&mut SectionTracker>,
    rollback: bool,
) -> u64 {
    if let Some(tracker) = tracker.filter(|t| t.is_member(desc.id)) {
        let section = tracker.section_of(desc.id);
        let base = section
            .filter(|&s| tracker.section_size(s) > 0)
            .and_then(|s| tracker.section_addr(s));
        if tracker.mark_as_free(desc.id, rollback) {
            if let Some(base) = base {
                return allocator.free(base);
            }
        }
        return 0;
    }

    if desc.padded_size() == 0 {
        return 0;
    }
    allocator.free(address)
}

/// Allocate the real tensor behind `tensor` in `tier` and commit its
/// placement.
///
/// A failed allocation is returned as `Error::AllocationFailed`; with
/// `allow_failure` the failure is expected by the caller and only logged
/// at trace level.
pub fn allocate_tensor<S: TensorStore + ?Sized>(
    store: &mut S,
    tensor: TensorId,
    tier: Tier,
    allocator: &mut dyn RangeAllocator,
    allow_failure: bool,
    tracker: Option<&mut SectionTracker>,
    lifetime: Option<Lifetime>,
) -> Result<()> {
    let real = store.real_tensor(tensor);
    let desc = store.desc(real);

    match place_tensor(desc, allocator, allow_failure, tracker, lifetime) {
        Some(offset) => {
            log::debug!(
                "tensor {} ({}) placed in {} memory at 0x{:x}, size 0x{:x}",
                desc.name,
                real,
                tier,
                offset,
                desc.size
            );
            store.commit(real, Placement { tier, offset });
            Ok(())
        }
        None => {
            if allow_failure {
                log::trace!("failed to allocate tensor {} in {} memory", desc.name, tier);
            } else {
                log::error!(
                    "failed to allocate tensor {} in {} memory ({} bytes, {} free contiguous)",
                    desc.name,
                    tier,
                    desc.padded_size(),
                    allocator.max_free_contiguous()
                );
            }
            Err(Error::AllocationFailed {
                tensor: real,
                name: desc.name.clone(),
                tier,
                size: desc.padded_size(),
            })
        }
    }
}

/// Release the memory of the real tensor behind `tensor`.
///
/// The committed placement is kept as the final result. Freeing a tensor
/// that was never allocated panics.
pub fn free_tensor<S: TensorStore + ?Sized>(
    store: &S,
    tensor: TensorId,
    allocator: &mut dyn RangeAllocator,
    tracker: Option<&mut SectionTracker>,
) -> u64 {
    let real = store.real_tensor(tensor);
    let desc = store.desc(real);
    let placement = store
        .placement(real)
        .unwrap_or_else(|| panic!("tensor {} ({}) is freed but was never allocated", desc.name, real));

    log::debug!(
        "free tensor {} ({}) from {} memory at 0x{:x}",
        desc.name,
        real,
        placement.tier,
        placement.offset
    );
    release_tensor(desc, placement.offset, allocator, tracker, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::{create_allocator, PlacementKind};
    use crate::model::{SectionInfo, TensorTable};

    fn allocator(size: u64) -> Box<dyn RangeAllocator> {
        let mut alloc = create_allocator(PlacementKind::FirstFit, "facade");
        alloc.init(size, 0x1000);
        alloc
    }

    #[test]
    fn test_allocate_and_free_through_alias() {
        let mut store = TensorTable::new();
        let real = store.add(TensorDesc::new("real", 100).with_alignment(64));
        let view = store.add(TensorDesc::new("view", 100).aliasing(real));
        let mut alloc = allocator(4096);

        allocate_tensor(&mut store, view, Tier::Fast, alloc.as_mut(), false, None, None).unwrap();
        assert_eq!(store.placement(real), Some(Placement { tier: Tier::Fast, offset: 0x1000 }));
        assert_eq!(alloc.currently_used(), 128);

        assert_eq!(free_tensor(&store, real, alloc.as_mut(), None), 128);
        assert_eq!(alloc.currently_used(), 0);
    }

    #[test]
    fn test_failure_reports_tensor_and_tier() {
        let mut store = TensorTable::new();
        let big = store.add(TensorDesc::new("big", 10_000));
        let mut alloc = allocator(4096);

        let err = allocate_tensor(&mut store, big, Tier::Slow, alloc.as_mut(), true, None, None).unwrap_err();
        match err {
            Error::AllocationFailed { tensor, name, tier, size } => {
                assert_eq!((tensor, name.as_str(), tier, size), (big, "big", Tier::Slow, 10_000));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(store.placement(big).is_none());
    }

    #[test]
    fn test_section_members_share_one_allocation() {
        let mut store = TensorTable::new();
        let a = store.add(TensorDesc::new("a", 64).in_section(SectionInfo::new(1, 0)));
        let b = store.add(TensorDesc::new("b", 64).in_section(SectionInfo::new(1, 64)));
        let mut tracker = SectionTracker::from_store(&store);
        let mut alloc = allocator(4096);

        allocate_tensor(&mut store, a, Tier::Fast, alloc.as_mut(), false, Some(&mut tracker), None).unwrap();
        allocate_tensor(&mut store, b, Tier::Fast, alloc.as_mut(), false, Some(&mut tracker), None).unwrap();
        assert_eq!(store.placement(b).map(|p| p.offset), Some(0x1040));
        assert_eq!(alloc.currently_used(), 128);

        assert_eq!(free_tensor(&store, a, alloc.as_mut(), Some(&mut tracker)), 0);
        assert_eq!(free_tensor(&store, b, alloc.as_mut(), Some(&mut tracker)), 128);
        assert_eq!(alloc.currently_used(), 0);
        tracker.verify_all_done();
    }

    #[test]
    fn test_failed_section_allocation_rolls_back() {
        let mut store = TensorTable::new();
        let a = store.add(TensorDesc::new("a", 8192).in_section(SectionInfo::new(3, 0)));
        let mut tracker = SectionTracker::from_store(&store);
        let mut alloc = allocator(4096);

        assert!(allocate_tensor(&mut store, a, Tier::Fast, alloc.as_mut(), true, Some(&mut tracker), None).is_err());
        assert_eq!(tracker.counters(3), Some((1, 0, 0)));
        tracker.verify_all_done();
    }

    #[test]
    fn test_zero_sized_tensor_takes_no_memory() {
        let mut store = TensorTable::new();
        let empty = store.add(TensorDesc::new("empty", 0));
        let mut alloc = allocator(4096);
        allocate_tensor(&mut store, empty, Tier::Fast, alloc.as_mut(), false, None, None).unwrap();
        assert_eq!(store.placement(empty).map(|p| p.offset), Some(0x1000));
        assert_eq!(free_tensor(&store, empty, alloc.as_mut(), None), 0);
        assert_eq!(alloc.currently_used(), 0);
    }

    #[test]
    #[should_panic(expected = "was never allocated")]
    fn test_free_unallocated_tensor_panics() {
        let mut store = TensorTable::new();
        let t = store.add(TensorDesc::new("t", 16));
        let mut alloc = allocator(4096);
        free_tensor(&store, t, alloc.as_mut(), None);
    }
}
