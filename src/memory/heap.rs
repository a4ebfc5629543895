use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::memory::allocator::{AllocRequest, Allocation, RangeAllocator};
use crate::memory::policy::{BestFit, FirstFit, FreeList, PlacementPolicy};
use crate::memory::range::{padding, Range};
use crate::model::round_up;

/// Counters collected by a heap allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful allocations
    pub allocations: u64,
    /// Frees
    pub frees: u64,
    /// Allocation requests that found no space
    pub failed_allocations: u64,
    /// Free ranges inspected by the placement policy
    pub probes: u64,
    /// Highest end address ever allocated, relative to the heap base
    pub high_water_mark: u64,
}

/// Free-list allocator over one address space.
///
/// The free list is address ordered and fully coalesced. Live allocations
/// are kept in an occupied map keyed by the address returned to the
/// caller. Together they tile `[base, base + size)` exactly.
#[derive(Debug, Clone)]
pub struct HeapAllocator<P: PlacementPolicy = FirstFit> {
    name: String,
    base: u64,
    size: u64,
    free: FreeList,
    occupied: BTreeMap<u64, Range>,
    /// Free range size -> number of free ranges with that size
    free_sizes: BTreeMap<u64, usize>,
    used: u64,
    policy: P,
    stats: HeapStats,
    print_status: bool,
}

/// Heap with the cursor-based first-fit policy
pub type FirstFitAllocator = HeapAllocator<FirstFit>;

/// Heap with the size-indexed best-fit policy
pub type BestFitAllocator = HeapAllocator<BestFit>;

impl HeapAllocator<FirstFit> {
    /// Cursor-based first fit allocator, cyclic or not
    pub fn first_fit(name: &str, cyclic: bool) -> Self {
        Self::with_policy(name, FirstFit::new(cyclic))
    }

    /// Switch the full-ring best-fit scan on or off
    pub fn set_best_fit_allocation(&mut self, best_fit: bool) {
        self.policy.set_best_fit(best_fit);
    }
}

impl<P: PlacementPolicy> HeapAllocator<P> {
    /// Create an empty allocator; call `init` before use
    pub fn with_policy(name: &str, policy: P) -> Self {
        Self {
            name: name.to_string(),
            base: 0,
            size: 0,
            free: FreeList::new(),
            occupied: BTreeMap::new(),
            free_sizes: BTreeMap::new(),
            used: 0,
            policy,
            stats: HeapStats::default(),
            print_status: false,
        }
    }

    /// Placement policy in use
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Counters collected since the last `init`
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Log the memory status map at trace level after every change
    pub fn set_print_status(&mut self, enabled: bool) {
        self.print_status = enabled;
    }

    /// Free ranges in address order
    pub fn free_ranges(&self) -> Vec<Range> {
        self.free.iter().map(|(&b, &s)| Range::new(b, s)).collect()
    }

    /// Live allocations as (address, range) in address order
    pub fn occupied_ranges(&self) -> Vec<(u64, Range)> {
        self.occupied.iter().map(|(&a, &r)| (a, r)).collect()
    }

    /// Largest free range
    pub fn max_free_range(&self) -> Range {
        self.policy.max_free_range(&self.free).unwrap_or_default()
    }

    /// Base of the free range containing `address`, if it is free
    pub fn free_range_containing(&self, address: u64) -> Option<u64> {
        self.free
            .range(..=address)
            .next_back()
            .filter(|(&b, &s)| address < b + s)
            .map(|(&b, _)| b)
    }

    /// Allocate exactly `range`, recording it under `range.base + pad`.
    ///
    /// Returns false if no single free range covers it.
    pub fn reserve_range(&mut self, range: Range, pad: u64) -> bool {
        let Some(container) = self.free_container_of(&range) else {
            log::error!(
                "{}: requested range {} was not found in current free ranges",
                self.name,
                range
            );
            return false;
        };

        self.take_from(container, range);
        self.occupied.insert(range.base + pad, range);
        self.used += range.size;
        self.note_allocation(range);
        true
    }

    /// Verify that free and occupied ranges tile the address space.
    ///
    /// Panics with a description of the first violation found.
    pub fn check_tiling(&self) {
        let mut spans: Vec<(Range, bool)> = self
            .free
            .iter()
            .map(|(&b, &s)| (Range::new(b, s), true))
            .chain(self.occupied.values().map(|&r| (r, false)))
            .collect();
        spans.sort_by_key(|(r, _)| r.base);

        let mut expected = self.base;
        let mut prev_free = false;
        for (range, is_free) in spans {
            assert!(
                !range.is_empty(),
                "{}: zero-sized {} range at 0x{:x}",
                self.name,
                if is_free { "free" } else { "occupied" },
                range.base
            );
            assert_eq!(
                range.base, expected,
                "{}: range {} does not start where the previous one ended (0x{:x})",
                self.name, range, expected
            );
            assert!(
                !(is_free && prev_free),
                "{}: adjacent free ranges were not coalesced at {}",
                self.name,
                range
            );
            prev_free = is_free;
            expected = range.end();
        }
        assert_eq!(
            expected,
            self.base + self.size,
            "{}: ranges end at 0x{:x}, address space ends at 0x{:x}",
            self.name,
            expected,
            self.base + self.size
        );

        let free_total: u64 = self.free.values().sum();
        assert_eq!(free_total + self.used, self.size, "{}: usage counter out of sync", self.name);
        let histogram_total: usize = self.free_sizes.values().sum();
        assert_eq!(histogram_total, self.free.len(), "{}: free size histogram out of sync", self.name);
    }

    /// Status map: one marker per occupied/free span, plus their sizes
    pub fn render_status(&self) -> (String, String) {
        const OCCUPIED: &str = "[++++++]";
        const FREE: &str = "[------]";

        let mut marks = String::new();
        let mut sizes = String::new();
        let mut previous_end = self.base;
        for range in self.occupied.values() {
            if range.base != previous_end {
                marks.push_str(FREE);
                sizes.push_str(&size_description(range.base - previous_end));
            }
            marks.push_str(OCCUPIED);
            sizes.push_str(&size_description(range.size));
            previous_end = range.end();
        }
        if previous_end != self.base + self.size {
            marks.push_str(FREE);
            sizes.push_str(&size_description(self.base + self.size - previous_end));
        }
        (marks, sizes)
    }

    fn print_status(&self) {
        if !self.print_status || !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let (marks, sizes) = self.render_status();
        log::trace!("{} memory status:\n{}\n{}", self.name, marks, sizes);
    }

    fn free_container_of(&self, range: &Range) -> Option<Range> {
        self.free
            .range(..=range.base)
            .next_back()
            .map(|(&b, &s)| Range::new(b, s))
            .filter(|candidate| range.contained_in(candidate))
    }

    /// Remove `taken` from the free range `container`, keeping leftovers free
    fn take_from(&mut self, container: Range, taken: Range) {
        match container.carve(&taken) {
            (None, None) => self.free_remove(container),
            (None, Some(after)) => self.free_resize(container, after),
            (Some(before), None) => self.free_resize(container, before),
            (Some(before), Some(after)) => {
                self.free_resize(container, before);
                self.free_insert(after);
            }
        }
    }

    fn free_insert(&mut self, range: Range) {
        debug_assert!(!range.is_empty());
        self.free.insert(range.base, range.size);
        *self.free_sizes.entry(range.size).or_insert(0) += 1;
        self.policy.insert(range);
    }

    fn free_remove(&mut self, range: Range) {
        self.free.remove(&range.base);
        self.histogram_remove(range.size);
        self.policy.remove(range, &self.free);
    }

    fn free_resize(&mut self, old: Range, new: Range) {
        debug_assert!(!new.is_empty());
        if old.base != new.base {
            self.free.remove(&old.base);
        }
        self.free.insert(new.base, new.size);
        self.histogram_remove(old.size);
        *self.free_sizes.entry(new.size).or_insert(0) += 1;
        self.policy.resize(old, new);
    }

    fn histogram_remove(&mut self, size: u64) {
        if let Some(count) = self.free_sizes.get_mut(&size) {
            *count -= 1;
            if *count == 0 {
                self.free_sizes.remove(&size);
            }
        }
    }

    fn note_allocation(&mut self, range: Range) {
        self.stats.allocations += 1;
        self.stats.high_water_mark = self.stats.high_water_mark.max(range.end() - self.base);
        self.print_status();
    }

    fn allocate_requested(&mut self, request: &AllocRequest, address: u64) -> Option<Allocation> {
        let pad = padding(address, request.alignment);
        if pad != 0 {
            log::warn!(
                "{}: requested address 0x{:x} must be aligned to {}, but requires padding {}",
                self.name,
                address,
                request.alignment,
                pad
            );
            return None;
        }

        assert!(
            address >= self.base + request.offset,
            "{}: requested address 0x{:x} with offset {} starts below the heap base 0x{:x}",
            self.name,
            address,
            request.offset,
            self.base
        );
        let wanted = Range::new(address - request.offset, request.size + request.offset);
        assert!(
            wanted.end() <= self.base + self.size,
            "{}: requested range {} is outside of the memory range",
            self.name,
            wanted
        );

        let Some(container) = self.free_container_of(&wanted) else {
            log::debug!(
                "{}: failed to allocate requested address 0x{:x}, range {} is not free",
                self.name,
                address,
                wanted
            );
            self.stats.failed_allocations += 1;
            return None;
        };

        self.take_from(container, wanted);
        self.occupied.insert(address, wanted);
        self.used += wanted.size;
        log::debug!("{}: allocate at requested addr 0x{:x}, size 0x{:x}", self.name, address, wanted.size);
        self.note_allocation(wanted);
        Some(Allocation {
            address,
            size: wanted.size,
        })
    }
}

impl<P: PlacementPolicy> RangeAllocator for HeapAllocator<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, size: u64, base: u64) {
        self.base = base;
        self.size = size;
        self.free.clear();
        self.occupied.clear();
        self.free_sizes.clear();
        self.used = 0;
        self.stats = HeapStats::default();
        if size > 0 {
            self.free_insert(Range::new(base, size));
        }
    }

    fn allocate(&mut self, request: &AllocRequest) -> Option<Allocation> {
        if request.size == 0 && request.offset == 0 {
            let address = request.requested_address.unwrap_or(self.base);
            log::trace!("{}: zero-sized request placed at 0x{:x}", self.name, address);
            return Some(Allocation { address, size: 0 });
        }
        if self.used == self.size {
            log::debug!("{}: all memory has already been allocated", self.name);
            self.stats.failed_allocations += 1;
            return None;
        }

        self.policy.begin_search(&self.free);

        if let Some(address) = request.requested_address {
            return self.allocate_requested(request, address);
        }

        let alignment = request.alignment.max(1);
        let allocation_size = round_up(request.size + request.offset, alignment);

        let mut probes = 0;
        let found = self.policy.find(&self.free, allocation_size, alignment, &mut probes);
        self.stats.probes += probes;

        let Some(container) = found else {
            self.stats.failed_allocations += 1;
            if request.allow_failure {
                log::trace!("{}: failed to allocate size 0x{:x}", self.name, allocation_size);
            } else {
                log::error!("{}: failed to allocate size 0x{:x}", self.name, allocation_size);
            }
            return None;
        };

        let pad = padding(container.base, alignment);
        let padded = allocation_size + pad;
        assert!(
            padded <= container.size,
            "{}: padded size 0x{:x} exceeds the selected free range {}",
            self.name,
            padded,
            container
        );

        let granted = Range::new(container.base, padded);
        let address = container.base + pad + request.offset;
        self.take_from(container, granted);
        self.occupied.insert(address, granted);
        self.used += padded;

        log::debug!("{}: allocate at addr 0x{:x}, size 0x{:x}", self.name, address, padded);
        self.note_allocation(granted);
        Some(Allocation { address, size: padded })
    }

    fn free(&mut self, address: u64) -> u64 {
        let allocation = self.occupied.remove(&address).unwrap_or_else(|| {
            panic!(
                "{}: attempt to free non-existent allocation at address 0x{:x}",
                self.name, address
            )
        });
        self.used -= allocation.size;
        self.stats.frees += 1;
        log::debug!("{}: free at addr 0x{:x}, size 0x{:x}", self.name, address, allocation.size);

        let prev = self
            .free
            .range(..allocation.base)
            .next_back()
            .map(|(&b, &s)| Range::new(b, s))
            .filter(|p| p.touches(&allocation));
        let next = self
            .free
            .get(&allocation.end())
            .map(|&s| Range::new(allocation.end(), s));

        match (prev, next) {
            (Some(p), Some(n)) => {
                self.free_resize(p, Range::new(p.base, p.size + allocation.size + n.size));
                self.free_remove(n);
            }
            (Some(p), None) => {
                self.free_resize(p, Range::new(p.base, p.size + allocation.size));
            }
            (None, Some(n)) => {
                self.free_resize(n, Range::new(allocation.base, allocation.size + n.size));
            }
            (None, None) => self.free_insert(allocation),
        }

        self.print_status();
        allocation.size
    }

    fn is_allocated(&self, address: u64) -> bool {
        self.occupied.contains_key(&address)
    }

    fn max_free_contiguous(&self) -> u64 {
        self.free_sizes.keys().next_back().copied().unwrap_or(0)
    }

    fn currently_used(&self) -> u64 {
        self.used
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn box_clone(&self) -> Box<dyn RangeAllocator> {
        Box::new(self.clone())
    }
}

fn size_description(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    let (count, unit) = if size < MB {
        (size / KB, "K")
    } else if size < GB {
        (size / MB, "M")
    } else {
        (size / GB, "G")
    };

    let mut out = String::from("[ ");
    if count == 0 {
        out.push_str("0.5");
    } else {
        let _ = write!(out, "{:<3}", count);
    }
    out.push_str(unit);
    out.push_str(" ]");
    out
}
