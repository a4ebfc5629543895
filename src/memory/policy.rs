use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::memory::range::{padding, Range};

/// Address-ordered free ranges: base -> size
pub type FreeList = BTreeMap<u64, u64>;

/// Strategy a heap allocator uses to pick a free range.
///
/// The heap owns the free list and keeps it address ordered and
/// coalesced. A policy only maintains its own index over the free list,
/// kept in sync through `insert`, `remove` and `resize`, which the heap
/// calls after it has applied each change to the free list.
pub trait PlacementPolicy: Clone + fmt::Debug + Send + 'static {
    /// Called once at the start of every allocation request
    fn begin_search(&mut self, _free: &FreeList) {}

    /// Pick a free range that fits `size` bytes after aligning its base.
    /// `probes` is incremented for every range inspected.
    fn find(&mut self, free: &FreeList, size: u64, alignment: u64, probes: &mut u64) -> Option<Range>;

    /// A range was added to the free list
    fn insert(&mut self, range: Range);

    /// A range was removed from the free list
    fn remove(&mut self, range: Range, free: &FreeList);

    /// A free range changed its base and/or size
    fn resize(&mut self, old: Range, new: Range);

    /// Largest free range, first in address order on ties
    fn max_free_range(&self, free: &FreeList) -> Option<Range> {
        let mut best: Option<Range> = None;
        for (&base, &size) in free {
            if best.map_or(true, |b| size > b.size) {
                best = Some(Range::new(base, size));
            }
        }
        best
    }
}

/// Cursor-based first fit.
///
/// With `cyclic` set the cursor keeps rotating through the free list
/// between requests, spreading allocations over the address space instead
/// of always reusing the lowest hole. Without it every search restarts at
/// the lowest address. With `best_fit` set the whole ring is scanned and
/// the smallest fitting range wins; ties go to the range the cursor
/// reaches first.
#[derive(Debug, Clone, Default)]
pub struct FirstFit {
    cyclic: bool,
    best_fit: bool,
    cursor: Option<u64>,
}

impl FirstFit {
    /// First fit from the lowest address, or from the cursor when `cyclic`
    pub fn new(cyclic: bool) -> Self {
        Self {
            cyclic,
            best_fit: false,
            cursor: None,
        }
    }

    /// Cyclic first fit
    pub fn cyclic() -> Self {
        Self::new(true)
    }

    /// Whether searches resume after the last allocation
    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    /// Scan the whole list for the smallest fitting range
    pub fn set_best_fit(&mut self, best_fit: bool) {
        self.best_fit = best_fit;
    }

    /// Whether the best-fit scan is on
    pub fn is_best_fit(&self) -> bool {
        self.best_fit
    }

    /// Base of the free range the next search starts from
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }
}

impl PlacementPolicy for FirstFit {
    fn begin_search(&mut self, free: &FreeList) {
        let valid = self.cursor.filter(|c| free.contains_key(c));
        self.cursor = match valid {
            Some(c) if self.cyclic => Some(c),
            _ => free.keys().next().copied(),
        };
    }

    fn find(&mut self, free: &FreeList, size: u64, alignment: u64, probes: &mut u64) -> Option<Range> {
        let start = self.cursor?;
        let mut best: Option<Range> = None;

        for (&base, &range_size) in free.range(start..).chain(free.range(..start)) {
            *probes += 1;
            let padded = size + padding(base, alignment);
            if range_size < padded {
                continue;
            }
            if !self.best_fit || range_size == padded {
                self.cursor = Some(base);
                return Some(Range::new(base, range_size));
            }
            if best.map_or(true, |b| range_size < b.size) {
                best = Some(Range::new(base, range_size));
            }
        }

        // A full turn of the ring brings the cursor back where it started
        self.cursor = Some(start);
        best
    }

    fn insert(&mut self, _range: Range) {}

    fn remove(&mut self, range: Range, free: &FreeList) {
        if self.cursor == Some(range.base) {
            // Step onto the following range; past the end means "restart"
            self.cursor = free.range(range.base + 1..).next().map(|(&b, _)| b);
        }
    }

    fn resize(&mut self, old: Range, new: Range) {
        if self.cursor == Some(old.base) {
            self.cursor = Some(new.base);
        }
    }
}

/// Best fit over a size-ordered index.
///
/// Among the ranges large enough for the request the smallest wins, lower
/// address first on equal sizes. Lookup is logarithmic in the number of
/// free ranges plus the few candidates rejected for alignment.
#[derive(Debug, Clone, Default)]
pub struct BestFit {
    by_size: BTreeSet<(u64, u64)>,
}

impl BestFit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlacementPolicy for BestFit {
    fn find(&mut self, _free: &FreeList, size: u64, alignment: u64, probes: &mut u64) -> Option<Range> {
        for &(range_size, base) in self.by_size.range((size, 0)..) {
            *probes += 1;
            if range_size >= size + padding(base, alignment) {
                return Some(Range::new(base, range_size));
            }
        }
        None
    }

    fn insert(&mut self, range: Range) {
        self.by_size.insert((range.size, range.base));
    }

    fn remove(&mut self, range: Range, _free: &FreeList) {
        let removed = self.by_size.remove(&(range.size, range.base));
        debug_assert!(removed, "best-fit index lost track of {}", range);
    }

    fn resize(&mut self, old: Range, new: Range) {
        self.by_size.remove(&(old.size, old.base));
        self.by_size.insert((new.size, new.base));
    }

    fn max_free_range(&self, free: &FreeList) -> Option<Range> {
        let &(max_size, _) = self.by_size.iter().next_back()?;
        // Lowest address among the largest ranges
        self.by_size
            .range((max_size, 0)..)
            .next()
            .map(|&(size, base)| {
                debug_assert_eq!(free.get(&base), Some(&size));
                Range::new(base, size)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_list(ranges: &[(u64, u64)]) -> FreeList {
        ranges.iter().copied().collect()
    }

    #[test]
    fn test_first_fit_restarts_without_cyclic() {
        let free = free_list(&[(0, 100), (200, 300)]);
        let mut policy = FirstFit::new(false);
        let mut probes = 0;

        policy.begin_search(&free);
        assert_eq!(policy.find(&free, 150, 1, &mut probes), Some(Range::new(200, 300)));

        // Non-cyclic searches always restart at the lowest address
        policy.begin_search(&free);
        assert_eq!(policy.find(&free, 50, 1, &mut probes), Some(Range::new(0, 100)));
    }

    #[test]
    fn test_first_fit_cyclic_keeps_rotating() {
        let free = free_list(&[(0, 100), (200, 300)]);
        let mut policy = FirstFit::cyclic();
        let mut probes = 0;

        policy.begin_search(&free);
        assert_eq!(policy.find(&free, 150, 1, &mut probes), Some(Range::new(200, 300)));

        policy.begin_search(&free);
        assert_eq!(policy.find(&free, 50, 1, &mut probes), Some(Range::new(200, 300)));
        assert_eq!(policy.cursor(), Some(200));
    }

    #[test]
    fn test_first_fit_best_fit_flag() {
        let free = free_list(&[(0, 500), (600, 120), (800, 110)]);
        let mut policy = FirstFit::new(false);
        policy.set_best_fit(true);
        let mut probes = 0;

        policy.begin_search(&free);
        assert_eq!(policy.find(&free, 100, 1, &mut probes), Some(Range::new(800, 110)));
        assert_eq!(probes, 3);
        // An exact fit stops the scan early
        policy.begin_search(&free);
        assert_eq!(policy.find(&free, 120, 1, &mut probes), Some(Range::new(600, 120)));
    }

    #[test]
    fn test_first_fit_alignment_padding() {
        let free = free_list(&[(10, 100), (256, 64)]);
        let mut policy = FirstFit::new(false);
        let mut probes = 0;
        policy.begin_search(&free);
        // 10 -> pad 118 to reach 128, too big for the first range
        assert_eq!(policy.find(&free, 64, 128, &mut probes), Some(Range::new(256, 64)));
    }

    #[test]
    fn test_first_fit_cursor_follows_removal_and_resize() {
        let mut free = free_list(&[(0, 100), (200, 300)]);
        let mut policy = FirstFit::cyclic();
        policy.begin_search(&free);
        assert_eq!(policy.cursor(), Some(0));

        policy.resize(Range::new(0, 100), Range::new(40, 60));
        assert_eq!(policy.cursor(), Some(40));

        free.remove(&0);
        free.insert(40, 60);
        free.remove(&40);
        policy.remove(Range::new(40, 60), &free);
        assert_eq!(policy.cursor(), Some(200));

        free.remove(&200);
        policy.remove(Range::new(200, 300), &free);
        assert_eq!(policy.cursor(), None);
    }

    #[test]
    fn test_best_fit_index() {
        let free = free_list(&[(0, 500), (600, 120), (800, 110), (1000, 110)]);
        let mut policy = BestFit::new();
        for (&b, &s) in &free {
            policy.insert(Range::new(b, s));
        }
        let mut probes = 0;
        assert_eq!(policy.find(&free, 100, 1, &mut probes), Some(Range::new(800, 110)));
        assert_eq!(policy.find(&free, 111, 1, &mut probes), Some(Range::new(600, 120)));
        assert_eq!(policy.find(&free, 501, 1, &mut probes), None);
        assert_eq!(policy.max_free_range(&free), Some(Range::new(0, 500)));
    }

    #[test]
    fn test_best_fit_skips_misaligned_candidates() {
        let free = free_list(&[(8, 100), (256, 128)]);
        let mut policy = BestFit::new();
        for (&b, &s) in &free {
            policy.insert(Range::new(b, s));
        }
        let mut probes = 0;
        assert_eq!(policy.find(&free, 64, 64, &mut probes), Some(Range::new(256, 128)));
        assert_eq!(probes, 2);
    }

    #[test]
    fn test_default_max_free_range_prefers_lowest_address() {
        let free = free_list(&[(0, 10), (20, 50), (100, 50)]);
        let policy = FirstFit::new(false);
        assert_eq!(policy.max_free_range(&free), Some(Range::new(20, 50)));
    }
}
