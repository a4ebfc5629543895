use std::fmt;

use serde::{Deserialize, Serialize};

/// A contiguous span of device address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    /// First address in the range
    pub base: u64,
    /// Size in bytes
    pub size: u64,
}

impl Range {
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// One past the last address
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `self` lies fully inside `other`
    pub fn contained_in(&self, other: &Range) -> bool {
        self.base >= other.base && self.end() <= other.end()
    }

    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn intersects(&self, other: &Range) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Overlapping part of two ranges, if any
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        let base = self.base.max(other.base);
        let end = self.end().min(other.end());
        (base < end).then(|| Range::new(base, end - base))
    }

    /// Whether `other` starts exactly where `self` ends
    pub fn touches(&self, other: &Range) -> bool {
        self.end() == other.base
    }

    /// Remove `inner` from `self`, returning the leftover before and after it.
    ///
    /// `inner` must be contained in `self`. Empty leftovers are `None`.
    pub fn carve(&self, inner: &Range) -> (Option<Range>, Option<Range>) {
        assert!(
            inner.contained_in(self),
            "carved range {} is not contained in {}",
            inner,
            self
        );
        let before = (inner.base > self.base).then(|| Range::new(self.base, inner.base - self.base));
        let after = (inner.end() < self.end()).then(|| Range::new(inner.end(), self.end() - inner.end()));
        (before, after)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}, 0x{:x})", self.base, self.end())
    }
}

/// Bytes needed to move `base` up to the next multiple of `alignment`
pub fn padding(base: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return 0;
    }
    match base % alignment {
        0 => 0,
        rem => alignment - rem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containment_and_intersection() {
        let outer = Range::new(100, 100);
        let inner = Range::new(120, 30);
        assert!(inner.contained_in(&outer));
        assert!(!outer.contained_in(&inner));
        assert_eq!(outer.intersection(&Range::new(150, 100)), Some(Range::new(150, 50)));
        assert_eq!(outer.intersection(&Range::new(200, 10)), None);
        assert!(!outer.intersects(&Range::new(200, 10)));
        assert!(outer.touches(&Range::new(200, 10)));
    }

    #[test]
    fn test_carve() {
        let outer = Range::new(0, 100);
        assert_eq!(outer.carve(&Range::new(0, 100)), (None, None));
        assert_eq!(outer.carve(&Range::new(0, 40)), (None, Some(Range::new(40, 60))));
        assert_eq!(outer.carve(&Range::new(60, 40)), (Some(Range::new(0, 60)), None));
        assert_eq!(
            outer.carve(&Range::new(10, 20)),
            (Some(Range::new(0, 10)), Some(Range::new(30, 70)))
        );
    }

    #[test]
    #[should_panic(expected = "is not contained")]
    fn test_carve_outside_panics() {
        Range::new(0, 10).carve(&Range::new(5, 10));
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding(0, 128), 0);
        assert_eq!(padding(1, 128), 127);
        assert_eq!(padding(256, 128), 0);
        assert_eq!(padding(7, 1), 0);
    }
}
