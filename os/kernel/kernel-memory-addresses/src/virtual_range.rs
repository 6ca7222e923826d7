use crate::{PAGE_SHIFT, VirtualAddress, VirtualPage};
use core::fmt;

/// Half-open span `[start, start + size)` of virtual addresses.
///
/// Ranges used for mappings are page aligned in both start and size; the
/// constructor does not enforce it so that callers can validate and report
/// the error themselves (see [`is_page_aligned`](Self::is_page_aligned)).
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    start: VirtualAddress,
    size: u64,
}

impl VirtualRange {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, size: u64) -> Self {
        Self { start, size }
    }

    /// Range from `start` up to (excluding) `end`.
    #[inline]
    #[must_use]
    pub const fn from_bounds(start: VirtualAddress, end: VirtualAddress) -> Self {
        debug_assert!(end.as_u64() >= start.as_u64());
        Self::new(start, end.as_u64() - start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Exclusive end. Saturates at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64().saturating_add(self.size))
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(&self) -> bool {
        self.start.is_page_aligned() && crate::is_page_aligned(self.size)
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.size >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end().as_u64()
    }

    /// Whether `other` lies completely inside `self`.
    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        other.start.as_u64() >= self.start.as_u64()
            && other.end().as_u64() <= self.end().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end().as_u64() && other.start.as_u64() < self.end().as_u64()
    }

    /// Iterate the pages of this range in ascending order.
    pub fn pages(&self) -> impl Iterator<Item = VirtualPage> + use<> {
        let first = self.start.page();
        (0..self.page_count()).map(move |i| first.add(i))
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end())
    }
}

impl fmt::Display for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn overlap_is_half_open() {
        let a = VirtualRange::new(VirtualAddress::new(0x1000), 2 * PAGE_SIZE);
        let b = VirtualRange::new(VirtualAddress::new(0x3000), PAGE_SIZE);
        let c = VirtualRange::new(VirtualAddress::new(0x2000), PAGE_SIZE);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(a.contains_range(&c));
        assert!(!a.contains(VirtualAddress::new(0x3000)));
    }

    #[test]
    fn pages_iterates_every_page() {
        let r = VirtualRange::new(VirtualAddress::new(0x10_0000), 3 * PAGE_SIZE);
        let bases: Vec<u64> = r.pages().map(|p| p.base().as_u64()).collect();
        assert_eq!(bases, vec![0x10_0000, 0x10_1000, 0x10_2000]);
    }
}
