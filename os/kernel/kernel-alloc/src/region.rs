use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage};

const BITS: usize = u64::BITS as usize;

/// Contiguous run of frames with a used/free bitmap.
///
/// # Invariants
/// - `free` equals the number of clear bits below `frames`.
/// - Bits at or above `frames` in the last word are always set.
#[derive(Debug)]
pub struct FrameRegion {
    base: PhysicalPage,
    frames: usize,
    free: usize,
    /// 1 = allocated.
    bitmap: Vec<u64>,
    /// Word index where the next search starts.
    search_hint: usize,
}

impl FrameRegion {
    /// Region of `frames` free frames starting at `base`.
    #[must_use]
    pub fn new(base: PhysicalPage, frames: usize) -> Self {
        let words = frames.div_ceil(BITS);
        let mut bitmap = vec![0u64; words];
        let tail = frames % BITS;
        if tail != 0 {
            bitmap[words - 1] = !0u64 << tail;
        }
        Self {
            base,
            frames,
            free: frames,
            bitmap,
            search_hint: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalPage {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    #[must_use]
    pub const fn free(&self) -> usize {
        self.free
    }

    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.frames - self.free
    }

    /// Exclusive end.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalPage {
        self.base.add(self.frames as u64)
    }

    #[inline]
    #[must_use]
    pub const fn page(&self, slot: usize) -> PhysicalPage {
        self.base.add(slot as u64)
    }

    /// Slot index of `page`, if this region holds it.
    #[must_use]
    pub fn slot_of(&self, page: PhysicalPage) -> Option<usize> {
        let n = page.number();
        let first = self.base.number();
        if n >= first && n < first + self.frames as u64 {
            usize::try_from(n - first).ok()
        } else {
            None
        }
    }

    #[inline]
    fn is_used(&self, slot: usize) -> bool {
        self.bitmap[slot / BITS] & (1 << (slot % BITS)) != 0
    }

    #[inline]
    fn mark(&mut self, slot: usize) {
        self.bitmap[slot / BITS] |= 1 << (slot % BITS);
    }

    /// Take one free frame; starts at the search hint and wraps around.
    pub fn allocate(&mut self) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        let words = self.bitmap.len();
        for step in 0..words {
            let w = (self.search_hint + step) % words;
            let word = self.bitmap[w];
            if word != !0 {
                let bit = (!word).trailing_zeros() as usize;
                let slot = w * BITS + bit;
                self.mark(slot);
                self.free -= 1;
                self.search_hint = w;
                return Some(slot);
            }
        }
        unreachable!("free count says {} frames are available", self.free)
    }

    /// Take `count` consecutive frames whose first frame's physical address
    /// is a multiple of `alignment` bytes. Returns the first slot.
    pub fn allocate_run(&mut self, count: usize, alignment: u64) -> Option<usize> {
        if count == 0 || count > self.free {
            return None;
        }
        let align_frames = (alignment / PAGE_SIZE).max(1);
        let first_pfn = self.base.number();

        let mut start = 0usize;
        while start + count <= self.frames {
            let pfn = first_pfn + start as u64;
            let misalign = pfn % align_frames;
            if misalign != 0 {
                start += usize::try_from(align_frames - misalign).ok()?;
                continue;
            }
            match (start..start + count).find(|&s| self.is_used(s)) {
                Some(taken) => start = taken + 1,
                None => {
                    for s in start..start + count {
                        self.mark(s);
                    }
                    self.free -= count;
                    return Some(start);
                }
            }
        }
        None
    }

    /// Return a frame.
    ///
    /// # Panics
    /// On double free or an out-of-range slot.
    pub fn release(&mut self, slot: usize) {
        assert!(slot < self.frames, "slot {slot} outside region at {}", self.base);
        assert!(
            self.is_used(slot),
            "double free of frame {} in region at {}",
            self.page(slot),
            self.base
        );
        self.bitmap[slot / BITS] &= !(1 << (slot % BITS));
        self.free += 1;
        self.search_hint = slot / BITS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(first_pfn: u64, frames: usize) -> FrameRegion {
        FrameRegion::new(PhysicalPage::from_number(first_pfn), frames)
    }

    #[test]
    fn tail_bits_are_never_handed_out() {
        let mut r = region(0x100, 3);
        let got: Vec<_> = core::iter::from_fn(|| r.allocate()).collect();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(r.free(), 0);
        assert!(r.allocate().is_none());
    }

    #[test]
    fn release_makes_the_slot_reusable() {
        let mut r = region(0x100, 130);
        for _ in 0..130 {
            r.allocate().unwrap();
        }
        r.release(77);
        assert_eq!(r.free(), 1);
        assert_eq!(r.allocate(), Some(77));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_release_panics() {
        let mut r = region(0x100, 8);
        let s = r.allocate().unwrap();
        r.release(s);
        r.release(s);
    }

    #[test]
    fn runs_respect_physical_alignment() {
        // pfn 0x101 is not 16 KiB aligned; the first aligned pfn is 0x104
        let mut r = region(0x101, 32);
        let first = r.allocate_run(4, 4 * PAGE_SIZE).unwrap();
        assert_eq!(r.page(first).number(), 0x104);
        assert_eq!(r.used(), 4);

        // the next aligned run skips the used block
        let second = r.allocate_run(4, 4 * PAGE_SIZE).unwrap();
        assert_eq!(r.page(second).number(), 0x108);
    }

    #[test]
    fn runs_skip_holes() {
        let mut r = region(0, 8);
        for _ in 0..3 {
            r.allocate().unwrap();
        }
        r.release(1);
        // 1 is free but alone; the run must start at 3
        assert_eq!(r.allocate_run(3, PAGE_SIZE), Some(3));
        assert!(r.allocate_run(3, PAGE_SIZE).is_none());
        assert_eq!(r.allocate_run(2, PAGE_SIZE), Some(6));
    }

    #[test]
    fn slot_lookup() {
        let r = region(0x200, 4);
        assert_eq!(r.slot_of(PhysicalPage::from_number(0x202)), Some(2));
        assert_eq!(r.slot_of(PhysicalPage::from_number(0x204)), None);
        assert_eq!(r.slot_of(PhysicalPage::from_number(0x1ff)), None);
    }
}
