use crate::frame::{PhysicalFrame, PoolKind};
use crate::region::FrameRegion;
use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalPage;
use kernel_vmem::TableFrameAlloc;
use log::warn;

/// A set of non-overlapping [`FrameRegion`]s handing out frames of one kind.
#[derive(Debug)]
pub struct FramePool {
    kind: PoolKind,
    regions: Vec<FrameRegion>,
}

impl FramePool {
    /// # Panics
    /// If two regions overlap.
    #[must_use]
    pub fn new(kind: PoolKind, mut regions: Vec<FrameRegion>) -> Self {
        regions.sort_by_key(FrameRegion::base);
        for pair in regions.windows(2) {
            assert!(
                pair[0].end() <= pair[1].base(),
                "frame regions at {} and {} overlap",
                pair[0].base(),
                pair[1].base()
            );
        }
        assert!(regions.len() <= usize::from(u16::MAX), "too many frame regions");
        Self { kind, regions }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> PoolKind {
        self.kind
    }

    #[must_use]
    pub fn regions(&self) -> &[FrameRegion] {
        &self.regions
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.regions.iter().map(FrameRegion::frames).sum()
    }

    #[must_use]
    pub fn free(&self) -> usize {
        self.regions.iter().map(FrameRegion::free).sum()
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.total() - self.free()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn handle(&self, region: usize, slot: usize) -> PhysicalFrame {
        PhysicalFrame::new(
            self.regions[region].page(slot),
            self.kind,
            region as u16,
            slot as u32,
        )
    }

    /// One frame from the first region that has any.
    pub fn allocate(&mut self) -> Option<PhysicalFrame> {
        let (region, slot) = self
            .regions
            .iter_mut()
            .enumerate()
            .find_map(|(i, r)| r.allocate().map(|s| (i, s)))?;
        Some(self.handle(region, slot))
    }

    /// `count` physically contiguous frames, the first aligned to
    /// `alignment` bytes. The run never spans two regions.
    pub fn allocate_contiguous(
        &mut self,
        count: usize,
        alignment: u64,
    ) -> Option<Vec<PhysicalFrame>> {
        let (region, first) = self
            .regions
            .iter_mut()
            .enumerate()
            .find_map(|(i, r)| r.allocate_run(count, alignment).map(|s| (i, s)))?;
        Some((first..first + count).map(|s| self.handle(region, s)).collect())
    }

    /// Return a frame to the region it came from.
    ///
    /// # Panics
    /// If the frame belongs to another pool or is already free.
    pub fn deallocate(&mut self, frame: PhysicalFrame) {
        assert_eq!(
            frame.pool(),
            self.kind,
            "{frame:?} returned to the wrong pool"
        );
        self.regions[frame.region()].release(frame.slot());
    }

    /// Return a frame known only by address (see [`PhysicalFrame::into_page`]).
    ///
    /// # Panics
    /// If no region of this pool holds `page`, or it is already free.
    pub fn deallocate_page(&mut self, page: PhysicalPage) {
        let found = self
            .regions
            .iter_mut()
            .find_map(|r| r.slot_of(page).map(|s| (r, s)));
        match found {
            Some((region, slot)) => region.release(slot),
            None => panic!("{page} is not part of the {:?} pool", self.kind),
        }
    }

    /// Whether `page` lies in one of this pool's regions.
    #[must_use]
    pub fn contains(&self, page: PhysicalPage) -> bool {
        self.regions.iter().any(|r| r.slot_of(page).is_some())
    }
}

/// Page tables are drawn from the kernel pool.
impl TableFrameAlloc for FramePool {
    fn alloc_table(&mut self) -> Option<PhysicalPage> {
        debug_assert_eq!(self.kind, PoolKind::Kernel);
        self.allocate().map(PhysicalFrame::into_page)
    }

    fn free_table(&mut self, frame: PhysicalPage) {
        self.deallocate_page(frame);
    }
}

/// Commit accounting of the user pool.
///
/// `committed + uncommitted + used` always equals the pool's capacity.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CommitCounters {
    /// Free frames promised to someone; drawing them cannot fail.
    pub committed: usize,
    /// Free frames nobody has a claim on.
    pub uncommitted: usize,
    /// Frames handed out.
    pub used: usize,
}

impl CommitCounters {
    #[inline]
    #[must_use]
    pub const fn total(&self) -> usize {
        self.committed + self.uncommitted + self.used
    }
}

/// The general-purpose pool under commit/uncommit accounting.
#[derive(Debug)]
pub struct UserPool {
    frames: FramePool,
    counters: CommitCounters,
}

impl UserPool {
    #[must_use]
    pub fn new(regions: Vec<FrameRegion>) -> Self {
        let frames = FramePool::new(PoolKind::User, regions);
        let counters = CommitCounters {
            committed: 0,
            uncommitted: frames.free(),
            used: frames.used(),
        };
        Self { frames, counters }
    }

    #[inline]
    #[must_use]
    pub const fn counters(&self) -> CommitCounters {
        self.counters
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &FramePool {
        &self.frames
    }

    #[inline]
    fn check(&self) {
        debug_assert_eq!(self.counters.total(), self.frames.total());
        debug_assert_eq!(
            self.counters.committed + self.counters.uncommitted,
            self.frames.free()
        );
    }

    /// Move `pages` from uncommitted to committed.
    ///
    /// Returns `false`, changing nothing, if fewer are uncommitted.
    pub fn commit(&mut self, pages: usize) -> bool {
        if self.counters.uncommitted < pages {
            warn!(
                "Cannot commit {pages} pages, only {} uncommitted",
                self.counters.uncommitted
            );
            return false;
        }
        self.counters.uncommitted -= pages;
        self.counters.committed += pages;
        self.check();
        true
    }

    /// Move `pages` back from committed to uncommitted.
    ///
    /// # Panics
    /// If fewer than `pages` are committed.
    pub fn uncommit(&mut self, pages: usize) {
        assert!(
            pages <= self.counters.committed,
            "uncommit of {pages} pages with only {} committed",
            self.counters.committed
        );
        self.counters.committed -= pages;
        self.counters.uncommitted += pages;
        self.check();
    }

    /// Draw from the uncommitted part. `None` when it is empty.
    pub fn allocate_uncommitted(&mut self) -> Option<PhysicalFrame> {
        if self.counters.uncommitted == 0 {
            return None;
        }
        let frame = self.frames.allocate()?;
        self.counters.uncommitted -= 1;
        self.counters.used += 1;
        self.check();
        Some(frame)
    }

    /// Draw from the committed part.
    ///
    /// # Panics
    /// If nothing is committed; a caller that committed pages must not
    /// consume more than it committed.
    pub fn allocate_committed(&mut self) -> PhysicalFrame {
        assert!(self.counters.committed > 0, "committed frame pool is empty");
        let Some(frame) = self.frames.allocate() else {
            panic!(
                "{} pages committed but no free frame left",
                self.counters.committed
            );
        };
        self.counters.committed -= 1;
        self.counters.used += 1;
        self.check();
        frame
    }

    /// Return a frame; it becomes uncommitted.
    pub fn deallocate(&mut self, frame: PhysicalFrame) {
        self.frames.deallocate(frame);
        self.counters.used -= 1;
        self.counters.uncommitted += 1;
        self.check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(frames: usize) -> UserPool {
        UserPool::new(vec![FrameRegion::new(PhysicalPage::from_number(0x400), frames)])
    }

    fn triple(p: &UserPool) -> (usize, usize, usize) {
        let c = p.counters();
        (c.uncommitted, c.committed, c.used)
    }

    #[test]
    fn capacity_four_scenario() {
        let mut p = pool(4);
        assert!(p.commit(2));
        assert_eq!(triple(&p), (2, 2, 0));

        let c1 = p.allocate_committed();
        let c2 = p.allocate_committed();
        assert_eq!(triple(&p), (2, 0, 2));

        let u1 = p.allocate_uncommitted().unwrap();
        let u2 = p.allocate_uncommitted().unwrap();
        assert_eq!(triple(&p), (0, 0, 4));

        assert!(p.allocate_uncommitted().is_none());
        assert_eq!(triple(&p), (0, 0, 4));

        p.deallocate(u1);
        assert_eq!(triple(&p), (1, 0, 3));
        for f in [c1, c2, u2] {
            p.deallocate(f);
        }
        assert_eq!(triple(&p), (4, 0, 0));
    }

    #[test]
    fn over_commit_changes_nothing() {
        let mut p = pool(3);
        assert!(p.commit(2));
        assert!(!p.commit(2));
        assert_eq!(triple(&p), (1, 2, 0));
        p.uncommit(2);
        assert_eq!(triple(&p), (3, 0, 0));
    }

    #[test]
    #[should_panic(expected = "committed frame pool is empty")]
    fn committed_draw_without_commitment_panics() {
        let mut p = pool(2);
        let _ = p.allocate_committed();
    }

    #[test]
    #[should_panic(expected = "uncommit")]
    fn uncommit_beyond_committed_panics() {
        let mut p = pool(2);
        assert!(p.commit(1));
        p.uncommit(2);
    }

    #[test]
    fn committed_frames_survive_uncommitted_exhaustion() {
        let mut p = pool(3);
        assert!(p.commit(1));
        let a = p.allocate_uncommitted().unwrap();
        let b = p.allocate_uncommitted().unwrap();
        assert!(p.allocate_uncommitted().is_none());
        let c = p.allocate_committed();
        assert_ne!(a.page(), c.page());
        assert_ne!(b.page(), c.page());
        assert_eq!(triple(&p), (0, 0, 3));
    }

    #[test]
    fn kernel_pool_tables_round_trip_by_address() {
        let mut k = FramePool::new(
            PoolKind::Kernel,
            vec![FrameRegion::new(PhysicalPage::from_number(0x10), 2)],
        );
        let t = k.alloc_table().unwrap();
        assert_eq!(k.used(), 1);
        k.free_table(t);
        assert_eq!(k.used(), 0);
    }

    #[test]
    #[should_panic(expected = "wrong pool")]
    fn frames_cannot_change_pools() {
        let mut k = FramePool::new(
            PoolKind::Kernel,
            vec![FrameRegion::new(PhysicalPage::from_number(0x10), 2)],
        );
        let mut u = pool(2);
        let f = u.allocate_uncommitted().unwrap();
        k.deallocate(f);
    }
}
