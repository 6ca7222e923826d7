use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// Which pool a frame was drawn from and must go back to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PoolKind {
    /// Reserved pool for page tables and kernel structures.
    Kernel,
    /// General-purpose pool under commit accounting.
    User,
}

/// Owning handle of one 4 KiB physical frame.
///
/// Deliberately neither `Copy` nor `Clone`: there is exactly one handle per
/// allocated frame, and handing it back to its pool is the only way to free
/// the frame. Dropping a handle leaks the frame.
#[must_use = "dropping a frame handle leaks the frame"]
#[derive(PartialEq, Eq, Hash)]
pub struct PhysicalFrame {
    page: PhysicalPage,
    pool: PoolKind,
    region: u16,
    slot: u32,
}

impl PhysicalFrame {
    pub(crate) const fn new(page: PhysicalPage, pool: PoolKind, region: u16, slot: u32) -> Self {
        Self {
            page,
            pool,
            region,
            slot,
        }
    }

    #[inline]
    #[must_use]
    pub const fn page(&self) -> PhysicalPage {
        self.page
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.page.base()
    }

    #[inline]
    #[must_use]
    pub const fn pool(&self) -> PoolKind {
        self.pool
    }

    #[inline]
    pub(crate) const fn region(&self) -> usize {
        self.region as usize
    }

    #[inline]
    pub(crate) const fn slot(&self) -> usize {
        self.slot as usize
    }

    /// Give up the handle and keep only the address.
    ///
    /// The frame stays allocated; return it with
    /// [`FramePool::deallocate_page`](crate::FramePool::deallocate_page).
    #[inline]
    #[must_use]
    pub const fn into_page(self) -> PhysicalPage {
        self.page
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalFrame({:?}, {})", self.pool, self.page)
    }
}
