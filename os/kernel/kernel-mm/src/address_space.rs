use crate::region::Region;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualRange};
use kernel_sync::{MutexGuard, RawSpin, SpinMutex};
use kernel_vmem::PageDirectory;

/// A page directory plus the regions mapped through it.
///
/// The lock is taken after the manager's global lock, never before it.
pub struct AddressSpace {
    root: PhysicalPage,
    state: SpinMutex<SpaceState>,
}

pub(crate) struct SpaceState {
    pub directory: PageDirectory,
    /// User regions by base address. Empty for the kernel space, whose
    /// regions live in the manager's global state.
    pub regions: BTreeMap<VirtualAddress, Arc<Region>>,
}

impl SpaceState {
    /// The region containing `va`.
    pub fn find(&self, va: VirtualAddress) -> Option<&Arc<Region>> {
        find_region(&self.regions, va)
    }
}

/// The region in `regions` containing `va`.
pub(crate) fn find_region(
    regions: &BTreeMap<VirtualAddress, Arc<Region>>,
    va: VirtualAddress,
) -> Option<&Arc<Region>> {
    regions
        .range(..=va)
        .next_back()
        .map(|(_, r)| r)
        .filter(|r| r.range().contains(va))
}

/// Whether `range` collides with any of `regions`.
pub(crate) fn overlaps_any(
    regions: &BTreeMap<VirtualAddress, Arc<Region>>,
    range: &VirtualRange,
) -> bool {
    let before = regions.range(..range.start()).next_back();
    let from = regions.range(range.start()..range.end());
    before
        .into_iter()
        .chain(from)
        .any(|(_, r)| r.range().overlaps(range))
}

impl AddressSpace {
    pub(crate) fn new(directory: PageDirectory) -> Self {
        Self {
            root: directory.root(),
            state: SpinMutex::new(SpaceState {
                directory,
                regions: BTreeMap::new(),
            }),
        }
    }

    /// Top-level table, as loaded into the MMU.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SpaceState, RawSpin> {
        self.state.lock()
    }

    pub(crate) fn into_state(self) -> SpaceState {
        self.state.into_inner()
    }

    /// The user region containing `va`.
    #[must_use]
    pub fn find_region(&self, va: VirtualAddress) -> Option<Arc<Region>> {
        self.state.lock().find(va).cloned()
    }

    #[must_use]
    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.state.lock().regions.values().cloned().collect()
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.state.lock().directory.table_count()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
