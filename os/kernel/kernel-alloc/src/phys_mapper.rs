//! Physical memory access through the higher-half direct map.

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// Reaches physical memory at a fixed virtual offset.
///
/// Valid once the boot stage has mapped all RAM at `offset`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Where `pa` shows up in the direct map.
    #[inline]
    #[must_use]
    pub const fn virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset + pa.as_u64())
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(HHDM_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: Caller must ensure the physical address is valid and mapped via HHDM.
        unsafe { &mut *self.virt(pa).as_mut_ptr::<T>() }
    }
}
