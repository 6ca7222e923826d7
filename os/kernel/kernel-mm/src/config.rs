use crate::InitError;
use kernel_info::memory::{
    DEFAULT_KERNEL_POOL_PAGES, KERNEL_REGION_BASE, KERNEL_REGION_WINDOW_SIZE, MAX_CPUS,
    QUICKMAP_BASE, QUICKMAP_SHARED_SLOTS,
};
use kernel_memory_addresses::{VirtualAddress, VirtualRange};
use kernel_vmem::PagingGeometry;

/// Runtime parameters of the memory manager.
///
/// The compile-time layout in [`kernel_info::memory`] provides the x86-64
/// defaults; see [`MemoryConfig::x86_64`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryConfig {
    pub geometry: PagingGeometry,
    /// First quickmap slot. All slots share one leaf table.
    pub quickmap_base: VirtualAddress,
    /// Where kernel regions are placed.
    pub kernel_region_window: VirtualRange,
    /// CPUs that get a private quickmap slot.
    pub cpu_count: usize,
    pub shared_quickmap_slots: usize,
    /// Frames the boot map hands to the kernel pool.
    pub kernel_pool_pages: u64,
}

impl MemoryConfig {
    #[must_use]
    pub const fn x86_64(cpu_count: usize) -> Self {
        Self {
            geometry: PagingGeometry::X86_64,
            quickmap_base: VirtualAddress::new(QUICKMAP_BASE),
            kernel_region_window: VirtualRange::new(
                VirtualAddress::new(KERNEL_REGION_BASE),
                KERNEL_REGION_WINDOW_SIZE,
            ),
            cpu_count,
            shared_quickmap_slots: QUICKMAP_SHARED_SLOTS,
            kernel_pool_pages: DEFAULT_KERNEL_POOL_PAGES,
        }
    }

    /// Total quickmap slots, per-CPU ones first.
    #[inline]
    #[must_use]
    pub const fn quickmap_slots(&self) -> usize {
        self.cpu_count + self.shared_quickmap_slots
    }

    /// Check that the layout fits the geometry.
    pub fn validate(&self) -> Result<(), InitError> {
        let g = &self.geometry;
        let kernel_start = g.kernel_half_start();

        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            return Err(InitError::Config("CPU count out of range"));
        }
        if self.shared_quickmap_slots == 0 {
            return Err(InitError::Config("at least one shared quickmap slot is required"));
        }

        let leaf_span = g.entry_span(g.leaf_depth() - 1);
        let base = self.quickmap_base.as_u64();
        if base < kernel_start || !base.is_multiple_of(leaf_span) {
            return Err(InitError::Config(
                "quickmap base must be a leaf-table aligned kernel address",
            ));
        }
        if self.quickmap_slots() > g.entries_per_table() {
            return Err(InitError::Config("quickmap slots exceed one leaf table"));
        }

        let window = &self.kernel_region_window;
        if window.is_empty() || !window.is_page_aligned() || window.start().as_u64() < kernel_start
        {
            return Err(InitError::Config(
                "kernel region window must be a page-aligned kernel range",
            ));
        }
        let quickmap = VirtualRange::new(self.quickmap_base, leaf_span);
        if window.overlaps(&quickmap) {
            return Err(InitError::Config("kernel region window overlaps the quickmap"));
        }
        Ok(())
    }
}
