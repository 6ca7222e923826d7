//! The hardware the manager drives, behind one trait.

use kernel_memory_addresses::{PageBytes, PhysicalPage, VirtualAddress};
use kernel_sync::InterruptControl;
use kernel_vmem::PhysMapper;

/// CPU and MMU services the memory manager needs.
///
/// The kernel implements this for real hardware (see
/// [`X86Platform`](crate::arch::x86_64::X86Platform)); tests implement it
/// for a simulated machine with a software TLB.
pub trait Platform: PhysMapper + InterruptControl + Sync {
    /// Index of the executing CPU, below the configured CPU count.
    fn current_cpu(&self) -> usize;

    /// How many CPUs [`flush_remote`](Self::flush_remote) reaches.
    fn max_cpus(&self) -> usize;

    /// Invalidate the local TLB entry for `va`.
    fn flush_local(&self, va: VirtualAddress);

    /// Invalidate `pages` pages starting at `va` on every other CPU and wait
    /// until they did so.
    fn flush_remote(&self, va: VirtualAddress, pages: usize);

    /// Load `root` as the current CPU's top-level table.
    ///
    /// # Safety
    /// `root` must be a complete directory that maps the executing code.
    unsafe fn activate(&self, root: PhysicalPage);

    /// The page mapped at `va` in the current translation.
    ///
    /// # Safety
    /// `va` must be page aligned and currently mapped, and the caller must
    /// hold the only reference to that page.
    unsafe fn page_at<'a>(&self, va: VirtualAddress) -> &'a mut PageBytes;
}
