//! The memory manager on bare x86-64 hardware.

use crate::platform::Platform;
use kernel_alloc::HhdmPhysMapper;
use kernel_info::memory::MAX_CPUS;
use kernel_memory_addresses::{PageBytes, PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_sync::{InterruptControl, X86Interrupts};
use kernel_vmem::PhysMapper;

/// Invalidate `pages` pages at `va` on all other CPUs (IPI and wait).
pub type RemoteFlushFn = fn(va: VirtualAddress, pages: usize);

/// Returns the index of the executing CPU.
pub type CpuIdFn = fn() -> usize;

const fn boot_cpu() -> usize {
    0
}

/// HHDM for physical access, `invlpg` and CR3 for the MMU.
///
/// Starts out single-CPU; the SMP bring-up installs CPU identification and
/// the shootdown IPI with [`with_smp`](Self::with_smp).
#[derive(Debug, Copy, Clone)]
pub struct X86Platform {
    direct_map: HhdmPhysMapper,
    interrupts: X86Interrupts,
    cpu_id: CpuIdFn,
    remote_flush: Option<RemoteFlushFn>,
}

impl X86Platform {
    #[must_use]
    pub const fn new(direct_map: HhdmPhysMapper) -> Self {
        Self {
            direct_map,
            interrupts: X86Interrupts,
            cpu_id: boot_cpu,
            remote_flush: None,
        }
    }

    #[must_use]
    pub const fn with_smp(mut self, cpu_id: CpuIdFn, remote_flush: RemoteFlushFn) -> Self {
        self.cpu_id = cpu_id;
        self.remote_flush = Some(remote_flush);
        self
    }
}

impl Default for X86Platform {
    fn default() -> Self {
        Self::new(HhdmPhysMapper::default())
    }
}

impl PhysMapper for X86Platform {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { self.direct_map.phys_to_mut(pa) }
    }
}

impl InterruptControl for X86Platform {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        self.interrupts.interrupts_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        self.interrupts.disable_interrupts();
    }

    #[inline]
    fn enable_interrupts(&self) {
        self.interrupts.enable_interrupts();
    }
}

impl Platform for X86Platform {
    fn current_cpu(&self) -> usize {
        (self.cpu_id)()
    }

    /// Only the boot CPU until a shootdown is installed.
    fn max_cpus(&self) -> usize {
        if self.remote_flush.is_some() {
            MAX_CPUS
        } else {
            1
        }
    }

    #[inline]
    fn flush_local(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn flush_remote(&self, va: VirtualAddress, pages: usize) {
        if let Some(flush) = self.remote_flush {
            flush(va, pages);
        }
    }

    unsafe fn activate(&self, root: PhysicalPage) {
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) root.base().as_u64(),
                options(nostack, preserves_flags)
            );
        }
    }

    unsafe fn page_at<'a>(&self, va: VirtualAddress) -> &'a mut PageBytes {
        unsafe { &mut *va.as_mut_ptr::<PageBytes>() }
    }
}
