//! # Memory Layout

/// Exclusive end of the user half.
pub const USER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// First address of the kernel half.
pub const KERNEL_HALF_START: u64 = 0xffff_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the window kernel regions are placed in.
pub const KERNEL_REGION_BASE: u64 = 0xffff_c000_0000_0000;

/// Size of the kernel region window (64 GiB).
pub const KERNEL_REGION_WINDOW_SIZE: u64 = 64 << 30;

/// Base of the quickmap window. Aligned so that all slots share one leaf table.
pub const QUICKMAP_BASE: u64 = 0xffff_ffff_7fe0_0000;

/// Upper bound on CPUs that get a private quickmap slot.
pub const MAX_CPUS: usize = 64;

/// Number of lock-protected quickmap slots shared by all CPUs.
pub const QUICKMAP_SHARED_SLOTS: usize = 4;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is loaded in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Physical memory below this address is never handed out.
pub const LOW_MEMORY_RESERVED: u64 = 0x0010_0000;

/// Frames set aside for the kernel pool (page tables, kernel structures) when
/// the boot stage does not override it: 16 MiB.
pub const DEFAULT_KERNEL_POOL_PAGES: u64 = 4096;

const _: () = {
    assert!(USER_HALF_END <= KERNEL_HALF_START);
    assert!(HHDM_BASE >= KERNEL_HALF_START);
    assert!(KERNEL_REGION_BASE > HHDM_BASE);
    assert!(KERNEL_REGION_BASE + KERNEL_REGION_WINDOW_SIZE <= QUICKMAP_BASE);
    assert!(QUICKMAP_BASE.is_multiple_of(2 << 20));
    assert!(QUICKMAP_BASE < KERNEL_BASE);
    assert!(MAX_CPUS + QUICKMAP_SHARED_SLOTS <= 512);
    assert!(PHYS_LOAD >= LOW_MEMORY_RESERVED);
};
