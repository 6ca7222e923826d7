//! # Kernel Boot Information

use kernel_memory_addresses::PhysicalAddress;

/// What the loader hands the kernel.
/// Keep this `#[repr(C)]` with fixed-size integers at the ABI boundary.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct KernelBootInfo {
    /// Firmware memory map, already translated to [`BootMemoryRange`]s.
    pub memory_map: MemoryMapInfo,

    /// Physical range occupied by the loaded kernel image.
    pub kernel_image: PhysicalRangeInfo,

    /// Physical ranges occupied by boot modules (array of [`PhysicalRangeInfo`]).
    pub modules_ptr: u64,

    /// Number of entries behind `modules_ptr`.
    pub modules_len: u64,

    /// RSDP (ACPI 2.0+) physical address, or 0 if not provided.
    pub rsdp_addr: u64,
}

/// Location of the memory map array.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct MemoryMapInfo {
    /// Kernel-visible pointer to an array of [`BootMemoryRange`].
    pub ranges_ptr: u64,

    /// Number of entries (not bytes).
    pub ranges_len: u64,
}

/// Kind of a memory map entry.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BootMemoryKind {
    /// Free RAM.
    Usable = 0,
    /// Firmware or device reserved. Candidates for user-mappable MMIO.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Defective RAM reported by firmware.
    BadMemory = 4,
    /// Anything the loader could not classify.
    Unknown = 5,
}

/// One `(kind, base, length)` triple of the boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootMemoryRange {
    pub kind: BootMemoryKind,
    pub base: u64,
    pub length: u64,
}

impl BootMemoryRange {
    #[must_use]
    pub const fn new(kind: BootMemoryKind, base: u64, length: u64) -> Self {
        Self { kind, base, length }
    }

    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// Exclusive end, saturating at the top of the physical address space.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.saturating_add(self.length))
    }
}

/// A physical range already in use at handoff (kernel image, module).
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysicalRangeInfo {
    pub base: u64,
    pub length: u64,
}

impl PhysicalRangeInfo {
    #[must_use]
    pub const fn new(base: u64, length: u64) -> Self {
        Self { base, length }
    }
}
