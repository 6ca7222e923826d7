use kernel_alloc::BootMapError;
use kernel_memory_addresses::{PhysicalAddress, VirtualRange};
use kernel_vmem::WalkError;

/// Recoverable failures of manager operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("size {0:#x} is zero or not page aligned")]
    InvalidSize(u64),
    #[error("physical address {0} is not page aligned")]
    UnalignedPhysical(PhysicalAddress),
    #[error("range {0} is empty or not page aligned")]
    InvalidRange(VirtualRange),
    #[error("range {0} lies outside the address space half")]
    OutsideAddressSpace(VirtualRange),
    #[error("range {0} overlaps an existing region")]
    Overlap(VirtualRange),
    #[error("no room left for {0} bytes in the kernel region window")]
    WindowExhausted(u64),
    #[error("physical range at {0} may not be mapped into user space")]
    NotUserMappable(PhysicalAddress),
    #[error("region is not registered in this address space")]
    NoSuchRegion,
}

/// Why [`MemoryManager::new`](crate::MemoryManager::new) refused to start.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    BootMap(#[from] BootMapError),
    #[error("kernel page tables: {0}")]
    Walk(#[from] WalkError),
    #[error("invalid memory configuration: {0}")]
    Config(&'static str),
}
