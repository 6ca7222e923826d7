use crate::address_space::AddressSpace;
use crate::manager::MemoryManager;
use crate::platform::Platform;
use crate::region::{FaultPolicy, Region};
use crate::vmobject::AnonymousVmObject;
use alloc::sync::Arc;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::PageWalker;
use log::{Level, debug, error, warn};

/// Page-fault error code as pushed by the CPU (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultCode {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool, // bit 0

    /// 0 = read or execute, 1 = write.
    pub write: bool, // bit 1

    /// 1 = access from user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch.
    pub instruction_fetch: bool, // bit 4

    pub protection_key: bool, // bit 5
    pub shadow_stack: bool,   // bit 6

    #[bits(57)]
    __: u64,
}

impl PageFaultCode {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "reserved bit set in a paging structure"
        } else if !self.present() {
            if self.instruction_fetch() {
                "instruction fetch from a non-present page"
            } else if self.write() {
                "write to a non-present page"
            } else {
                "read from a non-present page"
            }
        } else if self.instruction_fetch() {
            "instruction fetch from a non-executable page"
        } else if self.write() {
            "write to a read-only page"
        } else {
            "protection violation"
        }
    }
}

/// A trapped page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub code: PageFaultCode,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, code: PageFaultCode) -> Self {
        Self { address, code }
    }

    /// From the faulting address (CR2) and the raw error code.
    #[must_use]
    pub const fn from_raw(cr2: u64, error_code: u64) -> Self {
        Self::new(VirtualAddress::new(cr2), PageFaultCode::from_bits(error_code))
    }

    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.code.write()
    }

    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.code.user()
    }

    #[must_use]
    pub const fn is_instruction_fetch(&self) -> bool {
        self.code.instruction_fetch()
    }
}

/// What the trap handler should do after [`handle_page_fault`](crate::MemoryManager::handle_page_fault).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// Resume the faulting instruction.
    Handled,
    /// Kill the faulting thread, or the kernel.
    ShouldCrash,
}

impl<P: Platform> MemoryManager<P> {
    /// Resolve a page fault.
    ///
    /// The kernel region list is searched first, then the current address
    /// space. Anonymous regions are filled lazily; everything else, and any
    /// fault without an owner, is fatal for the faulting context.
    pub fn handle_page_fault(&self, fault: &PageFault, was_in_interrupt: bool) -> FaultResolution {
        if was_in_interrupt {
            error!(
                "Page fault at {} while servicing an interrupt: {}",
                fault.address,
                fault.code.explain()
            );
            self.dump_kernel_regions_at(Level::Error);
            return FaultResolution::ShouldCrash;
        }

        // Resolving would take the global lock again and spin forever.
        if self.holds_global_lock() {
            error!(
                "Page fault at {} inside the memory manager: {}",
                fault.address,
                fault.code.explain()
            );
            self.dump_kernel_regions_at(Level::Error);
            return FaultResolution::ShouldCrash;
        }

        let Some((space, region)) = self.find_fault_owner(fault.address) else {
            error!(
                "Page fault at {} outside any region: {}",
                fault.address,
                fault.code.explain()
            );
            self.dump_kernel_regions_at(Level::Error);
            return FaultResolution::ShouldCrash;
        };

        if !region.allows(fault.is_write(), fault.is_user(), fault.is_instruction_fetch()) {
            error!(
                "Access violation at {} in {region:?}: {}",
                fault.address,
                fault.code.explain()
            );
            return FaultResolution::ShouldCrash;
        }

        match region.policy() {
            FaultPolicy::Anonymous(object) => {
                self.handle_anonymous_fault(&space, &region, object, fault)
            }
            FaultPolicy::Physical { .. } => {
                error!("Fault at {} in physical region {region:?}", fault.address);
                FaultResolution::ShouldCrash
            }
            FaultPolicy::Guard => {
                error!("Guard page hit at {} in {region:?}", fault.address);
                FaultResolution::ShouldCrash
            }
        }
    }

    fn find_fault_owner(&self, va: VirtualAddress) -> Option<(Arc<AddressSpace>, Arc<Region>)> {
        let kernel = self.find_kernel_region(va);
        if let Some(region) = kernel {
            return Some((self.kernel_space().clone(), region));
        }
        let space = self.current_address_space()?;
        let region = space.find_region(va)?;
        Some((space, region))
    }

    fn handle_anonymous_fault(
        &self,
        space: &AddressSpace,
        region: &Region,
        object: &AnonymousVmObject,
        fault: &PageFault,
    ) -> FaultResolution {
        let va = fault.address.page().base();
        let index = region.page_index(va);
        let attrs = region.leaf_attributes();

        let mut state = object.lock();
        let Some(slot) = state.frames.get(index) else {
            error!("Fault at {va} in released region {region:?}");
            return FaultResolution::ShouldCrash;
        };

        if let Some(frame) = slot {
            let frame = frame.page();
            if self.is_mapped_to(space, va, frame, fault) {
                debug!("Spurious fault at {va}");
            } else {
                self.map_pages(space, attrs, [(va, frame)]);
            }
            return FaultResolution::Handled;
        }

        let Ok(frame) = self.draw_frame(&mut state) else {
            warn!("No frame for {va} in {region:?}");
            return FaultResolution::ShouldCrash;
        };
        let page = frame.page();
        state.frames[index] = Some(frame);
        self.map_pages(space, attrs, [(va, page)]);
        debug!("Zero-filled {va} -> {page}");
        FaultResolution::Handled
    }

    /// Whether `va` already maps `frame` with the faulting access allowed.
    fn is_mapped_to(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        frame: PhysicalPage,
        fault: &PageFault,
    ) -> bool {
        let irq = IrqGuard::new(self.platform());
        let token = irq.token();
        let space_state = space.lock();
        let tables = self.tables(&token);
        PageWalker::new(&tables)
            .lookup(&space_state.directory, va)
            .is_some_and(|pte| {
                pte.entry.physical_page() == frame
                    && pte.entry.permits(
                        fault.is_write(),
                        fault.is_user(),
                        fault.is_instruction_fetch(),
                    )
            })
    }
}
