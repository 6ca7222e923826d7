use crate::vmobject::AnonymousVmObject;
use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_vmem::LeafAttributes;

bitflags! {
    /// What a region may be accessed for.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct RegionFlags: u8 {
        /// Mapped into user space.
        const USER = 1 << 0;
        const STACK = 1 << 1;
        /// System calls may originate here.
        const SYSCALL = 1 << 2;
        const SHARED = 1 << 3;
    }
}

/// How frames are found for a region's pages.
pub enum FaultPolicy {
    /// Lazily zero-filled frames owned by an anonymous object.
    Anonymous(Arc<AnonymousVmObject>),
    /// A fixed physical range, mapped eagerly.
    Physical { base: PhysicalAddress },
    /// Never accessible.
    Guard,
}

/// When an anonymous region gets its frames.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocationStrategy {
    /// Commit every page now, draw frames on first touch.
    Reserve,
    /// Commit and populate every page now.
    AllocateNow,
    /// No commitment; first touch draws from the uncommitted pool and may fail.
    None,
}

/// A contiguous virtual range with uniform access and backing.
pub struct Region {
    range: VirtualRange,
    access: Access,
    flags: RegionFlags,
    name: String,
    policy: FaultPolicy,
}

impl Region {
    pub(crate) fn new(
        range: VirtualRange,
        name: impl Into<String>,
        access: Access,
        flags: RegionFlags,
        policy: FaultPolicy,
    ) -> Self {
        Self {
            range,
            access,
            flags,
            name: name.into(),
            policy,
        }
    }

    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        self.range
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.range.start()
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    #[must_use]
    pub const fn flags(&self) -> RegionFlags {
        self.flags
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn policy(&self) -> &FaultPolicy {
        &self.policy
    }

    /// The anonymous object behind this region, if any.
    #[must_use]
    pub const fn anonymous(&self) -> Option<&Arc<AnonymousVmObject>> {
        match &self.policy {
            FaultPolicy::Anonymous(object) => Some(object),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.flags.contains(RegionFlags::USER)
    }

    /// Page index of `va` inside the region.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn page_index(&self, va: VirtualAddress) -> usize {
        (va.offset_from(self.range.start()) >> PAGE_SHIFT) as usize
    }

    /// Whether an access of this kind is allowed at all.
    #[must_use]
    pub const fn allows(&self, write: bool, user: bool, execute: bool) -> bool {
        if user && !self.is_user() {
            return false;
        }
        if write {
            self.access.contains(Access::WRITE)
        } else if execute {
            self.access.contains(Access::EXECUTE)
        } else {
            self.access.contains(Access::READ)
        }
    }

    /// Leaf permissions for this region's pages.
    #[must_use]
    pub const fn leaf_attributes(&self) -> LeafAttributes {
        LeafAttributes {
            writable: self.access.contains(Access::WRITE),
            user: self.is_user(),
            executable: self.access.contains(Access::EXECUTE),
            global: !self.is_user(),
            uncached: matches!(self.policy, FaultPolicy::Physical { .. }),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.policy {
            FaultPolicy::Anonymous(_) => "anonymous",
            FaultPolicy::Physical { .. } => "physical",
            FaultPolicy::Guard => "guard",
        };
        write!(
            f,
            "{} {:?} {:?} {kind} {:?}",
            self.range, self.access, self.flags, self.name
        )
    }
}
