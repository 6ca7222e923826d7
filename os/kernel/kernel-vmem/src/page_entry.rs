use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// One 64-bit page table entry in its raw bitfield form.
///
/// The layout is the x86-64 superset shared by all levels. Only 4 KiB leaves
/// are ever produced, so `large_page` stays clear; it is kept so that foreign
/// entries decode faithfully.
///
/// | Bits   | Name            | Meaning                         |
/// |--------|-----------------|---------------------------------|
/// | 0      | `P`             | Present                         |
/// | 1      | `RW`            | Writable                        |
/// | 2      | `US`            | User accessible                 |
/// | 3      | `PWT`           | Write-through                   |
/// | 4      | `PCD`           | Cache disabled                  |
/// | 5      | `A`             | Accessed                        |
/// | 6      | `D`             | Dirty (leaf only)               |
/// | 7      | `PS`            | Large page                      |
/// | 8      | `G`             | Global                          |
/// | 9–11   | OS available    | Ignored by hardware             |
/// | 12–51  | `addr`          | Physical frame bits `[51:12]`   |
/// | 52–62  | OS available    | Ignored by hardware             |
/// | 63     | `NX`            | No execute                      |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalPage;
/// # use kernel_vmem::{LeafAttributes, PageEntryBits};
/// let frame = PhysicalPage::from_number(0x1234);
/// let e = PageEntryBits::leaf(frame, LeafAttributes::kernel_rw());
/// assert!(e.present() && e.writable() && e.no_execute());
/// assert_eq!(e.physical_page(), frame);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global_translation: bool,

    #[bits(3)]
    pub os_available_low: u8,

    #[bits(40)]
    phys_addr_bits_51_12: u64,

    #[bits(11)]
    pub os_available_high: u16,

    pub no_execute: bool,
}

/// Permissions and caching of a leaf mapping.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct LeafAttributes {
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
    pub global: bool,
    pub uncached: bool,
}

impl LeafAttributes {
    /// Supervisor read/write data.
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self {
            writable: true,
            user: false,
            executable: false,
            global: true,
            uncached: false,
        }
    }
}

impl PageEntryBits {
    /// An all-zero, not-present entry.
    pub const EMPTY: Self = Self::new();

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn physical_page(&self) -> PhysicalPage {
        PhysicalPage::from_aligned(self.physical_address())
    }

    #[inline]
    pub const fn set_physical_page(&mut self, frame: PhysicalPage) {
        self.set_phys_addr_bits_51_12(frame.number());
    }

    /// Entry linking a parent table to the next-level `table`.
    ///
    /// Intermediate entries are always writable; the leaf decides. `user`
    /// must be set for tables in the user half, `global` for the kernel half.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalPage, user: bool, global: bool) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_global_translation(global);
        e.set_physical_page(table);
        e
    }

    /// 4 KiB leaf mapping `frame` with `attrs`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage, attrs: LeafAttributes) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(attrs.writable)
            .with_user_access(attrs.user)
            .with_no_execute(!attrs.executable)
            .with_global_translation(attrs.global)
            .with_cache_disabled(attrs.uncached)
            .with_write_through(attrs.uncached);
        e.set_physical_page(frame);
        e
    }

    /// Whether this entry permits a user-mode access of the given kind.
    #[inline]
    #[must_use]
    pub const fn permits(&self, write: bool, user: bool, execute: bool) -> bool {
        self.present()
            && (!write || self.writable())
            && (!user || self.user_access())
            && (!execute || !self.no_execute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entry_layout() {
        let frame = PhysicalPage::from_number(0xABCDE);
        let e = PageEntryBits::table(frame, true, false);
        assert_eq!(e.into_bits(), 0x0000_0000_ABCD_E007);
        assert_eq!(e.physical_page(), frame);
    }

    #[test]
    fn leaf_permissions() {
        let frame = PhysicalPage::from_number(7);
        let ro_user = PageEntryBits::leaf(
            frame,
            LeafAttributes {
                user: true,
                ..LeafAttributes::default()
            },
        );
        assert!(ro_user.permits(false, true, false));
        assert!(!ro_user.permits(true, true, false));
        assert!(!ro_user.permits(false, true, true));
        assert!(!PageEntryBits::EMPTY.permits(false, false, false));
        assert!(ro_user.no_execute());
    }
}
