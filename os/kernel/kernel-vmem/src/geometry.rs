//! Radix layout of the page tables.
//!
//! A geometry is `levels` tables deep, each indexed by `index_bits` bits of
//! the virtual address above the 12-bit page offset. Depth 0 is the root;
//! depth `levels - 1` holds the leaf entries.
//!
//! ```text
//! x86-64, 4 × 9 bits:
//!
//!  63      48 47    39 38    30 29    21 20    12 11        0
//! ┌──────────┬────────┬────────┬────────┬────────┬───────────┐
//! │ sign ext │ depth0 │ depth1 │ depth2 │ depth3 │  offset   │
//! └──────────┴────────┴────────┴────────┴────────┴───────────┘
//! ```
//!
//! Every non-root table is identified by a [`TableKey`]: its depth plus the
//! address prefix *above* the bits it indexes. All addresses a table serves
//! share that prefix, so the key is stable for the lifetime of the table.

use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress};

/// Number of 64-bit entries in one 4 KiB table frame.
pub const MAX_ENTRIES: usize = 512;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PagingGeometry {
    levels: u8,
    index_bits: u8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("paging needs 2 to 5 levels, got {0}")]
    Levels(u8),
    #[error("a table index of {0} bits does not fit a 4 KiB table")]
    IndexBits(u8),
    #[error("{levels} levels of {index_bits} bits exceed 64 address bits")]
    TooWide { levels: u8, index_bits: u8 },
}

/// Identity of a non-root page table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableKey {
    pub depth: u8,
    pub prefix: u64,
}

impl PagingGeometry {
    /// x86-64 4-level paging.
    pub const X86_64: Self = Self {
        levels: 4,
        index_bits: 9,
    };

    pub const fn new(levels: u8, index_bits: u8) -> Result<Self, GeometryError> {
        if levels < 2 || levels > 5 {
            return Err(GeometryError::Levels(levels));
        }
        if index_bits == 0 || index_bits > 9 {
            return Err(GeometryError::IndexBits(index_bits));
        }
        if PAGE_SHIFT + levels as u32 * index_bits as u32 > 64 {
            return Err(GeometryError::TooWide { levels, index_bits });
        }
        Ok(Self { levels, index_bits })
    }

    #[inline]
    #[must_use]
    pub const fn levels(&self) -> u8 {
        self.levels
    }

    #[inline]
    #[must_use]
    pub const fn leaf_depth(&self) -> u8 {
        self.levels - 1
    }

    #[inline]
    #[must_use]
    pub const fn index_bits(&self) -> u8 {
        self.index_bits
    }

    #[inline]
    #[must_use]
    pub const fn entries_per_table(&self) -> usize {
        1 << self.index_bits
    }

    /// Number of address bits translated by the whole walk.
    #[inline]
    #[must_use]
    pub const fn address_bits(&self) -> u32 {
        PAGE_SHIFT + self.levels as u32 * self.index_bits as u32
    }

    /// Lowest address bit consumed by the index at `depth`.
    #[inline]
    #[must_use]
    pub const fn index_shift(&self, depth: u8) -> u32 {
        debug_assert!(depth < self.levels);
        PAGE_SHIFT + self.index_bits as u32 * (self.levels - 1 - depth) as u32
    }

    /// Bytes of address space covered by one entry at `depth`.
    #[inline]
    #[must_use]
    pub const fn entry_span(&self, depth: u8) -> u64 {
        1 << self.index_shift(depth)
    }

    #[inline]
    #[must_use]
    const fn masked(&self, va: VirtualAddress) -> u64 {
        let bits = self.address_bits();
        if bits >= 64 {
            va.as_u64()
        } else {
            va.as_u64() & ((1 << bits) - 1)
        }
    }

    /// Index of `va` in its table at `depth`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(&self, va: VirtualAddress, depth: u8) -> usize {
        ((va.as_u64() >> self.index_shift(depth)) & ((1 << self.index_bits) - 1)) as usize
    }

    /// Key of the table at `depth` (≥ 1) that serves `va`.
    #[inline]
    #[must_use]
    pub const fn table_key(&self, va: VirtualAddress, depth: u8) -> TableKey {
        debug_assert!(depth >= 1 && depth < self.levels);
        TableKey {
            depth,
            prefix: self.masked(va) >> self.index_shift(depth - 1),
        }
    }

    /// Sign-extended first address of the upper (kernel) half.
    #[inline]
    #[must_use]
    pub const fn kernel_half_start(&self) -> u64 {
        let bits = self.address_bits();
        if bits >= 64 {
            1 << 63
        } else {
            !((1u64 << (bits - 1)) - 1)
        }
    }

    /// Exclusive end of the lower (user) half.
    #[inline]
    #[must_use]
    pub const fn user_half_end(&self) -> u64 {
        1 << (self.address_bits() - 1)
    }

    /// Root indices belonging to the kernel half.
    #[inline]
    #[must_use]
    pub const fn kernel_root_indices(&self) -> core::ops::Range<usize> {
        self.entries_per_table() / 2..self.entries_per_table()
    }
}

impl Default for PagingGeometry {
    fn default() -> Self {
        Self::X86_64
    }
}
