//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for the addresses, frames and ranges the memory
//! manager passes around.
//!
//! ## Overview
//!
//! The memory manager only ever hands out **4 KiB** frames and maps **4 KiB**
//! pages, so the page granularity is a crate-wide constant ([`PAGE_SIZE`])
//! rather than a type parameter.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`PhysicalPage`] | The page-aligned base of one physical frame. |
//! | [`VirtualAddress`] | A byte address in some virtual address space. |
//! | [`VirtualPage`] | The page-aligned base of one virtual page. |
//! | [`VirtualRange`] | A half-open, page-granular span of virtual addresses. |
//!
//! All of them are `#[repr(transparent)]` over `u64` (or a pair of them), are
//! `Copy`, and order/hash by their raw value so they can be used as map keys.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
//! let frame = pa.page();
//! assert_eq!(frame.base().as_u64(), 0x0000_0010_2000_0000);
//! assert_eq!(frame.base() + pa.page_offset(), pa);
//!
//! let range = VirtualRange::new(VirtualAddress::new(0x4000), 3 * PAGE_SIZE);
//! assert!(range.contains(VirtualAddress::new(0x6fff)));
//! assert_eq!(range.page_count(), 3);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;
mod virtual_range;

pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;
pub use virtual_range::VirtualRange;

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a page / physical frame in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// [`PAGE_SIZE`] as `usize`, for slice lengths.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_SIZE_BYTES: usize = PAGE_SIZE as usize;

/// Raw bytes of one page.
pub type PageBytes = [u8; PAGE_SIZE_BYTES];

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two; the result is meaningless otherwise.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1,    4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Whether `x` is a multiple of [`PAGE_SIZE`].
#[inline(always)]
#[must_use]
pub const fn is_page_aligned(x: u64) -> bool {
    x & (PAGE_SIZE - 1) == 0
}
