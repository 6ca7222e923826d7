//! # Kernel Memory Layout and Boot Interface
//!
//! Constants and ABI types shared between the boot stage and the memory
//! manager. Everything here is plain data: the memory manager consumes it,
//! nothing in this crate acts on it.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User half               │
//!                       │   (one page directory per       │
//!                       │    address space)               │
//! USER_HALF_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │    non-canonical hole           │
//! KERNEL_HALF_START     ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │         (unused)                │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_REGION_BASE    ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │   Kernel regions (allocated     │
//!                       │   VA with guard gaps)           │
//!                       ├─────────────────────────────────┤
//!                       │         (unused)                │
//! QUICKMAP_BASE         ├─────────────────────────────────┤ 0xffff_ffff_7fe0_0000
//!                       │   Quickmap slots (one leaf      │
//!                       │   table, per-CPU + shared)      │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The kernel half is shared by all address spaces: its top-level tables are
//! created once and aliased into every user page directory.
//!
//! ## Physical Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Low memory (never handed out)  │
//! PHYS_LOAD   ├─────────────────────────────────┤ 0x0010_0000 (1 MiB)
//!             │       Kernel Image              │
//!             ├─────────────────────────────────┤
//!             │  Usable RAM, split into the     │
//!             │  kernel pool and the user pool  │
//!             └─────────────────────────────────┘
//! ```
//!
//! ## Boot Handoff
//!
//! The loader passes a [`KernelBootInfo`](boot::KernelBootInfo) carrying the
//! firmware memory map as `(kind, base, length)` triples plus the physical
//! ranges already occupied by the kernel image and boot modules.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
