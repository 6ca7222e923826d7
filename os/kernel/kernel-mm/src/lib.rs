//! # Kernel Memory Manager
//!
//! Ties the frame pools, the page-table walker and the quickmap window into
//! one [`MemoryManager`] that the rest of the kernel talks to.
//!
//! ```text
//!   boot memory map
//!         │  PhysicalMemoryLayout
//!         ▼
//!  ┌────────────────────── MemoryManager ──────────────────────┐
//!  │  GlobalLock (ticket): kernel pool, user pool + commits,   │
//!  │                       kernel regions, purgeables          │
//!  │  kernel AddressSpace (pinned top level, quickmap table)   │
//!  │  QuickMap: per-CPU slots + shared slots                   │
//!  └───────────────┬───────────────────────────┬───────────────┘
//!                  │                           │
//!        handle_page_fault              create_address_space
//!       kernel list ▸ current space     user Region ▸ AnonymousVmObject
//! ```
//!
//! ## Regions
//!
//! A [`Region`] carries one of three policies: [`FaultPolicy::Anonymous`]
//! memory is zero-filled on first touch from an [`AnonymousVmObject`],
//! [`FaultPolicy::Physical`] maps a fixed physical range eagerly, and
//! [`FaultPolicy::Guard`] is never accessible.
//!
//! ## Hardware
//!
//! Everything CPU specific sits behind [`Platform`]. On x86-64 that is
//! [`arch::x86_64::X86Platform`]; the integration tests drive the manager on
//! a simulated machine with a software TLB.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
pub mod arch;
mod committed;
mod config;
mod error;
mod fault;
mod global_lock;
mod manager;
mod platform;
pub mod quickmap;
mod region;
mod vmobject;

pub use address_space::AddressSpace;
pub use committed::CommittedPages;
pub use config::MemoryConfig;
pub use error::{InitError, MemoryError};
pub use fault::{FaultResolution, PageFault, PageFaultCode};
pub use manager::{KernelRegion, MemoryManager, MemoryStats};
pub use platform::Platform;
pub use quickmap::{QuickMap, QuickMapping};
pub use region::{Access, AllocationStrategy, FaultPolicy, Region, RegionFlags};
pub use vmobject::{AnonymousVmObject, PurgeContext, Purgeable};
