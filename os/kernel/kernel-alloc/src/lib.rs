//! # Physical Frame Pools
//!
//! Ownership and accounting of physical memory.
//!
//! ```text
//!  boot memory map ──▶ PhysicalMemoryLayout::from_boot_map
//!                            │
//!          ┌─────────────────┴──────────────────┐
//!          ▼                                    ▼
//!  FramePool (Kernel)                    UserPool
//!   • page tables, kernel structures      • FramePool (User)
//!   • contiguous + aligned runs           • CommitCounters
//!   • exhaustion is fatal upstream          committed + uncommitted + used
//!                                            == capacity
//! ```
//!
//! Frames travel as [`PhysicalFrame`] handles: a pool hands one out on
//! allocation and takes it back on deallocation, so a frame has exactly one
//! owner at a time. Each pool is a set of [`FrameRegion`]s, bitmaps over
//! disjoint contiguous spans.
//!
//! Nothing in this crate locks; the memory manager keeps both pools inside its
//! global lock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod boot_map;
mod frame;
pub mod phys_mapper;
mod pool;
mod region;

pub use boot_map::{BootMapError, PhysicalMemoryLayout, RecordedRange};
pub use frame::{PhysicalFrame, PoolKind};
pub use phys_mapper::HhdmPhysMapper;
pub use pool::{CommitCounters, FramePool, UserPool};
pub use region::FrameRegion;
