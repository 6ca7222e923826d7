//! # Page tables
//!
//! Multi-level radix page tables for one address space at a time.
//!
//! ```text
//!  PageDirectory ─── root frame
//!        │            ├─ entry ──▶ depth-1 table ─ entry ──▶ … ──▶ leaf table
//!        │            └─ …                                          └─ 4 KiB leaf
//!        └─ tables: TableKey { depth, prefix } ──▶ frame (+ pinned)
//! ```
//!
//! - [`PagingGeometry`] fixes the number of levels and the index width.
//! - [`PageDirectory`] owns the root and records every intermediate table it
//!   created so the tables can be found again for teardown.
//! - [`PageWalker`] performs `lookup`, `ensure`, `release` and `destroy`
//!   through a [`TableAccess`] that knows how to reach table frames.
//!
//! Intermediate tables come from a [`TableFrameAlloc`]; in the kernel this is
//! the reserved kernel frame pool.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod directory;
pub mod geometry;
mod page_entry;
mod walker;

pub use directory::{DirectoryHalf, PageDirectory, TableRecord};
pub use geometry::{GeometryError, PagingGeometry, TableKey};
pub use page_entry::{LeafAttributes, PageEntryBits};
pub use walker::{
    DirectTables, PageWalker, PhysMapper, Pte, PteRef, RawTable, ReleaseHint, TableAccess,
    TableFrameAlloc, WalkError,
};
