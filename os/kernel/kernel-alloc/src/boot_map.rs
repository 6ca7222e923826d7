//! Boot memory map ingestion.
//!
//! Turns the firmware's `(kind, base, length)` triples into frame pools:
//!
//! 1. every [`Usable`](BootMemoryKind::Usable) range minus the ranges already
//!    occupied at handoff (kernel image, boot modules) and minus low memory;
//! 2. alignment fix-up: round the start up, truncate the end down, drop
//!    sub-page leftovers;
//! 3. the lowest `kernel_pool_pages` frames form the kernel pool, the rest the
//!    user pool.
//!
//! Non-usable ranges are kept by kind so that later requests to map physical
//! memory into user space can be checked against them.

use crate::pool::{FramePool, UserPool};
use crate::region::FrameRegion;
use crate::frame::PoolKind;
use alloc::vec::Vec;
use kernel_info::boot::{
    BootMemoryKind, BootMemoryRange, KernelBootInfo, MemoryMapInfo, PhysicalRangeInfo,
};
use kernel_info::memory::LOW_MEMORY_RESERVED;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, align_down, align_up};
use log::{debug, info};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootMapError {
    #[error("the boot memory map has no usable memory")]
    NoUsableMemory,
    #[error(
        "{available} usable pages cannot hold a kernel pool of {kernel_pool} pages and a user pool"
    )]
    InsufficientMemory { available: u64, kernel_pool: u64 },
}

/// A non-usable range as reported at boot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RecordedRange {
    pub kind: BootMemoryKind,
    pub base: PhysicalAddress,
    pub length: u64,
}

/// The result of parsing the boot map: both pools plus the recorded
/// non-usable ranges.
#[derive(Debug)]
pub struct PhysicalMemoryLayout {
    pub kernel: FramePool,
    pub user: UserPool,
    pub recorded: Vec<RecordedRange>,
}

/// Half-open `[start, end)` byte range.
type Span = (u64, u64);

fn subtract(spans: Vec<Span>, hole: Span) -> Vec<Span> {
    let mut out = Vec::with_capacity(spans.len() + 1);
    for (start, end) in spans {
        if hole.1 <= start || hole.0 >= end {
            out.push((start, end));
            continue;
        }
        if start < hole.0 {
            out.push((start, hole.0));
        }
        if hole.1 < end {
            out.push((hole.1, end));
        }
    }
    out
}

impl PhysicalMemoryLayout {
    /// Build the pools from a boot memory map.
    ///
    /// `used` lists ranges occupied at handoff. At least one frame must
    /// remain for the user pool after `kernel_pool_pages` are set aside.
    pub fn from_boot_map(
        map: &[BootMemoryRange],
        used: &[PhysicalRangeInfo],
        kernel_pool_pages: u64,
    ) -> Result<Self, BootMapError> {
        let mut spans: Vec<Span> = map
            .iter()
            .filter(|r| r.kind == BootMemoryKind::Usable && r.length > 0)
            .map(|r| (r.base, r.base.saturating_add(r.length)))
            .collect();

        let mut recorded: Vec<RecordedRange> = map
            .iter()
            .filter(|r| r.kind != BootMemoryKind::Usable)
            .map(|r| RecordedRange {
                kind: r.kind,
                base: r.start(),
                length: r.length,
            })
            .collect();
        recorded.sort_by_key(|r| r.base);

        spans = subtract(spans, (0, LOW_MEMORY_RESERVED));
        for u in used {
            spans = subtract(spans, (u.base, u.base.saturating_add(u.length)));
        }

        let mut pages: Vec<(PhysicalPage, u64)> = spans
            .into_iter()
            .filter_map(|(start, end)| {
                let start = align_up(start, PAGE_SIZE)?;
                let end = align_down(end, PAGE_SIZE);
                (end > start).then(|| {
                    (
                        PhysicalPage::from_aligned(PhysicalAddress::new(start)),
                        (end - start) / PAGE_SIZE,
                    )
                })
            })
            .collect();
        pages.sort_by_key(|&(base, _)| base);

        // firmware maps may list overlapping or touching usable entries
        let mut merged: Vec<(PhysicalPage, u64)> = Vec::with_capacity(pages.len());
        for (base, count) in pages {
            if let Some((last_base, last_count)) = merged.last_mut() {
                let last_end = last_base.number() + *last_count;
                if base.number() <= last_end {
                    *last_count = (*last_count).max(base.number() + count - last_base.number());
                    continue;
                }
            }
            merged.push((base, count));
        }

        let available: u64 = merged.iter().map(|&(_, n)| n).sum();
        if available == 0 {
            return Err(BootMapError::NoUsableMemory);
        }
        if available <= kernel_pool_pages {
            return Err(BootMapError::InsufficientMemory {
                available,
                kernel_pool: kernel_pool_pages,
            });
        }

        let mut kernel_regions = Vec::new();
        let mut user_regions = Vec::new();
        let mut kernel_left = kernel_pool_pages;
        for (base, count) in merged {
            let to_kernel = kernel_left.min(count);
            kernel_left -= to_kernel;
            if to_kernel > 0 {
                kernel_regions.push(region(base, to_kernel));
            }
            if count > to_kernel {
                user_regions.push(region(base.add(to_kernel), count - to_kernel));
            }
        }

        for r in kernel_regions.iter().chain(&user_regions) {
            debug!("Frame region {}..{} ({} frames)", r.base(), r.end(), r.frames());
        }

        let kernel = FramePool::new(PoolKind::Kernel, kernel_regions);
        let user = UserPool::new(user_regions);
        info!(
            "Physical memory: {} kernel frames, {} user frames, {} recorded ranges",
            kernel.total(),
            user.frames().total(),
            recorded.len()
        );

        Ok(Self {
            kernel,
            user,
            recorded,
        })
    }

    /// Build the pools from what the loader handed over.
    ///
    /// # Safety
    /// The pointers in `info` must reference valid arrays of the stated
    /// lengths for the duration of the call.
    pub unsafe fn from_boot_info(
        info: &KernelBootInfo,
        kernel_pool_pages: u64,
    ) -> Result<Self, BootMapError> {
        let map = unsafe { boot_ranges(&info.memory_map) };
        let mut used = Vec::with_capacity(1 + usize::try_from(info.modules_len).unwrap_or(0));
        used.push(info.kernel_image);
        if info.modules_ptr != 0 {
            let modules = unsafe {
                core::slice::from_raw_parts(
                    info.modules_ptr as *const PhysicalRangeInfo,
                    usize::try_from(info.modules_len).unwrap_or(0),
                )
            };
            used.extend_from_slice(modules);
        }
        Self::from_boot_map(map, &used, kernel_pool_pages)
    }

    /// Whether `[base, base + size)` may be mapped into user space: it must
    /// lie inside one single reserved range.
    #[must_use]
    pub fn is_allowed_to_map_to_userspace(&self, base: PhysicalAddress, size: u64) -> bool {
        is_user_mappable(&self.recorded, base, size)
    }
}

/// Whether `[base, base + size)` lies inside one single reserved entry of
/// `recorded`. Adjacent entries are not merged.
#[must_use]
pub fn is_user_mappable(recorded: &[RecordedRange], base: PhysicalAddress, size: u64) -> bool {
    let Some(end) = base.as_u64().checked_add(size) else {
        return false;
    };
    recorded.iter().any(|r| {
        r.kind == BootMemoryKind::Reserved
            && r.base <= base
            && end <= r.base.as_u64().saturating_add(r.length)
    })
}

fn region(base: PhysicalPage, count: u64) -> FrameRegion {
    FrameRegion::new(base, usize::try_from(count).unwrap_or(usize::MAX))
}

/// View the memory map array the loader passed.
///
/// # Safety
/// `info` must describe a valid, live array of [`BootMemoryRange`].
#[must_use]
pub unsafe fn boot_ranges(info: &MemoryMapInfo) -> &[BootMemoryRange] {
    if info.ranges_ptr == 0 || info.ranges_len == 0 {
        return &[];
    }
    unsafe {
        core::slice::from_raw_parts(
            info.ranges_ptr as *const BootMemoryRange,
            usize::try_from(info.ranges_len).unwrap_or(0),
        )
    }
}
