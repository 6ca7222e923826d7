//! # Quickmap window
//!
//! A fixed run of virtual pages, all served by one pinned leaf table, used to
//! reach an arbitrary physical frame for a short while:
//!
//! ```text
//!  quickmap_base
//!  │ slot 0 │ slot 1 │ … │ slot n-1 │ shared 0 │ … │ shared k-1 │
//!  └──── one per CPU ───────────────┴─── SpinMutex each ───────┘
//! ```
//!
//! Every slot is taken with interrupts disabled, which the
//! [`InterruptsDisabled`] token in the signature proves: the local TLB flush
//! done at checkout only holds while the caller stays on this CPU. Shared
//! slots are additionally locked, since any CPU may pick them.
//!
//! Mappings are left in place when a slot is returned. Taking a slot always
//! invalidates the local TLB entry, so a stale translation cached by an
//! earlier user (possibly on another CPU) is never observed.

use crate::platform::Platform;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, PageBytes, PhysicalPage, VirtualAddress};
use kernel_sync::{InterruptsDisabled, MutexGuard, RawSpin, SpinMutex};
use kernel_vmem::{LeafAttributes, PageEntryBits, PagingGeometry, RawTable, TableAccess};
use log::trace;

const UNMAPPED: u64 = u64::MAX;

struct Slot {
    checked_out: AtomicBool,
    /// Frame number the entry currently points at.
    mapped: AtomicU64,
    lock: SpinMutex<()>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            checked_out: AtomicBool::new(false),
            mapped: AtomicU64::new(UNMAPPED),
            lock: SpinMutex::new(()),
        }
    }
}

pub struct QuickMap {
    base: VirtualAddress,
    leaf_table: PhysicalPage,
    /// Leaf index of slot 0.
    first_index: usize,
    cpu_slots: usize,
    slots: Vec<Slot>,
}

impl QuickMap {
    /// Window at `base` whose entries live in the pinned `leaf_table`.
    pub(crate) fn new(
        geometry: &PagingGeometry,
        base: VirtualAddress,
        leaf_table: PhysicalPage,
        cpu_slots: usize,
        shared_slots: usize,
    ) -> Self {
        let slots = (0..cpu_slots + shared_slots).map(|_| Slot::new()).collect();
        Self {
            base,
            leaf_table,
            first_index: geometry.index(base, geometry.leaf_depth()),
            cpu_slots,
            slots,
        }
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn leaf_table(&self) -> PhysicalPage {
        self.leaf_table
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot_va(&self, slot: usize) -> VirtualAddress {
        self.base + slot as u64 * PAGE_SIZE
    }

    /// Map `frame` in the executing CPU's private slot.
    ///
    /// # Panics
    /// If the slot is already checked out, or the CPU has no slot.
    pub fn map_for_cpu<'a, P: Platform>(
        &'a self,
        platform: &'a P,
        _irq: &'a InterruptsDisabled<'_>,
        frame: PhysicalPage,
    ) -> QuickMapping<'a> {
        let cpu = platform.current_cpu();
        assert!(cpu < self.cpu_slots, "CPU {cpu} has no quickmap slot");
        self.checkout(platform, cpu, frame, None)
    }

    /// Map `frame` in the first free shared slot, spinning while all are busy.
    pub fn map_shared<'a, P: Platform>(
        &'a self,
        platform: &'a P,
        _irq: &'a InterruptsDisabled<'_>,
        frame: PhysicalPage,
    ) -> QuickMapping<'a> {
        loop {
            for index in self.cpu_slots..self.slots.len() {
                if let Some(lock) = self.slots[index].lock.try_lock() {
                    return self.checkout(platform, index, frame, Some(lock));
                }
            }
            spin_loop();
        }
    }

    fn checkout<'a, P: Platform>(
        &'a self,
        platform: &'a P,
        index: usize,
        frame: PhysicalPage,
        lock: Option<MutexGuard<'a, (), RawSpin>>,
    ) -> QuickMapping<'a> {
        let slot = &self.slots[index];
        assert!(
            !slot.checked_out.swap(true, Ordering::Acquire),
            "quickmap slot {index} checked out twice"
        );

        let va = self.slot_va(index);
        if slot.mapped.load(Ordering::Relaxed) != frame.number() {
            let entry_pa = self.leaf_table.base() + ((self.first_index + index) * 8) as u64;
            // SAFETY: the checkout flag makes this slot's entry exclusively ours.
            let entry = unsafe { platform.phys_to_mut::<PageEntryBits>(entry_pa) };
            *entry = PageEntryBits::leaf(frame, LeafAttributes::kernel_rw());
            slot.mapped.store(frame.number(), Ordering::Relaxed);
            trace!("Quickmap slot {index} -> {frame}");
        }
        platform.flush_local(va);

        // SAFETY: the slot maps `frame` on this CPU and nobody else holds it.
        let page = unsafe { platform.page_at(va) };
        QuickMapping {
            va,
            page,
            slot,
            _lock: lock,
        }
    }
}

/// A frame temporarily visible through a quickmap slot.
///
/// Dereferences to the page contents. Returning the guard frees the slot but
/// keeps the translation.
#[must_use]
pub struct QuickMapping<'a> {
    va: VirtualAddress,
    page: &'a mut PageBytes,
    slot: &'a Slot,
    _lock: Option<MutexGuard<'a, (), RawSpin>>,
}

impl QuickMapping<'_> {
    #[must_use]
    pub const fn va(&self) -> VirtualAddress {
        self.va
    }

    /// The page viewed as a page table.
    pub fn as_table(&mut self) -> &mut RawTable {
        // SAFETY: slot addresses are page aligned and a table is exactly one page.
        unsafe { &mut *self.page.as_mut_ptr().cast::<RawTable>() }
    }
}

impl Deref for QuickMapping<'_> {
    type Target = PageBytes;

    fn deref(&self) -> &PageBytes {
        self.page
    }
}

impl DerefMut for QuickMapping<'_> {
    fn deref_mut(&mut self) -> &mut PageBytes {
        self.page
    }
}

impl Drop for QuickMapping<'_> {
    fn drop(&mut self) {
        self.slot.checked_out.store(false, Ordering::Release);
    }
}

/// Table access for walks of directories that are not directly mapped.
///
/// Borrowing the interrupts-disabled token ties the whole walk to one CPU.
pub struct QuickTables<'a, P: Platform> {
    quickmap: &'a QuickMap,
    platform: &'a P,
    irq: &'a InterruptsDisabled<'a>,
}

impl<'a, P: Platform> QuickTables<'a, P> {
    pub const fn new(
        quickmap: &'a QuickMap,
        platform: &'a P,
        irq: &'a InterruptsDisabled<'a>,
    ) -> Self {
        Self {
            quickmap,
            platform,
            irq,
        }
    }
}

impl<P: Platform> TableAccess for QuickTables<'_, P> {
    fn with_table<R>(&self, table: PhysicalPage, f: impl FnOnce(&mut RawTable) -> R) -> R {
        let mut mapping = self.quickmap.map_shared(self.platform, self.irq, table);
        f(mapping.as_table())
    }
}
