//! # Memory manager
//!
//! One instance owns both frame pools, the kernel directory, the quickmap
//! window and the kernel region list.
//!
//! ```text
//!  lock order (outer first)
//!
//!    object state ──▶ global (TicketMutex) ──▶ address space ──▶ quickmap slot
//!                     • kernel pool
//!                     • user pool + commit counters
//!                     • kernel regions
//!                     • purgeable registry
//! ```
//!
//! The global lock is not reentrant. Helpers that run under it take the
//! locked state by `&mut` and never lock again; purging reaches objects only
//! through `try_lock`, so a fault holding an object lock never deadlocks
//! against a purge holding the global lock. The lock records its owner, and
//! taking it again on the same CPU is fatal.
//!
//! Table walks go through shared quickmap slots and run with interrupts
//! disabled from the first table touched to the last.

use crate::address_space::{AddressSpace, find_region, overlaps_any};
use crate::committed::CommittedPages;
use crate::config::MemoryConfig;
use crate::global_lock::{GlobalGuard, GlobalLock};
use crate::platform::Platform;
use crate::quickmap::{QuickMap, QuickMapping, QuickTables};
use crate::region::{Access, AllocationStrategy, FaultPolicy, Region, RegionFlags};
use crate::vmobject::{AnonymousState, AnonymousVmObject, PurgeContext, Purgeable, registry_entry};
use crate::{InitError, MemoryError};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use kernel_alloc::boot_map::is_user_mappable;
use kernel_alloc::{FramePool, PhysicalFrame, PhysicalMemoryLayout, RecordedRange, UserPool};
use kernel_info::boot::{BootMemoryRange, PhysicalRangeInfo};
use kernel_memory_addresses::{
    PAGE_SIZE, PageBytes, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualRange,
};
use kernel_sync::{InterruptsDisabled, IrqGuard, SpinMutex};
use kernel_vmem::{
    DirectTables, DirectoryHalf, LeafAttributes, PageDirectory, PageEntryBits, PageWalker,
    ReleaseHint, TableAccess, WalkError,
};
use log::{Level, debug, error, info, log, warn};

type RegionMap = BTreeMap<VirtualAddress, Arc<Region>>;

/// Everything behind the global lock.
struct GlobalState {
    kernel_pool: FramePool,
    user_pool: UserPool,
    kernel_regions: RegionMap,
    purgeables: Vec<Weak<dyn Purgeable>>,
}

/// Snapshot of the pool counters.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MemoryStats {
    pub user_total: usize,
    pub user_used: usize,
    pub user_committed: usize,
    pub user_uncommitted: usize,
    pub kernel_total: usize,
    pub kernel_used: usize,
}

pub struct MemoryManager<P: Platform> {
    platform: P,
    config: MemoryConfig,
    global: GlobalLock<GlobalState>,
    kernel_space: Arc<AddressSpace>,
    quickmap: QuickMap,
    /// Active address space per CPU.
    current: Vec<SpinMutex<Option<Arc<AddressSpace>>>>,
    recorded: Vec<RecordedRange>,
}

fn dump_regions(level: Level, regions: &RegionMap) {
    log!(level, "Kernel regions ({}):", regions.len());
    for region in regions.values() {
        log!(level, "  {region:?}");
    }
}

/// Kernel-pool exhaustion and other unrecoverable states end here.
#[cold]
fn fatal(regions: &RegionMap, what: fmt::Arguments<'_>) -> ! {
    error!("Fatal memory manager error: {what}");
    dump_regions(Level::Error, regions);
    panic!("{what}");
}

impl<P: Platform> MemoryManager<P> {
    /// Take over the pools in `layout` and build the kernel directory.
    ///
    /// The kernel half's top-level tables and the quickmap leaf table are
    /// created and pinned here, through the platform's direct map.
    pub fn new(
        platform: P,
        config: MemoryConfig,
        layout: PhysicalMemoryLayout,
    ) -> Result<Self, InitError> {
        config.validate()?;
        if config.cpu_count > platform.max_cpus() {
            return Err(InitError::Config(
                "more CPUs than the platform can send TLB shootdowns to",
            ));
        }
        let PhysicalMemoryLayout {
            kernel: mut kernel_pool,
            user: user_pool,
            recorded,
        } = layout;

        let root = kernel_pool
            .allocate()
            .ok_or(WalkError::OutOfTableFrames)?
            .into_page();
        let mut directory = PageDirectory::new(root, config.geometry, DirectoryHalf::Kernel);

        let leaf_table = {
            let tables = DirectTables::new(&platform);
            tables.with_table(root, |t| t.fill(PageEntryBits::EMPTY));
            let walker = PageWalker::new(&tables);
            walker.pin_kernel_top_level(&mut directory, &mut kernel_pool)?;
            walker.ensure_pinned_leaf_table(&mut directory, config.quickmap_base, &mut kernel_pool)?
        };
        let quickmap = QuickMap::new(
            &config.geometry,
            config.quickmap_base,
            leaf_table,
            config.cpu_count,
            config.shared_quickmap_slots,
        );

        info!(
            "Memory manager up: kernel pool {}/{} frames used, user pool {} frames",
            kernel_pool.used(),
            kernel_pool.total(),
            user_pool.frames().total(),
        );
        info!(
            "{} quickmap slots at {}",
            quickmap.slot_count(),
            config.quickmap_base
        );

        Ok(Self {
            platform,
            config,
            global: GlobalLock::new(GlobalState {
                kernel_pool,
                user_pool,
                kernel_regions: BTreeMap::new(),
                purgeables: Vec::new(),
            }),
            kernel_space: Arc::new(AddressSpace::new(directory)),
            quickmap,
            current: (0..config.cpu_count).map(|_| SpinMutex::new(None)).collect(),
            recorded,
        })
    }

    /// Parse the boot memory map and start the manager on it.
    pub fn from_boot_map(
        platform: P,
        config: MemoryConfig,
        map: &[BootMemoryRange],
        used: &[PhysicalRangeInfo],
    ) -> Result<Self, InitError> {
        let layout = PhysicalMemoryLayout::from_boot_map(map, used, config.kernel_pool_pages)?;
        Self::new(platform, config, layout)
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[must_use]
    pub const fn quickmap(&self) -> &QuickMap {
        &self.quickmap
    }

    #[must_use]
    pub const fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel_space
    }

    pub(crate) const fn tables<'a>(
        &'a self,
        irq: &'a InterruptsDisabled<'a>,
    ) -> QuickTables<'a, P> {
        QuickTables::new(&self.quickmap, &self.platform, irq)
    }

    /// Take the global lock for the executing CPU.
    ///
    /// # Panics
    /// If this CPU already holds it; the kernel regions are dumped first.
    fn global(&self) -> GlobalGuard<'_, GlobalState> {
        let cpu = self.platform.current_cpu();
        if self.global.is_held_by(cpu) {
            // SAFETY: the holder is suspended further down this CPU's stack.
            let held = unsafe { self.global.peek_held() };
            fatal(
                &held.kernel_regions,
                format_args!("global memory lock re-entered on CPU {cpu}"),
            );
        }
        self.global.lock(cpu)
    }

    /// Whether the executing CPU is inside a global-lock section.
    pub(crate) fn holds_global_lock(&self) -> bool {
        self.global.is_held_by(self.platform.current_cpu())
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let global = self.global();
        let counters = global.user_pool.counters();
        MemoryStats {
            user_total: counters.total(),
            user_used: counters.used,
            user_committed: counters.committed,
            user_uncommitted: counters.uncommitted,
            kernel_total: global.kernel_pool.total(),
            kernel_used: global.kernel_pool.used(),
        }
    }

    // ---- quickmap ------------------------------------------------------

    /// Map `frame` in this CPU's private quickmap slot.
    pub fn quickmap_cpu<'a>(
        &'a self,
        irq: &'a InterruptsDisabled<'_>,
        frame: PhysicalPage,
    ) -> QuickMapping<'a> {
        self.quickmap.map_for_cpu(&self.platform, irq, frame)
    }

    /// Map `frame` in a shared quickmap slot.
    pub fn quickmap_shared<'a>(
        &'a self,
        irq: &'a InterruptsDisabled<'_>,
        frame: PhysicalPage,
    ) -> QuickMapping<'a> {
        self.quickmap.map_shared(&self.platform, irq, frame)
    }

    fn zero_frame(&self, frame: PhysicalPage) {
        let irq = IrqGuard::new(&self.platform);
        let token = irq.token();
        self.quickmap
            .map_for_cpu(&self.platform, &token, frame)
            .fill(0);
    }

    // ---- user pool -----------------------------------------------------

    /// One frame from the uncommitted part of the user pool.
    ///
    /// When that is empty, every registered purgeable object is asked to give
    /// frames back and the allocation is retried once. The flag reports
    /// whether a purge made the allocation succeed. Never blocks.
    pub fn allocate_user_frame(&self, zero_fill: bool) -> Option<(PhysicalFrame, bool)> {
        let (frame, did_purge) = {
            let mut global = self.global();
            let state = &mut *global;
            let mut frame = state.user_pool.allocate_uncommitted();
            let mut did_purge = false;
            if frame.is_none() && self.purge_locked(state) > 0 {
                frame = state.user_pool.allocate_uncommitted();
                did_purge = true;
            }
            (frame, did_purge)
        };

        let Some(frame) = frame else {
            warn!("User frame pool exhausted");
            return None;
        };
        if zero_fill {
            self.zero_frame(frame.page());
        }
        Some((frame, did_purge))
    }

    /// One frame from the committed part of the user pool.
    ///
    /// # Panics
    /// If nothing is committed.
    pub fn allocate_committed_user_frame(&self, zero_fill: bool) -> PhysicalFrame {
        let frame = self.global().user_pool.allocate_committed();
        if zero_fill {
            self.zero_frame(frame.page());
        }
        frame
    }

    /// Move `pages` from uncommitted to committed; `false` if too few are
    /// uncommitted.
    pub fn commit(&self, pages: usize) -> bool {
        self.global().user_pool.commit(pages)
    }

    /// # Panics
    /// If fewer than `pages` are committed.
    pub fn uncommit(&self, pages: usize) {
        self.global().user_pool.uncommit(pages);
    }

    /// Commit `pages` and hand out the commitment as a guard.
    pub fn commit_pages(&self, pages: usize) -> Option<CommittedPages<'_, P>> {
        self.commit(pages)
            .then(|| CommittedPages::new(self, pages))
    }

    pub fn deallocate_user_frame(&self, frame: PhysicalFrame) {
        self.global().user_pool.deallocate(frame);
    }

    /// Let `object` be asked for frames when the user pool runs dry.
    pub fn register_purgeable(&self, object: Weak<dyn Purgeable>) {
        self.global().purgeables.push(object);
    }

    /// Run every purgeable against the locked pools; returns the frames
    /// released. Translations of purged pages are removed before returning.
    fn purge_locked(&self, state: &mut GlobalState) -> usize {
        state.purgeables.retain(|p| p.strong_count() > 0);

        let mut ctx = PurgeContext::new(&mut state.user_pool);
        for entry in &state.purgeables {
            if let Some(object) = entry.upgrade() {
                object.purge(&mut ctx);
            }
        }
        let released = ctx.released();

        for (space, va) in ctx.into_unmaps() {
            if let Some(space) = space.upgrade() {
                self.unmap_page_locked(&mut state.kernel_pool, &space, va);
            }
        }

        if released > 0 {
            warn!("Purged {released} frames under memory pressure");
        }
        released
    }

    // ---- kernel pool ---------------------------------------------------

    /// One frame from the kernel pool. Running out is fatal.
    pub fn allocate_kernel_frame(&self) -> PhysicalFrame {
        let mut global = self.global();
        let frame = global.kernel_pool.allocate();
        frame.unwrap_or_else(|| {
            fatal(
                &global.kernel_regions,
                format_args!("kernel frame pool exhausted"),
            )
        })
    }

    /// `count` contiguous kernel frames, the first aligned to `alignment`
    /// bytes, zero-filled through the direct map.
    pub fn allocate_contiguous_kernel_frames(
        &self,
        count: usize,
        alignment: u64,
    ) -> Result<Vec<PhysicalFrame>, MemoryError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let Some(frames) = self
            .global()
            .kernel_pool
            .allocate_contiguous(count, alignment)
        else {
            warn!("No run of {count} kernel frames aligned to {alignment:#x}");
            return Err(MemoryError::OutOfMemory);
        };

        for frame in &frames {
            // SAFETY: the frame was just handed to us; nobody else maps it.
            unsafe { self.platform.phys_to_mut::<PageBytes>(frame.base()) }.fill(0);
        }
        Ok(frames)
    }

    pub fn deallocate_kernel_frame(&self, frame: PhysicalFrame) {
        self.global().kernel_pool.deallocate(frame);
    }

    pub fn deallocate_contiguous_kernel_frames(&self, frames: Vec<PhysicalFrame>) {
        let mut global = self.global();
        for frame in frames {
            global.kernel_pool.deallocate(frame);
        }
    }

    // ---- mapping -------------------------------------------------------

    /// Install leaf entries for `pages` in `space`. Page tables come from
    /// the kernel pool; running out of them is fatal.
    pub(crate) fn map_pages(
        &self,
        space: &AddressSpace,
        attrs: LeafAttributes,
        pages: impl IntoIterator<Item = (VirtualAddress, PhysicalPage)>,
    ) {
        let irq = IrqGuard::new(&self.platform);
        let token = irq.token();
        let mut global = self.global();
        let state = &mut *global;
        let mut space_state = space.lock();
        let tables = self.tables(&token);
        let walker = PageWalker::new(&tables);

        for (va, frame) in pages {
            let slot = match walker.ensure(&mut space_state.directory, va, &mut state.kernel_pool) {
                Ok(slot) => slot,
                Err(e) => fatal(&state.kernel_regions, format_args!("mapping {va}: {e}")),
            };
            let old = walker.read(slot);
            walker.write(slot, PageEntryBits::leaf(frame, attrs));
            if old.present() {
                self.platform.flush_remote(va, 1);
            }
            self.platform.flush_local(va);
        }
    }

    /// Clear the translation of one page, keeping the tables.
    fn unmap_page_locked(
        &self,
        kernel_pool: &mut FramePool,
        space: &AddressSpace,
        va: VirtualAddress,
    ) {
        let irq = IrqGuard::new(&self.platform);
        let token = irq.token();
        {
            let mut space_state = space.lock();
            let tables = self.tables(&token);
            PageWalker::new(&tables).release(
                &mut space_state.directory,
                va,
                ReleaseHint::MoreToCome,
                kernel_pool,
            );
        }
        self.platform.flush_local(va);
        self.platform.flush_remote(va, 1);
    }

    /// Clear every translation in `range` and free the tables that become
    /// empty.
    fn unmap_range_locked(
        &self,
        kernel_pool: &mut FramePool,
        space: &AddressSpace,
        range: VirtualRange,
    ) {
        let irq = IrqGuard::new(&self.platform);
        let token = irq.token();
        {
            let mut space_state = space.lock();
            let g = *space_state.directory.geometry();
            let leaf_span = g.entry_span(g.leaf_depth() - 1);
            let tables = self.tables(&token);
            let walker = PageWalker::new(&tables);

            for page in range.pages() {
                let va = page.base();
                let next = va + PAGE_SIZE;
                // Scan once per leaf table, at the last page the range has in it.
                let hint = if next == range.end() || next.as_u64().is_multiple_of(leaf_span) {
                    ReleaseHint::LastInRegion
                } else {
                    ReleaseHint::MoreToCome
                };
                walker.release(&mut space_state.directory, va, hint, kernel_pool);
            }
        }

        for page in range.pages() {
            self.platform.flush_local(page.base());
        }
        let pages = usize::try_from(range.page_count()).unwrap_or(usize::MAX);
        self.platform.flush_remote(range.start(), pages);
    }

    /// Map whatever backs `region` right now: resident pages of an anonymous
    /// object, every page of a physical range, nothing for a guard.
    pub fn map_region(&self, space: &AddressSpace, region: &Region) {
        let attrs = region.leaf_attributes();
        match region.policy() {
            FaultPolicy::Anonymous(object) => {
                let state = object.lock();
                self.map_resident(space, region, attrs, &state);
            }
            FaultPolicy::Physical { base } => {
                let first = base.page();
                self.map_pages(
                    space,
                    attrs,
                    region
                        .range()
                        .pages()
                        .zip(0..)
                        .map(|(page, i)| (page.base(), first.add(i))),
                );
            }
            FaultPolicy::Guard => {}
        }
    }

    fn map_resident(
        &self,
        space: &AddressSpace,
        region: &Region,
        attrs: LeafAttributes,
        state: &AnonymousState,
    ) {
        let base = region.base();
        self.map_pages(
            space,
            attrs,
            state
                .resident()
                .map(|(i, frame)| (base + i as u64 * PAGE_SIZE, frame.page())),
        );
    }

    /// Frame for a new page of an anonymous object: from its commitment
    /// when it has one left, else from the uncommitted pool.
    pub(crate) fn draw_frame(
        &self,
        state: &mut AnonymousState,
    ) -> Result<PhysicalFrame, MemoryError> {
        if state.committed > 0 {
            state.committed -= 1;
            return Ok(self.allocate_committed_user_frame(true));
        }
        self.allocate_user_frame(true)
            .map(|(frame, _)| frame)
            .ok_or(MemoryError::OutOfMemory)
    }

    /// Give every page of `region` a frame and map it.
    fn populate(&self, space: &AddressSpace, region: &Region) -> Result<(), MemoryError> {
        let Some(object) = region.anonymous() else {
            return Ok(());
        };
        let mut state = object.lock();
        for index in 0..state.frames.len() {
            if state.frames[index].is_none() {
                let frame = self.draw_frame(&mut state)?;
                state.frames[index] = Some(frame);
            }
        }
        self.map_resident(space, region, region.leaf_attributes(), &state);
        Ok(())
    }

    /// Unmap `region` and return what it owned.
    fn teardown(&self, space: &AddressSpace, region: &Region) {
        let (frames, committed) = region
            .anonymous()
            .map_or_else(|| (Vec::new(), 0), |object| object.take_all());

        let mut global = self.global();
        let state = &mut *global;
        self.unmap_range_locked(&mut state.kernel_pool, space, region.range());
        for frame in frames {
            state.user_pool.deallocate(frame);
        }
        if committed > 0 {
            state.user_pool.uncommit(committed);
        }
        debug!("Released region {region:?}");
    }

    // ---- kernel regions ------------------------------------------------

    fn page_count(size: u64) -> Result<usize, MemoryError> {
        if size == 0 || !kernel_memory_addresses::is_page_aligned(size) {
            return Err(MemoryError::InvalidSize(size));
        }
        usize::try_from(size / PAGE_SIZE).map_err(|_| MemoryError::InvalidSize(size))
    }

    /// First fit in the window; every region is followed by an unmapped
    /// guard page.
    fn place_kernel_region(
        &self,
        regions: &RegionMap,
        size: u64,
    ) -> Result<VirtualRange, MemoryError> {
        let window = self.config.kernel_region_window;
        let needed = size + PAGE_SIZE;
        let mut candidate = window.start().as_u64();

        for region in regions.values() {
            let range = region.range();
            if candidate + needed <= range.start().as_u64() {
                break;
            }
            candidate = candidate.max(range.end().as_u64() + PAGE_SIZE);
        }

        match candidate.checked_add(needed) {
            Some(end) if end <= window.end().as_u64() => {
                Ok(VirtualRange::new(VirtualAddress::new(candidate), size))
            }
            _ => Err(MemoryError::WindowExhausted(size)),
        }
    }

    /// Commit for a new anonymous region per `strategy`.
    fn commit_for(
        pool: &mut UserPool,
        pages: usize,
        strategy: AllocationStrategy,
    ) -> Result<usize, MemoryError> {
        match strategy {
            AllocationStrategy::None => Ok(0),
            AllocationStrategy::Reserve | AllocationStrategy::AllocateNow => {
                if pool.commit(pages) {
                    Ok(pages)
                } else {
                    Err(MemoryError::OutOfMemory)
                }
            }
        }
    }

    /// Anonymous kernel memory of `size` bytes.
    ///
    /// The region is unmapped and its frames returned when the guard drops.
    pub fn allocate_kernel_region(
        &self,
        size: u64,
        name: &str,
        access: Access,
        strategy: AllocationStrategy,
    ) -> Result<KernelRegion<'_, P>, MemoryError> {
        let pages = Self::page_count(size)?;
        let region = {
            let mut global = self.global();
            let state = &mut *global;
            let range = self.place_kernel_region(&state.kernel_regions, size)?;
            let committed = Self::commit_for(&mut state.user_pool, pages, strategy)?;

            let object = Arc::new(AnonymousVmObject::new(
                pages,
                committed,
                Arc::downgrade(&self.kernel_space),
                range.start(),
            ));
            state.purgeables.push(registry_entry(&object));

            let region = Arc::new(Region::new(
                range,
                name,
                access,
                RegionFlags::empty(),
                FaultPolicy::Anonymous(object),
            ));
            state.kernel_regions.insert(range.start(), region.clone());
            region
        };
        debug!("Allocated kernel region {region:?}");

        let region = KernelRegion {
            manager: self,
            region,
        };
        if strategy == AllocationStrategy::AllocateNow {
            self.populate(&self.kernel_space, &region)?;
        }
        Ok(region)
    }

    /// Kernel mapping of `size` bytes of physical memory at `base`, mapped
    /// uncached right away.
    pub fn allocate_kernel_region_with_physical(
        &self,
        base: PhysicalAddress,
        size: u64,
        name: &str,
        access: Access,
    ) -> Result<KernelRegion<'_, P>, MemoryError> {
        Self::page_count(size)?;
        if !base.is_page_aligned() {
            return Err(MemoryError::UnalignedPhysical(base));
        }

        let region = {
            let mut global = self.global();
            let range = self.place_kernel_region(&global.kernel_regions, size)?;
            let region = Arc::new(Region::new(
                range,
                name,
                access,
                RegionFlags::empty(),
                FaultPolicy::Physical { base },
            ));
            global.kernel_regions.insert(range.start(), region.clone());
            region
        };
        debug!("Allocated kernel region {region:?} at {base}");

        self.map_region(&self.kernel_space, &region);
        Ok(KernelRegion {
            manager: self,
            region,
        })
    }

    /// The kernel region containing `va`.
    #[must_use]
    pub fn find_kernel_region(&self, va: VirtualAddress) -> Option<Arc<Region>> {
        find_region(&self.global().kernel_regions, va).cloned()
    }

    #[must_use]
    pub fn kernel_region_count(&self) -> usize {
        self.global().kernel_regions.len()
    }

    fn deallocate_kernel_region(&self, region: &Region) {
        let removed = self.global().kernel_regions.remove(&region.base());
        assert!(removed.is_some(), "kernel region {region:?} is not registered");
        self.teardown(&self.kernel_space, region);
    }

    /// Log every kernel region.
    pub fn dump_kernel_regions(&self) {
        self.dump_kernel_regions_at(Level::Info);
    }

    /// Also usable while this CPU is inside a global-lock section, which is
    /// how lock re-entry and faults under the lock get diagnosed.
    pub(crate) fn dump_kernel_regions_at(&self, level: Level) {
        if self.holds_global_lock() {
            // SAFETY: the holder is suspended further down this CPU's stack.
            let held = unsafe { self.global.peek_held() };
            dump_regions(level, &held.kernel_regions);
        } else {
            dump_regions(level, &self.global().kernel_regions);
        }
    }

    // ---- user regions --------------------------------------------------

    fn check_user_range(&self, range: &VirtualRange) -> Result<(), MemoryError> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(MemoryError::InvalidRange(*range));
        }
        match range.start().checked_add(range.size()) {
            Some(end) if end.as_u64() <= self.config.geometry.user_half_end() => Ok(()),
            _ => Err(MemoryError::OutsideAddressSpace(*range)),
        }
    }

    /// Register `region` in `space` unless it overlaps. `committed` pages
    /// are uncommitted again on failure.
    fn insert_user_region(
        &self,
        space: &AddressSpace,
        state: &mut GlobalState,
        region: Region,
        committed: usize,
    ) -> Result<Arc<Region>, MemoryError> {
        let range = region.range();
        let mut space_state = space.lock();
        if overlaps_any(&space_state.regions, &range) {
            drop(space_state);
            if committed > 0 {
                state.user_pool.uncommit(committed);
            }
            return Err(MemoryError::Overlap(range));
        }
        let region = Arc::new(region);
        space_state.regions.insert(range.start(), region.clone());
        debug!("Allocated user region {region:?}");
        Ok(region)
    }

    /// Anonymous user memory at `range`.
    pub fn allocate_user_region(
        &self,
        space: &Arc<AddressSpace>,
        range: VirtualRange,
        name: &str,
        access: Access,
        flags: RegionFlags,
        strategy: AllocationStrategy,
    ) -> Result<Arc<Region>, MemoryError> {
        self.check_user_range(&range)?;
        let pages = Self::page_count(range.size())?;

        let region = {
            let mut global = self.global();
            let state = &mut *global;
            let committed = Self::commit_for(&mut state.user_pool, pages, strategy)?;
            let object = Arc::new(AnonymousVmObject::new(
                pages,
                committed,
                Arc::downgrade(space),
                range.start(),
            ));
            let entry = registry_entry(&object);
            let region = Region::new(
                range,
                name,
                access,
                flags | RegionFlags::USER,
                FaultPolicy::Anonymous(object),
            );
            let region = self.insert_user_region(space, state, region, committed)?;
            state.purgeables.push(entry);
            region
        };

        if strategy == AllocationStrategy::AllocateNow
            && let Err(e) = self.populate(space, &region)
        {
            self.deallocate_user_region(space, &region)?;
            return Err(e);
        }
        Ok(region)
    }

    /// User mapping of the physical range at `base`, which must lie inside
    /// one reserved boot-map entry.
    pub fn allocate_user_region_with_physical(
        &self,
        space: &Arc<AddressSpace>,
        range: VirtualRange,
        base: PhysicalAddress,
        name: &str,
        access: Access,
    ) -> Result<Arc<Region>, MemoryError> {
        self.check_user_range(&range)?;
        if !base.is_page_aligned() {
            return Err(MemoryError::UnalignedPhysical(base));
        }
        if !self.is_allowed_to_map_to_userspace(base, range.size()) {
            return Err(MemoryError::NotUserMappable(base));
        }

        let region = {
            let mut global = self.global();
            let region = Region::new(
                range,
                name,
                access,
                RegionFlags::USER,
                FaultPolicy::Physical { base },
            );
            self.insert_user_region(space, &mut global, region, 0)?
        };
        self.map_region(space, &region);
        Ok(region)
    }

    /// An inaccessible user range, e.g. below a stack.
    pub fn allocate_user_guard_region(
        &self,
        space: &Arc<AddressSpace>,
        range: VirtualRange,
        name: &str,
    ) -> Result<Arc<Region>, MemoryError> {
        self.check_user_range(&range)?;
        let mut global = self.global();
        let region = Region::new(
            range,
            name,
            Access::empty(),
            RegionFlags::USER,
            FaultPolicy::Guard,
        );
        self.insert_user_region(space, &mut global, region, 0)
    }

    /// Remove `region` from `space`, unmap it and return its frames.
    pub fn deallocate_user_region(
        &self,
        space: &AddressSpace,
        region: &Arc<Region>,
    ) -> Result<(), MemoryError> {
        {
            let mut space_state = space.lock();
            match space_state.regions.get(&region.base()) {
                Some(r) if Arc::ptr_eq(r, region) => {
                    space_state.regions.remove(&region.base());
                }
                _ => return Err(MemoryError::NoSuchRegion),
            }
        }
        self.teardown(space, region);
        Ok(())
    }

    #[must_use]
    pub fn is_allowed_to_map_to_userspace(&self, base: PhysicalAddress, size: u64) -> bool {
        is_user_mappable(&self.recorded, base, size)
    }

    // ---- address spaces ------------------------------------------------

    /// A fresh user address space sharing the kernel half.
    pub fn create_address_space(&self) -> Result<Arc<AddressSpace>, MemoryError> {
        let irq = IrqGuard::new(&self.platform);
        let token = irq.token();
        let mut global = self.global();
        let Some(root) = global.kernel_pool.allocate() else {
            warn!("No kernel frame left for a page directory");
            return Err(MemoryError::OutOfMemory);
        };
        let root = root.into_page();

        let tables = self.tables(&token);
        tables.with_table(root, |t| t.fill(PageEntryBits::EMPTY));
        let directory = PageDirectory::new(root, self.config.geometry, DirectoryHalf::User);
        let kernel = self.kernel_space.lock();
        PageWalker::new(&tables).alias_kernel_half(&directory, &kernel.directory);
        drop(kernel);
        drop(global);
        drop(irq);

        debug!("Created address space {root}");
        Ok(Arc::new(AddressSpace::new(directory)))
    }

    /// Tear down `space`: all its regions, tables and the root.
    ///
    /// Hands `space` back if it is still active on a CPU or referenced
    /// elsewhere.
    pub fn destroy_address_space(&self, space: Arc<AddressSpace>) -> Result<(), Arc<AddressSpace>> {
        let active = self.current.iter().any(|current| {
            current
                .lock()
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, &space))
        });
        if active {
            warn!("Address space {} is still active", space.root());
            return Err(space);
        }
        let space = Arc::try_unwrap(space)?;

        let regions = core::mem::take(&mut space.lock().regions);
        for region in regions.values() {
            self.teardown(&space, region);
        }

        let state = space.into_state();
        let irq = IrqGuard::new(&self.platform);
        let token = irq.token();
        let mut global = self.global();
        let tables = self.tables(&token);
        PageWalker::new(&tables).destroy(state.directory, &mut global.kernel_pool);
        Ok(())
    }

    /// Make `space` the current translation on this CPU.
    pub fn enter_address_space(&self, space: &Arc<AddressSpace>) {
        let irq = IrqGuard::new(&self.platform);
        let cpu = self.platform.current_cpu();
        assert!(cpu < self.current.len(), "CPU {cpu} is not configured");

        let previous = self.current[cpu].lock().replace(space.clone());
        // SAFETY: every directory shares the kernel half, which maps the
        // running kernel.
        unsafe { self.platform.activate(space.root()) };
        drop(irq);
        drop(previous);
    }

    /// The address space active on this CPU.
    #[must_use]
    pub fn current_address_space(&self) -> Option<Arc<AddressSpace>> {
        let irq = IrqGuard::new(&self.platform);
        let cpu = self.platform.current_cpu();
        let current = self.current.get(cpu).and_then(|c| c.lock().clone());
        drop(irq);
        current
    }

    /// Where `va` translates to in `space`, if anywhere.
    #[must_use]
    pub fn translate(&self, space: &AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let irq = IrqGuard::new(&self.platform);
        let token = irq.token();
        let space_state = space.lock();
        if !space_state.directory.covers(va) {
            return None;
        }
        let tables = self.tables(&token);
        PageWalker::new(&tables).translate(&space_state.directory, va)
    }
}

/// A kernel region, released when dropped.
pub struct KernelRegion<'m, P: Platform> {
    manager: &'m MemoryManager<P>,
    region: Arc<Region>,
}

impl<P: Platform> KernelRegion<'_, P> {
    #[must_use]
    pub const fn region(&self) -> &Arc<Region> {
        &self.region
    }
}

impl<P: Platform> Deref for KernelRegion<'_, P> {
    type Target = Region;

    fn deref(&self) -> &Region {
        &self.region
    }
}

impl<P: Platform> fmt::Debug for KernelRegion<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.region, f)
    }
}

impl<P: Platform> Drop for KernelRegion<'_, P> {
    fn drop(&mut self) {
        self.manager.deallocate_kernel_region(&self.region);
    }
}
