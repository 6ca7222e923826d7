use crate::directory::{DirectoryHalf, PageDirectory};
use crate::geometry::MAX_ENTRIES;
use crate::page_entry::PageEntryBits;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use log::{debug, warn};

/// A page table frame viewed as its entries.
pub type RawTable = [PageEntryBits; MAX_ENTRIES];

/// Deepest supported geometry.
const MAX_LEVELS: usize = 5;

/// Converts physical addresses into usable references.
pub trait PhysMapper {
    /// Map a physical address to a mutable reference of type `T`.
    ///
    /// # Safety
    /// The caller must ensure that `pa` points to memory that holds a valid
    /// `T` and is not aliased for the lifetime of the reference.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// How the walker reaches the contents of a table frame.
///
/// Boot code and tests see all RAM through a direct map ([`DirectTables`]);
/// the running kernel goes through a temporary quickmap slot instead.
pub trait TableAccess {
    fn with_table<R>(&self, table: PhysicalPage, f: impl FnOnce(&mut RawTable) -> R) -> R;
}

/// Table access through a [`PhysMapper`].
pub struct DirectTables<'m, M: PhysMapper + ?Sized> {
    mapper: &'m M,
}

impl<'m, M: PhysMapper + ?Sized> DirectTables<'m, M> {
    pub const fn new(mapper: &'m M) -> Self {
        Self { mapper }
    }
}

impl<M: PhysMapper + ?Sized> TableAccess for DirectTables<'_, M> {
    fn with_table<R>(&self, table: PhysicalPage, f: impl FnOnce(&mut RawTable) -> R) -> R {
        // SAFETY: table frames belong to exactly one directory, which the
        // walker borrows for the duration of the call.
        let raw = unsafe { self.mapper.phys_to_mut::<RawTable>(table.base()) };
        f(raw)
    }
}

/// Source and sink of page-table frames.
pub trait TableFrameAlloc {
    fn alloc_table(&mut self) -> Option<PhysicalPage>;
    fn free_table(&mut self, frame: PhysicalPage);
}

/// Location of one entry: table frame plus index.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PteRef {
    pub table: PhysicalPage,
    pub index: usize,
}

/// A present leaf entry as read by [`PageWalker::lookup`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Pte {
    pub slot: PteRef,
    pub entry: PageEntryBits,
}

/// What [`PageWalker::release`] may assume about the caller's next steps.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReleaseHint {
    /// Final page of a region: scan and free tables that became empty.
    LastInRegion,
    /// More releases in the same table follow; skip the scan.
    MoreToCome,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WalkError {
    #[error("out of frames for page tables")]
    OutOfTableFrames,
}

/// Builds, reads and tears down the tables of a [`PageDirectory`].
///
/// The walker holds no state besides the table access; exclusivity over the
/// directory comes from the `&mut PageDirectory` the mutating calls take.
pub struct PageWalker<'a, A: TableAccess> {
    access: &'a A,
}

impl<'a, A: TableAccess> PageWalker<'a, A> {
    pub const fn new(access: &'a A) -> Self {
        Self { access }
    }

    #[inline]
    pub fn read(&self, pte: PteRef) -> PageEntryBits {
        self.access.with_table(pte.table, |t| t[pte.index])
    }

    #[inline]
    pub fn write(&self, pte: PteRef, entry: PageEntryBits) {
        self.access.with_table(pte.table, |t| t[pte.index] = entry);
    }

    fn zero_table(&self, table: PhysicalPage) {
        self.access
            .with_table(table, |t| t.fill(PageEntryBits::EMPTY));
    }

    fn is_table_empty(&self, table: PhysicalPage, entries: usize) -> bool {
        self.access
            .with_table(table, |t| t[..entries].iter().all(|e| !e.present()))
    }

    /// Read-only walk to the present leaf entry for `va`.
    ///
    /// Returns `None` at the first absent level; never allocates.
    ///
    /// # Panics
    /// If `va` is outside the directory's half.
    pub fn lookup(&self, dir: &PageDirectory, va: VirtualAddress) -> Option<Pte> {
        dir.assert_covers(va);
        let g = dir.geometry();
        let mut table = dir.root();
        for depth in 0..g.leaf_depth() {
            let entry = self.read(PteRef {
                table,
                index: g.index(va, depth),
            });
            if !entry.present() {
                return None;
            }
            table = entry.physical_page();
            debug_assert_eq!(
                dir.table(&g.table_key(va, depth + 1)),
                Some(table),
                "linked table is not registered"
            );
        }

        let slot = PteRef {
            table,
            index: g.index(va, g.leaf_depth()),
        };
        let entry = self.read(slot);
        entry.present().then_some(Pte { slot, entry })
    }

    /// Physical address `va` currently translates to.
    pub fn translate(&self, dir: &PageDirectory, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.lookup(dir, va)
            .map(|pte| pte.entry.physical_address() + va.page_offset())
    }

    /// Walk to the leaf slot for `va`, creating missing tables on the way.
    ///
    /// New tables come zeroed from `frames` and are registered in `dir`.
    /// Since the allocator may run reclamation, the parent entry is re-read
    /// after each allocation; if it got populated meanwhile the fresh frame is
    /// returned and the walk restarts from the root.
    ///
    /// # Panics
    /// If `va` is outside the directory's half.
    pub fn ensure<F>(
        &self,
        dir: &mut PageDirectory,
        va: VirtualAddress,
        frames: &mut F,
    ) -> Result<PteRef, WalkError>
    where
        F: TableFrameAlloc + ?Sized,
    {
        dir.assert_covers(va);
        let g = *dir.geometry();
        let (user, global) = match dir.half() {
            DirectoryHalf::User => (true, false),
            DirectoryHalf::Kernel => (false, true),
        };

        'restart: loop {
            let mut table = dir.root();
            for depth in 0..g.leaf_depth() {
                let slot = PteRef {
                    table,
                    index: g.index(va, depth),
                };
                let entry = self.read(slot);
                if entry.present() {
                    table = entry.physical_page();
                    continue;
                }

                let Some(fresh) = frames.alloc_table() else {
                    warn!("No frame left for a depth-{} table covering {va}", depth + 1);
                    return Err(WalkError::OutOfTableFrames);
                };
                self.zero_table(fresh);

                if self.read(slot).present() {
                    frames.free_table(fresh);
                    continue 'restart;
                }

                self.write(slot, PageEntryBits::table(fresh, user, global));
                dir.register(g.table_key(va, depth + 1), fresh, false);
                debug!("Created depth-{} table {fresh} for {va}", depth + 1);
                table = fresh;
            }

            return Ok(PteRef {
                table,
                index: g.index(va, g.leaf_depth()),
            });
        }
    }

    /// Like [`ensure`](Self::ensure), then pins the leaf table so it is never
    /// released. Returns the leaf table frame.
    pub fn ensure_pinned_leaf_table<F>(
        &self,
        dir: &mut PageDirectory,
        va: VirtualAddress,
        frames: &mut F,
    ) -> Result<PhysicalPage, WalkError>
    where
        F: TableFrameAlloc + ?Sized,
    {
        let slot = self.ensure(dir, va, frames)?;
        let key = dir.geometry().table_key(va, dir.geometry().leaf_depth());
        dir.pin(&key);
        Ok(slot.table)
    }

    /// Create and pin every depth-1 table of the kernel half.
    ///
    /// Afterwards the kernel root entries never change, so user directories
    /// can alias them once with [`alias_kernel_half`](Self::alias_kernel_half).
    ///
    /// # Panics
    /// If `dir` is not a kernel directory.
    pub fn pin_kernel_top_level<F>(
        &self,
        dir: &mut PageDirectory,
        frames: &mut F,
    ) -> Result<(), WalkError>
    where
        F: TableFrameAlloc + ?Sized,
    {
        assert_eq!(dir.half(), DirectoryHalf::Kernel);
        let g = *dir.geometry();
        let first = g.kernel_root_indices().start;

        for index in g.kernel_root_indices() {
            let va = VirtualAddress::new(
                g.kernel_half_start() + (index - first) as u64 * g.entry_span(0),
            );
            let key = g.table_key(va, 1);
            let slot = PteRef {
                table: dir.root(),
                index,
            };

            if self.read(slot).present() {
                dir.pin(&key);
                continue;
            }

            let fresh = frames.alloc_table().ok_or(WalkError::OutOfTableFrames)?;
            self.zero_table(fresh);
            self.write(slot, PageEntryBits::table(fresh, false, true));
            dir.register(key, fresh, true);
        }

        debug!(
            "Pinned {} kernel top-level tables",
            g.kernel_root_indices().len()
        );
        Ok(())
    }

    /// Copy the kernel-half root entries of `kernel` into `user`'s root.
    pub fn alias_kernel_half(&self, user: &PageDirectory, kernel: &PageDirectory) {
        assert_eq!(user.geometry(), kernel.geometry());
        let range = kernel.geometry().kernel_root_indices();
        let mut entries = [PageEntryBits::EMPTY; MAX_ENTRIES];
        self.access.with_table(kernel.root(), |t| {
            entries[range.clone()].copy_from_slice(&t[range.clone()]);
        });
        self.access.with_table(user.root(), |t| {
            t[range.clone()].copy_from_slice(&entries[range.clone()]);
        });
    }

    /// Clear the leaf entry for `va` and return it if it was present.
    ///
    /// With [`ReleaseHint::LastInRegion`] the tables on the path are scanned
    /// bottom-up; each one that became empty is unlinked from its parent,
    /// unregistered and handed back to `frames`. Pinned tables stay. Releasing
    /// an absent entry is a no-op apart from that scan.
    ///
    /// The caller is responsible for TLB invalidation.
    ///
    /// # Panics
    /// If `va` is outside the directory's half, or a linked table has no
    /// registration.
    pub fn release<F>(
        &self,
        dir: &mut PageDirectory,
        va: VirtualAddress,
        hint: ReleaseHint,
        frames: &mut F,
    ) -> Option<PageEntryBits>
    where
        F: TableFrameAlloc + ?Sized,
    {
        dir.assert_covers(va);
        let g = *dir.geometry();
        let leaf = g.leaf_depth();

        let mut path = [dir.root(); MAX_LEVELS];
        for depth in 0..leaf {
            let entry = self.read(PteRef {
                table: path[depth as usize],
                index: g.index(va, depth),
            });
            if !entry.present() {
                return None;
            }
            path[depth as usize + 1] = entry.physical_page();
        }

        let slot = PteRef {
            table: path[leaf as usize],
            index: g.index(va, leaf),
        };
        let old = self.read(slot);
        if old.present() {
            self.write(slot, PageEntryBits::EMPTY);
        } else if hint == ReleaseHint::MoreToCome {
            return None;
        }

        if hint == ReleaseHint::LastInRegion {
            for depth in (1..=leaf).rev() {
                let key = g.table_key(va, depth);
                let table = path[depth as usize];
                if dir.is_pinned(&key) || !self.is_table_empty(table, g.entries_per_table()) {
                    break;
                }

                self.write(
                    PteRef {
                        table: path[depth as usize - 1],
                        index: g.index(va, depth - 1),
                    },
                    PageEntryBits::EMPTY,
                );
                let record = dir.unregister(&key);
                assert_eq!(record.frame, table, "table {key:?} registered as another frame");
                frames.free_table(table);
                debug!("Released empty depth-{depth} table {table}");
            }
        }

        old.present().then_some(old)
    }

    /// Tear down `dir`: free every unpinned registered table and the root.
    ///
    /// Leaf frames are not touched; their owners release them beforehand.
    pub fn destroy<F>(&self, mut dir: PageDirectory, frames: &mut F)
    where
        F: TableFrameAlloc + ?Sized,
    {
        let mut freed = 0usize;
        for record in dir.take_tables().into_values() {
            if !record.pinned {
                frames.free_table(record.frame);
                freed += 1;
            }
        }
        frames.free_table(dir.root());
        debug!("Destroyed directory {} ({freed} tables)", dir.root());
    }
}
