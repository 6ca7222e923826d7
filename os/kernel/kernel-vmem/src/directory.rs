use crate::geometry::{PagingGeometry, TableKey};
use alloc::collections::BTreeMap;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// Which half of the address space a directory translates.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DirectoryHalf {
    /// Lower half; intermediate tables are user accessible.
    User,
    /// Upper half; shared by every address space.
    Kernel,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TableRecord {
    pub frame: PhysicalPage,
    /// Pinned tables outlive any mapping in them and are never released.
    pub pinned: bool,
}

/// Page tables of one address space.
///
/// Owns the root frame and remembers every intermediate table it created,
/// keyed by [`TableKey`]. A non-root table is linked from its parent entry
/// exactly when it is registered here.
#[derive(Debug)]
pub struct PageDirectory {
    root: PhysicalPage,
    geometry: PagingGeometry,
    half: DirectoryHalf,
    tables: BTreeMap<TableKey, TableRecord>,
}

impl PageDirectory {
    /// Wrap a zeroed (or alias-prepared) root table frame.
    #[must_use]
    pub const fn new(root: PhysicalPage, geometry: PagingGeometry, half: DirectoryHalf) -> Self {
        Self {
            root,
            geometry,
            half,
            tables: BTreeMap::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn geometry(&self) -> &PagingGeometry {
        &self.geometry
    }

    #[inline]
    #[must_use]
    pub const fn half(&self) -> DirectoryHalf {
        self.half
    }

    /// Whether `va` lies in the half this directory translates.
    #[must_use]
    pub const fn covers(&self, va: VirtualAddress) -> bool {
        match self.half {
            DirectoryHalf::User => va.as_u64() < self.geometry.user_half_end(),
            DirectoryHalf::Kernel => va.as_u64() >= self.geometry.kernel_half_start(),
        }
    }

    /// Panics unless `va` is covered; a foreign address here is a caller bug.
    #[inline]
    pub(crate) fn assert_covers(&self, va: VirtualAddress) {
        assert!(
            self.covers(va),
            "{va} is outside the {:?} half of directory {}",
            self.half,
            self.root
        );
    }

    #[inline]
    #[must_use]
    pub fn table(&self, key: &TableKey) -> Option<PhysicalPage> {
        self.tables.get(key).map(|r| r.frame)
    }

    #[inline]
    #[must_use]
    pub fn is_pinned(&self, key: &TableKey) -> bool {
        self.tables.get(key).is_some_and(|r| r.pinned)
    }

    /// Mark an existing table as pinned.
    ///
    /// # Panics
    /// If the table is not registered.
    pub fn pin(&mut self, key: &TableKey) {
        let Some(record) = self.tables.get_mut(key) else {
            panic!("pinning unregistered table {key:?}");
        };
        record.pinned = true;
    }

    pub(crate) fn register(&mut self, key: TableKey, frame: PhysicalPage, pinned: bool) {
        let previous = self.tables.insert(key, TableRecord { frame, pinned });
        assert!(previous.is_none(), "table {key:?} registered twice");
    }

    pub(crate) fn unregister(&mut self, key: &TableKey) -> TableRecord {
        match self.tables.remove(key) {
            Some(record) => record,
            None => panic!("linked table {key:?} has no registration"),
        }
    }

    /// Number of registered intermediate tables (root excluded).
    #[inline]
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn tables(&self) -> impl Iterator<Item = (&TableKey, &TableRecord)> {
        self.tables.iter()
    }

    pub(crate) fn take_tables(&mut self) -> BTreeMap<TableKey, TableRecord> {
        core::mem::take(&mut self.tables)
    }
}
