//! Anonymous memory objects and the purge protocol.

use crate::address_space::AddressSpace;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use kernel_alloc::{PhysicalFrame, UserPool};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_sync::{MutexGuard, RawSpin, SpinMutex};
use log::debug;

/// Something that can hand frames back under memory pressure.
///
/// Called with the manager's global lock held. Implementations must not
/// block on their own locks; a busy object is skipped.
pub trait Purgeable: Send + Sync {
    /// Release what can be released into `ctx`; returns the number of frames.
    fn purge(&self, ctx: &mut PurgeContext<'_>) -> usize;
}

/// The already-locked pools a purge releases into.
pub struct PurgeContext<'a> {
    pool: &'a mut UserPool,
    unmaps: Vec<(Weak<AddressSpace>, VirtualAddress)>,
    released: usize,
}

impl<'a> PurgeContext<'a> {
    pub(crate) const fn new(pool: &'a mut UserPool) -> Self {
        Self {
            pool,
            unmaps: Vec::new(),
            released: 0,
        }
    }

    /// Give a frame back to the user pool.
    pub fn release(&mut self, frame: PhysicalFrame) {
        self.pool.deallocate(frame);
        self.released += 1;
    }

    /// Schedule the removal of the translation at `va` in `space`. Done by
    /// the manager before the global lock is dropped.
    pub fn unmap(&mut self, space: Weak<AddressSpace>, va: VirtualAddress) {
        self.unmaps.push((space, va));
    }

    #[must_use]
    pub const fn released(&self) -> usize {
        self.released
    }

    pub(crate) fn into_unmaps(self) -> Vec<(Weak<AddressSpace>, VirtualAddress)> {
        self.unmaps
    }
}

pub(crate) struct AnonymousState {
    pub frames: Vec<Option<PhysicalFrame>>,
    /// Committed pages not yet drawn.
    pub committed: usize,
    pub volatile: bool,
    pub purged: bool,
    /// Where the object is mapped.
    pub mapping: Option<(Weak<AddressSpace>, VirtualAddress)>,
}

impl AnonymousState {
    pub fn resident(&self) -> impl Iterator<Item = (usize, &PhysicalFrame)> {
        self.frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (i, f)))
    }
}

/// Zero-filled memory that gets its frames on first touch.
///
/// Frames are owned by the object and go back to the pool when the region
/// is torn down or, for a volatile object, when it is purged.
pub struct AnonymousVmObject {
    pages: usize,
    state: SpinMutex<AnonymousState>,
}

impl AnonymousVmObject {
    /// Object of `pages` pages mapped at `base` in `space`, with `committed`
    /// pages already committed on its behalf.
    pub(crate) fn new(
        pages: usize,
        committed: usize,
        space: Weak<AddressSpace>,
        base: VirtualAddress,
    ) -> Self {
        let mut frames = Vec::with_capacity(pages);
        frames.resize_with(pages, || None);
        Self {
            pages,
            state: SpinMutex::new(AnonymousState {
                frames,
                committed,
                volatile: false,
                purged: false,
                mapping: Some((space, base)),
            }),
        }
    }

    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.pages
    }

    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.state.lock().resident().count()
    }

    /// Committed pages that were not drawn yet.
    #[must_use]
    pub fn committed_pages(&self) -> usize {
        self.state.lock().committed
    }

    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.state.lock().volatile
    }

    /// Allow or forbid purging. Returns whether contents were purged since
    /// the object last became volatile.
    pub fn set_volatile(&self, volatile: bool) -> bool {
        let mut state = self.state.lock();
        let was_purged = state.purged;
        state.volatile = volatile;
        if volatile {
            state.purged = false;
        }
        was_purged
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AnonymousState, RawSpin> {
        self.state.lock()
    }

    /// Remove every frame and the remaining commitment. The object has no
    /// pages afterwards, so later faults on it fail.
    pub(crate) fn take_all(&self) -> (Vec<PhysicalFrame>, usize) {
        let mut state = self.state.lock();
        let frames = core::mem::take(&mut state.frames).into_iter().flatten().collect();
        let committed = core::mem::take(&mut state.committed);
        state.mapping = None;
        (frames, committed)
    }
}

impl Purgeable for AnonymousVmObject {
    fn purge(&self, ctx: &mut PurgeContext<'_>) -> usize {
        let Some(mut state) = self.state.try_lock() else {
            return 0;
        };
        if !state.volatile {
            return 0;
        }

        let state = &mut *state;
        let mut released = 0;
        for (index, slot) in state.frames.iter_mut().enumerate() {
            let Some(frame) = slot.take() else {
                continue;
            };
            if let Some((space, base)) = &state.mapping {
                ctx.unmap(space.clone(), *base + index as u64 * PAGE_SIZE);
            }
            ctx.release(frame);
            released += 1;
        }

        if released > 0 {
            state.purged = true;
            debug!("Purged {released} of {} pages", self.pages);
        }
        released
    }
}

/// Registry entry for an object.
pub(crate) fn registry_entry(object: &Arc<AnonymousVmObject>) -> Weak<dyn Purgeable> {
    let weak: Weak<AnonymousVmObject> = Arc::downgrade(object);
    weak
}
