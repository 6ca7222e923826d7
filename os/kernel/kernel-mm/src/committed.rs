use crate::manager::MemoryManager;
use crate::platform::Platform;
use core::fmt;
use kernel_alloc::PhysicalFrame;

/// Pages committed on behalf of one consumer.
///
/// Every [`take_frame`](Self::take_frame) draws one committed frame; the
/// pages never drawn are uncommitted when the guard drops.
#[must_use = "dropping the guard uncommits the pages right away"]
pub struct CommittedPages<'m, P: Platform> {
    manager: &'m MemoryManager<P>,
    remaining: usize,
}

impl<'m, P: Platform> CommittedPages<'m, P> {
    pub(crate) const fn new(manager: &'m MemoryManager<P>, pages: usize) -> Self {
        Self {
            manager,
            remaining: pages,
        }
    }

    /// Pages that can still be drawn.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.remaining
    }

    /// Draw one committed frame; `None` once the commitment is used up.
    pub fn take_frame(&mut self, zero_fill: bool) -> Option<PhysicalFrame> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.manager.allocate_committed_user_frame(zero_fill))
    }
}

impl<P: Platform> fmt::Debug for CommittedPages<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittedPages")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

impl<P: Platform> Drop for CommittedPages<'_, P> {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.manager.uncommit(self.remaining);
        }
    }
}
