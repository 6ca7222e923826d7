use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// FIFO ticket lock.
///
/// Each locker draws a ticket from `next` and spins until `serving` reaches
/// it, so waiters are granted the lock in arrival order. Used for the memory
/// manager's global state where many CPUs may contend on allocation.
pub struct RawTicket {
    next: AtomicU32,
    serving: AtomicU32,
}

impl Default for RawTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            serving: AtomicU32::new(0),
        }
    }
}

impl RawLock for RawTicket {
    #[inline]
    fn raw_lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    #[inline]
    fn raw_try_lock(&self) -> bool {
        let serving = self.serving.load(Ordering::Relaxed);
        // only take a ticket when it would be served immediately
        self.next
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline]
    fn raw_is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.serving.load(Ordering::Relaxed)
    }
}

impl RawUnlock for RawTicket {
    #[inline]
    unsafe fn raw_unlock(&self) {
        // only the holder writes `serving`
        let now = self.serving.load(Ordering::Relaxed);
        self.serving.store(now.wrapping_add(1), Ordering::Release);
    }
}
