//! The manager's global lock, with the owning CPU on record.
//!
//! The ticket lock underneath is not reentrant. Remembering the holder lets
//! the manager turn a same-CPU re-entry (a fault or nested call while the
//! lock is held) into a diagnosed crash instead of a silent hang.

use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::{MutexGuard, RawTicket, TicketMutex};

const NO_OWNER: usize = usize::MAX;

pub(crate) struct GlobalLock<T> {
    inner: TicketMutex<T>,
    owner: AtomicUsize,
}

impl<T> GlobalLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: TicketMutex::new(value),
            owner: AtomicUsize::new(NO_OWNER),
        }
    }

    /// Whether `cpu` holds the lock right now.
    ///
    /// Exact for the executing CPU: only it can set or clear its own index.
    #[must_use]
    pub fn is_held_by(&self, cpu: usize) -> bool {
        self.owner.load(Ordering::Acquire) == cpu
    }

    /// Acquire on behalf of `cpu`, which must not hold the lock already.
    pub fn lock(&self, cpu: usize) -> GlobalGuard<'_, T> {
        let guard = self.inner.lock();
        self.owner.store(cpu, Ordering::Release);
        GlobalGuard {
            guard,
            owner: &self.owner,
        }
    }

    /// The protected state, read without locking.
    ///
    /// # Safety
    /// The executing CPU must hold the lock further down its own stack, and
    /// the reference must not outlive that suspended holder.
    #[must_use]
    pub unsafe fn peek_held(&self) -> &T {
        unsafe { &*self.inner.data_ptr() }
    }
}

pub(crate) struct GlobalGuard<'a, T> {
    guard: MutexGuard<'a, T, RawTicket>,
    owner: &'a AtomicUsize,
}

impl<T> Deref for GlobalGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for GlobalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for GlobalGuard<'_, T> {
    fn drop(&mut self) {
        // Cleared before `guard` unlocks.
        self.owner.store(NO_OWNER, Ordering::Release);
    }
}

impl<T> fmt::Debug for GlobalLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => f.write_str("GlobalLock { <free> }"),
            cpu => write!(f, "GlobalLock {{ held by CPU {cpu} }}"),
        }
    }
}
