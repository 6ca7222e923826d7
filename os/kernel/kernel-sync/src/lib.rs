//! # Kernel synchronization primitives
//!
//! Spin-only locks for code that must never sleep, plus the interrupt
//! bookkeeping the memory manager relies on:
//!
//! - [`Mutex`] over a pluggable raw lock ([`RawSpin`] or the FIFO-fair
//!   [`RawTicket`]). Neither lock is reentrant: locking twice on the same CPU
//!   deadlocks, so callers pass locked state down by `&mut` instead.
//! - [`IrqGuard`] disables interrupts for a scope and hands out the
//!   [`InterruptsDisabled`] capability token that per-CPU resources require.
//! - [`InterruptControl`] abstracts the interrupt flag so that the guard works
//!   against real hardware ([`X86Interrupts`]) and against simulated CPUs.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_spin;
mod raw_ticket;

pub use irq::{InterruptControl, InterruptsDisabled, IrqGuard, IrqMutex};
#[cfg(target_arch = "x86_64")]
pub use irq::X86Interrupts;
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;

/// Test-and-set spin lock around `T`.
pub type SpinMutex<T> = Mutex<T, RawSpin>;

/// Ticket lock around `T`; waiters are served in arrival order.
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;

    /// Snapshot of the lock state; only meaningful for assertions.
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
