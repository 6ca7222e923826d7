//! Interrupt masking and the interrupts-disabled capability.
//!
//! Per-CPU state (such as a CPU's private quickmap slot) is only safe to touch
//! while the current CPU cannot be interrupted or migrated. Rather than
//! trusting callers to remember that, such APIs take an
//! [`InterruptsDisabled`] token, which can only be obtained from a live
//! [`IrqGuard`] (or asserted with the `unsafe` [`InterruptsDisabled::assume`]
//! from contexts such as an interrupt handler prologue).
//!
//! ```
//! use core::cell::Cell;
//! use kernel_sync::{InterruptControl, IrqGuard, InterruptsDisabled};
//!
//! struct FakeCpu(Cell<bool>);
//! impl InterruptControl for FakeCpu {
//!     fn interrupts_enabled(&self) -> bool { self.0.get() }
//!     fn disable_interrupts(&self) { self.0.set(false) }
//!     fn enable_interrupts(&self) { self.0.set(true) }
//! }
//!
//! fn per_cpu_work(_proof: &InterruptsDisabled<'_>) {}
//!
//! let cpu = FakeCpu(Cell::new(true));
//! {
//!     let guard = IrqGuard::new(&cpu);
//!     assert!(!cpu.interrupts_enabled());
//!     per_cpu_work(&guard.token());
//! }
//! assert!(cpu.interrupts_enabled());
//! ```

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// Access to the current CPU's interrupt flag.
pub trait InterruptControl {
    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&self);
    fn enable_interrupts(&self);
}

/// Proof that interrupts are disabled on the current CPU for `'a`.
///
/// Neither `Send` nor `Sync`: the proof is about *this* CPU only.
#[derive(Debug)]
pub struct InterruptsDisabled<'a> {
    _scope: PhantomData<&'a ()>,
    _this_cpu: PhantomData<*const ()>,
}

impl InterruptsDisabled<'_> {
    /// Mint a token without a guard.
    ///
    /// # Safety
    /// Interrupts must be disabled on the current CPU, and stay disabled for
    /// as long as the token (or anything borrowed through it) is alive.
    #[must_use]
    pub const unsafe fn assume() -> Self {
        Self {
            _scope: PhantomData,
            _this_cpu: PhantomData,
        }
    }
}

/// Disables interrupts on creation and restores the previous state on drop.
///
/// Nesting is fine: an inner guard sees interrupts already disabled and
/// leaves them disabled when it goes away.
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct IrqGuard<'a, I: InterruptControl + ?Sized> {
    ctl: &'a I,
    were_enabled: bool,
    _this_cpu: PhantomData<*const ()>,
}

impl<'a, I: InterruptControl + ?Sized> IrqGuard<'a, I> {
    #[inline]
    pub fn new(ctl: &'a I) -> Self {
        let were_enabled = ctl.interrupts_enabled();
        if were_enabled {
            ctl.disable_interrupts();
        }
        Self {
            ctl,
            were_enabled,
            _this_cpu: PhantomData,
        }
    }

    /// Whether interrupts were enabled when the guard was taken.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }

    /// Capability token bounded by this guard's lifetime.
    #[inline]
    #[must_use]
    pub fn token(&self) -> InterruptsDisabled<'_> {
        // SAFETY: the guard keeps interrupts disabled for at least `'_`.
        unsafe { InterruptsDisabled::assume() }
    }
}

impl<I: InterruptControl + ?Sized> Drop for IrqGuard<'_, I> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.ctl.enable_interrupts();
        }
    }
}

/// A mutex guard taken with interrupts disabled.
///
/// The lock is released before interrupts are restored.
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock, I: InterruptControl + ?Sized> {
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard<'a, I>,
}

impl<T, R: RawLock + RawUnlock, I: InterruptControl + ?Sized> Deref for IrqMutex<'_, T, R, I> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock + RawUnlock, I: InterruptControl + ?Sized> DerefMut for IrqMutex<'_, T, R, I> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Disable interrupts through `ctl`, then acquire the lock.
    ///
    /// Keeps an interrupt handler on this CPU from spinning on a lock the
    /// interrupted code already holds.
    #[inline]
    pub fn lock_irq<'a, I: InterruptControl + ?Sized>(
        &'a self,
        ctl: &'a I,
    ) -> IrqMutex<'a, T, R, I> {
        let irq = IrqGuard::new(ctl);
        let guard = self.lock();
        IrqMutex { guard, _irq: irq }
    }
}

/// The interrupt flag of the executing x86-64 CPU (`RFLAGS.IF`, `cli`, `sti`).
///
/// Only valid at CPL 0.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Interrupts;

#[cfg(target_arch = "x86_64")]
impl X86Interrupts {
    const RFLAGS_IF: u64 = 1 << 9;

    #[inline]
    #[must_use]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r
    }
}

#[cfg(target_arch = "x86_64")]
impl InterruptControl for X86Interrupts {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        Self::rflags() & Self::RFLAGS_IF != 0
    }

    #[inline]
    fn disable_interrupts(&self) {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    fn enable_interrupts(&self) {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}
