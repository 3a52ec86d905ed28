//! Interrupt-disable scoping.
//!
//! On a single CPU, disabling interrupts is the kernel's mutual-exclusion
//! primitive for ISR-visible state. [`InterruptGuard`] is the scoped form
//! of the pushf/cli...popf idiom: construction saves EFLAGS and disables
//! interrupts, drop restores the saved state (so nested guards compose).

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

/// RAII interrupt-disable scope.
pub struct InterruptGuard {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    saved_flags: u32,
}

impl InterruptGuard {
    /// Disable interrupts, remembering whether they were enabled.
    #[inline]
    pub fn new() -> Self {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            // SAFETY: saving EFLAGS and clearing IF has no memory effects.
            let saved_flags = unsafe { crate::arch::x86::cpu::disable_interrupts_saving_flags() };
            Self { saved_flags }
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            Self {}
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    #[inline]
    fn drop(&mut self) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        // SAFETY: restores the exact flags saved at construction.
        unsafe {
            crate::arch::x86::cpu::restore_flags(self.saved_flags)
        }
    }
}

/// A lock whose guard also holds interrupts off.
///
/// The embedded spinlock is uncontended on the single CPU once interrupts
/// are disabled; it exists so the same type is sound under the host test
/// harness's parallel threads.
pub struct IrqLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let irq = InterruptGuard::new();
        IrqLockGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }
}

/// Guard handed out by [`IrqLock::lock`]. Dropping it releases the lock
/// and then restores the interrupt state.
pub struct IrqLockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _irq: InterruptGuard,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Interior mutability for state that is only ever touched with
/// interrupts disabled on the single CPU, namely the scheduler's run
/// queue, whose borrow must survive a context switch (a lock guard
/// could not: the switched-away stack still holds it).
pub struct IrqCell<T> {
    inner: UnsafeCell<T>,
}

// SAFETY: access is gated by the `get_mut` contract (interrupts off,
// single CPU), which serializes all users.
unsafe impl<T: Send> Sync for IrqCell<T> {}

impl<T> IrqCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    /// Borrow the contents mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold interrupts disabled for the whole lifetime of
    /// the returned borrow and must not create a second overlapping
    /// borrow from the same execution context.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        // SAFETY: forwarded contract.
        unsafe { &mut *self.inner.get() }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn irq_lock_round_trip() {
        let lock = IrqLock::new(41);
        {
            let mut v = lock.lock();
            *v += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn guards_nest() {
        let _outer = InterruptGuard::new();
        let _inner = InterruptGuard::new();
    }
}
