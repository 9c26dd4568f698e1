//! Interrupt-safe spin lock.
//!
//! Saves RFLAGS and disables interrupts before taking the inner lock,
//! restoring the previous interrupt state on release. Required for any state
//! shared with interrupt handlers (scheduler queues, event bus, TTY input):
//! taking a plain spinlock there deadlocks the moment the timer fires while
//! the lock is held on the same CPU.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spin lock that keeps interrupts disabled while held.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: Same reasoning as SpinLock; the flag serializes access.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked lock.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Disables interrupts and acquires the lock.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let saved_flags = save_flags_and_cli();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqSpinLockGuard {
                    lock: self,
                    saved_flags,
                    _not_send: PhantomData,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire without spinning, restoring flags on failure.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let saved_flags = save_flags_and_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard {
                lock: self,
                saved_flags,
                _not_send: PhantomData,
            })
        } else {
            restore_flags(saved_flags);
            None
        }
    }
}

/// RAII guard; restores the saved interrupt state on drop.
///
/// `!Send`: the saved RFLAGS belong to the CPU that acquired the lock.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    saved_flags: u64,
    _not_send: PhantomData<*mut ()>,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The lock is held for the guard's lifetime.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The lock is held for the guard's lifetime.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> IrqSpinLockGuard<'_, T> {
    /// Releases the lock but leaves interrupts disabled.
    ///
    /// For paths that must stay atomic past the unlock — the context
    /// switch releases the scheduler lock this way and lets `iretq`
    /// restore the incoming task's interrupt state in one instruction.
    pub fn unlock_keep_disabled(self) {
        self.lock.locked.store(false, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_flags(self.saved_flags);
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn save_flags_and_cli() -> u64 {
    let flags: u64;
    // SAFETY: pushfq/pop reads RFLAGS; cli is always legal at CPL 0.
    unsafe {
        core::arch::asm!("pushfq", "pop {}", "cli", out(reg) flags, options(nomem));
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn restore_flags(flags: u64) {
    // SAFETY: Restores the RFLAGS image saved by save_flags_and_cli on this
    // CPU; only IF meaningfully changes.
    unsafe {
        core::arch::asm!("push {}", "popfq", in(reg) flags, options(nomem));
    }
}

// Host build: interrupt state does not exist; the lock degenerates to a
// plain spinlock so the users remain unit-testable.
#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
fn save_flags_and_cli() -> u64 {
    0
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
fn restore_flags(_flags: u64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_exclusion() {
        let lock = IrqSpinLock::new(5u32);
        {
            let mut g = lock.lock();
            *g = 6;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn try_lock_restores_state_on_failure() {
        let lock = IrqSpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn unlock_keep_disabled_releases_the_lock() {
        let lock = IrqSpinLock::new(0u8);
        lock.lock().unlock_keep_disabled();
        assert!(lock.try_lock().is_some());
    }
}
