//! Lazy one-time initialization for statics.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A value initialized on first access by a stored closure.
///
/// Racing initializers are resolved with an atomic state machine: one wins,
/// the rest spin until the value is ready.
pub struct LazyLock<T, F = fn() -> T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    init: UnsafeCell<Option<F>>,
}

// SAFETY: The state machine publishes the value with Release/Acquire ordering
// and consumes the init closure exactly once.
unsafe impl<T: Send + Sync, F: Send> Send for LazyLock<T, F> {}
unsafe impl<T: Send + Sync, F: Send> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a new lazy value with the given initializer.
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            init: UnsafeCell::new(Some(init)),
        }
    }

    fn force(&self) -> &T {
        loop {
            match self.state.load(Ordering::Acquire) {
                READY => {
                    // SAFETY: READY means the value was fully written before
                    // the Release store below.
                    return unsafe { (*self.value.get()).assume_init_ref() };
                }
                INITIALIZING => core::hint::spin_loop(),
                _ => {
                    if self
                        .state
                        .compare_exchange(
                            UNINIT,
                            INITIALIZING,
                            Ordering::Acquire,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        // SAFETY: We won the race; nobody else touches init
                        // or value until we store READY.
                        unsafe {
                            let f = (*self.init.get()).take().expect("LazyLock init consumed");
                            (*self.value.get()).write(f());
                        }
                        self.state.store(READY, Ordering::Release);
                    }
                }
            }
        }
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;
    fn deref(&self) -> &T {
        self.force()
    }
}

impl<T, F> Drop for LazyLock<T, F> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY implies the value is initialized and owned here.
            unsafe { (*self.value.get()).assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialized_once_on_first_access() {
        static LAZY: LazyLock<u64> = LazyLock::new(|| 40 + 2);
        assert_eq!(*LAZY, 42);
        assert_eq!(*LAZY, 42);
    }

    #[test]
    fn concurrent_access_sees_one_value() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;

        static RUNS: AtomicUsize = AtomicUsize::new(0);
        let lazy = Arc::new(LazyLock::new(|| {
            RUNS.fetch_add(1, Ordering::SeqCst);
            7u32
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lazy = lazy.clone();
                std::thread::spawn(move || **lazy)
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 7);
        }
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }
}
