// =============================================================================
// Ember — Spinlock
// =============================================================================
//
// Mutual exclusion on a single 64-bit word: 0 = unlocked, 1 = locked.
// `lock` spins on a compare-and-swap from 0 to 1; `try_lock` makes one
// attempt. Fair ordering between waiters is not guaranteed.
//
// The lock does NOT touch the interrupt flag. Code that can race against an
// interrupt handler on the same core must take `sync::intr::IntrMask`
// first; leaf data like the heap is never touched from interrupt context.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

const SPIN_UNLOCKED: u64 = 0;
const SPIN_LOCKED: u64 = 1;

/// A test-and-set spinlock guarding a value.
///
/// Suitable for statics:
/// ```ignore
/// static COUNTER: SpinLock<u64> = SpinLock::new(0);
/// ```
pub struct SpinLock<T> {
    state: AtomicU64,

    /// The protected data. UnsafeCell because we mutate through a shared
    /// reference; the lock provides exclusion at runtime.
    data: UnsafeCell<T>,
}

// SAFETY: the lock ensures only one core accesses T at a time.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new, unlocked spinlock wrapping the given value.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU64::new(SPIN_UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is free.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .state
            .compare_exchange_weak(SPIN_UNLOCKED, SPIN_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        SpinLockGuard { lock: self }
    }

    /// Makes a single attempt to acquire the lock.
    #[allow(dead_code)]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.state
            .compare_exchange(SPIN_UNLOCKED, SPIN_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// `&mut self` guarantees exclusive access at compile time, so no
    /// locking is needed. Useful during single-core initialization.
    #[allow(dead_code)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock. Dropping it releases the lock.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering publishes our writes to the next holder.
        self.lock.state.store(SPIN_UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_and_unlock() {
        let lock = SpinLock::new(5u64);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn contended_counter() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
