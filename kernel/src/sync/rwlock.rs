// =============================================================================
// Ember — Reader/Writer Lock
// =============================================================================
//
// Multiple concurrent readers or one writer, packed into one atomic word:
//
//   bit 63      WRITER   — a writer holds the lock
//   bit 62      PENDING  — a writer is waiting; new readers back off
//   bits 0-61   reader count
//
// A waiting writer re-asserts PENDING on every spin iteration, so a stream
// of readers cannot starve it indefinitely. Like the spinlock, this lock
// does not touch the interrupt flag; writers that can race against
// dispatch on the same core take `IntrMask` first.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

const WRITER: u64 = 1 << 63;
const PENDING: u64 = 1 << 62;
const READER: u64 = 1;
const READER_MASK: u64 = PENDING - 1;

/// A spin-based reader/writer lock.
pub struct RwLock<T> {
    state: AtomicU64,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes writers against everything else.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new, unlocked reader/writer lock.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU64::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires shared read access, spinning while a writer holds the lock
    /// or is waiting for it.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITER | PENDING) == 0
                && self
                    .state
                    .compare_exchange_weak(
                        state,
                        state + READER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return RwLockReadGuard { lock: self };
            }
            core::hint::spin_loop();
        }
    }

    /// Acquires exclusive write access, spinning until all readers have
    /// drained and no other writer holds the lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITER | READER_MASK) == 0 {
                // Claiming the lock clears PENDING; other waiting writers
                // re-assert it below.
                if self
                    .state
                    .compare_exchange_weak(state, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return RwLockWriteGuard { lock: self };
                }
            } else {
                self.state.fetch_or(PENDING, Ordering::Relaxed);
            }
            core::hint::spin_loop();
        }
    }

    /// Returns a mutable reference to the underlying data without locking.
    #[allow(dead_code)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for shared read access.
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: reader count is non-zero, so no writer holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(READER, Ordering::Release);
    }
}

/// RAII guard for exclusive write access.
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the writer bit.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the writer bit.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn concurrent_readers() {
        let lock = RwLock::new(7u32);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1, 7);
        assert_eq!(*r2, 7);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(RwLock::new(0u32));
        let acquired = Arc::new(AtomicBool::new(false));

        let writer = lock.write();
        let reader_lock = Arc::clone(&lock);
        let reader_acquired = Arc::clone(&acquired);
        let handle = thread::spawn(move || {
            let guard = reader_lock.read();
            reader_acquired.store(true, AtomicOrdering::SeqCst);
            drop(guard);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(AtomicOrdering::SeqCst));

        drop(writer);
        handle.join().unwrap();
        assert!(acquired.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn writer_sees_reader_writes() {
        let lock = Arc::new(RwLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    *lock.write() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 2000);
    }
}
