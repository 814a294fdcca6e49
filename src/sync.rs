//! The allocator's only lock. It lives inside `mmap()`ed pool headers and in
//! a `static`, so it has to be `const`-constructible, valid when all bytes
//! are zero and must never allocate. `std::sync::Mutex` poisons and wraps
//! data, neither of which we want here.
//!
//! Without the `locks` feature the lock never waits. Fuzz targets are single
//! threaded, so taking it is one uncontended swap, and a second thread that
//! finds it held aborts the process instead of racing on the free list.

#[cfg(feature = "locks")]
mod imp {
    use std::sync::atomic::Ordering;

    use linux_futex::{Futex, Private};

    /// This futex represents a lock and is unlocked
    const UNLOCKED: u32 = 0;

    /// Locked, nobody waiting
    const LOCKED: u32 = 1;

    /// Locked, and somebody might be asleep on the futex
    const CONTENDED: u32 = 2;

    pub struct RawMutex {
        futex: Futex<Private>,
    }

    impl RawMutex {
        pub const fn new() -> Self {
            Self {
                futex: Futex::new(UNLOCKED),
            }
        }

        #[inline]
        pub fn lock(&self) {
            if self
                .futex
                .value
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                self.lock_contended();
            }
        }

        #[cold]
        fn lock_contended(&self) {
            // Once we have slept we can't know whether others are asleep too,
            // so we always take the lock as CONTENDED from here on.
            while self.futex.value.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
                // Spurious wakeups and value changes are fine, we just retry
                _ = self.futex.wait(CONTENDED);
            }
        }

        #[inline]
        pub fn try_lock(&self) -> bool {
            self.futex
                .value
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }

        /// # Safety
        ///
        /// The calling thread must hold the lock
        #[inline]
        pub unsafe fn unlock(&self) {
            if self.futex.value.swap(UNLOCKED, Ordering::Release) == CONTENDED {
                self.futex.wake(1);
            }
        }
    }
}

#[cfg(not(feature = "locks"))]
mod imp {
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::util::print::fatal;

    /// Single-threaded build: a flag that is never waited on
    pub struct RawMutex {
        held: AtomicBool,
    }

    impl RawMutex {
        pub const fn new() -> Self {
            Self {
                held: AtomicBool::new(false),
            }
        }

        /// Take the lock. Finding it held means a second thread is inside
        /// the allocator, which this build can't serialize.
        #[inline]
        pub fn lock(&self) {
            if self.held.swap(true, Ordering::Acquire) {
                contended()
            }
        }

        #[inline]
        pub fn try_lock(&self) -> bool {
            self.held
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }

        /// # Safety
        ///
        /// The calling thread must hold the lock
        #[inline]
        pub unsafe fn unlock(&self) {
            self.held.store(false, Ordering::Release);
        }
    }

    #[cold]
    fn contended() -> ! {
        fatal(&"allocator entered from two threads at once; build with the `locks` feature")
    }
}

pub use imp::RawMutex;

impl RawMutex {
    /// Lock, returning an RAII guard that unlocks on drop
    #[inline]
    pub fn guard(&self) -> RawMutexGuard<'_> {
        self.lock();
        RawMutexGuard { mutex: self }
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a [`RawMutex`] until dropped
pub struct RawMutexGuard<'a> {
    mutex: &'a RawMutex,
}

impl Drop for RawMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: a guard only exists while its lock is held
        unsafe { self.mutex.unlock() }
    }
}
