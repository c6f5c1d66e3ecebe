//! Process-shared mutual exclusion usable inside a shared section.
//!
//! The lock is a single 32-bit word, so it works in any memory that every participant maps,
//! regardless of which process created it. There is no owner tracking: the holder is whoever
//! completed the `0 -> 1` transition.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Spin iterations before falling back to yielding the thread.
const SPIN_LIMIT: u32 = 64;

#[repr(C)]
pub struct SharedLock {
    word: AtomicU32,
}

impl SharedLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn lock(&self) -> SharedLockGuard<'_> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn try_lock(&self) -> Option<SharedLockGuard<'_>> {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SharedLockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) == LOCKED
    }
}

impl Default for SharedLock {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use = "dropping the guard releases the lock immediately"]
pub struct SharedLockGuard<'a> {
    lock: &'a SharedLock,
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.word.store(UNLOCKED, Ordering::Release);
    }
}
