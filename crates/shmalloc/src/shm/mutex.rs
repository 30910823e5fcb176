// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! Region-embedded mutex for cross-process pools.
//!
//! The mutex is a single `AtomicU32` word designed to be placed inside a
//! shared memory segment; any process that maps the segment contends on
//! the same word. The word protocol is the classic three-state futex
//! mutex:
//!
//! - `0` - unlocked
//! - `1` - locked, no waiters
//! - `2` - locked, at least one waiter (or there may have been one)
//!
//! Uncontended lock/unlock is a single compare-exchange; the futex
//! syscall is only reached after a short adaptive spin fails. Unlock
//! wakes one waiter only when the word was in the contended state.
//!
//! Holders in other processes are tolerated: a waiter simply sleeps on
//! the shared word until any mapper of the region releases it.

use super::futex::{futex_wait, futex_wake};
use std::sync::atomic::{AtomicU32, Ordering};

/// Spins before falling back to the futex syscall.
const SPIN_LIMIT: u32 = 100;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A futex-backed mutex that lives inside the memory it protects.
///
/// `#[repr(transparent)]` over the futex word so the struct can be
/// embedded directly in a `#[repr(C)]` region header.
#[repr(transparent)]
pub struct ShmMutex {
    word: AtomicU32,
}

impl ShmMutex {
    /// Create an unlocked mutex (for placement in a fresh region).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquire the mutex, blocking until it is available.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return ShmMutexGuard { mutex: self };
        }
        self.lock_contended();
        ShmMutexGuard { mutex: self }
    }

    /// Try to acquire the mutex without blocking.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard { mutex: self })
    }

    fn lock_contended(&self) {
        let mut spins = 0;
        loop {
            let state = self.word.load(Ordering::Relaxed);
            if state == UNLOCKED
                && self
                    .word
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }
            // Mark contended so the holder knows to wake us, then sleep.
            if self.word.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            futex_wait(&self.word, CONTENDED, None);
        }
    }

    fn unlock(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(&self.word, 1);
        }
    }
}

impl Default for ShmMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard; releases the mutex on drop.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_unlock() {
        let m = ShmMutex::new();
        {
            let _g = m.lock();
            assert!(m.try_lock().is_none());
        }
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn test_contended_counter() {
        let m = Arc::new(ShmMutex::new());
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = m.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().expect("locker thread panicked");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }
}
