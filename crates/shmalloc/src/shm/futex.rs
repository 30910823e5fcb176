// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! Linux futex wrapper for inter-process synchronization.
//!
//! # CRITICAL: SHARED vs PRIVATE
//!
//! This module uses `FUTEX_WAIT` and `FUTEX_WAKE` (NOT the `_PRIVATE`
//! variants). The `_PRIVATE` variants only work within a single process
//! and will silently fail to wake waiters in other processes. A slab
//! region lives in shared memory, so its mutex word is contended across
//! process boundaries.

#[cfg(target_os = "linux")]
use std::ptr;
use std::sync::atomic::AtomicU32;
#[cfg(target_os = "linux")]
use std::time::Duration;

/// Futex operation codes (SHARED, not PRIVATE!)
#[cfg(target_os = "linux")]
const FUTEX_WAIT: i32 = 0; // NOT 128 (FUTEX_WAIT_PRIVATE)
#[cfg(target_os = "linux")]
const FUTEX_WAKE: i32 = 1; // NOT 129 (FUTEX_WAKE_PRIVATE)

/// Wait on a futex word until it no longer holds `expected` or the
/// timeout expires.
///
/// Returns `0` on wake or spurious wakeup, `-1` with `EAGAIN` if the
/// current value differs from `expected`, `-1` with `ETIMEDOUT` on
/// timeout.
///
/// For inter-process use the word must live in shared memory (mmap).
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(d.subsec_nanos()),
    });

    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: the futex syscall is invoked with a valid word address
    // (we hold a reference to it for the duration of the call).
    // CRITICAL: FUTEX_WAIT (0), NOT FUTEX_WAIT_PRIVATE (128).
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(), // uaddr2 (unused)
            0i32,               // val3 (unused)
        ) as i32
    }
}

/// Wake up to `count` waiters blocked on the futex word.
///
/// Returns the number of waiters woken, or -1 on error.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: the futex syscall is invoked with a valid word address.
    // CRITICAL: FUTEX_WAKE (1), NOT FUTEX_WAKE_PRIVATE (129).
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(), // timeout (unused for wake)
            ptr::null::<u32>(),            // uaddr2 (unused)
            0i32,                          // val3 (unused)
        ) as i32
    }
}

/// Wake all waiters
#[cfg(target_os = "linux")]
#[inline]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}

// Non-Linux fallback (sleep-poll, for development builds only)
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(
    _addr: &AtomicU32,
    _expected: u32,
    timeout: Option<std::time::Duration>,
) -> i32 {
    let sleep_time = timeout.unwrap_or(std::time::Duration::from_millis(1));
    std::thread::sleep(sleep_time.min(std::time::Duration::from_millis(1)));
    0
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32, _count: i32) -> i32 {
    0
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn futex_wake_all(_addr: &AtomicU32) -> i32 {
    0
}
