// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! POSIX shared memory segment management.
//!
//! Provides safe wrappers around `shm_open`, `ftruncate`, and `mmap`
//! for creating and mapping the segments that back cross-process slab
//! regions.
//!
//! # Segment Lifecycle
//!
//! 1. The service master creates a segment with [`ShmSegment::create`]
//! 2. Worker processes open it with [`ShmSegment::open`]
//! 3. The segment is automatically unmapped on drop
//! 4. The creator calls [`ShmSegment::unlink`] on cleanup
//!
//! # Naming Convention
//!
//! Segment names must start with `/` and contain no other `/`.
//! Example: `/shmalloc_sessions` (see [`super::segment_name`]).

use super::{Result, ShmError};
use crate::config::SLAB_MAGIC;
use std::ffi::CString;
use std::io;
use std::ptr;

/// POSIX shared memory segment wrapper.
///
/// Automatically unmaps the memory region on drop.
/// Does NOT automatically unlink the segment (creator's responsibility).
pub struct ShmSegment {
    /// Pointer to mapped memory region
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Segment name (for unlink)
    name: String,
}

// SAFETY: ShmSegment points to shared memory that is accessed from
// multiple threads and processes. The pool structures placed inside the
// segment carry their own synchronization (region-embedded mutex).
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared memory segment.
    ///
    /// If a segment with this name already exists, it is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if segment creation or mapping fails.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString created above
        // - shm_unlink is safe to call with any valid path; errors are ignored
        // - shm_open with O_CREAT|O_RDWR|O_EXCL creates a new segment or fails
        // - mode 0o600 restricts the segment to the owning user
        let fd = unsafe {
            // Remove a leftover segment first (ignore errors)
            libc::shm_unlink(c_name.as_ptr());

            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
        };

        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid descriptor from the successful shm_open
        // above; ftruncate fails gracefully on an oversized request.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid and not used after this point.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = Self::map(fd, size)?;

        // Zero-initialize: a fresh region must not look initialized.
        // SAFETY: ptr is valid for exactly `size` bytes (successful mmap
        // with PROT_WRITE) and no other reference exists yet.
        unsafe {
            ptr::write_bytes(ptr, 0, size);
        }

        log::debug!("[SHM] created segment {name} ({size} bytes)");

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing shared memory segment.
    ///
    /// `size` must match (or be smaller than) the size it was created
    /// with.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment does not exist or mapping fails.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid null-terminated CString; O_RDWR
        // opens an existing segment, mode is ignored without O_CREAT.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        let ptr = Self::map(fd, size)?;

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Map `size` bytes of `fd` read-write shared, then close the fd.
    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY:
        // - null hint lets the kernel choose the address
        // - PROT_READ|PROT_WRITE with MAP_SHARED creates a mapping
        //   visible to other processes mapping the same segment
        // - fd is valid from the caller's successful shm_open
        // - mmap returns MAP_FAILED on error (checked below)
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: fd is valid; the mapping (when it succeeded) holds its
        // own reference, so closing is safe either way.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }

        Ok(ptr.cast::<u8>())
    }

    /// Validate that a segment name follows POSIX rules
    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "segment name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a shared memory segment by name.
    ///
    /// The segment is removed once all processes unmap it. Idempotent:
    /// a missing segment is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if unlink fails for any reason other than the
    /// segment not existing.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid null-terminated CString; shm_unlink
        // only touches the filesystem namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }

        Ok(())
    }

    /// Get raw pointer to the mapped memory
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Get the size of the mapping
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the segment name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if a segment with the given name exists
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };

        // SAFETY: c_name is a valid null-terminated CString; O_RDONLY
        // probes for existence only.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };

        if fd >= 0 {
            // SAFETY: fd is valid and not used after this point.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size describe exactly the mapping
        // obtained in create() or open(); Drop runs at most once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
        // Note: no unlink here. The creator is responsible for cleanup.
    }
}

/// Clean up stale allocator segments.
///
/// Scans `/dev/shm` for segments matching the `shmalloc_` naming prefix
/// and removes the ones whose region was never initialized (a crashed
/// creator leaves the magic word zeroed or torn). Intended to run at
/// service startup.
///
/// Returns the number of segments removed.
pub fn cleanup_stale_segments() -> usize {
    let mut cleaned = 0;

    // On Linux, shm segments appear in /dev/shm
    let shm_dir = std::path::Path::new("/dev/shm");
    if !shm_dir.exists() {
        return 0;
    }

    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };

        if !name.starts_with("shmalloc_") {
            continue;
        }

        let segment_name = format!("/{name}");
        if is_segment_stale(&segment_name) && ShmSegment::unlink(&segment_name).is_ok() {
            log::debug!("[SHM] cleaned up stale segment: {segment_name}");
            cleaned += 1;
        }
    }

    cleaned
}

/// Check whether a segment looks stale (created but never initialized).
///
/// Heuristic: the first word of an initialized region is the pool magic;
/// anything else means the creator died before `init` completed.
fn is_segment_stale(name: &str) -> bool {
    let Ok(seg) = ShmSegment::open(name, 64) else {
        // Can't open = gone or permission denied, not ours to reap.
        return false;
    };

    // SAFETY: the mapping is at least 64 bytes and page-aligned, so a
    // u32 read at offset 0 is in bounds and aligned.
    let magic = unsafe { seg.as_ptr().cast::<u32>().read_volatile() };
    magic != SLAB_MAGIC
}
