// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! POSIX shared memory plumbing for cross-process pools.
//!
//! A slab region normally lives inside a shared memory segment mapped by
//! every process of the service. This module provides the segment
//! lifecycle (`ShmSegment`), the shared futex primitives, and the
//! region-embedded mutex built on top of them.

mod futex;
mod mutex;
mod segment;

pub use futex::{futex_wait, futex_wake, futex_wake_all};
pub use mutex::{ShmMutex, ShmMutexGuard};
pub use segment::{cleanup_stale_segments, ShmSegment};

use std::fmt;
use std::io;

/// Errors that can occur while managing shared memory segments.
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory segment creation failed
    SegmentCreate(io::Error),

    /// Shared memory segment open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Invalid segment name
    InvalidName(String),

    /// Segment not found
    NotFound(String),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::InvalidName(name) => write!(f, "invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "segment not found: {name}"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            Self::InvalidName(_) | Self::NotFound(_) => None,
        }
    }
}

/// Result type for shared memory operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// Generate the deterministic segment name for a named pool region.
///
/// Format: `/shmalloc_{name}`
///
/// The scheme lets any process of the service reconstruct the segment
/// name from the pool name alone, without coordination.
#[must_use]
pub fn segment_name(pool: &str) -> String {
    format!("/shmalloc_{pool}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name() {
        assert_eq!(segment_name("sessions"), "/shmalloc_sessions");
    }

    #[test]
    fn test_error_display() {
        let err = ShmError::InvalidName("foo".to_string());
        assert_eq!(err.to_string(), "invalid segment name: foo");
    }
}
