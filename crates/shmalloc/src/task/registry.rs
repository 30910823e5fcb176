// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 shmalloc contributors

//! The task registry: hashed buckets of tasks, one per live atom.
//!
//! The registry is an explicit value; services that want a process-wide
//! instance use [`global`]. Every bucket carries its own mutex, so
//! callers under different atoms contend only on hash collisions, and
//! calls under one atom are serialized by that atom's definition (one
//! atom = one logical caller).

use super::mem::TaskMem;
use super::{Atom, Result, TaskError, ThreadAtom};
use crate::config::{TASK_MASK, TASK_MAX};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::OnceLock;

struct Task<A> {
    atom: A,
    mem: TaskMem,
}

/// Registry of per-task memory contexts, keyed by [`Atom`].
pub struct TaskRegistry<A: Atom = ThreadAtom> {
    buckets: Vec<Mutex<Vec<Task<A>>>>,
}

impl<A: Atom> TaskRegistry<A> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(TASK_MAX);
        buckets.resize_with(TASK_MAX, || Mutex::new(Vec::new()));
        Self { buckets }
    }

    #[inline]
    fn bucket(&self, atom: &A) -> &Mutex<Vec<Task<A>>> {
        &self.buckets[(atom.hashcode() & TASK_MASK) as usize]
    }

    /// Register a task for the current atom.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` when the atom has a task, `MemInit` when the
    /// context table cannot be allocated.
    pub fn register(&self) -> Result<()> {
        let atom = A::current();
        let mut bucket = self.bucket(&atom).lock();
        if bucket.iter().any(|t| t.atom == atom) {
            return Err(TaskError::AlreadyRegistered);
        }
        let mem = TaskMem::new()?;
        bucket.push(Task { atom, mem });
        Ok(())
    }

    /// Whether `atom` currently has a task.
    #[must_use]
    pub fn registered(&self, atom: &A) -> bool {
        self.bucket(atom).lock().iter().any(|t| t.atom == *atom)
    }

    /// The current task's singleton allocation for `id`.
    ///
    /// Returns the existing allocation when one is outstanding -
    /// whatever `size` the call asks for - and allocates a fresh one
    /// otherwise. The calling task is registered on first use. `None`
    /// on registration or allocation failure.
    pub fn acquire(&self, id: u64, size: usize) -> Option<NonNull<u8>> {
        let atom = A::current();
        let mut bucket = self.bucket(&atom).lock();

        if let Some(task) = bucket.iter_mut().find(|t| t.atom == atom) {
            if let Some(existing) = task.mem.search(id) {
                return Some(existing);
            }
            return task.mem.insert(id, size);
        }

        let mem = TaskMem::new().ok()?;
        bucket.push(Task {
            atom: atom.clone(),
            mem,
        });
        let end = bucket.len() - 1;
        bucket[end].mem.insert(id, size)
    }

    /// Release a singleton allocation of the current task.
    ///
    /// The next [`TaskRegistry::acquire`] with the same id allocates
    /// anew.
    ///
    /// # Safety
    ///
    /// `obj` must have been returned by `acquire` on this registry from
    /// the same atom, and must not be used after this call.
    pub unsafe fn release(&self, obj: NonNull<u8>) {
        let atom = A::current();
        let mut bucket = self.bucket(&atom).lock();
        let Some(task) = bucket.iter_mut().find(|t| t.atom == atom) else {
            log::error!("[TASK] release from an unregistered task");
            return;
        };
        // SAFETY: forwarded caller contract.
        if unsafe { task.mem.remove(obj) }.is_none() {
            log::error!("[TASK] release of an unknown object");
        }
    }

    /// Outstanding singleton allocations of the current task.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let atom = A::current();
        self.bucket(&atom)
            .lock()
            .iter()
            .find(|t| t.atom == atom)
            .map_or(0, |t| t.mem.count())
    }

    /// Drop the current task, releasing every outstanding allocation of
    /// its context.
    pub fn unregister(&self) {
        let atom = A::current();
        let mut bucket = self.bucket(&atom).lock();
        bucket.retain(|t| t.atom != atom);
    }
}

impl<A: Atom> Default for TaskRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry keyed by calling thread.
pub fn global() -> &'static TaskRegistry<ThreadAtom> {
    static GLOBAL: OnceLock<TaskRegistry<ThreadAtom>> = OnceLock::new();
    GLOBAL.get_or_init(TaskRegistry::new)
}
