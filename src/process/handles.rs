/*!
 * Handle Table
 *
 * Per-process map from handle values to referenced objects and the access
 * granted when the handle was opened. Process rundown kills the table:
 * every entry is dropped and further inserts are refused.
 */

use super::{Process, Thread};
use crate::core::errors::{KernelError, KernelResult};
use crate::core::limits::FIRST_HANDLE;
use crate::core::types::{AccessMask, Handle};
use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Object a handle refers to
#[derive(Clone)]
pub enum KernelObject {
    Process(Arc<Process>),
    Thread(Arc<Thread>),
}

#[derive(Clone)]
struct HandleEntry {
    object: KernelObject,
    access: AccessMask,
}

pub struct HandleTable {
    entries: DashMap<u32, HandleEntry, ahash::RandomState>,
    next: AtomicU32,
    killed: AtomicBool,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(ahash::RandomState::new()),
            next: AtomicU32::new(FIRST_HANDLE),
            killed: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, object: KernelObject, access: AccessMask) -> KernelResult<Handle> {
        if self.killed.load(Ordering::Acquire) {
            return Err(KernelError::InvalidParameter(
                "handle table has been run down".to_string(),
            ));
        }
        let value = self.next.fetch_add(FIRST_HANDLE, Ordering::Relaxed);
        self.entries.insert(value, HandleEntry { object, access });
        // Lost a race with kill; do not leave the entry behind
        if self.killed.load(Ordering::Acquire) {
            self.entries.remove(&value);
            return Err(KernelError::InvalidParameter(
                "handle table has been run down".to_string(),
            ));
        }
        Ok(Handle(value))
    }

    pub fn close(&self, handle: Handle) -> KernelResult<()> {
        self.entries
            .remove(&handle.value())
            .map(|_| ())
            .ok_or(KernelError::InvalidHandle(handle.value()))
    }

    fn lookup(&self, handle: Handle, desired: AccessMask) -> KernelResult<KernelObject> {
        let entry = self
            .entries
            .get(&handle.value())
            .ok_or(KernelError::InvalidHandle(handle.value()))?;
        if !entry.access.contains(desired) {
            return Err(KernelError::AccessDenied {
                requested: desired.0,
                granted: entry.access.0,
            });
        }
        Ok(entry.object.clone())
    }

    pub fn lookup_thread(&self, handle: Handle, desired: AccessMask) -> KernelResult<Arc<Thread>> {
        match self.lookup(handle, desired)? {
            KernelObject::Thread(thread) => Ok(thread),
            KernelObject::Process(_) => Err(KernelError::InvalidHandle(handle.value())),
        }
    }

    pub fn lookup_process(
        &self,
        handle: Handle,
        desired: AccessMask,
    ) -> KernelResult<Arc<Process>> {
        match self.lookup(handle, desired)? {
            KernelObject::Process(process) => Ok(process),
            KernelObject::Thread(_) => Err(KernelError::InvalidHandle(handle.value())),
        }
    }

    /// Drop every entry and refuse new ones
    pub fn kill(&self) -> usize {
        self.killed.store(true, Ordering::Release);
        let closed = self.entries.len();
        self.entries.clear();
        debug!("Handle table killed, {} handles closed", closed);
        closed
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
