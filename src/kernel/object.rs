//! Kernel objects
//!
//! Every kernel object (semaphore, mutex, descriptor, queue) lives in a
//! fixed-size arena slot. Callers only ever see a [`Handle`]: the slot index
//! plus the generation the slot had when it was handed out, so a token that
//! outlives its object is rejected instead of aliasing the slot's next tenant.

use super::error::{KResult, KernelError};
use super::fd::FileObject;
use super::glist::NodeId;
use super::semaphore::CountingSemaphore;
use super::sync::{EventGroup, MutexObject, RwLockObject};
use bitflags::bitflags;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Opaque token naming a kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: NodeId,
    generation: u32,
}

impl Handle {
    pub(crate) fn new(index: NodeId, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> NodeId {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Packed form, never zero for a handle the kernel issued
    pub fn raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Type tag of a slot (`cid`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum HandleKind {
    Freed = 0,
    Tcb,
    Fd,
    Semaphore,
    Event,
    Mutex,
    RwLock,
}

impl HandleKind {
    /// Synchronization-object kinds
    pub fn is_sync(self) -> bool {
        matches!(
            self,
            HandleKind::Semaphore | HandleKind::Event | HandleKind::Mutex | HandleKind::RwLock
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Freed => "freed",
            HandleKind::Tcb => "tcb",
            HandleKind::Fd => "fd",
            HandleKind::Semaphore => "semaphore",
            HandleKind::Event => "event",
            HandleKind::Mutex => "mutex",
            HandleKind::RwLock => "rwlock",
        }
    }
}

bitflags! {
    /// Per-slot state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HandleFlags: u8 {
        /// Released, waiting for the next recycle pass
        const DESTROYING = 1 << 0;
        /// Slot belongs to the arena's slabs and returns to the free-list
        const SYSMEM_MANAGED = 1 << 1;
        /// Waits on this object cannot be interrupted
        const NO_INTR = 1 << 2;
        /// Built from a static initializer
        const INITIALIZER = 1 << 3;
        /// Mutex may be re-locked by its owner
        const RECURSIVE = 1 << 4;
    }
}

/// What a slot carries, by kind
#[derive(Default)]
pub(crate) enum Payload {
    #[default]
    Empty,
    Semaphore(Arc<CountingSemaphore>),
    Mutex(Arc<MutexObject>),
    Event(Arc<EventGroup>),
    RwLock(Arc<RwLockObject>),
    File(FileObject),
}

impl Payload {
    /// Wake and fail every waiter of a synchronization payload
    pub(crate) fn invalidate(&self) {
        match self {
            Payload::Semaphore(s) => s.invalidate(),
            Payload::Mutex(m) => m.invalidate(),
            Payload::Event(e) => e.invalidate(),
            Payload::RwLock(r) => r.invalidate(),
            Payload::Empty | Payload::File(_) => {}
        }
    }

    /// Abort current waits; only synchronization payloads can be waited on
    pub(crate) fn interrupt(&self) -> KResult<()> {
        match self {
            Payload::Semaphore(s) => s.interrupt(),
            Payload::Mutex(m) => m.interrupt(),
            Payload::Event(e) => e.interrupt(),
            Payload::RwLock(r) => r.interrupt(),
            Payload::Empty | Payload::File(_) => return Err(KernelError::InvalidHandle),
        }
        Ok(())
    }
}

/// One arena slot
pub(crate) struct Slot {
    /// Free-list / destroying-list link
    pub(crate) next: Option<NodeId>,
    pub(crate) generation: u32,
    pub(crate) kind: HandleKind,
    pub(crate) flags: HandleFlags,
    pub(crate) payload: Payload,
}

impl Slot {
    pub(crate) fn freed() -> Self {
        Self {
            next: None,
            generation: 1,
            kind: HandleKind::Freed,
            flags: HandleFlags::empty(),
            payload: Payload::Empty,
        }
    }

    /// Acquired and not yet released
    pub(crate) fn is_live(&self) -> bool {
        self.kind != HandleKind::Freed && !self.flags.contains(HandleFlags::DESTROYING)
    }

    pub(crate) fn is_managed(&self) -> bool {
        self.flags.contains(HandleFlags::SYSMEM_MANAGED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_raw_roundtrip() {
        let h = Handle::new(7, 3);
        assert_eq!(Handle::from_raw(h.raw()), h);
        assert_ne!(Handle::new(0, 1).raw(), 0);
        assert_eq!(h.to_string(), "#7.3");
    }

    #[test]
    fn test_sync_kinds() {
        assert!(HandleKind::Mutex.is_sync());
        assert!(HandleKind::RwLock.is_sync());
        assert!(!HandleKind::Fd.is_sync());
        assert!(!HandleKind::Tcb.is_sync());
        assert_eq!(HandleKind::Event.name(), "event");
    }

    #[test]
    fn test_fresh_slot_is_not_live() {
        let mut slot = Slot::freed();
        assert!(!slot.is_live());
        slot.kind = HandleKind::Semaphore;
        assert!(slot.is_live());
        slot.flags.insert(HandleFlags::DESTROYING);
        assert!(!slot.is_live());
    }
}
