//! The kernel-object layer
//!
//! One [`Kernel`] owns the handle arena and the named-queue directory. Every
//! list mutation happens under its process-wide reentrant spinlock; every
//! blocking wait happens on a semaphore after that lock is dropped.
//!
//! - Handles are `{index, generation}` tokens into the arena
//! - Release is deferred: `release` parks, `recycle` reclaims
//! - Descriptors, queues and sync objects all share the one arena

pub mod arena;
pub mod config;
pub mod error;
pub mod fd;
pub mod fifo;
pub mod glist;
pub mod msgqueue;
pub mod object;
pub mod posix;
pub mod semaphore;
pub mod spinlock;
pub mod sync;
pub mod sysfs;



pub use arena::ArenaStats;
pub use config::KernelConfig;
pub use error::{Errno, KResult, KernelError};
pub use fd::{Fd, FdTag, FileObject, FileOps, FileSpec};
pub use msgqueue::{MqAttr, OpenFlags};
pub use object::{Handle, HandleFlags, HandleKind};
pub use semaphore::{CountingSemaphore, Timeout};
pub use spinlock::{CoreId, CriticalSection};
pub use sync::{EventWait, StaticHandle, StaticInit};
pub use sysfs::KernelSnapshot;

use arena::Arena;
use object::Payload;
use spinlock::SpinLock;
use std::collections::BTreeMap;

/// Everything guarded by the kernel spinlock
pub(crate) struct KernelState {
    pub(crate) arena: Arena,
    /// Named queues
    pub(crate) queues: BTreeMap<String, Fd>,
    /// Resolved static initializers, by `StaticHandle` key
    pub(crate) statics: BTreeMap<u64, Handle>,
}

/// Kernel context: arena, descriptor space, queue directory
pub struct Kernel {
    config: KernelConfig,
    pub(crate) state: SpinLock<KernelState>,
    /// Serializes static-initializer construction
    pub(crate) init_lock: SpinLock<()>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let arena = Arena::new(&config);
        log::debug!(
            "kernel: {} inline handles, slab size {}",
            config.inline_handles,
            config.slab_size
        );
        Self {
            config,
            state: SpinLock::new(KernelState {
                arena,
                queues: BTreeMap::new(),
                statics: BTreeMap::new(),
            }),
            init_lock: SpinLock::new(()),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Enter the kernel's critical section. Reentrant on the same core;
    /// kernel calls made while holding it nest rather than deadlock.
    pub fn critical(&self) -> CriticalSection<'_> {
        self.state.raw().enter()
    }

    /// Raw slot of the given kind with no payload
    pub fn acquire(&self, kind: HandleKind) -> KResult<Handle> {
        self.state.lock().arena.acquire(kind)
    }

    /// First phase of destruction, dispatched by kind.
    ///
    /// Descriptors run their vtable `close` first; a failing close leaves
    /// everything in place. Afterwards the descriptor's managed readiness
    /// semaphores and the descriptor itself are parked for `recycle`.
    /// Synchronization objects wake their waiters with `InvalidHandle`.
    pub fn release(&self, handle: Handle) -> KResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let slot = state
            .arena
            .slot_mut(handle)
            .ok_or(KernelError::InvalidHandle)?;
        if slot.flags.contains(HandleFlags::DESTROYING) {
            return Err(KernelError::NotPermitted);
        }

        let kind = slot.kind;
        let flags = slot.flags;
        match kind {
            HandleKind::Fd => {
                // A bare FD slot has no file object and nothing to close
                let subs = match &mut slot.payload {
                    Payload::File(file) => {
                        if let Some(close) = file.ops().close {
                            close(file)?;
                        }
                        [file.read_rdy(), file.write_rdy()]
                    }
                    _ => [None, None],
                };
                for sub in subs.into_iter().flatten() {
                    let managed = state
                        .arena
                        .lookup(sub)
                        .is_ok_and(|slot| slot.is_managed());
                    if managed {
                        state.arena.retire(sub)?;
                    }
                }
                state.queues.retain(|_, fd| *fd != handle);
                state.arena.retire(handle)?;
            }
            _ if kind.is_sync() => {
                state.arena.retire(handle)?;
                if flags.contains(HandleFlags::INITIALIZER) {
                    state.statics.retain(|_, h| *h != handle);
                }
            }
            _ => return Err(KernelError::InvalidHandle),
        }
        log::trace!("kernel: released {}", handle);
        Ok(())
    }

    /// Second phase: reclaim every released slot. Call from a context that
    /// does not race with acquire or release.
    pub fn recycle(&self) -> usize {
        self.state.lock().arena.recycle()
    }

    pub fn stats(&self) -> ArenaStats {
        self.state.lock().arena.stats()
    }

    /// Kind of a live handle
    pub fn kind_of(&self, handle: Handle) -> KResult<HandleKind> {
        Ok(self.state.lock().arena.lookup(handle)?.kind)
    }

    /// Flags of an acquired handle, including one that is mid-destruction
    pub fn handle_flags(&self, handle: Handle) -> KResult<HandleFlags> {
        self.state
            .lock()
            .arena
            .slot(handle)
            .map(|slot| slot.flags)
            .ok_or(KernelError::InvalidHandle)
    }

    /// Whether the handle's slot sits on the free-list
    pub fn in_free_list(&self, handle: Handle) -> bool {
        self.state.lock().arena.is_free(handle)
    }

    /// Whether the handle's slot waits on the destroying-list
    pub fn is_destroying(&self, handle: Handle) -> bool {
        self.state.lock().arena.is_destroying(handle)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_recycle() {
        let k = Kernel::new();
        let h = k.semaphore_create(0, 1).unwrap();
        k.release(h).unwrap();
        assert!(!k.in_free_list(h));
        assert!(k.is_destroying(h));
        assert!(k.handle_flags(h).unwrap().contains(HandleFlags::DESTROYING));
        assert_eq!(k.release(h), Err(KernelError::NotPermitted));

        assert_eq!(k.recycle(), 1);
        assert!(k.in_free_list(h));
        assert_eq!(k.release(h), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn test_release_of_plain_kind_is_invalid() {
        let k = Kernel::new();
        let tcb = k.acquire(HandleKind::Tcb).unwrap();
        assert_eq!(k.kind_of(tcb), Ok(HandleKind::Tcb));
        assert_eq!(k.release(tcb), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn test_release_of_bare_fd_slot() {
        let k = Kernel::new();
        let fd = k.acquire(HandleKind::Fd).unwrap();
        assert_eq!(k.release(fd), Ok(()));
        assert!(k.is_destroying(fd));
        assert_eq!(k.stats().live, 0);
        assert_eq!(k.recycle(), 1);
        assert!(k.in_free_list(fd));
        assert_eq!(k.kind_of(fd), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn test_critical_section_nests_with_kernel_calls() {
        let k = Kernel::new();
        let outer = k.critical();
        let h = k.semaphore_create(1, 1).unwrap();
        assert_eq!(k.semaphore_count(h), Ok(1));
        assert_eq!(outer.nesting(), 1);
        drop(outer);
        assert!(!k.state.raw().is_locked());
    }

    #[test]
    fn test_config_is_applied() {
        let k = Kernel::with_config(KernelConfig::default().inline_handles(3));
        assert_eq!(k.config().inline_handles, 3);
        assert_eq!(k.stats().total, 3);
    }
}
