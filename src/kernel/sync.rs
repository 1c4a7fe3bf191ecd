//! Synchronization-object handles
//!
//! Semaphores, mutexes, event groups and reader/writer locks stored in arena
//! slots. Blocking calls resolve the handle under the kernel spinlock, drop
//! it, and only then wait on the object itself.
//!
//! [`StaticHandle`] is the static-initializer form: a const-constructible
//! description that becomes a real object on first use, under the kernel's
//! dedicated initialization lock. Each [`Kernel`] keeps its own table of
//! resolved statics, so one `StaticHandle` names a distinct object in every
//! kernel that uses it.

use super::error::{KResult, KernelError};
use super::object::{Handle, HandleFlags, HandleKind, Payload};
use super::semaphore::{CountingSemaphore, Timeout, Waitable};
use super::spinlock::CoreId;
use super::Kernel;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct MutexState {
    owner: Option<CoreId>,
    depth: u32,
}

/// Owner-tracking mutex, optionally recursive
pub struct MutexObject {
    recursive: bool,
    inner: Waitable<MutexState>,
}

impl MutexObject {
    pub(crate) fn new(recursive: bool) -> Self {
        Self {
            recursive,
            inner: Waitable::new(MutexState {
                owner: None,
                depth: 0,
            }),
        }
    }

    fn lock(&self, timeout: Timeout) -> KResult<()> {
        let me = CoreId::current();
        let recursive = self.recursive;
        self.inner.wait_for(timeout, |s| match s.owner {
            None => {
                s.owner = Some(me);
                s.depth = 1;
                Some(Ok(()))
            }
            Some(owner) if owner == me => {
                if recursive {
                    s.depth += 1;
                    Some(Ok(()))
                } else {
                    Some(Err(KernelError::Busy))
                }
            }
            Some(_) => None,
        })
    }

    fn unlock(&self) -> KResult<()> {
        let me = CoreId::current();
        let released = self.inner.with(|s| {
            if s.owner != Some(me) {
                return Err(KernelError::NotPermitted);
            }
            s.depth -= 1;
            if s.depth == 0 {
                s.owner = None;
            }
            Ok(s.depth == 0)
        })?;
        if released {
            self.inner.notify_one();
        }
        Ok(())
    }

    fn owner(&self) -> KResult<Option<CoreId>> {
        self.inner.with(|s| Ok(s.owner))
    }

    pub(crate) fn invalidate(&self) {
        self.inner.invalidate();
    }

    pub(crate) fn interrupt(&self) {
        self.inner.interrupt();
    }
}

/// How `event_wait` matches and consumes bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventWait {
    /// Every requested bit must be set (otherwise any one will do)
    pub all: bool,
    /// Clear the requested bits once the wait is satisfied
    pub clear: bool,
}

/// 32-bit event flag group
pub struct EventGroup {
    inner: Waitable<u32>,
}

impl EventGroup {
    pub(crate) fn new() -> Self {
        Self {
            inner: Waitable::new(0),
        }
    }

    fn set(&self, bits: u32) -> KResult<u32> {
        let now = self.inner.with(|b| {
            *b |= bits;
            Ok(*b)
        })?;
        self.inner.notify_all();
        Ok(now)
    }

    fn clear(&self, bits: u32) -> KResult<u32> {
        self.inner.with(|b| {
            *b &= !bits;
            Ok(*b)
        })
    }

    fn wait(&self, mask: u32, mode: EventWait, timeout: Timeout) -> KResult<u32> {
        if mask == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.inner.wait_for(timeout, |b| {
            let hit = *b & mask;
            let satisfied = if mode.all { hit == mask } else { hit != 0 };
            if !satisfied {
                return None;
            }
            let seen = *b;
            if mode.clear {
                *b &= !mask;
            }
            Some(Ok(seen))
        })
    }

    fn bits(&self) -> KResult<u32> {
        self.inner.with(|b| Ok(*b))
    }

    pub(crate) fn invalidate(&self) {
        self.inner.invalidate();
    }

    pub(crate) fn interrupt(&self) {
        self.inner.interrupt();
    }
}

struct RwState {
    readers: u32,
    writer: Option<CoreId>,
}

/// Many-readers/one-writer lock
pub struct RwLockObject {
    inner: Waitable<RwState>,
}

impl RwLockObject {
    pub(crate) fn new() -> Self {
        Self {
            inner: Waitable::new(RwState {
                readers: 0,
                writer: None,
            }),
        }
    }

    fn read(&self, timeout: Timeout) -> KResult<()> {
        let me = CoreId::current();
        self.inner.wait_for(timeout, |s| match s.writer {
            None => {
                s.readers += 1;
                Some(Ok(()))
            }
            Some(writer) if writer == me => Some(Err(KernelError::Busy)),
            Some(_) => None,
        })
    }

    fn write(&self, timeout: Timeout) -> KResult<()> {
        let me = CoreId::current();
        self.inner.wait_for(timeout, |s| match s.writer {
            Some(writer) if writer == me => Some(Err(KernelError::Busy)),
            None if s.readers == 0 => {
                s.writer = Some(me);
                Some(Ok(()))
            }
            _ => None,
        })
    }

    fn unlock(&self) -> KResult<()> {
        let me = CoreId::current();
        self.inner.with(|s| {
            if s.writer == Some(me) {
                s.writer = None;
            } else if s.readers > 0 {
                s.readers -= 1;
            } else {
                return Err(KernelError::NotPermitted);
            }
            Ok(())
        })?;
        self.inner.notify_all();
        Ok(())
    }

    pub(crate) fn invalidate(&self) {
        self.inner.invalidate();
    }

    pub(crate) fn interrupt(&self) {
        self.inner.interrupt();
    }
}

/// What a [`StaticHandle`] turns into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticInit {
    Mutex { recursive: bool },
    Semaphore { initial: u32, max: u32 },
    Event,
    RwLock,
}

/// Static initializer for a synchronization object.
///
/// ```ignore
/// static LOG_LOCK: StaticHandle = StaticHandle::mutex();
///
/// let h = kernel.resolve_static(&LOG_LOCK)?;
/// kernel.mutex_lock(h, Timeout::Forever)?;
/// ```
pub struct StaticHandle {
    init: StaticInit,
    /// Identity in every kernel's static table, 0 until first use
    key: AtomicU64,
}

impl StaticHandle {
    pub const fn new(init: StaticInit) -> Self {
        Self {
            init,
            key: AtomicU64::new(0),
        }
    }

    pub const fn mutex() -> Self {
        Self::new(StaticInit::Mutex { recursive: false })
    }

    pub const fn recursive_mutex() -> Self {
        Self::new(StaticInit::Mutex { recursive: true })
    }

    pub const fn semaphore(initial: u32, max: u32) -> Self {
        Self::new(StaticInit::Semaphore { initial, max })
    }

    pub const fn event() -> Self {
        Self::new(StaticInit::Event)
    }

    pub const fn rwlock() -> Self {
        Self::new(StaticInit::RwLock)
    }

    pub fn init(&self) -> StaticInit {
        self.init
    }

    /// Process-unique key, assigned on first call
    pub(crate) fn key(&self) -> u64 {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let key = self.key.load(Ordering::Acquire);
        if key != 0 {
            return key;
        }
        let fresh = NEXT.fetch_add(1, Ordering::Relaxed);
        match self
            .key
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(winner) => winner,
        }
    }
}

fn build(init: StaticInit) -> KResult<(HandleKind, HandleFlags, Payload)> {
    Ok(match init {
        StaticInit::Mutex { recursive } => (
            HandleKind::Mutex,
            if recursive {
                HandleFlags::RECURSIVE
            } else {
                HandleFlags::empty()
            },
            Payload::Mutex(Arc::new(MutexObject::new(recursive))),
        ),
        StaticInit::Semaphore { initial, max } => {
            if max == 0 || initial > max {
                return Err(KernelError::InvalidArgument);
            }
            (
                HandleKind::Semaphore,
                HandleFlags::empty(),
                Payload::Semaphore(Arc::new(CountingSemaphore::new(initial, max))),
            )
        }
        StaticInit::Event => (
            HandleKind::Event,
            HandleFlags::empty(),
            Payload::Event(Arc::new(EventGroup::new())),
        ),
        StaticInit::RwLock => (
            HandleKind::RwLock,
            HandleFlags::empty(),
            Payload::RwLock(Arc::new(RwLockObject::new())),
        ),
    })
}

impl Kernel {
    fn create_sync(&self, init: StaticInit, extra: HandleFlags) -> KResult<Handle> {
        let (kind, flags, payload) = build(init)?;
        self.state
            .lock()
            .arena
            .acquire_with(kind, flags | extra, payload)
    }

    /// Object behind a live handle, or `InvalidHandle` on a kind mismatch
    fn sync_payload<T>(&self, handle: Handle, pick: impl FnOnce(&Payload) -> Option<T>) -> KResult<T> {
        let state = self.state.lock();
        let slot = state.arena.lookup(handle)?;
        pick(&slot.payload).ok_or(KernelError::InvalidHandle)
    }

    pub(crate) fn semaphore_object(&self, handle: Handle) -> KResult<Arc<CountingSemaphore>> {
        self.sync_payload(handle, |p| match p {
            Payload::Semaphore(s) => Some(Arc::clone(s)),
            _ => None,
        })
    }

    fn mutex_object(&self, handle: Handle) -> KResult<Arc<MutexObject>> {
        self.sync_payload(handle, |p| match p {
            Payload::Mutex(m) => Some(Arc::clone(m)),
            _ => None,
        })
    }

    fn event_object(&self, handle: Handle) -> KResult<Arc<EventGroup>> {
        self.sync_payload(handle, |p| match p {
            Payload::Event(e) => Some(Arc::clone(e)),
            _ => None,
        })
    }

    fn rwlock_object(&self, handle: Handle) -> KResult<Arc<RwLockObject>> {
        self.sync_payload(handle, |p| match p {
            Payload::RwLock(r) => Some(Arc::clone(r)),
            _ => None,
        })
    }

    /// New counting semaphore; `initial <= max` and `max > 0`
    pub fn semaphore_create(&self, initial: u32, max: u32) -> KResult<Handle> {
        self.create_sync(StaticInit::Semaphore { initial, max }, HandleFlags::empty())
    }

    /// Semaphore whose waits cannot be interrupted
    pub fn semaphore_create_uninterruptible(&self, initial: u32, max: u32) -> KResult<Handle> {
        self.create_sync(StaticInit::Semaphore { initial, max }, HandleFlags::NO_INTR)
    }

    pub fn semaphore_take(&self, handle: Handle, timeout: Timeout) -> KResult<()> {
        self.semaphore_object(handle)?.take(timeout)
    }

    pub fn semaphore_give(&self, handle: Handle) -> KResult<()> {
        self.semaphore_object(handle)?.give()
    }

    pub fn semaphore_give_from_isr(&self, handle: Handle) -> KResult<bool> {
        self.semaphore_object(handle)?.give_from_isr()
    }

    pub fn semaphore_count(&self, handle: Handle) -> KResult<u32> {
        Ok(self.semaphore_object(handle)?.count())
    }

    pub fn mutex_create(&self, recursive: bool) -> KResult<Handle> {
        self.create_sync(StaticInit::Mutex { recursive }, HandleFlags::empty())
    }

    /// Lock; re-locking a non-recursive mutex from its owner fails with `Busy`
    pub fn mutex_lock(&self, handle: Handle, timeout: Timeout) -> KResult<()> {
        self.mutex_object(handle)?.lock(timeout)
    }

    /// Unlock; only the owning core may unlock (`NotPermitted` otherwise)
    pub fn mutex_unlock(&self, handle: Handle) -> KResult<()> {
        self.mutex_object(handle)?.unlock()
    }

    pub fn mutex_owner(&self, handle: Handle) -> KResult<Option<CoreId>> {
        self.mutex_object(handle)?.owner()
    }

    pub fn event_create(&self) -> KResult<Handle> {
        self.create_sync(StaticInit::Event, HandleFlags::empty())
    }

    /// Set bits, waking waiters; returns the resulting bits
    pub fn event_set(&self, handle: Handle, bits: u32) -> KResult<u32> {
        self.event_object(handle)?.set(bits)
    }

    pub fn event_clear(&self, handle: Handle, bits: u32) -> KResult<u32> {
        self.event_object(handle)?.clear(bits)
    }

    /// Wait for `mask`; returns the group's bits at the moment it matched
    pub fn event_wait(
        &self,
        handle: Handle,
        mask: u32,
        mode: EventWait,
        timeout: Timeout,
    ) -> KResult<u32> {
        self.event_object(handle)?.wait(mask, mode, timeout)
    }

    pub fn event_bits(&self, handle: Handle) -> KResult<u32> {
        self.event_object(handle)?.bits()
    }

    pub fn rwlock_create(&self) -> KResult<Handle> {
        self.create_sync(StaticInit::RwLock, HandleFlags::empty())
    }

    pub fn rwlock_read(&self, handle: Handle, timeout: Timeout) -> KResult<()> {
        self.rwlock_object(handle)?.read(timeout)
    }

    pub fn rwlock_write(&self, handle: Handle, timeout: Timeout) -> KResult<()> {
        self.rwlock_object(handle)?.write(timeout)
    }

    pub fn rwlock_unlock(&self, handle: Handle) -> KResult<()> {
        self.rwlock_object(handle)?.unlock()
    }

    /// Abort every wait currently blocked on a synchronization object
    pub fn interrupt(&self, handle: Handle) -> KResult<()> {
        let state = self.state.lock();
        let slot = state.arena.lookup(handle)?;
        if slot.flags.contains(HandleFlags::NO_INTR) {
            return Err(KernelError::NotPermitted);
        }
        slot.payload.interrupt()
    }

    /// Construct a static initializer's object on first use in this kernel.
    ///
    /// Double-checked: the fast path is one table lookup; construction
    /// happens at most once per kernel, under the initialization lock.
    /// Releasing the object forgets it, so the next call builds a new one.
    pub fn resolve_static(&self, handle: &StaticHandle) -> KResult<Handle> {
        let key = handle.key();
        if let Some(resolved) = self.static_handle(handle) {
            return Ok(resolved);
        }

        let _init = self.init_lock.lock();
        let mut state = self.state.lock();
        if let Some(&resolved) = state.statics.get(&key) {
            return Ok(resolved);
        }
        let (kind, flags, payload) = build(handle.init)?;
        let resolved = state.arena.insert_static(kind, flags, payload)?;
        state.statics.insert(key, resolved);
        drop(state);
        log::debug!("static {} constructed as {}", kind.name(), resolved);
        Ok(resolved)
    }

    /// Object this kernel built for `handle`, if any
    pub fn static_handle(&self, handle: &StaticHandle) -> Option<Handle> {
        self.state.lock().statics.get(&handle.key()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_semaphore_handle() {
        let k = Kernel::new();
        let s = k.semaphore_create(1, 2).unwrap();
        assert_eq!(k.kind_of(s), Ok(HandleKind::Semaphore));
        k.semaphore_take(s, Timeout::POLL).unwrap();
        assert_eq!(k.semaphore_take(s, Timeout::POLL), Err(KernelError::Timeout));
        k.semaphore_give(s).unwrap();
        assert_eq!(k.semaphore_count(s), Ok(1));
    }

    #[test]
    fn test_semaphore_bad_limits() {
        let k = Kernel::new();
        assert_eq!(k.semaphore_create(3, 2), Err(KernelError::InvalidArgument));
        assert_eq!(k.semaphore_create(0, 0), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_wrong_kind_is_invalid_handle() {
        let k = Kernel::new();
        let m = k.mutex_create(false).unwrap();
        assert_eq!(k.semaphore_give(m), Err(KernelError::InvalidHandle));
        assert_eq!(k.event_set(m, 1), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn test_mutex_ownership() {
        let k = Arc::new(Kernel::new());
        let m = k.mutex_create(false).unwrap();
        k.mutex_lock(m, Timeout::POLL).unwrap();
        assert_eq!(k.mutex_owner(m), Ok(Some(CoreId::current())));
        assert_eq!(k.mutex_lock(m, Timeout::POLL), Err(KernelError::Busy));

        let other = Arc::clone(&k);
        let res = thread::spawn(move || {
            (
                other.mutex_lock(m, Timeout::Millis(10)),
                other.mutex_unlock(m),
            )
        })
        .join()
        .unwrap();
        assert_eq!(res, (Err(KernelError::Timeout), Err(KernelError::NotPermitted)));

        k.mutex_unlock(m).unwrap();
        assert_eq!(k.mutex_owner(m), Ok(None));
    }

    #[test]
    fn test_recursive_mutex() {
        let k = Kernel::new();
        let m = k.mutex_create(true).unwrap();
        assert!(k.handle_flags(m).unwrap().contains(HandleFlags::RECURSIVE));
        k.mutex_lock(m, Timeout::POLL).unwrap();
        k.mutex_lock(m, Timeout::POLL).unwrap();
        k.mutex_unlock(m).unwrap();
        assert!(k.mutex_owner(m).unwrap().is_some());
        k.mutex_unlock(m).unwrap();
        assert_eq!(k.mutex_owner(m), Ok(None));
        assert_eq!(k.mutex_unlock(m), Err(KernelError::NotPermitted));
    }

    #[test]
    fn test_event_any_and_all() {
        let k = Arc::new(Kernel::new());
        let e = k.event_create().unwrap();
        k.event_set(e, 0b01).unwrap();
        let any = EventWait::default();
        assert_eq!(k.event_wait(e, 0b11, any, Timeout::POLL), Ok(0b01));

        let all = EventWait {
            all: true,
            clear: true,
        };
        assert_eq!(k.event_wait(e, 0b11, all, Timeout::POLL), Err(KernelError::Timeout));

        let setter = Arc::clone(&k);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.event_set(e, 0b10).unwrap();
        });
        assert_eq!(k.event_wait(e, 0b11, all, Timeout::Forever), Ok(0b11));
        t.join().unwrap();
        assert_eq!(k.event_bits(e), Ok(0));
        assert_eq!(k.event_wait(e, 0, any, Timeout::POLL), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_rwlock_readers_exclude_writer() {
        let k = Arc::new(Kernel::new());
        let rw = k.rwlock_create().unwrap();
        k.rwlock_read(rw, Timeout::POLL).unwrap();
        k.rwlock_read(rw, Timeout::POLL).unwrap();

        let other = Arc::clone(&k);
        let writer = thread::spawn(move || other.rwlock_write(rw, Timeout::Millis(10)));
        assert_eq!(writer.join().unwrap(), Err(KernelError::Timeout));

        k.rwlock_unlock(rw).unwrap();
        k.rwlock_unlock(rw).unwrap();
        k.rwlock_write(rw, Timeout::POLL).unwrap();
        assert_eq!(k.rwlock_read(rw, Timeout::POLL), Err(KernelError::Busy));
        k.rwlock_unlock(rw).unwrap();
        assert_eq!(k.rwlock_unlock(rw), Err(KernelError::NotPermitted));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let k = Arc::new(Kernel::new());
        let s = k.semaphore_create(0, 1).unwrap();
        let sem = k.semaphore_object(s).unwrap();
        let waiter = {
            let k = Arc::clone(&k);
            thread::spawn(move || k.semaphore_take(s, Timeout::Forever))
        };
        while sem.waiters() == 0 {
            thread::yield_now();
        }
        k.release(s).unwrap();
        assert_eq!(waiter.join().unwrap(), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn test_interrupt_respects_no_intr() {
        let k = Arc::new(Kernel::new());
        let plain = k.semaphore_create(0, 1).unwrap();
        let guarded = k.semaphore_create_uninterruptible(0, 1).unwrap();
        assert_eq!(k.interrupt(guarded), Err(KernelError::NotPermitted));

        let sem = k.semaphore_object(plain).unwrap();
        let waiter = {
            let k = Arc::clone(&k);
            thread::spawn(move || k.semaphore_take(plain, Timeout::Forever))
        };
        while sem.waiters() == 0 {
            thread::yield_now();
        }
        k.interrupt(plain).unwrap();
        assert_eq!(waiter.join().unwrap(), Err(KernelError::Interrupted));
    }

    #[test]
    fn test_static_handle_constructed_once() {
        let k = Kernel::new();
        let lock = StaticHandle::mutex();
        assert_eq!(k.static_handle(&lock), None);
        let a = k.resolve_static(&lock).unwrap();
        let b = k.resolve_static(&lock).unwrap();
        assert_eq!(a, b);
        assert_eq!(k.static_handle(&lock), Some(a));
        let flags = k.handle_flags(a).unwrap();
        assert!(flags.contains(HandleFlags::INITIALIZER));
        assert!(!flags.contains(HandleFlags::SYSMEM_MANAGED));
        k.mutex_lock(a, Timeout::POLL).unwrap();
        k.mutex_unlock(a).unwrap();
    }

    #[test]
    fn test_static_handle_concurrent_resolve() {
        let k = Arc::new(Kernel::new());
        let sem = Arc::new(StaticHandle::semaphore(0, 4));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let (k, sem) = (Arc::clone(&k), Arc::clone(&sem));
                thread::spawn(move || k.resolve_static(&sem).unwrap())
            })
            .collect();
        let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(handles.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(k.stats().statics, 1);
    }

    #[test]
    fn test_static_handle_is_per_kernel() {
        static A: StaticHandle = StaticHandle::mutex();
        static B: StaticHandle = StaticHandle::mutex();
        let k1 = Kernel::new();
        let k2 = Kernel::new();

        let b2 = k2.resolve_static(&B).unwrap();
        let a1 = k1.resolve_static(&A).unwrap();
        let a2 = k2.resolve_static(&A).unwrap();
        assert_ne!(a2, b2);
        assert_eq!(k1.static_handle(&B), None);
        assert_eq!(k1.kind_of(a1), Ok(HandleKind::Mutex));

        // Distinct locks in k2
        k2.mutex_lock(b2, Timeout::POLL).unwrap();
        assert_eq!(k2.mutex_lock(a2, Timeout::POLL), Ok(()));
        assert_eq!(k2.stats().statics, 2);
        assert_eq!(k1.stats().statics, 1);
    }

    #[test]
    fn test_released_static_is_rebuilt() {
        let k = Kernel::new();
        let ev = StaticHandle::event();
        let old = k.resolve_static(&ev).unwrap();
        k.event_set(old, 0b1).unwrap();
        k.release(old).unwrap();
        assert_eq!(k.static_handle(&ev), None);
        k.recycle();

        let new = k.resolve_static(&ev).unwrap();
        assert_ne!(old, new);
        assert_eq!(k.event_bits(new), Ok(0));
        assert_eq!(k.stats().statics, 1);
    }
}
