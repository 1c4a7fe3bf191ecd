//! Cross-core spinlock
//!
//! A busy-wait lock that is reentrant per core: the owner is tagged with
//! the current core id plus a nesting count, so a core that already holds
//! the lock may enter it again. It never yields, so it must not be held
//! across anything that can suspend the calling thread.
//!
//! On a hosted build every thread is its own "core".

use std::cell::{RefCell, RefMut};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

const UNLOCKED: usize = 0;

/// Identifier of the executing core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreId(pub usize);

impl CoreId {
    /// The core the caller is running on. Never zero.
    pub fn current() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        thread_local! {
            static ID: usize = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        CoreId(ID.with(|id| *id))
    }
}

/// Reentrant busy-wait lock without protected data
pub struct RawSpinLock {
    /// Owning core id, or `UNLOCKED`
    owner: AtomicUsize,
    /// Only touched by the owning core
    nesting: AtomicUsize,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(UNLOCKED),
            nesting: AtomicUsize::new(0),
        }
    }

    /// Spin until the lock is held by this core
    pub fn enter(&self) -> CriticalSection<'_> {
        let me = CoreId::current().0;
        if self.owner.load(Ordering::Relaxed) != me {
            while self
                .owner
                .compare_exchange_weak(UNLOCKED, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                while self.owner.load(Ordering::Relaxed) != UNLOCKED {
                    std::hint::spin_loop();
                }
            }
        }
        self.nesting.fetch_add(1, Ordering::Relaxed);
        CriticalSection {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Take the lock only if no other core holds it
    pub fn try_enter(&self) -> Option<CriticalSection<'_>> {
        let me = CoreId::current().0;
        if self.owner.load(Ordering::Relaxed) != me
            && self
                .owner
                .compare_exchange(UNLOCKED, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return None;
        }
        self.nesting.fetch_add(1, Ordering::Relaxed);
        Some(CriticalSection {
            lock: self,
            _not_send: PhantomData,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNLOCKED
    }

    pub fn is_held_by_current_core(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == CoreId::current().0
    }

    /// Nesting depth; only meaningful on the owning core
    pub fn nesting(&self) -> usize {
        if self.is_held_by_current_core() {
            self.nesting.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    fn exit(&self) {
        if self.nesting.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(UNLOCKED, Ordering::Release);
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the current core holds a [`RawSpinLock`]. Dropping it exits
/// one nesting level.
pub struct CriticalSection<'a> {
    lock: &'a RawSpinLock,
    // Must be released on the core that entered it
    _not_send: PhantomData<*const ()>,
}

impl CriticalSection<'_> {
    pub fn nesting(&self) -> usize {
        self.lock.nesting.load(Ordering::Relaxed)
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.lock.exit();
    }
}

/// Spinlock protecting a value.
///
/// The lock itself is reentrant, but the value is not: borrowing it a second
/// time from a nested section on the same core panics, like a `RefCell`.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: RefCell<T>,
}

// SAFETY: the RefCell borrow flag and the value are only touched while
// `raw` is held, and `raw` admits one core at a time.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: RefCell::new(value),
        }
    }

    /// Acquire the lock and borrow the value.
    ///
    /// # Panics
    ///
    /// If this core already has the value borrowed through an outer guard.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let section = self.raw.enter();
        SpinLockGuard {
            data: self.data.borrow_mut(),
            _section: section,
        }
    }

    /// The underlying lock, for critical sections that do not touch the value
    pub fn raw(&self) -> &RawSpinLock {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Borrow of a [`SpinLock`]'s value; the lock is released on drop
pub struct SpinLockGuard<'a, T> {
    // Declared first so the borrow ends before the section exits
    data: RefMut<'a, T>,
    _section: CriticalSection<'a>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}
