//! Blocking counting semaphore
//!
//! The scheduler-integrated primitive behind every wait in the kernel-object
//! layer: millisecond timeouts, an ISR-safe give/take pair, and invalidation
//! so a destroyed object wakes everyone blocked on it.

use super::error::{KResult, KernelError};
use serde::{Deserialize, Serialize};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long a blocking call may wait
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeout {
    /// Wait until the event happens
    #[default]
    Forever,
    /// Wait at most this many milliseconds (0 = poll)
    Millis(u32),
}

impl Timeout {
    /// Do not wait at all
    pub const POLL: Timeout = Timeout::Millis(0);

    pub fn is_poll(self) -> bool {
        self == Timeout::POLL
    }

    fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Forever => None,
            Timeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(u64::from(ms))),
        }
    }
}

struct Guarded<S> {
    value: S,
    valid: bool,
    /// Bumped by `interrupt`; waiters that saw an older value bail out
    interrupts: u64,
}

/// State plus a condition variable, shared by every blocking object
pub(crate) struct Waitable<S> {
    state: Mutex<Guarded<S>>,
    cond: Condvar,
}

impl<S> Waitable<S> {
    pub(crate) fn new(value: S) -> Self {
        Self {
            state: Mutex::new(Guarded {
                value,
                valid: true,
                interrupts: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Guarded<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `ready` yields a result, the timeout expires, the object
    /// is invalidated or the wait is interrupted.
    pub(crate) fn wait_for<R>(
        &self,
        timeout: Timeout,
        mut ready: impl FnMut(&mut S) -> Option<KResult<R>>,
    ) -> KResult<R> {
        let deadline = timeout.deadline();
        let mut guard = self.lock();
        let epoch = guard.interrupts;
        loop {
            if !guard.valid {
                return Err(KernelError::InvalidHandle);
            }
            if guard.interrupts != epoch {
                return Err(KernelError::Interrupted);
            }
            if let Some(result) = ready(&mut guard.value) {
                return result;
            }
            guard = match deadline {
                None => self
                    .cond
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(KernelError::Timeout);
                    }
                    self.cond
                        .wait_timeout(guard, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Run `f` on the state without blocking
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut S) -> KResult<R>) -> KResult<R> {
        let mut guard = self.lock();
        if !guard.valid {
            return Err(KernelError::InvalidHandle);
        }
        f(&mut guard.value)
    }

    /// Run `f` on the state even after invalidation
    pub(crate) fn peek<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.lock().value)
    }

    pub(crate) fn notify_one(&self) {
        self.cond.notify_one();
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    pub(crate) fn invalidate(&self) {
        self.lock().valid = false;
        self.cond.notify_all();
    }

    pub(crate) fn interrupt(&self) {
        self.lock().interrupts += 1;
        self.cond.notify_all();
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.lock().valid
    }
}

struct SemState {
    count: u32,
    max: u32,
    waiters: u32,
}

/// Counting semaphore with a fixed maximum
pub struct CountingSemaphore {
    inner: Waitable<SemState>,
}

impl CountingSemaphore {
    /// `initial` must not exceed `max`; callers validate.
    pub fn new(initial: u32, max: u32) -> Self {
        Self {
            inner: Waitable::new(SemState {
                count: initial.min(max),
                max,
                waiters: 0,
            }),
        }
    }

    /// Take one count, waiting up to `timeout`
    pub fn take(&self, timeout: Timeout) -> KResult<()> {
        let mut registered = false;
        let result = self.inner.wait_for(timeout, |s| {
            if s.count > 0 {
                s.count -= 1;
                if registered {
                    s.waiters -= 1;
                }
                Some(Ok(()))
            } else {
                if !registered {
                    s.waiters += 1;
                    registered = true;
                }
                None
            }
        });
        if result.is_err() && registered {
            self.inner.peek(|s| s.waiters = s.waiters.saturating_sub(1));
        }
        result
    }

    /// Return one count, waking one waiter. Fails with `Busy` at the maximum.
    pub fn give(&self) -> KResult<()> {
        self.inner.with(|s| {
            if s.count >= s.max {
                return Err(KernelError::Busy);
            }
            s.count += 1;
            Ok(())
        })?;
        self.inner.notify_one();
        Ok(())
    }

    /// Interrupt-context take: never blocks
    pub fn try_take_from_isr(&self) -> bool {
        self.inner
            .with(|s| {
                if s.count > 0 {
                    s.count -= 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .unwrap_or(false)
    }

    /// Interrupt-context give. Returns whether a blocked task was woken.
    pub fn give_from_isr(&self) -> KResult<bool> {
        let woke = self.inner.with(|s| {
            if s.count >= s.max {
                return Err(KernelError::Busy);
            }
            s.count += 1;
            Ok(s.waiters > 0)
        })?;
        self.inner.notify_one();
        Ok(woke)
    }

    pub fn count(&self) -> u32 {
        self.inner.with(|s| Ok(s.count)).unwrap_or(0)
    }

    pub fn max(&self) -> u32 {
        self.inner.with(|s| Ok(s.max)).unwrap_or(0)
    }

    /// Wake every waiter with `InvalidHandle`; later calls fail the same way
    pub fn invalidate(&self) {
        self.inner.invalidate();
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// Tasks currently blocked in `take`
    pub fn waiters(&self) -> u32 {
        self.inner.peek(|s| s.waiters)
    }

    pub(crate) fn interrupt(&self) {
        self.inner.interrupt();
    }
}

impl std::fmt::Debug for CountingSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingSemaphore")
            .field("count", &self.count())
            .field("max", &self.max())
            .finish()
    }
}
