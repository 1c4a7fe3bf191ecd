//! Kernel-object error types
//!
//! Every operation is synchronous and reports failure straight to its
//! caller. `Errno` is the libc-facing view of the same failures.

use std::fmt;

/// Kernel-object result type
pub type KResult<T> = Result<T, KernelError>;

/// Kernel-object errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// Arena slab or message block could not be allocated
    ResourceExhausted,
    /// Argument out of bounds (message size/count, semaphore limits, ...)
    InvalidArgument,
    /// Stale handle, wrong kind, or handle being destroyed
    InvalidHandle,
    /// Not a descriptor of the kind the operation needs
    BadDescriptor,
    /// Operation not allowed in the handle's current state
    NotPermitted,
    /// Payload or receive buffer does not match the queue's message size
    MessageTooLarge,
    /// Blocking wait expired
    Timeout,
    /// Non-blocking operation could not proceed
    WouldBlock,
    /// Wait aborted by an explicit interrupt
    Interrupted,
    /// Name lookup miss
    NotFound,
    /// Name already registered
    AlreadyExists,
    /// Object is in use or already at its limit
    Busy,
    /// Vtable entry or POSIX call not implemented
    NotSupported,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::ResourceExhausted => write!(f, "resource exhausted"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::InvalidHandle => write!(f, "invalid handle"),
            KernelError::BadDescriptor => write!(f, "bad descriptor"),
            KernelError::NotPermitted => write!(f, "operation not permitted"),
            KernelError::MessageTooLarge => write!(f, "message too large"),
            KernelError::Timeout => write!(f, "timed out"),
            KernelError::WouldBlock => write!(f, "would block"),
            KernelError::Interrupted => write!(f, "interrupted"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::AlreadyExists => write!(f, "already exists"),
            KernelError::Busy => write!(f, "resource busy"),
            KernelError::NotSupported => write!(f, "not supported"),
        }
    }
}

impl std::error::Error for KernelError {}

/// libc error numbers, as seen by the retargeting layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    EINTR = 4,
    EBADF = 9,
    EAGAIN = 11,
    ENOMEM = 12,
    EBUSY = 16,
    EEXIST = 17,
    EINVAL = 22,
    ENOSYS = 38,
    EMSGSIZE = 90,
    ETIMEDOUT = 110,
}

impl Errno {
    /// The raw errno value
    pub fn raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            1 => Errno::EPERM,
            2 => Errno::ENOENT,
            4 => Errno::EINTR,
            9 => Errno::EBADF,
            11 => Errno::EAGAIN,
            12 => Errno::ENOMEM,
            16 => Errno::EBUSY,
            17 => Errno::EEXIST,
            22 => Errno::EINVAL,
            38 => Errno::ENOSYS,
            90 => Errno::EMSGSIZE,
            110 => Errno::ETIMEDOUT,
            _ => return None,
        })
    }
}

impl From<KernelError> for Errno {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::ResourceExhausted => Errno::ENOMEM,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::InvalidHandle | KernelError::BadDescriptor => Errno::EBADF,
            KernelError::NotPermitted => Errno::EPERM,
            KernelError::MessageTooLarge => Errno::EMSGSIZE,
            KernelError::Timeout => Errno::ETIMEDOUT,
            KernelError::WouldBlock => Errno::EAGAIN,
            KernelError::Interrupted => Errno::EINTR,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::AlreadyExists => Errno::EEXIST,
            KernelError::Busy => Errno::EBUSY,
            KernelError::NotSupported => Errno::ENOSYS,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.raw())
    }
}

impl std::error::Error for Errno {}
