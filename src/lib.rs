//! kernobj - kernel-object layer for an embedded real-time platform
//!
//! Design principles:
//! - One arena of typed handles shared by every subsystem
//! - Spinlock for list surgery, semaphores for waiting, never both at once
//! - Deferred reclamation: release parks a handle, recycle frees it
//! - Failures go straight back to the caller
//!
//! Components:
//! - `kernel::glist`: index-linked intrusive list
//! - `kernel::arena`: handle arena with two-phase destruction
//! - `kernel::sync`: semaphores, mutexes, event groups, rwlocks
//! - `kernel::fd`: descriptor vtable dispatch
//! - `kernel::msgqueue` / `kernel::posix`: priority queues and `mq_*`
//! - `kernel::fifo`: byte pipes
//!
//! ```
//! use kernobj::kernel::{Kernel, Timeout};
//!
//! let kernel = Kernel::new();
//! let q = kernel.queue_create(Some("/log"), 32, 4).unwrap();
//! kernel.queue_send(q, b"late", 7, Timeout::POLL).unwrap();
//! kernel.queue_send(q, b"early", 1, Timeout::POLL).unwrap();
//!
//! let mut buf = [0u8; 32];
//! let (prio, len) = kernel.queue_receive(q, &mut buf, Timeout::POLL).unwrap();
//! assert_eq!((prio, &buf[..len]), (1, &b"early"[..]));
//! ```

pub mod kernel;

pub use kernel::{Handle, Kernel, KernelConfig, KernelError, KResult, Timeout};
