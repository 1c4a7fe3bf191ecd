//! POSIX message-queue veneer
//!
//! `mq_*` over the kernel's priority queues. Every call returns its error
//! as an [`Errno`] and also leaves it in the calling thread's `errno`, the
//! way the libc retargeting layer expects.
//!
//! Opening a name that is already bound returns that same descriptor, so
//! the O_NONBLOCK setting belongs to the queue and is fixed at creation.

use super::error::{Errno, KResult, KernelError};
use super::fd::{Fd, FdTag};
use super::msgqueue::{MqAttr, OpenFlags};
use super::semaphore::Timeout;
use super::Kernel;
use std::cell::Cell;
use std::time::SystemTime;

/// Message-queue descriptor
pub type Mqd = Fd;

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Last error recorded on this thread by an `mq_*` call (0 if none)
pub fn errno() -> i32 {
    ERRNO.with(Cell::get)
}

pub fn set_errno(value: i32) {
    ERRNO.with(|e| e.set(value));
}

fn record<T>(result: KResult<T>) -> Result<T, Errno> {
    result.map_err(|e| {
        let errno = Errno::from(e);
        set_errno(errno.raw());
        errno
    })
}

/// Absolute deadline to a relative wait; a deadline already past is a
/// timeout before any waiting happens.
fn until(deadline: SystemTime) -> KResult<Timeout> {
    let left = deadline
        .duration_since(SystemTime::now())
        .map_err(|_| KernelError::Timeout)?;
    if left.is_zero() {
        return Err(KernelError::Timeout);
    }
    let ms = left.as_micros().div_ceil(1000).max(1);
    Ok(Timeout::Millis(u32::try_from(ms).unwrap_or(u32::MAX)))
}

fn check_mqd(kernel: &Kernel, mqd: Mqd) -> KResult<()> {
    if kernel.fd_tag(mqd)?.contains(FdTag::MQD) {
        Ok(())
    } else {
        Err(KernelError::BadDescriptor)
    }
}

fn is_nonblocking(kernel: &Kernel, mqd: Mqd) -> KResult<bool> {
    let flags = OpenFlags::from_bits_truncate(kernel.queue_attr(mqd)?.mq_flags);
    Ok(flags.contains(OpenFlags::NONBLOCK))
}

/// `Timeout` from a poll means the queue was full or empty
fn would_block(err: KernelError) -> KernelError {
    match err {
        KernelError::Timeout => KernelError::WouldBlock,
        other => other,
    }
}

fn open(kernel: &Kernel, name: &str, oflag: OpenFlags, attr: Option<&MqAttr>) -> KResult<Mqd> {
    if !oflag.contains(OpenFlags::CREAT) {
        return kernel.queue_lookup(name);
    }
    let attr = attr.copied().unwrap_or_default();
    let keep = oflag - (OpenFlags::CREAT | OpenFlags::EXCL);
    loop {
        match kernel.queue_lookup(name) {
            Ok(_) if oflag.contains(OpenFlags::EXCL) => return Err(KernelError::AlreadyExists),
            Ok(mqd) => return Ok(mqd),
            Err(KernelError::NotFound) => {}
            Err(e) => return Err(e),
        }
        match kernel.queue_create_with(Some(name), attr.mq_msgsize, attr.mq_maxmsg, keep) {
            // Lost a creation race; open the winner's queue
            Err(KernelError::AlreadyExists) if !oflag.contains(OpenFlags::EXCL) => continue,
            result => return result,
        }
    }
}

/// Open (or with O_CREAT, create) the queue bound to `name`
pub fn mq_open(
    kernel: &Kernel,
    name: &str,
    oflag: OpenFlags,
    attr: Option<&MqAttr>,
) -> Result<Mqd, Errno> {
    record(open(kernel, name, oflag, attr))
}

pub fn mq_close(kernel: &Kernel, mqd: Mqd) -> Result<(), Errno> {
    record(check_mqd(kernel, mqd).and_then(|()| kernel.close(mqd)))
}

/// Remove the name only; open descriptors keep working until closed
pub fn mq_unlink(kernel: &Kernel, name: &str) -> Result<(), Errno> {
    record(kernel.queue_unlink(name).map(|_| ()))
}

pub fn mq_getattr(kernel: &Kernel, mqd: Mqd) -> Result<MqAttr, Errno> {
    record(kernel.queue_attr(mqd))
}

pub fn mq_setattr(_kernel: &Kernel, _mqd: Mqd, _attr: &MqAttr) -> Result<MqAttr, Errno> {
    record(Err(KernelError::NotSupported))
}

pub fn mq_notify(_kernel: &Kernel, _mqd: Mqd) -> Result<(), Errno> {
    record(Err(KernelError::NotSupported))
}

fn send(kernel: &Kernel, mqd: Mqd, msg: &[u8], prio: u32, timeout: Timeout) -> KResult<()> {
    if is_nonblocking(kernel, mqd)? {
        return kernel
            .queue_send(mqd, msg, prio, Timeout::POLL)
            .map_err(would_block);
    }
    kernel.queue_send(mqd, msg, prio, timeout)
}

fn receive(kernel: &Kernel, mqd: Mqd, buf: &mut [u8], timeout: Timeout) -> KResult<(usize, u32)> {
    let (prio, len) = if is_nonblocking(kernel, mqd)? {
        kernel
            .queue_receive(mqd, buf, Timeout::POLL)
            .map_err(would_block)?
    } else {
        kernel.queue_receive(mqd, buf, timeout)?
    };
    Ok((len, prio))
}

pub fn mq_send(kernel: &Kernel, mqd: Mqd, msg: &[u8], prio: u32) -> Result<(), Errno> {
    record(send(kernel, mqd, msg, prio, Timeout::Forever))
}

/// Returns `(length, priority)` of the received message
pub fn mq_receive(kernel: &Kernel, mqd: Mqd, buf: &mut [u8]) -> Result<(usize, u32), Errno> {
    record(receive(kernel, mqd, buf, Timeout::Forever))
}

pub fn mq_timedsend(
    kernel: &Kernel,
    mqd: Mqd,
    msg: &[u8],
    prio: u32,
    abs_timeout: SystemTime,
) -> Result<(), Errno> {
    record(until(abs_timeout).and_then(|timeout| send(kernel, mqd, msg, prio, timeout)))
}

pub fn mq_timedreceive(
    kernel: &Kernel,
    mqd: Mqd,
    buf: &mut [u8],
    abs_timeout: SystemTime,
) -> Result<(usize, u32), Errno> {
    record(until(abs_timeout).and_then(|timeout| receive(kernel, mqd, buf, timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rdwr_creat() -> OpenFlags {
        OpenFlags::RDWR | OpenFlags::CREAT
    }

    #[test]
    fn test_open_create_then_reopen() {
        let k = Kernel::new();
        let a = mq_open(&k, "/q", rdwr_creat(), None).unwrap();
        let b = mq_open(&k, "/q", OpenFlags::RDWR, None).unwrap();
        assert_eq!(a, b);
        let attr = mq_getattr(&k, a).unwrap();
        assert_eq!(attr.mq_maxmsg, 10);
        assert_eq!(attr.mq_msgsize, 128);
        assert_eq!(attr.mq_flags, 0);
    }

    #[test]
    fn test_getattr_reports_only_nonblock() {
        let k = Kernel::new();
        let q = mq_open(&k, "/flags", rdwr_creat() | OpenFlags::NONBLOCK, None).unwrap();
        assert_eq!(mq_getattr(&k, q).unwrap().mq_flags, OpenFlags::NONBLOCK.bits());
        let w = mq_open(&k, "/wr", OpenFlags::WRONLY | OpenFlags::CREAT, None).unwrap();
        assert_eq!(mq_getattr(&k, w).unwrap().mq_flags, 0);
    }

    #[test]
    fn test_open_missing_and_exclusive() {
        let k = Kernel::new();
        assert_eq!(mq_open(&k, "/none", OpenFlags::RDWR, None), Err(Errno::ENOENT));
        assert_eq!(errno(), Errno::ENOENT.raw());
        mq_open(&k, "/x", rdwr_creat(), None).unwrap();
        assert_eq!(
            mq_open(&k, "/x", rdwr_creat() | OpenFlags::EXCL, None),
            Err(Errno::EEXIST)
        );
    }

    #[test]
    fn test_open_rejects_bad_attr() {
        let k = Kernel::new();
        let attr = MqAttr {
            mq_msgsize: 2048,
            ..MqAttr::default()
        };
        assert_eq!(mq_open(&k, "/big", rdwr_creat(), Some(&attr)), Err(Errno::EINVAL));
        assert_eq!(errno(), 22);
    }

    #[test]
    fn test_send_receive() {
        let k = Kernel::new();
        let attr = MqAttr {
            mq_maxmsg: 4,
            mq_msgsize: 32,
            ..MqAttr::default()
        };
        let q = mq_open(&k, "/io", rdwr_creat(), Some(&attr)).unwrap();
        mq_send(&k, q, b"low", 7).unwrap();
        mq_send(&k, q, b"high", 1).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(mq_receive(&k, q, &mut buf), Ok((4, 1)));
        assert_eq!(&buf[..4], b"high");
        assert_eq!(mq_receive(&k, q, &mut buf), Ok((3, 7)));
        let mut small = [0u8; 8];
        assert_eq!(mq_receive(&k, q, &mut small), Err(Errno::EMSGSIZE));
    }

    #[test]
    fn test_nonblocking_empty_and_full() {
        let k = Kernel::new();
        let attr = MqAttr {
            mq_maxmsg: 1,
            mq_msgsize: 8,
            ..MqAttr::default()
        };
        let q = mq_open(&k, "/nb", rdwr_creat() | OpenFlags::NONBLOCK, Some(&attr)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(mq_receive(&k, q, &mut buf), Err(Errno::EAGAIN));
        mq_send(&k, q, b"one", 0).unwrap();
        assert_eq!(mq_send(&k, q, b"two", 0), Err(Errno::EAGAIN));
        assert_eq!(errno(), Errno::EAGAIN.raw());
    }

    #[test]
    fn test_timed_calls() {
        let k = Kernel::new();
        let q = mq_open(&k, "/t", rdwr_creat(), None).unwrap();
        let mut buf = [0u8; 128];
        let past = SystemTime::now() - Duration::from_secs(1);
        assert_eq!(mq_timedsend(&k, q, b"x", 0, past), Err(Errno::ETIMEDOUT));

        let soon = SystemTime::now() + Duration::from_millis(20);
        assert_eq!(mq_timedreceive(&k, q, &mut buf, soon), Err(Errno::ETIMEDOUT));

        let later = SystemTime::now() + Duration::from_secs(5);
        mq_timedsend(&k, q, b"x", 3, later).unwrap();
        assert_eq!(mq_timedreceive(&k, q, &mut buf, later), Ok((1, 3)));
    }

    #[test]
    fn test_unlink_keeps_descriptor() {
        let k = Kernel::new();
        let q = mq_open(&k, "/u", rdwr_creat(), None).unwrap();
        mq_unlink(&k, "/u").unwrap();
        assert_eq!(mq_open(&k, "/u", OpenFlags::RDWR, None), Err(Errno::ENOENT));
        assert_eq!(mq_unlink(&k, "/u"), Err(Errno::ENOENT));
        mq_send(&k, q, b"still here", 0).unwrap();
        mq_close(&k, q).unwrap();
        assert_eq!(mq_close(&k, q), Err(Errno::EBADF));
    }

    #[test]
    fn test_close_rejects_other_descriptors() {
        let k = Kernel::new();
        let fifo = k.fifo_create(16).unwrap();
        assert_eq!(mq_close(&k, fifo), Err(Errno::EBADF));
    }

    #[test]
    fn test_unsupported_calls() {
        let k = Kernel::new();
        let q = mq_open(&k, "/n", rdwr_creat(), None).unwrap();
        assert_eq!(mq_setattr(&k, q, &MqAttr::default()), Err(Errno::ENOSYS));
        assert_eq!(mq_notify(&k, q), Err(Errno::ENOSYS));
    }

    #[test]
    fn test_errno_is_per_thread() {
        set_errno(0);
        let k = Kernel::new();
        let _ = mq_open(&k, "/missing", OpenFlags::RDWR, None);
        assert_eq!(errno(), Errno::ENOENT.raw());
        let other = std::thread::spawn(errno).join().unwrap();
        assert_eq!(other, 0);
    }
}
