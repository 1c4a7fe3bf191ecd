//! FIFO descriptors
//!
//! An anonymous byte pipe behind a FIFO-tagged descriptor. Readiness is two
//! binary semaphores hung off the descriptor as `read_rdy`/`write_rdy`:
//! one token while bytes are buffered, one token while there is room.
//! A reader or writer first takes the token, then moves bytes under the
//! kernel spinlock, then hands tokens back as the buffer state warrants.

use super::error::{KResult, KernelError};
use super::fd::{self, Fd, FdTag, FileObject, FileOps, FileSpec};
use super::object::{HandleFlags, HandleKind, Payload};
use super::semaphore::{CountingSemaphore, Timeout};
use super::Kernel;
use std::collections::VecDeque;
use std::sync::Arc;

/// ioctl: bytes available to read
pub const FIONREAD: u32 = 0x541B;

/// Bounded byte buffer
#[derive(Debug)]
pub(crate) struct FifoBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl FifoBuffer {
    fn with_capacity(capacity: usize) -> KResult<Self> {
        let mut data = VecDeque::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| KernelError::ResourceExhausted)?;
        Ok(Self { data, capacity })
    }

    /// Append as much of `bytes` as fits
    fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.capacity - self.data.len());
        self.data.extend(&bytes[..n]);
        n
    }

    fn pop(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len());
        for (dst, src) in buf.iter_mut().zip(self.data.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn available(&self) -> usize {
        self.data.len()
    }

    fn has_room(&self) -> bool {
        self.data.len() < self.capacity
    }
}

struct FifoExt {
    buf: FifoBuffer,
    readable: Arc<CountingSemaphore>,
    writable: Arc<CountingSemaphore>,
}

/// Post a binary token; already posted is fine
fn signal(sema: &CountingSemaphore) -> KResult<()> {
    match sema.give() {
        Ok(()) | Err(KernelError::Busy) => Ok(()),
        Err(e) => Err(e),
    }
}

fn wait_err(timeout: Timeout) -> impl Fn(KernelError) -> KernelError {
    move |err| match err {
        KernelError::Timeout if timeout.is_poll() => KernelError::WouldBlock,
        KernelError::InvalidHandle => KernelError::BadDescriptor,
        other => other,
    }
}

fn tokens(kernel: &Kernel, fd: Fd) -> KResult<(Arc<CountingSemaphore>, Arc<CountingSemaphore>)> {
    kernel.with_ext(fd, FdTag::FIFO, |f: &mut FifoExt| {
        Ok((Arc::clone(&f.readable), Arc::clone(&f.writable)))
    })
}

fn fifo_read(kernel: &Kernel, fd: Fd, buf: &mut [u8]) -> KResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let (timeout, _) = kernel.timeouts(fd)?;
    let (readable, writable) = tokens(kernel, fd)?;
    loop {
        readable.take(timeout).map_err(wait_err(timeout))?;
        let (n, more) = kernel.with_ext(fd, FdTag::FIFO, |f: &mut FifoExt| {
            let n = f.buf.pop(buf);
            Ok((n, f.buf.available() > 0))
        })?;
        if more {
            signal(&readable)?;
        }
        if n > 0 {
            signal(&writable)?;
            return Ok(n);
        }
    }
}

fn fifo_write(kernel: &Kernel, fd: Fd, bytes: &[u8]) -> KResult<usize> {
    if bytes.is_empty() {
        return Ok(0);
    }
    let (_, timeout) = kernel.timeouts(fd)?;
    let (readable, writable) = tokens(kernel, fd)?;
    loop {
        writable.take(timeout).map_err(wait_err(timeout))?;
        let (n, room) = kernel.with_ext(fd, FdTag::FIFO, |f: &mut FifoExt| {
            let n = f.buf.push(bytes);
            Ok((n, f.buf.has_room()))
        })?;
        if room {
            signal(&writable)?;
        }
        if n > 0 {
            signal(&readable)?;
            return Ok(n);
        }
    }
}

fn fifo_ioctl(kernel: &Kernel, fd: Fd, request: u32, _arg: usize) -> KResult<usize> {
    match request {
        FIONREAD => kernel.with_ext(fd, FdTag::FIFO, |f: &mut FifoExt| Ok(f.buf.available())),
        _ => Err(KernelError::InvalidArgument),
    }
}

fn fifo_close(file: &mut FileObject) -> KResult<()> {
    let fifo = file
        .take_ext::<FifoExt>()
        .ok_or(KernelError::BadDescriptor)?;
    fifo.readable.invalidate();
    fifo.writable.invalidate();
    Ok(())
}

static FIFO_FILE_OPS: FileOps = FileOps {
    read: Some(fifo_read),
    write: Some(fifo_write),
    seek: None,
    close: Some(fifo_close),
    ioctl: Some(fifo_ioctl),
};

impl Kernel {
    /// New pipe buffering at most `capacity` bytes
    pub fn fifo_create(&self, capacity: usize) -> KResult<Fd> {
        if capacity == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let buf = FifoBuffer::with_capacity(capacity)?;
        let readable = Arc::new(CountingSemaphore::new(0, 1));
        let writable = Arc::new(CountingSemaphore::new(1, 1));

        let mut state = self.state.lock();
        let read_rdy = state.arena.acquire_with(
            HandleKind::Semaphore,
            HandleFlags::empty(),
            Payload::Semaphore(Arc::clone(&readable)),
        )?;
        let write_rdy = match state.arena.acquire_with(
            HandleKind::Semaphore,
            HandleFlags::empty(),
            Payload::Semaphore(Arc::clone(&writable)),
        ) {
            Ok(h) => h,
            Err(e) => {
                state.arena.abandon(read_rdy);
                return Err(e);
            }
        };
        let spec = FileSpec::new(FdTag::FIFO | FdTag::VIRTUAL, &FIFO_FILE_OPS)
            .ext(FifoExt {
                buf,
                readable,
                writable,
            })
            .read_rdy(read_rdy)
            .write_rdy(write_rdy);
        fd::publish(&mut state.arena, spec).inspect_err(|_| {
            state.arena.abandon(write_rdy);
            state.arena.abandon(read_rdy);
        })
    }
}
