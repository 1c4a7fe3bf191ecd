//! File descriptors
//!
//! An FD is an arena handle carrying a [`FileObject`]: a tag, a static
//! vtable and a driver-owned `ext` value. Queues, FIFOs and drivers all
//! share the one descriptor space and the generic `read`/`write`/`seek`/
//! `ioctl`/`close` entry points below.
//!
//! Vtable entries other than `close` run outside the kernel spinlock and
//! receive the kernel itself, so a driver can block on its own semaphores.
//! `close` runs inside the critical section and only sees the file object.

use super::arena::Arena;
use super::error::{KResult, KernelError};
use super::object::{Handle, HandleFlags, HandleKind, Payload};
use super::semaphore::Timeout;
use super::Kernel;
use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::io::SeekFrom;

bitflags! {
    /// What kind of file a descriptor names
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FdTag: u16 {
        const CHAR = 1 << 0;
        const BLOCK = 1 << 1;
        const DIR = 1 << 2;
        const FIFO = 1 << 3;
        const REGULAR = 1 << 4;
        const LINK = 1 << 5;
        const SOCKET = 1 << 6;
        /// Not backed by a device or filesystem
        const VIRTUAL = 1 << 7;
        /// Message-queue descriptor
        const MQD = 1 << 8;
    }
}

/// File descriptor token
pub type Fd = Handle;

pub type ReadFn = fn(&Kernel, Fd, &mut [u8]) -> KResult<usize>;
pub type WriteFn = fn(&Kernel, Fd, &[u8]) -> KResult<usize>;
pub type SeekFn = fn(&Kernel, Fd, SeekFrom) -> KResult<u64>;
pub type CloseFn = fn(&mut FileObject) -> KResult<()>;
pub type IoctlFn = fn(&Kernel, Fd, u32, usize) -> KResult<usize>;

/// Driver vtable; a missing entry makes the operation `NotSupported`
#[derive(Debug, Clone, Copy)]
pub struct FileOps {
    pub read: Option<ReadFn>,
    pub write: Option<WriteFn>,
    pub seek: Option<SeekFn>,
    /// Tear down driver state. Failing vetoes the release.
    pub close: Option<CloseFn>,
    pub ioctl: Option<IoctlFn>,
}

impl FileOps {
    pub const EMPTY: FileOps = FileOps {
        read: None,
        write: None,
        seek: None,
        close: None,
        ioctl: None,
    };
}

/// Payload of an FD handle
pub struct FileObject {
    tag: FdTag,
    ops: &'static FileOps,
    ext: Option<Box<dyn Any + Send>>,
    read_rdy: Option<Handle>,
    write_rdy: Option<Handle>,
    read_timeout: Timeout,
    write_timeout: Timeout,
}

impl FileObject {
    pub fn tag(&self) -> FdTag {
        self.tag
    }

    pub fn ops(&self) -> &'static FileOps {
        self.ops
    }

    pub fn ext<T: Any>(&self) -> Option<&T> {
        self.ext.as_deref()?.downcast_ref()
    }

    pub fn ext_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.ext.as_deref_mut()?.downcast_mut()
    }

    /// Take the driver state out; left in place if it is not a `T`
    pub fn take_ext<T: Any>(&mut self) -> Option<Box<T>> {
        match self.ext.take()?.downcast::<T>() {
            Ok(ext) => Some(ext),
            Err(other) => {
                self.ext = Some(other);
                None
            }
        }
    }

    pub fn read_rdy(&self) -> Option<Handle> {
        self.read_rdy
    }

    pub fn write_rdy(&self) -> Option<Handle> {
        self.write_rdy
    }

    pub fn read_timeout(&self) -> Timeout {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Timeout {
        self.write_timeout
    }
}

impl fmt::Debug for FileObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileObject")
            .field("tag", &self.tag)
            .field("read_rdy", &self.read_rdy)
            .field("write_rdy", &self.write_rdy)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

/// Everything needed to publish a new descriptor
pub struct FileSpec {
    tag: FdTag,
    ops: &'static FileOps,
    ext: Option<Box<dyn Any + Send>>,
    read_rdy: Option<Handle>,
    write_rdy: Option<Handle>,
    read_timeout: Timeout,
    write_timeout: Timeout,
}

impl FileSpec {
    pub fn new(tag: FdTag, ops: &'static FileOps) -> Self {
        Self {
            tag,
            ops,
            ext: None,
            read_rdy: None,
            write_rdy: None,
            read_timeout: Timeout::Forever,
            write_timeout: Timeout::Forever,
        }
    }

    pub fn ext<T: Any + Send>(mut self, ext: T) -> Self {
        self.ext = Some(Box::new(ext));
        self
    }

    /// Semaphore posted when the file becomes readable
    pub fn read_rdy(mut self, sema: Handle) -> Self {
        self.read_rdy = Some(sema);
        self
    }

    /// Semaphore posted when the file becomes writable
    pub fn write_rdy(mut self, sema: Handle) -> Self {
        self.write_rdy = Some(sema);
        self
    }

    pub fn timeouts(mut self, read: Timeout, write: Timeout) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }
}

pub(crate) fn file_of(arena: &Arena, fd: Fd) -> KResult<&FileObject> {
    match arena.lookup(fd).map(|slot| &slot.payload) {
        Ok(Payload::File(file)) => Ok(file),
        _ => Err(KernelError::BadDescriptor),
    }
}

pub(crate) fn file_of_mut(arena: &mut Arena, fd: Fd) -> KResult<&mut FileObject> {
    match arena.lookup_mut(fd).map(|slot| &mut slot.payload) {
        Ok(Payload::File(file)) => Ok(file),
        _ => Err(KernelError::BadDescriptor),
    }
}

/// Acquire an FD slot for `spec`, with the kernel lock already held
pub(crate) fn publish(arena: &mut Arena, spec: FileSpec) -> KResult<Fd> {
    if spec.tag.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    for sub in [spec.read_rdy, spec.write_rdy].into_iter().flatten() {
        if arena.lookup(sub)?.kind != HandleKind::Semaphore {
            return Err(KernelError::InvalidArgument);
        }
    }
    let file = FileObject {
        tag: spec.tag,
        ops: spec.ops,
        ext: spec.ext,
        read_rdy: spec.read_rdy,
        write_rdy: spec.write_rdy,
        read_timeout: spec.read_timeout,
        write_timeout: spec.write_timeout,
    };
    arena.acquire_with(HandleKind::Fd, HandleFlags::empty(), Payload::File(file))
}

impl Kernel {
    /// Publish a descriptor. Readiness sub-handles must be live semaphores;
    /// they are released together with the descriptor.
    pub fn create_fd(&self, spec: FileSpec) -> KResult<Fd> {
        publish(&mut self.state.lock().arena, spec)
    }

    fn file_ops(&self, fd: Fd) -> KResult<&'static FileOps> {
        let state = self.state.lock();
        Ok(file_of(&state.arena, fd)?.ops)
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> KResult<usize> {
        let read = self.file_ops(fd)?.read.ok_or(KernelError::NotSupported)?;
        read(self, fd, buf)
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> KResult<usize> {
        let write = self.file_ops(fd)?.write.ok_or(KernelError::NotSupported)?;
        write(self, fd, buf)
    }

    pub fn seek(&self, fd: Fd, pos: SeekFrom) -> KResult<u64> {
        let seek = self.file_ops(fd)?.seek.ok_or(KernelError::NotSupported)?;
        seek(self, fd, pos)
    }

    pub fn ioctl(&self, fd: Fd, request: u32, arg: usize) -> KResult<usize> {
        let ioctl = self.file_ops(fd)?.ioctl.ok_or(KernelError::NotSupported)?;
        ioctl(self, fd, request, arg)
    }

    /// Same as [`Kernel::release`]
    pub fn close(&self, fd: Fd) -> KResult<()> {
        self.release(fd)
    }

    pub fn fd_tag(&self, fd: Fd) -> KResult<FdTag> {
        let state = self.state.lock();
        Ok(file_of(&state.arena, fd)?.tag)
    }

    pub fn timeouts(&self, fd: Fd) -> KResult<(Timeout, Timeout)> {
        self.with_file(fd, |file| (file.read_timeout, file.write_timeout))
    }

    pub fn set_timeouts(&self, fd: Fd, read: Timeout, write: Timeout) -> KResult<()> {
        let mut state = self.state.lock();
        let file = file_of_mut(&mut state.arena, fd)?;
        file.read_timeout = read;
        file.write_timeout = write;
        Ok(())
    }

    /// Inspect a descriptor under the spinlock
    pub fn with_file<R>(&self, fd: Fd, f: impl FnOnce(&FileObject) -> R) -> KResult<R> {
        let state = self.state.lock();
        Ok(f(file_of(&state.arena, fd)?))
    }

    /// Driver access to its `ext` under the spinlock.
    ///
    /// Fails with `BadDescriptor` unless `fd` is a live descriptor whose tag
    /// contains `tag` and whose ext is a `T`. `f` must not call back into
    /// the kernel.
    pub fn with_ext<T: Any, R>(
        &self,
        fd: Fd,
        tag: FdTag,
        f: impl FnOnce(&mut T) -> KResult<R>,
    ) -> KResult<R> {
        let mut state = self.state.lock();
        let file = file_of_mut(&mut state.arena, fd)?;
        if !file.tag.contains(tag) {
            return Err(KernelError::BadDescriptor);
        }
        let ext = file.ext_mut::<T>().ok_or(KernelError::BadDescriptor)?;
        f(ext)
    }
}
