//! Priority message queue
//!
//! A queue is an MQD descriptor whose ext holds one contiguous block of
//! fixed-size message slots. Slots never leave the block; they only move
//! between two sub-queues, each a list plus a counting semaphore:
//!
//! - `freed`: empty slots, counted by the descriptor's `write_rdy`
//! - `queued`: pending messages in delivery order, counted by `read_rdy`
//!
//! Delivery is ascending by priority value (0 first), FIFO among equals.
//! Senders and receivers wait on the semaphore first and only then take the
//! kernel spinlock to move a slot.

use super::error::{KResult, KernelError};
use super::fd::{self, Fd, FdTag, FileObject, FileOps, FileSpec};
use super::glist::{Cursor, Glist, Links, NodeId};
use super::object::{HandleFlags, HandleKind, Payload};
use super::semaphore::{CountingSemaphore, Timeout};
use super::Kernel;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Largest payload a queue may be created with
pub const MQ_MAX_MSG_SIZE: usize = 1024;
/// Largest slot count a queue may be created with
pub const MQ_MAX_MSG_COUNT: usize = 128;

/// ioctl: discard every pending message, returns how many
pub const MQ_IOC_FLUSH: u32 = 1;
/// ioctl: number of pending messages
pub const MQ_IOC_CURMSGS: u32 = 2;

bitflags! {
    /// `mq_open` flags (Linux values)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const NONBLOCK = 0o4000;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();
}

/// Queue attributes, as reported by `mq_getattr`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqAttr {
    pub mq_flags: u32,
    pub mq_maxmsg: usize,
    pub mq_msgsize: usize,
    pub mq_curmsgs: usize,
}

impl Default for MqAttr {
    fn default() -> Self {
        Self {
            mq_flags: 0,
            mq_maxmsg: 10,
            mq_msgsize: 128,
            mq_curmsgs: 0,
        }
    }
}

/// Semaphore counts against list lengths, for checking a quiescent queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCensus {
    pub msg_max: usize,
    pub freed_count: u32,
    pub freed_len: usize,
    pub queued_count: u32,
    pub queued_len: usize,
}

impl QueueCensus {
    pub fn is_consistent(&self) -> bool {
        self.freed_count as usize == self.freed_len
            && self.queued_count as usize == self.queued_len
            && self.freed_len + self.queued_len == self.msg_max
    }
}

#[derive(Default)]
struct MsgSlot {
    next: Option<NodeId>,
    priority: u32,
    len: usize,
}

/// Slot headers plus one payload allocation shared by every slot
struct MessageBlock {
    slots: Vec<MsgSlot>,
    payload: Vec<u8>,
    msg_size: usize,
}

impl MessageBlock {
    fn allocate(msg_size: usize, count: usize) -> KResult<Self> {
        let bytes = msg_size
            .checked_mul(count)
            .ok_or(KernelError::InvalidArgument)?;
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(bytes)
            .map_err(|_| KernelError::ResourceExhausted)?;
        payload.resize(bytes, 0);
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|_| KernelError::ResourceExhausted)?;
        slots.resize_with(count, MsgSlot::default);
        Ok(Self {
            slots,
            payload,
            msg_size,
        })
    }

    fn store(&mut self, node: NodeId, priority: u32, msg: &[u8]) {
        let start = node as usize * self.msg_size;
        self.payload[start..start + msg.len()].copy_from_slice(msg);
        let slot = &mut self.slots[node as usize];
        slot.priority = priority;
        slot.len = msg.len();
    }

    fn load(&self, node: NodeId, buf: &mut [u8]) -> (u32, usize) {
        let slot = &self.slots[node as usize];
        let start = node as usize * self.msg_size;
        buf[..slot.len].copy_from_slice(&self.payload[start..start + slot.len]);
        (slot.priority, slot.len)
    }

    fn priority(&self, node: NodeId) -> u32 {
        self.slots[node as usize].priority
    }
}

impl Links for MessageBlock {
    fn next(&self, node: NodeId) -> Option<NodeId> {
        self.slots[node as usize].next
    }

    fn set_next(&mut self, node: NodeId, next: Option<NodeId>) {
        self.slots[node as usize].next = next;
    }
}

struct SubQueue {
    sema: Arc<CountingSemaphore>,
    list: Glist,
}

/// Driver state of an MQD descriptor
pub(crate) struct MqExt {
    msg_max: usize,
    msg_size: usize,
    block: MessageBlock,
    freed: SubQueue,
    queued: SubQueue,
    /// Priority of the least urgent pending message (the tail)
    lowest_prio_queued: u32,
    flags: OpenFlags,
    name: Option<String>,
}

impl MqExt {
    fn enqueue(&mut self, node: NodeId, priority: u32) {
        if self.queued.list.is_empty() || priority >= self.lowest_prio_queued {
            self.queued.list.push_back(&mut self.block, node);
            self.lowest_prio_queued = priority;
            return;
        }
        // Strictly more urgent than the tail: insert before the first
        // message with a greater priority value
        let mut cursor = self.queued.list.cursor_begin();
        while let Some(at) = self.queued.list.node_at(&self.block, cursor) {
            if self.block.priority(at) > priority {
                break;
            }
            cursor = Cursor::After(at);
        }
        self.queued.list.insert(&mut self.block, cursor, node);
    }

    fn dequeue(&mut self) -> Option<NodeId> {
        let node = self.queued.list.pop(&mut self.block)?;
        if self.queued.list.is_empty() {
            self.lowest_prio_queued = 0;
        }
        Some(node)
    }

    /// `mq_flags` carries O_NONBLOCK only, never the access mode
    pub(crate) fn attr(&self) -> MqAttr {
        MqAttr {
            mq_flags: (self.flags & OpenFlags::NONBLOCK).bits(),
            mq_maxmsg: self.msg_max,
            mq_msgsize: self.msg_size,
            mq_curmsgs: self.queued.list.len(),
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn census(&self) -> QueueCensus {
        QueueCensus {
            msg_max: self.msg_max,
            freed_count: self.freed.sema.count(),
            freed_len: self.freed.list.len(),
            queued_count: self.queued.sema.count(),
            queued_len: self.queued.list.len(),
        }
    }
}

/// A destroyed queue shows up as a dead descriptor to its waiters
fn closed(err: KernelError) -> KernelError {
    match err {
        KernelError::InvalidHandle => KernelError::BadDescriptor,
        other => other,
    }
}

fn mq_read(kernel: &Kernel, fd: Fd, buf: &mut [u8]) -> KResult<usize> {
    let (timeout, _) = kernel.timeouts(fd)?;
    kernel
        .queue_receive(fd, buf, timeout)
        .map(|(_, len)| len)
}

fn mq_write(kernel: &Kernel, fd: Fd, buf: &[u8]) -> KResult<usize> {
    let (_, timeout) = kernel.timeouts(fd)?;
    kernel.queue_send(fd, buf, 0, timeout)?;
    Ok(buf.len())
}

fn mq_ioctl(kernel: &Kernel, fd: Fd, request: u32, _arg: usize) -> KResult<usize> {
    match request {
        MQ_IOC_FLUSH => {
            let mut flushed = 0;
            while kernel.queue_flush(fd)? {
                flushed += 1;
            }
            Ok(flushed)
        }
        MQ_IOC_CURMSGS => Ok(kernel.queue_attr(fd)?.mq_curmsgs),
        _ => Err(KernelError::InvalidArgument),
    }
}

fn mq_close(file: &mut FileObject) -> KResult<()> {
    let mq = file
        .take_ext::<MqExt>()
        .ok_or(KernelError::BadDescriptor)?;
    mq.freed.sema.invalidate();
    mq.queued.sema.invalidate();
    log::debug!(
        "mqueue: {} closed with {} pending",
        mq.name().unwrap_or("<anonymous>"),
        mq.queued.list.len()
    );
    Ok(())
}

static MQ_FILE_OPS: FileOps = FileOps {
    read: Some(mq_read),
    write: Some(mq_write),
    seek: None,
    close: Some(mq_close),
    ioctl: Some(mq_ioctl),
};

impl Kernel {
    /// Create a queue of `msg_count` slots of `msg_size` bytes
    pub fn queue_create(&self, name: Option<&str>, msg_size: usize, msg_count: usize) -> KResult<Fd> {
        self.queue_create_with(name, msg_size, msg_count, OpenFlags::RDWR)
    }

    /// [`Kernel::queue_create`] recording the opener's flags.
    ///
    /// All-or-nothing: on failure no handle stays acquired and the message
    /// block is freed.
    pub fn queue_create_with(
        &self,
        name: Option<&str>,
        msg_size: usize,
        msg_count: usize,
        flags: OpenFlags,
    ) -> KResult<Fd> {
        if msg_size == 0
            || msg_count == 0
            || msg_size > MQ_MAX_MSG_SIZE
            || msg_count > MQ_MAX_MSG_COUNT
            || name.is_some_and(str::is_empty)
        {
            return Err(KernelError::InvalidArgument);
        }

        let mut block = MessageBlock::allocate(msg_size, msg_count)?;
        let freed_sema = Arc::new(CountingSemaphore::new(msg_count as u32, msg_count as u32));
        let queued_sema = Arc::new(CountingSemaphore::new(0, msg_count as u32));
        let mut freed = Glist::new();
        for node in 0..msg_count as NodeId {
            freed.push_back(&mut block, node);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(name) = name {
            if state.queues.contains_key(name) {
                return Err(KernelError::AlreadyExists);
            }
        }

        let write_rdy = state.arena.acquire_with(
            HandleKind::Semaphore,
            HandleFlags::NO_INTR,
            Payload::Semaphore(Arc::clone(&freed_sema)),
        )?;
        let read_rdy = match state.arena.acquire_with(
            HandleKind::Semaphore,
            HandleFlags::empty(),
            Payload::Semaphore(Arc::clone(&queued_sema)),
        ) {
            Ok(h) => h,
            Err(e) => {
                state.arena.abandon(write_rdy);
                return Err(e);
            }
        };

        let ext = MqExt {
            msg_max: msg_count,
            msg_size,
            block,
            freed: SubQueue {
                sema: freed_sema,
                list: freed,
            },
            queued: SubQueue {
                sema: queued_sema,
                list: Glist::new(),
            },
            lowest_prio_queued: 0,
            flags,
            name: name.map(str::to_owned),
        };
        let spec = FileSpec::new(FdTag::MQD | FdTag::VIRTUAL, &MQ_FILE_OPS)
            .ext(ext)
            .read_rdy(read_rdy)
            .write_rdy(write_rdy);
        let fd = match fd::publish(&mut state.arena, spec) {
            Ok(fd) => fd,
            Err(e) => {
                state.arena.abandon(read_rdy);
                state.arena.abandon(write_rdy);
                return Err(e);
            }
        };

        if let Some(name) = name {
            state.queues.insert(name.to_owned(), fd);
        }
        log::debug!(
            "mqueue: created {} as {} ({} x {} bytes)",
            name.unwrap_or("<anonymous>"),
            fd,
            msg_count,
            msg_size
        );
        Ok(fd)
    }

    fn queue_parts(&self, fd: Fd) -> KResult<(Arc<CountingSemaphore>, Arc<CountingSemaphore>, usize)> {
        self.with_ext(fd, FdTag::MQD, |mq: &mut MqExt| {
            Ok((
                Arc::clone(&mq.freed.sema),
                Arc::clone(&mq.queued.sema),
                mq.msg_size,
            ))
        })
    }

    /// Queue `msg` at `priority`, waiting up to `timeout` for a free slot
    pub fn queue_send(&self, fd: Fd, msg: &[u8], priority: u32, timeout: Timeout) -> KResult<()> {
        let (freed, queued, msg_size) = self.queue_parts(fd)?;
        if msg.len() > msg_size {
            return Err(KernelError::MessageTooLarge);
        }
        freed.take(timeout).map_err(closed)?;
        self.with_ext(fd, FdTag::MQD, |mq: &mut MqExt| {
            let node = mq
                .freed
                .list
                .pop(&mut mq.block)
                .ok_or(KernelError::ResourceExhausted)?;
            mq.block.store(node, priority, msg);
            mq.enqueue(node, priority);
            Ok(())
        })?;
        queued.give().map_err(closed)
    }

    /// Take the most urgent message into `buf`; returns `(priority, len)`.
    /// `buf` must hold at least the queue's message size.
    pub fn queue_receive(&self, fd: Fd, buf: &mut [u8], timeout: Timeout) -> KResult<(u32, usize)> {
        let (freed, queued, msg_size) = self.queue_parts(fd)?;
        if buf.len() < msg_size {
            return Err(KernelError::MessageTooLarge);
        }
        queued.take(timeout).map_err(closed)?;
        let received = self.with_ext(fd, FdTag::MQD, |mq: &mut MqExt| {
            let node = mq.dequeue().ok_or(KernelError::ResourceExhausted)?;
            let received = mq.block.load(node, buf);
            mq.freed.list.push_back(&mut mq.block, node);
            Ok(received)
        })?;
        freed.give().map_err(closed)?;
        Ok(received)
    }

    /// Discard the most urgent pending message. `false` if none was pending.
    pub fn queue_flush(&self, fd: Fd) -> KResult<bool> {
        let (freed, queued, _) = self.queue_parts(fd)?;
        match queued.take(Timeout::POLL) {
            Ok(()) => {}
            Err(KernelError::Timeout) => return Ok(false),
            Err(e) => return Err(closed(e)),
        }
        self.with_ext(fd, FdTag::MQD, |mq: &mut MqExt| {
            let node = mq.dequeue().ok_or(KernelError::ResourceExhausted)?;
            mq.freed.list.push_back(&mut mq.block, node);
            Ok(())
        })?;
        freed.give().map_err(closed)?;
        Ok(true)
    }

    pub fn queue_attr(&self, fd: Fd) -> KResult<MqAttr> {
        self.with_ext(fd, FdTag::MQD, |mq: &mut MqExt| Ok(mq.attr()))
    }

    pub fn queue_census(&self, fd: Fd) -> KResult<QueueCensus> {
        self.with_ext(fd, FdTag::MQD, |mq: &mut MqExt| Ok(mq.census()))
    }

    /// Descriptor registered under `name`
    pub fn queue_lookup(&self, name: &str) -> KResult<Fd> {
        self.state
            .lock()
            .queues
            .get(name)
            .copied()
            .ok_or(KernelError::NotFound)
    }

    /// Drop the name binding; the queue itself lives until closed
    pub fn queue_unlink(&self, name: &str) -> KResult<Fd> {
        self.state
            .lock()
            .queues
            .remove(name)
            .ok_or(KernelError::NotFound)
    }
}
