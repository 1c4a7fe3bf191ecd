//! Integration tests for kernobj
//!
//! End-to-end runs over the public surface: POSIX queue flows, blocking
//! producer/consumer across threads, FIFOs, drivers and snapshots.
//! Every test builds its own `Kernel`, so names never collide.

use kernobj::kernel::posix::{self, mq_close, mq_getattr, mq_open, mq_receive, mq_send, mq_unlink};
use kernobj::kernel::{
    Errno, EventWait, FdTag, FileObject, FileOps, FileSpec, Kernel, KernelConfig, KernelError,
    KResult, MqAttr, OpenFlags, StaticHandle, Timeout,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn shared() -> Arc<Kernel> {
    Arc::new(Kernel::new())
}

// ============================================================================
// POSIX message queues
// ============================================================================

#[test]
fn test_posix_queue_lifecycle() {
    let k = Kernel::new();
    let attr = MqAttr {
        mq_maxmsg: 4,
        mq_msgsize: 64,
        ..MqAttr::default()
    };
    let q = mq_open(&k, "/jobs", OpenFlags::RDWR | OpenFlags::CREAT, Some(&attr)).unwrap();

    mq_send(&k, q, b"low", 9).unwrap();
    mq_send(&k, q, b"urgent", 0).unwrap();
    assert_eq!(mq_getattr(&k, q).unwrap().mq_curmsgs, 2);

    let mut buf = [0u8; 64];
    let (len, prio) = mq_receive(&k, q, &mut buf).unwrap();
    assert_eq!((&buf[..len], prio), (&b"urgent"[..], 0));

    mq_unlink(&k, "/jobs").unwrap();
    let (len, _) = mq_receive(&k, q, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"low");
    mq_close(&k, q).unwrap();

    assert_eq!(mq_getattr(&k, q), Err(Errno::EBADF));
    assert_eq!(posix::errno(), Errno::EBADF.raw());
}

#[test]
fn test_posix_shared_open() {
    let k = shared();
    let creator = mq_open(&k, "/shared", OpenFlags::RDWR | OpenFlags::CREAT, None).unwrap();
    let opener = {
        let k = Arc::clone(&k);
        thread::spawn(move || mq_open(&k, "/shared", OpenFlags::WRONLY, None))
            .join()
            .unwrap()
            .unwrap()
    };
    assert_eq!(creator, opener);
}

#[test]
fn test_posix_concurrent_create_yields_one_queue() {
    let k = shared();
    let opened: Vec<_> = (0..8)
        .map(|_| {
            let k = Arc::clone(&k);
            thread::spawn(move || {
                mq_open(&k, "/race", OpenFlags::RDWR | OpenFlags::CREAT, None).unwrap()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().unwrap())
        .collect();
    assert!(opened.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(k.snapshot().queues.len(), 1);
}

// ============================================================================
// Producer / consumer
// ============================================================================

#[test]
fn test_producers_and_consumers_exchange_everything() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 200;

    let k = shared();
    let q = k.queue_create(Some("/pc"), 8, 4).unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let k = Arc::clone(&k);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    k.queue_send(q, &value.to_le_bytes(), i % 3, Timeout::Forever)
                        .unwrap();
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let k = Arc::clone(&k);
            thread::spawn(move || {
                let mut seen = Vec::new();
                let mut buf = [0u8; 8];
                while let Ok((_, len)) = k.queue_receive(q, &mut buf, Timeout::Millis(500)) {
                    assert_eq!(len, 4);
                    seen.push(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]));
                }
                seen
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    let mut all: Vec<u32> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());
    assert!(k.queue_census(q).unwrap().is_consistent());
}

#[test]
fn test_blocked_sender_woken_by_close() {
    let k = shared();
    let q = k.queue_create(None, 4, 1).unwrap();
    k.queue_send(q, b"full", 0, Timeout::POLL).unwrap();
    let sender = {
        let k = Arc::clone(&k);
        thread::spawn(move || k.queue_send(q, b"more", 0, Timeout::Forever))
    };
    thread::sleep(Duration::from_millis(20));
    k.close(q).unwrap();
    assert_eq!(sender.join().unwrap(), Err(KernelError::BadDescriptor));
    k.recycle();
    assert_eq!(k.stats().live, 0);
}

// ============================================================================
// Synchronization objects
// ============================================================================

#[test]
fn test_mutex_serializes_threads() {
    static COUNTER_LOCK: StaticHandle = StaticHandle::mutex();
    let k = shared();
    let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let (k, counter) = (Arc::clone(&k), Arc::clone(&counter));
            thread::spawn(move || {
                let lock = k.resolve_static(&COUNTER_LOCK).unwrap();
                for _ in 0..100 {
                    k.mutex_lock(lock, Timeout::Forever).unwrap();
                    // Non-atomic read-modify-write, protected by the mutex
                    let v = counter.load(std::sync::atomic::Ordering::Relaxed);
                    counter.store(v + 1, std::sync::atomic::Ordering::Relaxed);
                    k.mutex_unlock(lock).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 400);
}

#[test]
fn test_event_handshake() {
    let k = shared();
    let ev = k.event_create().unwrap();
    let worker = {
        let k = Arc::clone(&k);
        thread::spawn(move || {
            let wait = EventWait {
                all: false,
                clear: true,
            };
            k.event_wait(ev, 0b1, wait, Timeout::Forever).unwrap();
            k.event_set(ev, 0b10).unwrap();
        })
    };
    k.event_set(ev, 0b1).unwrap();
    let done = EventWait {
        all: true,
        clear: false,
    };
    let bits = k.event_wait(ev, 0b10, done, Timeout::Millis(2_000)).unwrap();
    assert_eq!(bits & 0b10, 0b10);
    worker.join().unwrap();
}

// ============================================================================
// Descriptors and drivers
// ============================================================================

struct Null;

fn null_read(_k: &Kernel, _fd: kernobj::kernel::Fd, _buf: &mut [u8]) -> KResult<usize> {
    Ok(0)
}

fn null_write(_k: &Kernel, _fd: kernobj::kernel::Fd, buf: &[u8]) -> KResult<usize> {
    Ok(buf.len())
}

fn null_close(file: &mut FileObject) -> KResult<()> {
    file.take_ext::<Null>().map(|_| ()).ok_or(KernelError::BadDescriptor)
}

static NULL_OPS: FileOps = FileOps {
    read: Some(null_read),
    write: Some(null_write),
    close: Some(null_close),
    ..FileOps::EMPTY
};

#[test]
fn test_driver_shares_descriptor_space() {
    let k = Kernel::new();
    let null = k
        .create_fd(FileSpec::new(FdTag::CHAR, &NULL_OPS).ext(Null))
        .unwrap();
    let fifo = k.fifo_create(32).unwrap();
    let q = k.queue_create(None, 16, 2).unwrap();

    assert_eq!(k.write(null, b"discarded"), Ok(9));
    assert_eq!(k.read(null, &mut [0u8; 4]), Ok(0));

    assert_eq!(k.write(fifo, b"pipe"), Ok(4));
    let mut buf = [0u8; 16];
    assert_eq!(k.read(fifo, &mut buf), Ok(4));

    assert_eq!(k.write(q, b"queued"), Ok(6));
    assert_eq!(k.read(q, &mut buf), Ok(6));
    assert_eq!(&buf[..6], b"queued");

    for fd in [null, fifo, q] {
        k.close(fd).unwrap();
    }
    k.recycle();
    assert_eq!(k.stats().live, 0);
}

#[test]
fn test_fifo_across_threads() {
    let k = shared();
    let fifo = k.fifo_create(4).unwrap();
    let payload: Vec<u8> = (0..=255).collect();

    let writer = {
        let (k, payload) = (Arc::clone(&k), payload.clone());
        thread::spawn(move || {
            let mut sent = 0;
            while sent < payload.len() {
                sent += k.write(fifo, &payload[sent..]).unwrap();
            }
        })
    };
    let mut got = Vec::new();
    let mut buf = [0u8; 3];
    while got.len() < payload.len() {
        let n = k.read(fifo, &mut buf).unwrap();
        got.extend_from_slice(&buf[..n]);
    }
    writer.join().unwrap();
    assert_eq!(got, payload);
}

// ============================================================================
// Configuration and snapshots
// ============================================================================

#[test]
fn test_config_from_json_bounds_arena() {
    let config = KernelConfig::from_json(r#"{"inline_handles": 3, "max_slabs": 0}"#).unwrap();
    let k = Kernel::with_config(config);
    // A queue needs three handles
    let q = k.queue_create(None, 8, 1).unwrap();
    assert_eq!(k.queue_create(None, 8, 1), Err(KernelError::ResourceExhausted));
    k.close(q).unwrap();
    k.recycle();
    assert!(k.queue_create(None, 8, 1).is_ok());
}

#[test]
fn test_snapshot_json_reports_queues() {
    let k = Kernel::new();
    let q = mq_open(&k, "/status", OpenFlags::RDWR | OpenFlags::CREAT, None).unwrap();
    mq_send(&k, q, b"hi", 1).unwrap();
    let json = k.snapshot_json().unwrap();
    assert!(json.contains("\"/status\""));
    let snap = k.snapshot();
    assert_eq!(snap.attribute("mqueue/status/curmsgs").as_deref(), Some("1"));
}
