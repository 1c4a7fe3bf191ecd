//! Kernel status snapshot
//!
//! A point-in-time view of the arena and every live queue, serializable
//! to JSON and browsable as sysfs-style attribute paths:
//!
//! ```text
//! arena/{total,free,destroying,live,slabs,statics}
//! mqueue/<name>/{maxmsg,msgsize,curmsgs,flags}
//! ```

use super::arena::ArenaStats;
use super::fd::FdTag;
use super::msgqueue::{MqAttr, MqExt};
use super::object::{HandleKind, Payload};
use super::Kernel;
use serde::Serialize;

/// One live message queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Raw descriptor token
    pub fd: u64,
    pub name: Option<String>,
    pub attr: MqAttr,
}

/// Live-handle count per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub tcb: usize,
    pub fd: usize,
    pub semaphore: usize,
    pub event: usize,
    pub mutex: usize,
    pub rwlock: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelSnapshot {
    pub arena: ArenaStats,
    pub kinds: KindCounts,
    pub queues: Vec<QueueSnapshot>,
}

impl KernelSnapshot {
    /// Read one attribute by path
    pub fn attribute(&self, path: &str) -> Option<String> {
        let path = path.trim_matches('/');
        let (dir, leaf) = path.rsplit_once('/')?;
        if dir == "arena" {
            let a = &self.arena;
            let value = match leaf {
                "total" => a.total,
                "free" => a.free,
                "destroying" => a.destroying,
                "live" => a.live,
                "slabs" => a.slabs,
                "statics" => a.statics,
                _ => return None,
            };
            return Some(value.to_string());
        }

        let name = dir.strip_prefix("mqueue/")?;
        let queue = self
            .queues
            .iter()
            .find(|q| q.name.as_deref().map(|n| n.trim_start_matches('/')) == Some(name))?;
        let attr = &queue.attr;
        Some(match leaf {
            "maxmsg" => attr.mq_maxmsg.to_string(),
            "msgsize" => attr.mq_msgsize.to_string(),
            "curmsgs" => attr.mq_curmsgs.to_string(),
            "flags" => format!("{:#o}", attr.mq_flags),
            _ => return None,
        })
    }

    /// Every attribute path this snapshot answers
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = ["total", "free", "destroying", "live", "slabs", "statics"]
            .iter()
            .map(|leaf| format!("arena/{}", leaf))
            .collect();
        for name in self.queues.iter().filter_map(|q| q.name.as_deref()) {
            let name = name.trim_start_matches('/');
            for leaf in ["maxmsg", "msgsize", "curmsgs", "flags"] {
                paths.push(format!("mqueue/{}/{}", name, leaf));
            }
        }
        paths
    }
}

impl Kernel {
    pub fn snapshot(&self) -> KernelSnapshot {
        let state = self.state.lock();
        let mut kinds = KindCounts::default();
        let mut queues = Vec::new();
        for (handle, slot) in state.arena.live() {
            match slot.kind {
                HandleKind::Tcb => kinds.tcb += 1,
                HandleKind::Fd => kinds.fd += 1,
                HandleKind::Semaphore => kinds.semaphore += 1,
                HandleKind::Event => kinds.event += 1,
                HandleKind::Mutex => kinds.mutex += 1,
                HandleKind::RwLock => kinds.rwlock += 1,
                HandleKind::Freed => {}
            }
            let Payload::File(file) = &slot.payload else {
                continue;
            };
            if !file.tag().contains(FdTag::MQD) {
                continue;
            }
            if let Some(mq) = file.ext::<MqExt>() {
                queues.push(QueueSnapshot {
                    fd: handle.raw(),
                    name: mq.name().map(str::to_owned),
                    attr: mq.attr(),
                });
            }
        }
        KernelSnapshot {
            arena: state.arena.stats(),
            kinds,
            queues,
        }
    }

    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}
