//! Handle arena
//!
//! An inline block of slots plus heap slabs added one at a time when the
//! free-list runs dry. Slabs are never given back. Release is two-phase:
//! a released slot is marked DESTROYING and parked on the destroying-list,
//! and only `recycle` (run from a context that cannot race with acquire or
//! release) resets it and puts it back on the free-list.
//!
//! Slots built from static initializers live in a separate table outside
//! the slabs. Recycling one never returns it to the free-list; the FREED
//! entry is reused by the next static construction, so the table never
//! outgrows the number of statics live at once.

use super::config::KernelConfig;
use super::error::{KResult, KernelError};
use super::glist::{Glist, Links, NodeId};
use super::object::{Handle, HandleFlags, HandleKind, Payload, Slot};
use serde::Serialize;

/// Index bit marking a slot in the static-initializer table
const STATIC_BASE: NodeId = 1 << 31;

/// Slot storage shared by the free and destroying lists
pub(crate) struct SlotTable {
    inline: Box<[Slot]>,
    slabs: Vec<Box<[Slot]>>,
    slab_size: usize,
    statics: Vec<Slot>,
}

impl SlotTable {
    fn new(inline_handles: usize, slab_size: usize) -> Self {
        Self {
            inline: (0..inline_handles).map(|_| Slot::freed()).collect(),
            slabs: Vec::new(),
            slab_size,
            statics: Vec::new(),
        }
    }

    /// Slots backed by the inline block and the slabs
    fn managed_capacity(&self) -> usize {
        self.inline.len() + self.slabs.len() * self.slab_size
    }

    pub(crate) fn get(&self, index: NodeId) -> Option<&Slot> {
        if index & STATIC_BASE != 0 {
            return self.statics.get((index & !STATIC_BASE) as usize);
        }
        let index = index as usize;
        if index < self.inline.len() {
            return self.inline.get(index);
        }
        let offset = index - self.inline.len();
        self.slabs
            .get(offset / self.slab_size)
            .and_then(|slab| slab.get(offset % self.slab_size))
    }

    pub(crate) fn get_mut(&mut self, index: NodeId) -> Option<&mut Slot> {
        if index & STATIC_BASE != 0 {
            return self.statics.get_mut((index & !STATIC_BASE) as usize);
        }
        let index = index as usize;
        if index < self.inline.len() {
            return self.inline.get_mut(index);
        }
        let offset = index - self.inline.len();
        let slab_size = self.slab_size;
        self.slabs
            .get_mut(offset / slab_size)
            .and_then(|slab| slab.get_mut(offset % slab_size))
    }

    fn managed(&self) -> impl Iterator<Item = (NodeId, &Slot)> {
        self.inline
            .iter()
            .chain(self.slabs.iter().flat_map(|slab| slab.iter()))
            .enumerate()
            .map(|(i, slot)| (i as NodeId, slot))
    }

    fn statics(&self) -> impl Iterator<Item = (NodeId, &Slot)> {
        self.statics
            .iter()
            .enumerate()
            .map(|(i, slot)| (STATIC_BASE | i as NodeId, slot))
    }
}

impl Links for SlotTable {
    fn next(&self, node: NodeId) -> Option<NodeId> {
        self.get(node).and_then(|slot| slot.next)
    }

    fn set_next(&mut self, node: NodeId, next: Option<NodeId>) {
        if let Some(slot) = self.get_mut(node) {
            slot.next = next;
        }
    }
}

/// Arena occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Slots in the inline block and all slabs
    pub total: usize,
    /// Slots on the free-list
    pub free: usize,
    /// Managed slots released but not yet recycled
    pub destroying: usize,
    /// Managed slots handed out and not released
    pub live: usize,
    /// Heap slabs allocated so far
    pub slabs: usize,
    /// Static-initializer slots still live
    pub statics: usize,
}

pub(crate) struct Arena {
    table: SlotTable,
    free: Glist,
    destroying: Glist,
    max_slabs: Option<usize>,
}

impl Arena {
    pub(crate) fn new(config: &KernelConfig) -> Self {
        let mut arena = Self {
            table: SlotTable::new(config.inline_handles, config.slab_size.max(1)),
            free: Glist::new(),
            destroying: Glist::new(),
            max_slabs: config.max_slabs,
        };
        for index in 0..config.inline_handles as NodeId {
            arena.free.push_back(&mut arena.table, index);
        }
        arena
    }

    /// Hand out a zeroed slot stamped with `kind`
    pub(crate) fn acquire(&mut self, kind: HandleKind) -> KResult<Handle> {
        self.acquire_with(kind, HandleFlags::empty(), Payload::Empty)
    }

    pub(crate) fn acquire_with(
        &mut self,
        kind: HandleKind,
        flags: HandleFlags,
        payload: Payload,
    ) -> KResult<Handle> {
        if kind == HandleKind::Freed {
            return Err(KernelError::InvalidArgument);
        }
        let index = match self.free.pop(&mut self.table) {
            Some(index) => index,
            None => self.grow()?,
        };
        let slot = self
            .table
            .get_mut(index)
            .ok_or(KernelError::ResourceExhausted)?;
        slot.kind = kind;
        slot.flags = flags | HandleFlags::SYSMEM_MANAGED;
        slot.payload = payload;
        Ok(Handle::new(index, slot.generation))
    }

    /// Add one slab; all but its first slot go on the free-list
    fn grow(&mut self) -> KResult<NodeId> {
        if self
            .max_slabs
            .is_some_and(|max| self.table.slabs.len() >= max)
        {
            return Err(KernelError::ResourceExhausted);
        }
        let slab_size = self.table.slab_size;
        let mut slab = Vec::new();
        slab.try_reserve_exact(slab_size)
            .map_err(|_| KernelError::ResourceExhausted)?;
        slab.resize_with(slab_size, Slot::freed);
        self.table
            .slabs
            .try_reserve(1)
            .map_err(|_| KernelError::ResourceExhausted)?;

        let base = self.table.managed_capacity() as NodeId;
        self.table.slabs.push(slab.into_boxed_slice());
        for index in base + 1..base + slab_size as NodeId {
            self.free.push_back(&mut self.table, index);
        }
        log::debug!(
            "arena: slab {} allocated ({} slots total)",
            self.table.slabs.len(),
            self.table.managed_capacity()
        );
        Ok(base)
    }

    /// Place a static-initializer object outside the slabs, reusing a
    /// recycled entry when there is one
    pub(crate) fn insert_static(
        &mut self,
        kind: HandleKind,
        flags: HandleFlags,
        payload: Payload,
    ) -> KResult<Handle> {
        let free = self
            .table
            .statics
            .iter()
            .position(|slot| slot.kind == HandleKind::Freed);
        let offset = match free {
            Some(offset) => offset,
            None => {
                self.table
                    .statics
                    .try_reserve(1)
                    .map_err(|_| KernelError::ResourceExhausted)?;
                self.table.statics.push(Slot::freed());
                self.table.statics.len() - 1
            }
        };
        let slot = &mut self.table.statics[offset];
        slot.kind = kind;
        slot.flags = (flags | HandleFlags::INITIALIZER) - HandleFlags::SYSMEM_MANAGED;
        slot.payload = payload;
        Ok(Handle::new(STATIC_BASE | offset as NodeId, slot.generation))
    }

    /// Slot for a handle of the right generation, whatever its state
    pub(crate) fn slot(&self, handle: Handle) -> Option<&Slot> {
        self.table
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation() && slot.kind != HandleKind::Freed)
    }

    pub(crate) fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot> {
        self.table
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation() && slot.kind != HandleKind::Freed)
    }

    /// Live slot for a handle; stale or destroying handles are rejected
    pub(crate) fn lookup(&self, handle: Handle) -> KResult<&Slot> {
        self.slot(handle)
            .filter(|slot| slot.is_live())
            .ok_or(KernelError::InvalidHandle)
    }

    pub(crate) fn lookup_mut(&mut self, handle: Handle) -> KResult<&mut Slot> {
        self.slot_mut(handle)
            .filter(|slot| slot.is_live())
            .ok_or(KernelError::InvalidHandle)
    }

    /// Mark a live slot DESTROYING and park it for the next recycle
    pub(crate) fn retire(&mut self, handle: Handle) -> KResult<()> {
        let slot = self.lookup_mut(handle)?;
        slot.flags.insert(HandleFlags::DESTROYING);
        slot.payload.invalidate();
        self.destroying.push_back(&mut self.table, handle.index());
        Ok(())
    }

    /// Give back a slot that was acquired but never published
    pub(crate) fn abandon(&mut self, handle: Handle) {
        let Some(slot) = self.slot_mut(handle) else {
            return;
        };
        let managed = slot.is_managed();
        reset(slot);
        if managed {
            self.free.push_front(&mut self.table, handle.index());
        }
    }

    /// Drain the destroying-list. Returns the number of slots reclaimed.
    pub(crate) fn recycle(&mut self) -> usize {
        let mut reclaimed = 0;
        while let Some(index) = self.destroying.pop(&mut self.table) {
            let Some(slot) = self.table.get_mut(index) else {
                continue;
            };
            let managed = slot.is_managed();
            reset(slot);
            if managed {
                self.free.push_back(&mut self.table, index);
            }
            reclaimed += 1;
        }
        if reclaimed > 0 {
            log::trace!("arena: recycled {} handles", reclaimed);
        }
        reclaimed
    }

    pub(crate) fn is_free(&self, handle: Handle) -> bool {
        self.free.contains(&self.table, handle.index())
    }

    pub(crate) fn is_destroying(&self, handle: Handle) -> bool {
        self.destroying.contains(&self.table, handle.index())
    }

    /// Every live handle, managed slots first
    pub(crate) fn live(&self) -> impl Iterator<Item = (Handle, &Slot)> {
        self.table
            .managed()
            .chain(self.table.statics())
            .filter(|(_, slot)| slot.is_live())
            .map(|(index, slot)| (Handle::new(index, slot.generation), slot))
    }

    pub(crate) fn stats(&self) -> ArenaStats {
        let mut destroying = 0;
        let mut live = 0;
        for (_, slot) in self.table.managed() {
            if slot.kind == HandleKind::Freed {
                continue;
            }
            if slot.flags.contains(HandleFlags::DESTROYING) {
                destroying += 1;
            } else {
                live += 1;
            }
        }
        ArenaStats {
            total: self.table.managed_capacity(),
            free: self.free.len(),
            destroying,
            live,
            slabs: self.table.slabs.len(),
            statics: self.table.statics().filter(|(_, s)| s.is_live()).count(),
        }
    }
}

/// Back to FREED; the generation bump invalidates outstanding handles
fn reset(slot: &mut Slot) {
    slot.kind = HandleKind::Freed;
    slot.flags = HandleFlags::empty();
    slot.payload = Payload::Empty;
    slot.generation = slot.generation.wrapping_add(1).max(1);
}
