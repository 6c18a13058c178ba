// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment table, descriptors and lifecycle state machine
//! OWNERS: @kernel-team
//! PUBLIC API: EnvTable (create/get/resolve/set_status/destroy/reap), Env, Inbox, EnvError
//! DEPENDS_ON: mm::{AddressSpace, PhysMemory}, trap::TrapFrame
//! INVARIANTS: Slot reuse bumps the generation; authority = self or an ancestor;
//!             destroy never touches another environment's state
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::vec::Vec;

use crate::abi::{EnvId, EnvStatus, EnvType, InboxRecord, Prot};
use crate::mm::{AddressSpace, PhysMemory};
use crate::trap::TrapFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnvError {
    /// Unknown slot or stale generation.
    #[error("no such environment")]
    NotFound,
    /// Caller is neither the target nor one of its ancestors.
    #[error("no authority over environment")]
    NoAuthority,
    /// Operation reserved for driver environments.
    #[error("environment is not a driver")]
    NotDriver,
    #[error("environment table is full")]
    TableFull,
    #[error("status cannot be set")]
    InvalidStatus,
}

/// IPC receive state and the record of the last delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inbox {
    pub recving: bool,
    /// Where a transferred page should land; `None` for value-only receives.
    pub dst: Option<usize>,
    pub max_len: usize,
    pub from: Option<EnvId>,
    pub value: usize,
    pub perm: Prot,
    /// Bytes mapped at `dst` by the last delivery.
    pub len: usize,
}

impl Inbox {
    pub fn record(&self) -> InboxRecord {
        InboxRecord {
            from: self.from.map_or(0, |id| id.raw() as u64),
            value: self.value as u64,
            perm: self.perm.bits(),
            len: self.len as u64,
        }
    }
}

/// Environment descriptor.
#[derive(Debug)]
pub struct Env {
    pub id: EnvId,
    pub parent: Option<EnvId>,
    pub kind: EnvType,
    pub status: EnvStatus,
    pub space: AddressSpace,
    pub frame: TrapFrame,
    pub fault_entry: Option<usize>,
    pub inbox: Inbox,
    pub runs: u64,
}

struct Slot {
    generation: u32,
    env: Option<Env>,
}

/// Arena of environments indexed by generation-tagged ids.
pub struct EnvTable {
    slots: Vec<Slot>,
    current: Option<EnvId>,
}

impl EnvTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot { generation: 0, env: None }).collect();
        Self { slots, current: None }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Creates a NOT_RUNNABLE environment with an empty address space.
    pub fn create(&mut self, kind: EnvType, parent: Option<EnvId>) -> Result<EnvId, EnvError> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.env.is_none())
            .ok_or(EnvError::TableFull)?;
        slot.generation = EnvId::next_generation(slot.generation);
        let id = EnvId::new(index, slot.generation).ok_or(EnvError::TableFull)?;
        slot.env = Some(Env {
            id,
            parent,
            kind,
            status: EnvStatus::NotRunnable,
            space: AddressSpace::new(),
            frame: TrapFrame::default(),
            fault_entry: None,
            inbox: Inbox::default(),
            runs: 0,
        });
        log::info!(target: "env", "created {:?} kind={:?} parent={:?}", id, kind, parent);
        Ok(id)
    }

    pub fn get(&self, id: EnvId) -> Result<&Env, EnvError> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.env.as_ref())
            .filter(|env| env.id == id)
            .ok_or(EnvError::NotFound)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Result<&mut Env, EnvError> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.env.as_mut())
            .filter(|env| env.id == id)
            .ok_or(EnvError::NotFound)
    }

    /// Live (not FREE, not DYING) environment lookup.
    pub fn live(&self, id: EnvId) -> Result<&Env, EnvError> {
        self.get(id).and_then(|env| match env.status {
            EnvStatus::Free | EnvStatus::Dying => Err(EnvError::NotFound),
            _ => Ok(env),
        })
    }

    /// `true` when `caller` is `target` or sits on `target`'s creator chain.
    pub fn has_authority(&self, caller: EnvId, target: EnvId) -> bool {
        if caller == target {
            return true;
        }
        let mut cursor = self.get(target).ok().and_then(|env| env.parent);
        // A chain can never be longer than the table.
        for _ in 0..self.slots.len() {
            match cursor {
                Some(id) if id == caller => return true,
                Some(id) => cursor = self.get(id).ok().and_then(|env| env.parent),
                None => return false,
            }
        }
        false
    }

    /// Resolves a raw id argument: 0 names the caller. With `check_authority` the caller
    /// must have authority over the result.
    pub fn resolve(
        &self,
        caller: EnvId,
        raw: usize,
        check_authority: bool,
    ) -> Result<EnvId, EnvError> {
        if raw == 0 {
            return Ok(caller);
        }
        let id = EnvId::from_raw(raw).ok_or(EnvError::NotFound)?;
        self.live(id)?;
        if check_authority && !self.has_authority(caller, id) {
            return Err(EnvError::NoAuthority);
        }
        Ok(id)
    }

    pub fn current(&self) -> Option<EnvId> {
        self.current
    }

    pub fn set_current(&mut self, id: Option<EnvId>) {
        self.current = id;
    }

    /// Moves a live environment between RUNNABLE and NOT_RUNNABLE.
    pub fn set_status(&mut self, id: EnvId, status: EnvStatus) -> Result<(), EnvError> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(EnvError::InvalidStatus);
        }
        let env = self.get_mut(id)?;
        if matches!(env.status, EnvStatus::Free | EnvStatus::Dying) {
            return Err(EnvError::NotFound);
        }
        env.status = status;
        Ok(())
    }

    /// Destroys `id`, releasing its address space. The running environment is only
    /// marked DYING and is reclaimed by [`EnvTable::reap`].
    pub fn destroy(&mut self, id: EnvId, mem: &mut PhysMemory) -> Result<(), EnvError> {
        let is_current = self.current == Some(id);
        let env = self.get_mut(id)?;
        env.space.release_all(mem);
        env.inbox = Inbox::default();
        if is_current {
            env.status = EnvStatus::Dying;
            log::warn!(target: "env", "destroying running {:?}", id);
        } else {
            self.slots[id.index()].env = None;
            log::info!(target: "env", "freed {:?}", id);
        }
        Ok(())
    }

    /// Frees every DYING environment.
    pub fn reap(&mut self) {
        for slot in &mut self.slots {
            if matches!(&slot.env, Some(env) if env.status == EnvStatus::Dying) {
                if let Some(env) = slot.env.take() {
                    log::info!(target: "env", "reaped {:?}", env.id);
                }
            }
        }
        if let Some(id) = self.current {
            if self.get(id).is_err() {
                self.current = None;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().filter_map(|slot| slot.env.as_ref())
    }

    /// Occupied slot for `index`, if any. Used by the scheduler's circular scan.
    pub fn at_index(&self, index: usize) -> Option<&Env> {
        self.slots.get(index).and_then(|slot| slot.env.as_ref())
    }

    pub fn status(&self, id: EnvId) -> EnvStatus {
        self.get(id).map_or(EnvStatus::Free, |env| env.status)
    }
}
