// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Environment identifiers and status codes shared with userland.

use core::fmt;
use core::num::NonZeroU32;

use crate::Prot;

/// Number of low id bits that select the environment slot.
pub const ENV_INDEX_BITS: u32 = 10;
/// Upper bound on simultaneously live environments.
pub const MAX_ENVS: usize = 1 << ENV_INDEX_BITS;

const GENERATION_MASK: u32 = u32::MAX >> ENV_INDEX_BITS;

/// Generation-tagged environment id.
///
/// The low [`ENV_INDEX_BITS`] select the slot and the remaining bits carry a reuse
/// generation, so an id kept across a destroy/create cycle no longer resolves. A raw
/// argument of 0 is reserved for "the calling environment".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvId(NonZeroU32);

impl EnvId {
    /// Builds an id from a slot index and a non-zero generation.
    pub fn new(index: usize, generation: u32) -> Option<Self> {
        if index >= MAX_ENVS || generation == 0 || generation > GENERATION_MASK {
            return None;
        }
        NonZeroU32::new((generation << ENV_INDEX_BITS) | index as u32).map(Self)
    }

    /// Decodes an id passed through a register. Returns `None` for 0 and for values
    /// that cannot be ids.
    pub fn from_raw(raw: usize) -> Option<Self> {
        let raw = u32::try_from(raw).ok()?;
        if raw >> ENV_INDEX_BITS == 0 {
            return None;
        }
        NonZeroU32::new(raw).map(Self)
    }

    /// Returns the raw register encoding.
    pub const fn raw(self) -> usize {
        self.0.get() as usize
    }

    /// Returns the slot index.
    pub const fn index(self) -> usize {
        (self.0.get() & (MAX_ENVS as u32 - 1)) as usize
    }

    /// Returns the reuse generation.
    pub const fn generation(self) -> u32 {
        self.0.get() >> ENV_INDEX_BITS
    }

    /// Returns the generation that follows `generation`, skipping 0.
    pub fn next_generation(generation: u32) -> u32 {
        match generation.wrapping_add(1) & GENERATION_MASK {
            0 => 1,
            next => next,
        }
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({}#{})", self.index(), self.generation())
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0.get())
    }
}

/// Privilege class of an environment.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvType {
    /// Ordinary program.
    User = 0,
    /// Filesystem driver; may map device memory.
    FsDriver = 1,
    /// Video server; may map device memory.
    VideoDriver = 2,
}

impl EnvType {
    /// Whether environments of this type may call `map_physical_region`.
    pub const fn is_driver(self) -> bool {
        matches!(self, Self::FsDriver | Self::VideoDriver)
    }
}

/// Environment scheduling status.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvStatus {
    /// Slot is unused.
    Free = 0,
    /// Destroyed while running; reclaimed at the next scheduling point.
    Dying = 1,
    /// Eligible to run.
    Runnable = 2,
    /// Parked (freshly created, blocked in `recv`, or stopped by its parent).
    NotRunnable = 3,
}

impl EnvStatus {
    /// Decodes a status argument. Only the two settable states are accepted.
    pub fn settable(raw: usize) -> Option<Self> {
        match raw {
            2 => Some(Self::Runnable),
            3 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

/// Record written by `ipc_inbox`: who delivered the last message and what came with it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InboxRecord {
    /// Raw id of the sender, 0 when nothing was delivered yet.
    pub from: u64,
    /// Delivered scalar.
    pub value: u64,
    /// Delivered permission bits (empty when no page was transferred).
    pub perm: u32,
    /// Number of bytes mapped at the receive address.
    pub len: u64,
}

impl InboxRecord {
    /// Encoded size in bytes.
    pub const SIZE: usize = 32;

    /// Encodes the record as little-endian words.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.from.to_le_bytes());
        out[8..16].copy_from_slice(&self.value.to_le_bytes());
        out[16..20].copy_from_slice(&self.perm.to_le_bytes());
        out[24..32].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decodes a record produced by [`InboxRecord::to_bytes`].
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let mut perm = [0u8; 4];
        perm.copy_from_slice(&bytes[16..20]);
        Self { from: word(0), value: word(8), perm: u32::from_le_bytes(perm), len: word(24) }
    }

    /// Returns the delivered permission bits.
    pub fn prot(&self) -> Prot {
        Prot::from_bits_truncate(self.perm)
    }

    /// Returns the sender id, if a message was delivered.
    pub fn sender(&self) -> Option<EnvId> {
        EnvId::from_raw(self.from as usize)
    }
}
