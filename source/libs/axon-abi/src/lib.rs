// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(all(target_arch = "x86_64", target_os = "none")), forbid(unsafe_code))]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions between the axon kernel and its environments
//! OWNERS: @runtime
//! PUBLIC API: Sysno, Errno, Prot, EnvId, EnvType, EnvStatus, InboxRecord, sys::{Trap, Sys}
//! DEPENDS_ON: bitflags, thiserror (no_std)
//! INVARIANTS: Syscall numbers are stable and dense; error codes are negative in the result word
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

mod env;
pub mod sys;

pub use env::{EnvId, EnvStatus, EnvType, InboxRecord, ENV_INDEX_BITS, MAX_ENVS};

use bitflags::bitflags;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Syscall numbers, passed in RAX.
///
/// The numbering is part of the stable ABI: new calls are appended, never inserted.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sysno {
    /// Write a user buffer to the console.
    Cputs = 0,
    /// Read one console byte without blocking (0 when none is pending).
    Cgetc = 1,
    /// Return the caller's environment id.
    GetEnvId = 2,
    /// Destroy an environment.
    EnvDestroy = 3,
    /// Install a lazily backed region.
    AllocRegion = 4,
    /// Share an existing mapping into another (or the same) address space.
    MapRegion = 5,
    /// Map device memory into a driver environment.
    MapPhysicalRegion = 6,
    /// Remove mappings from a range.
    UnmapRegion = 7,
    /// Query the maximum frame reference count over one or two ranges.
    RegionRefs = 8,
    /// Create a blank child environment.
    Exofork = 9,
    /// Mark an environment runnable or not runnable.
    EnvSetStatus = 10,
    /// Replace an environment's saved context.
    EnvSetTrapframe = 11,
    /// Register the user page-fault entry point.
    EnvSetPgfaultUpcall = 12,
    /// Give up the CPU.
    Yield = 13,
    /// Attempt a rendezvous with a receiving environment.
    IpcTrySend = 14,
    /// Block until a sender delivers a value (and optionally a page).
    IpcRecv = 15,
    /// Return the platform clock.
    GetTime = 16,
    /// Return the CPU frequency in Hz.
    GetCpuFreq = 17,
    /// Return the raw pending key code (0 when none).
    PollKbd = 18,
    /// Render an 8x8 glyph into a user pixel buffer.
    DrawChar = 19,
    /// Copy the caller's last delivered IPC record to a user buffer.
    IpcInbox = 20,
}

impl Sysno {
    /// Number of defined syscalls.
    pub const COUNT: usize = 21;

    /// Decodes a raw syscall number.
    pub fn from_raw(raw: usize) -> Option<Self> {
        use Sysno::*;
        const TABLE: [Sysno; Sysno::COUNT] = [
            Cputs,
            Cgetc,
            GetEnvId,
            EnvDestroy,
            AllocRegion,
            MapRegion,
            MapPhysicalRegion,
            UnmapRegion,
            RegionRefs,
            Exofork,
            EnvSetStatus,
            EnvSetTrapframe,
            EnvSetPgfaultUpcall,
            Yield,
            IpcTrySend,
            IpcRecv,
            GetTime,
            GetCpuFreq,
            PollKbd,
            DrawChar,
            IpcInbox,
        ];
        TABLE.get(raw).copied()
    }

    /// Returns the raw syscall number.
    pub const fn raw(self) -> usize {
        self as usize
    }
}

/// Error kinds returned to environments as negative result words.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Errno {
    /// Unknown environment id, stale generation, or no authority over it.
    #[error("bad environment")]
    BadEnvironment,
    /// Bad alignment, out-of-range address or disallowed flag combination.
    #[error("invalid argument")]
    InvalidArgument,
    /// Physical memory (or a page-table frame) could not be allocated.
    #[error("out of memory")]
    NoMemory,
    /// The environment table is full.
    #[error("no free environment")]
    NoFreeEnvironment,
    /// The caller touched memory it does not own. Never observed by a live caller.
    #[error("fault")]
    Fault,
    /// The IPC target is not blocked in `recv`.
    #[error("target is not receiving")]
    NotReceiving,
    /// Unknown syscall number.
    #[error("no such call")]
    NoSuchCall,
}

impl Errno {
    /// Returns the (negative) code placed in the result register.
    pub const fn code(self) -> isize {
        match self {
            Self::BadEnvironment => -2,
            Self::InvalidArgument => -3,
            Self::NoMemory => -4,
            Self::NoFreeEnvironment => -5,
            Self::Fault => -6,
            Self::NotReceiving => -7,
            Self::NoSuchCall => -16,
        }
    }

    /// Maps a negative code back to its error kind.
    pub fn from_code(code: isize) -> Option<Self> {
        Some(match code {
            -2 => Self::BadEnvironment,
            -3 => Self::InvalidArgument,
            -4 => Self::NoMemory,
            -5 => Self::NoFreeEnvironment,
            -6 => Self::Fault,
            -7 => Self::NotReceiving,
            -16 => Self::NoSuchCall,
            _ => return None,
        })
    }

    /// Encodes the error as a raw result word.
    pub const fn to_word(self) -> usize {
        self.code() as usize
    }

    /// Splits a raw result word into a value or an error.
    ///
    /// Words that do not carry a known error code are returned unchanged.
    pub fn decode(word: usize) -> Result<usize, Errno> {
        match Self::from_code(word as isize) {
            Some(err) => Err(err),
            None => Ok(word),
        }
    }
}

bitflags! {
    /// Permission and backing-policy bits for user mappings.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Prot: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC = 1 << 2;
        /// User-accessible. Added by the kernel to every user mapping.
        const USER = 1 << 3;
        /// May be shared with other environments.
        const SHARE = 1 << 4;
        /// Write-combining memory type.
        const COMBINE = 1 << 5;
        /// Cache disabled (device memory).
        const NO_CACHE = 1 << 6;
        /// Lazily backed, zero-filled on first access.
        const ZERO_FILL = 1 << 8;
        /// Lazily backed, copied from the kernel fill template on first access.
        const COPY_FILL = 1 << 9;

        /// Read and write.
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// Every bit a caller may request for an existing or shared mapping.
        const ALL = Self::READ.bits()
            | Self::WRITE.bits()
            | Self::EXEC.bits()
            | Self::SHARE.bits()
            | Self::COMBINE.bits()
            | Self::NO_CACHE.bits();
        /// Backing-policy bits.
        const LAZY = Self::ZERO_FILL.bits() | Self::COPY_FILL.bits();
    }
}

impl Prot {
    /// Decodes a raw argument word, rejecting unknown bits.
    pub fn from_word(word: usize) -> Option<Self> {
        u32::try_from(word).ok().and_then(Self::from_bits)
    }

    /// Returns the access bits (READ/WRITE/EXEC) only.
    pub fn access(self) -> Self {
        self & (Self::READ | Self::WRITE | Self::EXEC)
    }
}
