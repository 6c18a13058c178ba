// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for syscall decoding and frame bookkeeping
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, PageLen, PhysAddr, FrameId, EnvId (re-export)
//! DEPENDS_ON: axon_abi::PAGE_SIZE
//! INVARIANTS: Aligned constructors reject unaligned input; no implicit conversions

use core::fmt;

pub use axon_abi::{EnvId, PAGE_SIZE};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        if addr % PAGE_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<usize> {
        self.0.checked_add(v)
    }

    /// Returns `true` when `[self, self + len)` lies entirely below `ceiling`.
    #[inline]
    pub fn range_below(self, len: usize, ceiling: usize) -> bool {
        matches!(self.0.checked_add(len), Some(end) if end <= ceiling)
    }

    #[inline]
    pub const fn page_floor(self) -> Self {
        Self(self.0 - self.0 % PAGE_SIZE)
    }
}

/// A non-zero, page-aligned length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageLen(usize);

impl PageLen {
    #[inline]
    pub fn from_bytes_aligned(bytes: usize) -> Option<Self> {
        if bytes != 0 && bytes % PAGE_SIZE == 0 {
            Some(Self(bytes))
        } else {
            None
        }
    }

    /// Rounds `bytes` up to whole pages. Zero stays invalid.
    #[inline]
    pub fn round_up(bytes: usize) -> Option<Self> {
        if bytes == 0 {
            return None;
        }
        bytes.checked_add(PAGE_SIZE - 1).map(|b| Self(b - b % PAGE_SIZE))
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn pages(self) -> usize {
        self.0 / PAGE_SIZE
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of a physical frame tracked by [`crate::mm::PhysMemory`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameId(u32);

impl FrameId {
    #[inline]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}
