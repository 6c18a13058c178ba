// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame pool and per-environment mappings
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysMemory, MemError, AddressSpace, PageEntry, Backing, Fill, region::*
//! DEPENDS_ON: types::{FrameId, PhysAddr}, abi::Prot
//! INVARIANTS: A frame's refcount equals the number of live entries pointing at it;
//!             RAM frames return to the pool at zero, device frames never do
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

pub mod address_space;
pub mod region;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::types::{FrameId, PhysAddr};

pub use address_space::{AddressSpace, Backing, Fill, PageEntry};
pub use crate::abi::{Prot, PAGE_SIZE};

/// Bytes covered by one leaf page table.
pub const TABLE_SPAN: usize = PAGE_SIZE * 512;

/// Error returned by mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemError {
    #[error("address is not page aligned")]
    Unaligned,
    #[error("range reaches past the user ceiling")]
    OutOfRange,
    #[error("empty range")]
    Empty,
    #[error("permission bits not allowed here")]
    InvalidPerm,
    #[error("no mapping at address")]
    NotMapped,
    #[error("mapping lacks the requested permission")]
    PermissionDenied,
    #[error("destination already mapped")]
    Overlap,
    #[error("out of physical memory")]
    NoMemory,
    #[error("physical range is not registered device memory")]
    NotDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Ram,
    Device,
}

#[derive(Debug)]
struct Frame {
    refs: u32,
    kind: FrameKind,
    pa: PhysAddr,
    data: Option<Box<[u8]>>,
}

/// Reference-counted page frame pool.
///
/// RAM occupies `[0, ram_frames * PAGE_SIZE)`; device frames are registered the first
/// time a device page is mapped and live for the rest of the run.
pub struct PhysMemory {
    frames: Vec<Frame>,
    free: Vec<FrameId>,
    ram_frames: usize,
    devices: BTreeMap<u64, FrameId>,
    template: Box<[u8]>,
    #[cfg(feature = "failpoints")]
    deny_next_alloc: bool,
}

impl PhysMemory {
    pub fn new(ram_frames: usize, fill_byte: u8) -> Self {
        let frames = (0..ram_frames)
            .map(|index| Frame {
                refs: 0,
                kind: FrameKind::Ram,
                pa: PhysAddr::new((index * PAGE_SIZE) as u64),
                data: None,
            })
            .collect();
        // Popped from the back, so the lowest frame goes out first and a freed frame
        // is the next one handed out.
        let free = (0..ram_frames).rev().map(FrameId::from_index).collect();
        Self {
            frames,
            free,
            ram_frames,
            devices: BTreeMap::new(),
            template: vec![fill_byte; PAGE_SIZE].into_boxed_slice(),
            #[cfg(feature = "failpoints")]
            deny_next_alloc: false,
        }
    }

    /// Allocates a zeroed RAM frame with one reference.
    pub fn alloc(&mut self) -> Result<FrameId, MemError> {
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.deny_next_alloc) {
            return Err(MemError::NoMemory);
        }
        let id = self.free.pop().ok_or(MemError::NoMemory)?;
        let frame = &mut self.frames[id.index()];
        debug_assert_eq!(frame.refs, 0);
        frame.refs = 1;
        frame.data = Some(vec![0u8; PAGE_SIZE].into_boxed_slice());
        log::trace!(target: "mm", "alloc frame {}", frame.pa);
        Ok(id)
    }

    /// Allocates a frame populated according to `fill`.
    pub fn alloc_filled(&mut self, fill: Fill) -> Result<FrameId, MemError> {
        let id = self.alloc()?;
        if fill == Fill::Copy {
            let template = &self.template;
            if let Some(data) = self.frames[id.index()].data.as_mut() {
                data.copy_from_slice(template);
            }
        }
        Ok(id)
    }

    /// Returns the frame backing device page `pa`, registering it on first use.
    pub fn device_frame(&mut self, pa: PhysAddr) -> FrameId {
        if let Some(id) = self.devices.get(&pa.raw()) {
            return *id;
        }
        let id = FrameId::from_index(self.frames.len());
        self.frames.push(Frame {
            refs: 0,
            kind: FrameKind::Device,
            pa,
            data: Some(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        });
        self.devices.insert(pa.raw(), id);
        id
    }

    pub fn incref(&mut self, id: FrameId) {
        let frame = &mut self.frames[id.index()];
        assert!(frame.data.is_some(), "incref on free frame {:?}", id);
        frame.refs += 1;
    }

    /// Drops one reference; a RAM frame reaching zero goes back to the pool.
    pub fn decref(&mut self, id: FrameId) {
        let frame = &mut self.frames[id.index()];
        frame.refs = match frame.refs.checked_sub(1) {
            Some(refs) => refs,
            None => panic!("refcount underflow on frame {:?}", id),
        };
        if frame.refs == 0 && frame.kind == FrameKind::Ram {
            frame.data = None;
            self.free.push(id);
            log::trace!(target: "mm", "free frame {}", frame.pa);
        }
    }

    pub fn refs(&self, id: FrameId) -> u32 {
        self.frames[id.index()].refs
    }

    pub fn kind(&self, id: FrameId) -> FrameKind {
        self.frames[id.index()].kind
    }

    pub fn phys_addr(&self, id: FrameId) -> PhysAddr {
        self.frames[id.index()].pa
    }

    pub fn bytes(&self, id: FrameId) -> &[u8] {
        match self.frames[id.index()].data.as_deref() {
            Some(data) => data,
            None => panic!("access to free frame {:?}", id),
        }
    }

    pub fn bytes_mut(&mut self, id: FrameId) -> &mut [u8] {
        match self.frames[id.index()].data.as_deref_mut() {
            Some(data) => data,
            None => panic!("access to free frame {:?}", id),
        }
    }

    /// Reads device memory by physical address, as the device would see it.
    pub fn device_bytes(&self, pa: PhysAddr) -> Option<&[u8]> {
        self.devices.get(&pa.raw()).map(|id| self.bytes(*id))
    }

    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    pub fn ram_frames(&self) -> usize {
        self.ram_frames
    }

    /// Forces the next [`PhysMemory::alloc`] to report [`MemError::NoMemory`].
    #[cfg(feature = "failpoints")]
    pub fn deny_next_alloc(&mut self) {
        self.deny_next_alloc = true;
    }
}
