// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-environment page mappings with leaf-table accounting.

extern crate alloc;

use alloc::collections::BTreeMap;

use super::{MemError, PhysMemory, Prot, PAGE_SIZE, TABLE_SPAN};
use crate::types::{FrameId, PageLen, PhysAddr, VirtAddr};

/// How a lazy page is populated on first touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    Zero,
    /// Copy of the kernel's shared fill template.
    Copy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    Frame(FrameId),
    Lazy(Fill),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageEntry {
    pub backing: Backing,
    pub prot: Prot,
}

impl PageEntry {
    pub fn frame(self) -> Option<FrameId> {
        match self.backing {
            Backing::Frame(id) => Some(id),
            Backing::Lazy(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct LeafTable {
    frame: FrameId,
    entries: usize,
}

/// Page mappings of one environment.
///
/// Every 2 MiB chunk holding at least one entry is charged one page-table frame, so
/// installing the first page of a chunk can run out of memory.
#[derive(Debug, Default)]
pub struct AddressSpace {
    pages: BTreeMap<usize, PageEntry>,
    tables: BTreeMap<usize, LeafTable>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, va: usize) -> Option<PageEntry> {
        self.pages.get(&VirtAddr::new(va).page_floor().raw()).copied()
    }

    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn table_frames(&self) -> usize {
        self.tables.len()
    }

    /// Resolves `va` to the physical address of its backing frame (present pages only).
    pub fn translate(&self, mem: &PhysMemory, va: usize) -> Option<(PhysAddr, Prot)> {
        let entry = self.entry(va)?;
        let frame = entry.frame()?;
        let pa = mem.phys_addr(frame).raw() + (va % PAGE_SIZE) as u64;
        Some((PhysAddr::new(pa), entry.prot))
    }

    /// Makes sure a leaf table exists for every chunk of `[va, va + len)`.
    ///
    /// All-or-nothing: on failure the tables allocated by this call are released again.
    pub fn reserve_tables(
        &mut self,
        mem: &mut PhysMemory,
        va: VirtAddr,
        len: PageLen,
    ) -> Result<(), MemError> {
        let first = va.raw() / TABLE_SPAN;
        let last = (va.raw() + len.raw() - 1) / TABLE_SPAN;
        let mut added = alloc::vec::Vec::new();
        for chunk in first..=last {
            if self.tables.contains_key(&chunk) {
                continue;
            }
            match mem.alloc() {
                Ok(frame) => {
                    self.tables.insert(chunk, LeafTable { frame, entries: 0 });
                    added.push(chunk);
                }
                Err(err) => {
                    for chunk in added {
                        if let Some(table) = self.tables.remove(&chunk) {
                            mem.decref(table.frame);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Installs `entry` at `va`, replacing (and releasing) whatever was there.
    ///
    /// The caller takes the frame reference for `entry` beforehand and must have reserved
    /// the leaf table.
    pub fn install(&mut self, mem: &mut PhysMemory, va: VirtAddr, entry: PageEntry) {
        let chunk = va.raw() / TABLE_SPAN;
        match self.pages.insert(va.raw(), entry) {
            Some(old) => {
                if let Backing::Frame(frame) = old.backing {
                    mem.decref(frame);
                }
            }
            None => match self.tables.get_mut(&chunk) {
                Some(table) => table.entries += 1,
                None => panic!("install at {:#x} without a leaf table", va.raw()),
            },
        }
    }

    /// Removes the entry at `va`. Returns `false` if nothing was mapped.
    pub fn remove(&mut self, mem: &mut PhysMemory, va: VirtAddr) -> bool {
        let Some(old) = self.pages.remove(&va.raw()) else {
            return false;
        };
        if let Backing::Frame(frame) = old.backing {
            mem.decref(frame);
        }
        let chunk = va.raw() / TABLE_SPAN;
        let empty = match self.tables.get_mut(&chunk) {
            Some(table) => {
                table.entries -= 1;
                table.entries == 0
            }
            None => panic!("entry at {:#x} without a leaf table", va.raw()),
        };
        if empty {
            if let Some(table) = self.tables.remove(&chunk) {
                mem.decref(table.frame);
            }
        }
        true
    }

    /// Removes every entry in `[va, va + len)` and returns how many there were.
    ///
    /// Only live entries are visited, so the cost does not depend on the size of the range.
    pub fn remove_range(&mut self, mem: &mut PhysMemory, va: VirtAddr, len: PageLen) -> usize {
        let end = va.raw().saturating_add(len.raw());
        let mapped: alloc::vec::Vec<usize> = self.pages.range(va.raw()..end).map(|(page, _)| *page).collect();
        for page in &mapped {
            self.remove(mem, VirtAddr::new(*page));
        }
        mapped.len()
    }

    /// Releases leaf tables reserved for entries that were never installed.
    pub fn release_empty_tables(&mut self, mem: &mut PhysMemory) {
        let empty: alloc::vec::Vec<usize> = self
            .tables
            .iter()
            .filter(|(_, table)| table.entries == 0)
            .map(|(chunk, _)| *chunk)
            .collect();
        for chunk in empty {
            if let Some(table) = self.tables.remove(&chunk) {
                mem.decref(table.frame);
            }
        }
    }

    /// Backs a lazy page with a real frame. Present pages are returned as-is.
    pub fn materialize(&mut self, mem: &mut PhysMemory, va: usize) -> Result<FrameId, MemError> {
        let key = VirtAddr::new(va).page_floor().raw();
        let entry = self.pages.get_mut(&key).ok_or(MemError::NotMapped)?;
        match entry.backing {
            Backing::Frame(frame) => Ok(frame),
            Backing::Lazy(fill) => {
                let frame = mem.alloc_filled(fill)?;
                entry.backing = Backing::Frame(frame);
                log::trace!(target: "mm", "materialized {:#x} ({:?})", key, fill);
                Ok(frame)
            }
        }
    }

    /// Checks that every page touched by `[va, va + len)` is mapped user-accessible
    /// with at least `need`.
    pub fn check(&self, va: usize, len: usize, need: Prot) -> Result<(), MemError> {
        if len == 0 {
            return Ok(());
        }
        let end = va.checked_add(len).ok_or(MemError::OutOfRange)?;
        let need = need | Prot::USER;
        let mut page = VirtAddr::new(va).page_floor().raw();
        while page < end {
            let entry = self.pages.get(&page).ok_or(MemError::NotMapped)?;
            if !entry.prot.contains(need) {
                return Err(MemError::PermissionDenied);
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copies user memory into `buf` after checking READ access.
    pub fn read(&mut self, mem: &mut PhysMemory, va: usize, buf: &mut [u8]) -> Result<(), MemError> {
        self.check(va, buf.len(), Prot::READ)?;
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            let frame = self.materialize(mem, addr)?;
            buf[done..done + chunk].copy_from_slice(&mem.bytes(frame)[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `data` into user memory after checking WRITE access.
    pub fn write(&mut self, mem: &mut PhysMemory, va: usize, data: &[u8]) -> Result<(), MemError> {
        self.check(va, data.len(), Prot::WRITE)?;
        let mut done = 0;
        while done < data.len() {
            let addr = va + done;
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let frame = self.materialize(mem, addr)?;
            mem.bytes_mut(frame)[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Highest reference count among frames backing `[va, va + len)`.
    pub fn max_refs(&self, mem: &PhysMemory, va: usize, len: usize) -> u32 {
        if len == 0 {
            return 0;
        }
        let Some(end) = va.checked_add(len) else {
            return 0;
        };
        let start = VirtAddr::new(va).page_floor().raw();
        self.pages
            .range(start..end)
            .filter_map(|(_, entry)| entry.frame())
            .map(|frame| mem.refs(frame))
            .max()
            .unwrap_or(0)
    }

    /// Drops every entry and table. Used when the owning environment is freed.
    pub fn release_all(&mut self, mem: &mut PhysMemory) {
        for (_, entry) in core::mem::take(&mut self.pages) {
            if let Backing::Frame(frame) = entry.backing {
                mem.decref(frame);
            }
        }
        for (_, table) in core::mem::take(&mut self.tables) {
            mem.decref(table.frame);
        }
    }
}
