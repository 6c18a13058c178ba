// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Region Manager (allocate / map / map_physical / unmap / ref_count)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: allocate, collect_shared, install_shared, map_physical, unmap, ref_count
//! DEPENDS_ON: mm::{AddressSpace, PhysMemory}, config::DeviceWindow
//! INVARIANTS: Arguments are fully validated before the first entry changes; leaf tables
//!             are reserved up front so installs cannot fail halfway

extern crate alloc;

use alloc::vec::Vec;

use super::{AddressSpace, Backing, Fill, MemError, PageEntry, PhysMemory, Prot, PAGE_SIZE};
use crate::config::DeviceWindow;
use crate::types::{FrameId, PageLen, PhysAddr, VirtAddr};

/// Page-aligned start below the ceiling and a page-rounded length that stays below it.
fn user_range(va: usize, len: usize, ceiling: usize) -> Result<(VirtAddr, PageLen), MemError> {
    let va = VirtAddr::page_aligned(va).ok_or(MemError::Unaligned)?;
    if va.raw() >= ceiling {
        return Err(MemError::OutOfRange);
    }
    let len = PageLen::round_up(len).ok_or(MemError::Empty)?;
    if !va.range_below(len.raw(), ceiling) {
        return Err(MemError::OutOfRange);
    }
    Ok((va, len))
}

fn pages(va: VirtAddr, len: PageLen) -> impl Iterator<Item = VirtAddr> {
    (0..len.pages()).map(move |page| VirtAddr::new(va.raw() + page * PAGE_SIZE))
}

/// Installs a lazily backed range. Exactly one of ZERO_FILL / COPY_FILL must be given;
/// existing entries in the range are replaced.
pub fn allocate(
    mem: &mut PhysMemory,
    space: &mut AddressSpace,
    va: usize,
    len: usize,
    perm: Prot,
    ceiling: usize,
) -> Result<(), MemError> {
    let (va, len) = user_range(va, len, ceiling)?;
    if !(Prot::ALL | Prot::USER | Prot::LAZY).contains(perm) {
        return Err(MemError::InvalidPerm);
    }
    let fill = match (perm.contains(Prot::ZERO_FILL), perm.contains(Prot::COPY_FILL)) {
        (true, false) => Fill::Zero,
        (false, true) => Fill::Copy,
        _ => return Err(MemError::InvalidPerm),
    };
    space.reserve_tables(mem, va, len)?;
    let prot = perm.difference(Prot::LAZY) | Prot::USER;
    for page in pages(va, len) {
        space.install(mem, page, PageEntry { backing: Backing::Lazy(fill), prot });
    }
    log::debug!(target: "mm", "allocate {:#x}+{:#x} {:?} {:?}", va.raw(), len.raw(), fill, prot);
    Ok(())
}

/// Validates a source range for sharing and returns its frames with their permissions.
///
/// Every page must be mapped, and WRITE in `perm` requires WRITE on every source page.
/// Lazy pages are materialized so both sides end up on the same frame. No references
/// are taken here.
pub fn collect_shared(
    mem: &mut PhysMemory,
    space: &mut AddressSpace,
    va: usize,
    len: usize,
    perm: Prot,
    ceiling: usize,
) -> Result<Vec<(FrameId, Prot)>, MemError> {
    let (va, len) = user_range(va, len, ceiling)?;
    if !(Prot::ALL | Prot::USER).contains(perm) {
        return Err(MemError::InvalidPerm);
    }
    for page in pages(va, len) {
        let entry = space.entry(page.raw()).ok_or(MemError::NotMapped)?;
        if perm.contains(Prot::WRITE) && !entry.prot.contains(Prot::WRITE) {
            return Err(MemError::PermissionDenied);
        }
    }
    let mut frames = Vec::with_capacity(len.pages());
    for page in pages(va, len) {
        let frame = space.materialize(mem, page.raw())?;
        let prot = space.entry(page.raw()).map(|entry| entry.prot).unwrap_or(Prot::empty());
        frames.push((frame, prot));
    }
    Ok(frames)
}

/// Maps `frames` consecutively at `va` with `prot | USER`, taking one reference per page.
///
/// Either every page is installed or (on `NoMemory` for page tables) none is. All
/// references are taken before the first install, so a destination that overlaps the
/// source range cannot free a frame that is still waiting to be mapped.
pub fn install_shared(
    mem: &mut PhysMemory,
    space: &mut AddressSpace,
    va: usize,
    frames: &[(FrameId, Prot)],
    prot: Prot,
    ceiling: usize,
) -> Result<(), MemError> {
    let (va, len) = user_range(va, frames.len() * PAGE_SIZE, ceiling)?;
    space.reserve_tables(mem, va, len)?;
    let prot = prot | Prot::USER;
    for (frame, _) in frames {
        mem.incref(*frame);
    }
    for (page, (frame, _)) in pages(va, len).zip(frames) {
        space.install(mem, page, PageEntry { backing: Backing::Frame(*frame), prot });
    }
    Ok(())
}

/// Maps registered device memory `[pa, pa + len)` at `va`.
pub fn map_physical(
    mem: &mut PhysMemory,
    space: &mut AddressSpace,
    devices: &[DeviceWindow],
    pa: usize,
    va: usize,
    len: usize,
    perm: Prot,
    ceiling: usize,
) -> Result<(), MemError> {
    if pa % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
        return Err(MemError::Unaligned);
    }
    let (va, len) = user_range(va, len, ceiling)?;
    let allowed = Prot::ALL.difference(Prot::SHARE | Prot::COMBINE) | Prot::USER;
    if !allowed.contains(perm) {
        return Err(MemError::InvalidPerm);
    }
    let base = pa as u64;
    if !devices.iter().any(|window| window.contains(base, len.raw() as u64)) {
        return Err(MemError::NotDevice);
    }
    if pages(va, len).any(|page| space.entry(page.raw()).is_some()) {
        return Err(MemError::Overlap);
    }
    space.reserve_tables(mem, va, len)?;
    let prot = perm | Prot::USER;
    for (index, page) in pages(va, len).enumerate() {
        let frame = mem.device_frame(PhysAddr::new(base + (index * PAGE_SIZE) as u64));
        mem.incref(frame);
        space.install(mem, page, PageEntry { backing: Backing::Frame(frame), prot });
    }
    log::debug!(target: "mm", "map device {:#x}+{:#x} at {:#x}", base, len.raw(), va.raw());
    Ok(())
}

/// Removes every entry in range. Unmapped pages and an empty range are not errors.
pub fn unmap(
    mem: &mut PhysMemory,
    space: &mut AddressSpace,
    va: usize,
    len: usize,
    ceiling: usize,
) -> Result<(), MemError> {
    if len == 0 {
        return VirtAddr::page_aligned(va).map(drop).ok_or(MemError::Unaligned);
    }
    let (va, len) = user_range(va, len, ceiling)?;
    let removed = space.remove_range(mem, va, len);
    log::debug!(target: "mm", "unmap {:#x}+{:#x} ({} pages)", va.raw(), len.raw(), removed);
    Ok(())
}

/// Maximum reference count over `[va, va + len)`; lazy and unmapped pages count zero.
pub fn ref_count(mem: &PhysMemory, space: &AddressSpace, va: usize, len: usize) -> u32 {
    space.max_refs(mem, va, len)
}
