// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Userland syscall wrappers.
//!
//! Every call goes through a [`Trap`], which loads the number into RAX and the six
//! arguments into RDX, RCX, RBX, RDI, RSI and R8 before entering the kernel. Pointer
//! arguments are plain addresses in the caller's address space.

use crate::{EnvId, EnvStatus, Errno, Prot, Sysno};

/// Result type of the typed wrappers.
pub type SysResult<T> = Result<T, Errno>;

/// Software trap into the kernel.
pub trait Trap {
    /// Issues syscall `no` with `args` and returns the raw result word.
    fn syscall(&mut self, no: Sysno, args: [usize; 6]) -> usize;
}

/// `int 0x30` trap used by environments running on bare x86-64.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub struct SoftwareInterrupt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl Trap for SoftwareInterrupt {
    fn syscall(&mut self, no: Sysno, args: [usize; 6]) -> usize {
        let mut ret = no.raw();
        // RBX is reserved by LLVM, so it is swapped in and out around the trap.
        // SAFETY: the kernel preserves every register except RAX across the trap.
        unsafe {
            core::arch::asm!(
                "xchg {a3}, rbx",
                "int 0x30",
                "xchg {a3}, rbx",
                a3 = inout(reg) args[2] => _,
                inout("rax") ret,
                in("rdx") args[0],
                in("rcx") args[1],
                in("rdi") args[3],
                in("rsi") args[4],
                in("r8") args[5],
            );
        }
        ret
    }
}

/// Typed syscall surface over a [`Trap`].
pub struct Sys<T: Trap> {
    trap: T,
}

impl<T: Trap> Sys<T> {
    /// Wraps a trap implementation.
    pub fn new(trap: T) -> Self {
        Self { trap }
    }

    /// Returns the underlying trap.
    pub fn trap_mut(&mut self) -> &mut T {
        &mut self.trap
    }

    fn call(&mut self, no: Sysno, args: [usize; 6]) -> SysResult<usize> {
        Errno::decode(self.trap.syscall(no, args))
    }

    /// Writes `len` bytes at `buf` to the console.
    pub fn cputs(&mut self, buf: usize, len: usize) -> SysResult<()> {
        self.call(Sysno::Cputs, [buf, len, 0, 0, 0, 0]).map(drop)
    }

    /// Returns the next console byte, if any.
    pub fn cgetc(&mut self) -> Option<u8> {
        match self.call(Sysno::Cgetc, [0; 6]) {
            Ok(0) | Err(_) => None,
            Ok(byte) => Some(byte as u8),
        }
    }

    /// Returns the caller's id.
    pub fn getenvid(&mut self) -> SysResult<EnvId> {
        let raw = self.call(Sysno::GetEnvId, [0; 6])?;
        EnvId::from_raw(raw).ok_or(Errno::BadEnvironment)
    }

    /// Destroys `env` (`None` for the caller).
    pub fn env_destroy(&mut self, env: Option<EnvId>) -> SysResult<()> {
        self.call(Sysno::EnvDestroy, [raw(env), 0, 0, 0, 0, 0]).map(drop)
    }

    /// Installs a lazily backed region in `env`.
    pub fn alloc_region(&mut self, env: Option<EnvId>, va: usize, len: usize, perm: Prot) -> SysResult<()> {
        self.call(Sysno::AllocRegion, [raw(env), va, len, perm.bits() as usize, 0, 0]).map(drop)
    }

    /// Shares `[src_va, src_va + len)` of `src` at `dst_va` in `dst`.
    pub fn map_region(
        &mut self,
        src: Option<EnvId>,
        src_va: usize,
        dst: Option<EnvId>,
        dst_va: usize,
        len: usize,
        perm: Prot,
    ) -> SysResult<()> {
        self.call(
            Sysno::MapRegion,
            [raw(src), src_va, raw(dst), dst_va, len, perm.bits() as usize],
        )
        .map(drop)
    }

    /// Maps device memory at `pa` into driver environment `env`.
    pub fn map_physical_region(
        &mut self,
        pa: usize,
        env: Option<EnvId>,
        va: usize,
        len: usize,
        perm: Prot,
    ) -> SysResult<()> {
        self.call(Sysno::MapPhysicalRegion, [pa, raw(env), va, len, perm.bits() as usize, 0])
            .map(drop)
    }

    /// Removes every mapping in `[va, va + len)` of `env`.
    pub fn unmap_region(&mut self, env: Option<EnvId>, va: usize, len: usize) -> SysResult<()> {
        self.call(Sysno::UnmapRegion, [raw(env), va, len, 0, 0, 0]).map(drop)
    }

    /// Maximum reference count over `[va, va + len)`.
    ///
    /// `ceiling` is the user-address ceiling; it tells the kernel no second range follows.
    /// This call cannot fail.
    pub fn region_refs(&mut self, va: usize, len: usize, ceiling: usize) -> usize {
        self.trap.syscall(Sysno::RegionRefs, [va, len, ceiling, 0, 0, 0])
    }

    /// Difference between the maximum reference counts of two ranges.
    pub fn region_refs2(&mut self, va: usize, len: usize, va2: usize, len2: usize) -> isize {
        self.trap.syscall(Sysno::RegionRefs, [va, len, va2, len2, 0, 0]) as isize
    }

    /// Creates a blank child. Returns its id in the parent.
    pub fn exofork(&mut self) -> SysResult<usize> {
        self.call(Sysno::Exofork, [0; 6])
    }

    /// Sets the status of `env`.
    pub fn env_set_status(&mut self, env: Option<EnvId>, status: EnvStatus) -> SysResult<()> {
        self.call(Sysno::EnvSetStatus, [raw(env), status as usize, 0, 0, 0, 0]).map(drop)
    }

    /// Replaces the saved context of `env` with the frame stored at `frame`.
    pub fn env_set_trapframe(&mut self, env: Option<EnvId>, frame: usize) -> SysResult<()> {
        self.call(Sysno::EnvSetTrapframe, [raw(env), frame, 0, 0, 0, 0]).map(drop)
    }

    /// Registers the page-fault entry point of `env`.
    pub fn env_set_pgfault_upcall(&mut self, env: Option<EnvId>, entry: usize) -> SysResult<()> {
        self.call(Sysno::EnvSetPgfaultUpcall, [raw(env), entry, 0, 0, 0, 0]).map(drop)
    }

    /// Gives up the CPU.
    pub fn yield_(&mut self) {
        let _ = self.trap.syscall(Sysno::Yield, [0; 6]);
    }

    /// Attempts to deliver `value` (and optionally the page range at `src_va`) to `to`.
    pub fn ipc_try_send(
        &mut self,
        to: EnvId,
        value: usize,
        src_va: usize,
        len: usize,
        perm: Prot,
    ) -> SysResult<()> {
        self.call(Sysno::IpcTrySend, [to.raw(), value, src_va, len, perm.bits() as usize, 0])
            .map(drop)
    }

    /// Blocks until a value arrives. Pass an address at or above the ceiling to refuse pages.
    ///
    /// The returned word is the delivered value; argument errors are reported before the
    /// caller parks.
    pub fn ipc_recv(&mut self, dst_va: usize, max_len: usize) -> usize {
        self.trap.syscall(Sysno::IpcRecv, [dst_va, max_len, 0, 0, 0, 0])
    }

    /// Copies the caller's inbox record to `buf`.
    pub fn ipc_inbox(&mut self, buf: usize) -> SysResult<()> {
        self.call(Sysno::IpcInbox, [buf, 0, 0, 0, 0, 0]).map(drop)
    }

    /// Platform clock.
    pub fn gettime(&mut self) -> usize {
        self.trap.syscall(Sysno::GetTime, [0; 6])
    }

    /// CPU frequency in Hz.
    pub fn get_cpufreq(&mut self) -> usize {
        self.trap.syscall(Sysno::GetCpuFreq, [0; 6])
    }

    /// Raw key code, 0 when none.
    pub fn poll_kbd(&mut self) -> u8 {
        self.trap.syscall(Sysno::PollKbd, [0; 6]) as u8
    }

    /// Renders `ch` into the 32-bit pixel buffer at `buf`, in cell `(x, y)`.
    pub fn drawchar(&mut self, buf: usize, x: u32, y: u32, color: u32, stride: u32, ch: u8) -> SysResult<()> {
        self.call(
            Sysno::DrawChar,
            [buf, x as usize, y as usize, color as usize, stride as usize, ch as usize],
        )
        .map(drop)
    }
}

fn raw(env: Option<EnvId>) -> usize {
    env.map_or(0, EnvId::raw)
}
