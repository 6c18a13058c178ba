// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: env::EnvTable, mm::{region, PhysMemory}, ipc, hal::{Platform, ConsoleRing}
//! INVARIANTS: Stable syscall numbers; Decode→Check→Execute pattern; every user pointer is
//!             checked against the caller's mappings before the kernel touches it
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::cmp;

use super::{Args, Error, SysResult, SyscallTable};
use crate::abi::{EnvId, EnvStatus, EnvType, Prot, Sysno};
use crate::config::KernelConfig;
use crate::env::{EnvError, EnvTable};
use crate::hal::font::GLYPH_SIZE;
use crate::hal::{ConsoleRing, Platform};
use crate::ipc::{self, Message};
use crate::mm::{region, MemError, PhysMemory};
use crate::trap::TrapFrame;

/// Bytes copied per console write.
const CPUTS_CHUNK: usize = 256;
/// Bytes per pixel of a `drawchar` target buffer.
const PIXEL_BYTES: usize = 4;

// Typed decoders for seL4-style Decode→Check→Execute

#[derive(Copy, Clone)]
struct CputsArgsTyped {
    buf: usize,
    len: usize,
}

impl CputsArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { buf: args.get(0), len: args.get(1) })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        self.buf.checked_add(self.len).map(drop).ok_or(Error::Fault { va: self.buf })
    }
}

#[derive(Copy, Clone)]
struct AllocArgsTyped {
    env: usize,
    va: usize,
    len: usize,
    perm: Prot,
}

impl AllocArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            env: args.get(0),
            va: args.get(1),
            len: args.get(2),
            perm: Prot::from_word(args.get(3)).ok_or(Error::InvalidArgs)?,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.len == 0 {
            return Err(MemError::Empty.into());
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct MapArgsTyped {
    src: usize,
    src_va: usize,
    dst: usize,
    dst_va: usize,
    len: usize,
    perm: Prot,
}

impl MapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            src: args.get(0),
            src_va: args.get(1),
            dst: args.get(2),
            dst_va: args.get(3),
            len: args.get(4),
            perm: Prot::from_word(args.get(5)).ok_or(Error::InvalidArgs)?,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.perm.intersects(Prot::LAZY) {
            return Err(MemError::InvalidPerm.into());
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct MapPhysicalArgsTyped {
    pa: usize,
    env: usize,
    va: usize,
    len: usize,
    perm: Prot,
}

impl MapPhysicalArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            pa: args.get(0),
            env: args.get(1),
            va: args.get(2),
            len: args.get(3),
            perm: Prot::from_word(args.get(4)).ok_or(Error::InvalidArgs)?,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.len == 0 {
            return Err(MemError::Empty.into());
        }
        if self.perm.intersects(Prot::LAZY) {
            return Err(MemError::InvalidPerm.into());
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct SendArgsTyped {
    target: usize,
    value: usize,
    src: usize,
    len: usize,
    raw_perm: usize,
}

impl SendArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            target: args.get(0),
            value: args.get(1),
            src: args.get(2),
            len: args.get(3),
            raw_perm: args.get(4),
        })
    }

    /// Permission bits only matter when a page is offered.
    #[inline]
    fn check(&self, ceiling: usize) -> Result<Prot, Error> {
        if self.src >= ceiling {
            return Ok(Prot::empty());
        }
        Prot::from_word(self.raw_perm).ok_or(Error::InvalidArgs)
    }
}

#[derive(Copy, Clone)]
struct DrawCharArgsTyped {
    buf: usize,
    x: usize,
    y: usize,
    color: u32,
    stride: usize,
    ch: u8,
}

impl DrawCharArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            buf: args.get(0),
            x: args.get(1),
            y: args.get(2),
            color: args.get(3) as u32,
            stride: args.get(4),
            ch: args.get(5) as u8,
        })
    }

    /// Address of the glyph's top-left pixel and the byte span the glyph touches.
    #[inline]
    fn check(&self) -> Result<(usize, usize), Error> {
        let span = || {
            let pixel = self
                .stride
                .checked_mul(GLYPH_SIZE)?
                .checked_mul(self.y)?
                .checked_add(GLYPH_SIZE.checked_mul(self.x)?)?;
            let start = self.buf.checked_add(pixel.checked_mul(PIXEL_BYTES)?)?;
            let len = self
                .stride
                .checked_mul(GLYPH_SIZE - 1)?
                .checked_add(GLYPH_SIZE)?
                .checked_mul(PIXEL_BYTES)?;
            start.checked_add(len)?;
            Some((start, len))
        };
        span().ok_or(Error::InvalidArgs)
    }
}

/// Execution context shared across syscalls.
pub struct Context<'a> {
    pub caller: EnvId,
    pub config: &'a KernelConfig,
    pub envs: &'a mut EnvTable,
    pub mem: &'a mut PhysMemory,
    pub console: &'a mut ConsoleRing,
    pub platform: &'a dyn Platform,
}

impl<'a> Context<'a> {
    /// Creates a new context for a call made by `caller`.
    pub fn new(
        caller: EnvId,
        config: &'a KernelConfig,
        envs: &'a mut EnvTable,
        mem: &'a mut PhysMemory,
        console: &'a mut ConsoleRing,
        platform: &'a dyn Platform,
    ) -> Self {
        Self { caller, config, envs, mem, console, platform }
    }

    /// Resolves an environment argument the caller must have authority over.
    fn target(&self, raw: usize) -> SysResult<EnvId> {
        Ok(self.envs.resolve(self.caller, raw, true)?)
    }

    /// Checks that the caller may access `[va, va + len)` with `need`.
    fn check_user(&self, va: usize, len: usize, need: Prot) -> SysResult<()> {
        self.envs
            .get(self.caller)?
            .space
            .check(va, len, need)
            .map_err(|_| Error::Fault { va })
    }

    fn copy_in(&mut self, va: usize, buf: &mut [u8]) -> SysResult<()> {
        let env = self.envs.get_mut(self.caller)?;
        env.space.read(self.mem, va, buf).map_err(|err| user_fault(va, err))
    }

    fn copy_out(&mut self, va: usize, data: &[u8]) -> SysResult<()> {
        let env = self.envs.get_mut(self.caller)?;
        env.space.write(self.mem, va, data).map_err(|err| user_fault(va, err))
    }
}

/// A page that cannot be materialized is reported to the caller; anything else means the
/// pointer itself was bad.
fn user_fault(va: usize, err: MemError) -> Error {
    match err {
        MemError::NoMemory => Error::Memory(MemError::NoMemory),
        _ => Error::Fault { va },
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(Sysno::Cputs, sys_cputs);
    table.register(Sysno::Cgetc, sys_cgetc);
    table.register(Sysno::GetEnvId, sys_getenvid);
    table.register(Sysno::EnvDestroy, sys_env_destroy);
    table.register(Sysno::AllocRegion, sys_alloc_region);
    table.register(Sysno::MapRegion, sys_map_region);
    table.register(Sysno::MapPhysicalRegion, sys_map_physical_region);
    table.register(Sysno::UnmapRegion, sys_unmap_region);
    table.register(Sysno::RegionRefs, sys_region_refs);
    table.register(Sysno::Exofork, sys_exofork);
    table.register(Sysno::EnvSetStatus, sys_env_set_status);
    table.register(Sysno::EnvSetTrapframe, sys_env_set_trapframe);
    table.register(Sysno::EnvSetPgfaultUpcall, sys_env_set_pgfault_upcall);
    table.register(Sysno::Yield, sys_yield);
    table.register(Sysno::IpcTrySend, sys_ipc_try_send);
    table.register(Sysno::IpcRecv, sys_ipc_recv);
    table.register(Sysno::GetTime, sys_gettime);
    table.register(Sysno::GetCpuFreq, sys_get_cpufreq);
    table.register(Sysno::PollKbd, sys_poll_kbd);
    table.register(Sysno::DrawChar, sys_drawchar);
    table.register(Sysno::IpcInbox, sys_ipc_inbox);
}

fn sys_cputs(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = CputsArgsTyped::decode(args)?;
    typed.check()?;
    ctx.check_user(typed.buf, typed.len, Prot::READ)?;
    let mut chunk = [0u8; CPUTS_CHUNK];
    let mut done = 0;
    while done < typed.len {
        let n = cmp::min(CPUTS_CHUNK, typed.len - done);
        ctx.copy_in(typed.buf + done, &mut chunk[..n])?;
        for byte in &mut chunk[..n] {
            *byte &= 0x7f;
        }
        ctx.platform.console_write(&chunk[..n]);
        done += n;
    }
    Ok(0)
}

fn sys_cgetc(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    while let Some(byte) = ctx.platform.console_read() {
        if byte != 0 {
            ctx.console.push(byte);
        }
    }
    Ok(ctx.console.pop().map_or(0, usize::from))
}

fn sys_getenvid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.caller.raw())
}

fn sys_env_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let id = ctx.target(args.get(0))?;
    ctx.envs.destroy(id, ctx.mem)?;
    Ok(0)
}

fn sys_alloc_region(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = AllocArgsTyped::decode(args)?;
    typed.check()?;
    let id = ctx.target(typed.env)?;
    let ceiling = ctx.config.user_ceiling;
    let env = ctx.envs.get_mut(id)?;
    region::allocate(ctx.mem, &mut env.space, typed.va, typed.len, typed.perm, ceiling)?;
    Ok(0)
}

fn sys_map_region(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MapArgsTyped::decode(args)?;
    typed.check()?;
    let src = ctx.target(typed.src)?;
    let dst = ctx.target(typed.dst)?;
    let ceiling = ctx.config.user_ceiling;
    let frames = {
        let env = ctx.envs.get_mut(src)?;
        region::collect_shared(ctx.mem, &mut env.space, typed.src_va, typed.len, typed.perm, ceiling)?
    };
    let env = ctx.envs.get_mut(dst)?;
    region::install_shared(ctx.mem, &mut env.space, typed.dst_va, &frames, typed.perm, ceiling)?;
    log::debug!(
        target: "sys",
        "map {:?}:{:#x} -> {:?}:{:#x} ({} pages) {:?}",
        src,
        typed.src_va,
        dst,
        typed.dst_va,
        frames.len(),
        typed.perm
    );
    Ok(0)
}

fn sys_map_physical_region(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MapPhysicalArgsTyped::decode(args)?;
    typed.check()?;
    let caller_kind = ctx.envs.get(ctx.caller)?.kind;
    let id = ctx.target(typed.env)?;
    let ceiling = ctx.config.user_ceiling;
    let env = ctx.envs.get_mut(id)?;
    if !caller_kind.is_driver() || !env.kind.is_driver() {
        log::warn!(target: "sys", "{:?} denied device mapping into {:?}", ctx.caller, id);
        return Err(EnvError::NotDriver.into());
    }
    region::map_physical(
        ctx.mem,
        &mut env.space,
        &ctx.config.devices,
        typed.pa,
        typed.va,
        typed.len,
        typed.perm,
        ceiling,
    )?;
    Ok(0)
}

fn sys_unmap_region(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let id = ctx.target(args.get(0))?;
    let ceiling = ctx.config.user_ceiling;
    let env = ctx.envs.get_mut(id)?;
    region::unmap(ctx.mem, &mut env.space, args.get(1), args.get(2), ceiling)?;
    Ok(0)
}

/// Maximum reference count over the first range, minus that of the second unless the
/// second address is at or above the ceiling. Never fails.
fn sys_region_refs(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let env = ctx.envs.get(ctx.caller)?;
    let first = region::ref_count(&*ctx.mem, &env.space, args.get(0), args.get(1)) as isize;
    if args.get(2) >= ctx.config.user_ceiling {
        return Ok(first as usize);
    }
    let second = region::ref_count(&*ctx.mem, &env.space, args.get(2), args.get(3)) as isize;
    Ok(first.wrapping_sub(second) as usize)
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let mut frame = ctx.envs.get(ctx.caller)?.frame;
    frame.set_return(0);
    let child = ctx.envs.create(EnvType::User, Some(ctx.caller))?;
    ctx.envs.get_mut(child)?.frame = frame;
    Ok(child.raw())
}

fn sys_env_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let status = EnvStatus::settable(args.get(1)).ok_or(EnvError::InvalidStatus)?;
    let id = ctx.target(args.get(0))?;
    ctx.envs.set_status(id, status)?;
    Ok(0)
}

fn sys_env_set_trapframe(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let id = ctx.target(args.get(0))?;
    let mut raw = [0u8; TrapFrame::SIZE];
    ctx.copy_in(args.get(1), &mut raw)?;
    let mut frame = TrapFrame::from_bytes(&raw);
    frame.sanitize();
    ctx.envs.get_mut(id)?.frame = frame;
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let id = ctx.target(args.get(0))?;
    let entry = args.get(1);
    ctx.envs.get_mut(id)?.fault_entry = (entry != 0).then_some(entry);
    Ok(0)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.envs.get_mut(ctx.caller)?.frame.set_return(0);
    Err(Error::Reschedule)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SendArgsTyped::decode(args)?;
    let perm = typed.check(ctx.config.user_ceiling)?;
    let target = ctx.envs.resolve(ctx.caller, typed.target, false)?;
    let msg = Message { target, value: typed.value, src: typed.src, len: typed.len, perm };
    ipc::try_send(ctx.envs, ctx.mem, ctx.config, ctx.caller, msg)?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ipc::recv(ctx.envs, ctx.caller, args.get(0), args.get(1), ctx.config.user_ceiling)?;
    ctx.envs.get_mut(ctx.caller)?.frame.set_return(0);
    Err(Error::Reschedule)
}

fn sys_gettime(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.platform.now() as usize)
}

fn sys_get_cpufreq(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.config.cpu_frequency_hz as usize)
}

fn sys_poll_kbd(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(usize::from(ctx.platform.poll_keyboard()))
}

fn sys_drawchar(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = DrawCharArgsTyped::decode(args)?;
    let (start, len) = typed.check()?;
    ctx.check_user(start, len, Prot::WRITE)?;
    let glyph = ctx.platform.glyph(typed.ch);
    for (row, bits) in glyph.iter().enumerate() {
        let mut line = [0u8; GLYPH_SIZE * PIXEL_BYTES];
        for (col, pixel) in line.chunks_exact_mut(PIXEL_BYTES).enumerate() {
            let on = u32::from((bits >> col) & 1);
            pixel.copy_from_slice(&(typed.color * on).to_le_bytes());
        }
        ctx.copy_out(start + row * typed.stride * PIXEL_BYTES, &line)?;
    }
    Ok(0)
}

fn sys_ipc_inbox(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let record = ctx.envs.get(ctx.caller)?.inbox.record();
    ctx.copy_out(args.get(0), &record.to_bytes())?;
    Ok(0)
}
