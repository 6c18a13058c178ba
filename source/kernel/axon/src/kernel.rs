// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Aggregated kernel state and the trap entry points
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (new/spawn/run/trap_syscall/trap_page_fault/trap_timer), UserAccessError
//! DEPENDS_ON: syscall::{SyscallTable, api}, env::EnvTable, mm::PhysMemory, sched::Scheduler
//! INVARIANTS: Every trap saves the interrupted context before anything else and leaves the
//!             live frame holding the context of whoever runs next
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::boxed::Box;
use core::marker::PhantomData;

use crate::abi::{EnvId, EnvStatus, EnvType, InboxRecord, Prot, PAGE_SIZE};
use crate::config::{ConfigError, KernelConfig};
use crate::env::{Env, EnvError, EnvTable};
use crate::hal::{ConsoleRing, HostPlatform, Platform};
use crate::mm::{MemError, PhysMemory};
use crate::sched::{RoundRobin, Scheduler};
use crate::syscall::{api, Error, SyscallTable};
use crate::trap::{FaultCode, FaultRecord, TrapFrame};
use crate::types::PhysAddr;

/// Failure of a host-side access to an environment's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UserAccessError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("access fault at {va:#x}: {source}")]
    Fault { va: usize, source: MemError },
}

/// The whole machine state: environments, physical memory, devices and the call table.
pub struct Kernel<P: Platform = HostPlatform> {
    config: KernelConfig,
    platform: P,
    envs: EnvTable,
    mem: PhysMemory,
    console: ConsoleRing,
    scheduler: Box<dyn Scheduler>,
    syscalls: SyscallTable,
    _not_send_sync: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(Kernel: Send, Sync);

impl<P: Platform> Kernel<P> {
    pub fn new(config: KernelConfig, platform: P) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);
        log::info!(
            target: "boot",
            "axon: {} env slots, {} frames, ceiling {:#x}, {} device windows",
            config.max_envs,
            config.ram_frames,
            config.user_ceiling,
            config.devices.len()
        );
        Ok(Self {
            envs: EnvTable::new(config.max_envs),
            mem: PhysMemory::new(config.ram_frames, config.copy_fill_byte),
            console: ConsoleRing::new(),
            scheduler: Box::new(RoundRobin::new()),
            syscalls,
            platform,
            config,
            _not_send_sync: PhantomData,
        })
    }

    /// Replaces the scheduling policy.
    pub fn with_scheduler(mut self, scheduler: Box<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    pub fn mem(&self) -> &PhysMemory {
        &self.mem
    }

    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(id).ok()
    }

    pub fn current(&self) -> Option<EnvId> {
        self.envs.current()
    }

    /// Boot-time environment creation: a RUNNABLE root environment of `kind` starting at
    /// `entry` with stack pointer `stack`.
    pub fn spawn(&mut self, kind: EnvType, entry: u64, stack: u64) -> Result<EnvId, EnvError> {
        let id = self.envs.create(kind, None)?;
        let env = self.envs.get_mut(id)?;
        env.frame = TrapFrame::user(entry, stack);
        env.status = EnvStatus::Runnable;
        Ok(id)
    }

    /// Makes `id` the running environment and returns the context to resume.
    pub fn run(&mut self, id: EnvId) -> Result<TrapFrame, EnvError> {
        let env = self.envs.get_mut(id)?;
        if env.status != EnvStatus::Runnable {
            return Err(EnvError::NotFound);
        }
        env.runs += 1;
        let frame = env.frame;
        self.envs.set_current(Some(id));
        log::trace!(target: "sched", "run {:?}", id);
        Ok(frame)
    }

    /// Picks the next environment without a trap (boot, idle wake-up).
    pub fn schedule(&mut self) -> Option<(EnvId, TrapFrame)> {
        let next = self.pick(true)?;
        self.envs.get(next).ok().map(|env| (next, env.frame))
    }

    /// System call entry. `frame` is the caller's live context on entry and the context of
    /// whoever runs next on return.
    pub fn trap_syscall(&mut self, frame: &mut TrapFrame) -> Option<EnvId> {
        let Some(caller) = self.save(frame) else {
            log::warn!(target: "trap", "syscall with no current environment");
            return self.switch(frame, true);
        };
        let (number, args) = frame.syscall_args();
        let result = {
            let mut ctx = api::Context::new(
                caller,
                &self.config,
                &mut self.envs,
                &mut self.mem,
                &mut self.console,
                &self.platform,
            );
            self.syscalls.dispatch(number, &mut ctx, &args)
        };
        let reschedule = match result {
            Ok(value) => {
                self.set_return(caller, value);
                false
            }
            Err(Error::Reschedule) => true,
            Err(Error::Fault { va }) => {
                log::warn!(target: "trap", "{:?} passed bad pointer {:#x} to call {}; destroying", caller, va, number);
                self.kill(caller);
                true
            }
            Err(err) => {
                log::debug!(target: "sys", "{:?} call {} failed: {}", caller, number, err);
                if let Some(errno) = err.errno() {
                    self.set_return(caller, errno.to_word());
                }
                false
            }
        };
        self.switch(frame, reschedule)
    }

    /// Page-fault entry: demand-fills lazy pages, else diverts to the environment's fault
    /// handler, else destroys it.
    pub fn trap_page_fault(&mut self, frame: &mut TrapFrame, va: usize, code: FaultCode) -> Option<EnvId> {
        let Some(env) = self.save(frame) else {
            return self.switch(frame, true);
        };
        if self.demand_page(env, va, code) || self.deliver_upcall(env, va, code) {
            return self.switch(frame, false);
        }
        log::warn!(target: "trap", "{:?} unhandled fault at {:#x} ({:?}); destroying", env, va, code);
        self.kill(env);
        self.switch(frame, true)
    }

    /// Timer preemption.
    pub fn trap_timer(&mut self, frame: &mut TrapFrame) -> Option<EnvId> {
        self.save(frame);
        self.switch(frame, true)
    }

    /// Console interrupt: moves pending device input into the ring read by `cgetc`.
    pub fn console_interrupt(&mut self) {
        while let Some(byte) = self.platform.console_read() {
            if byte != 0 {
                self.console.push(byte);
            }
        }
    }

    /// Reads `id`'s memory the way a user load would, materializing lazy pages.
    pub fn user_read(&mut self, id: EnvId, va: usize, buf: &mut [u8]) -> Result<(), UserAccessError> {
        let env = self.envs.get_mut(id)?;
        env.space.read(&mut self.mem, va, buf).map_err(|source| UserAccessError::Fault { va, source })
    }

    /// Writes `id`'s memory the way a user store would; needs WRITE on every page.
    pub fn user_write(&mut self, id: EnvId, va: usize, data: &[u8]) -> Result<(), UserAccessError> {
        let env = self.envs.get_mut(id)?;
        env.space.write(&mut self.mem, va, data).map_err(|source| UserAccessError::Fault { va, source })
    }

    /// Backing physical address and permissions of a present page.
    pub fn translate(&self, id: EnvId, va: usize) -> Option<(PhysAddr, Prot)> {
        let env = self.envs.get(id).ok()?;
        env.space.translate(&self.mem, va)
    }

    /// Maximum frame reference count over `[va, va + len)` of `id`.
    pub fn ref_count(&self, id: EnvId, va: usize, len: usize) -> u32 {
        self.envs.get(id).map_or(0, |env| env.space.max_refs(&self.mem, va, len))
    }

    pub fn frame(&self, id: EnvId) -> Option<TrapFrame> {
        self.envs.get(id).ok().map(|env| env.frame)
    }

    pub fn inbox(&self, id: EnvId) -> Option<InboxRecord> {
        self.envs.get(id).ok().map(|env| env.inbox.record())
    }

    /// Makes the next frame allocation (data page or page table) fail.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_alloc(&mut self) {
        self.mem.deny_next_alloc();
    }

    /// Stores the live frame into the current environment.
    fn save(&mut self, frame: &TrapFrame) -> Option<EnvId> {
        let id = self.envs.current()?;
        self.envs.get_mut(id).ok()?.frame = *frame;
        Some(id)
    }

    fn set_return(&mut self, id: EnvId, value: usize) {
        if let Ok(env) = self.envs.get_mut(id) {
            if env.status != EnvStatus::Dying {
                env.frame.set_return(value);
            }
        }
    }

    fn kill(&mut self, id: EnvId) {
        if let Err(err) = self.envs.destroy(id, &mut self.mem) {
            log::error!(target: "env", "destroy {:?} failed: {}", id, err);
        }
    }

    /// Reaps dead environments and decides who runs. The current environment keeps the
    /// CPU unless it asked to give it up or is no longer runnable.
    fn pick(&mut self, reschedule: bool) -> Option<EnvId> {
        self.envs.reap();
        if !reschedule {
            if let Some(id) = self.envs.current() {
                if self.envs.status(id) == EnvStatus::Runnable {
                    return Some(id);
                }
            }
        }
        let next = self.scheduler.pick_next(&self.envs);
        self.envs.set_current(next);
        match next {
            Some(id) => {
                if let Ok(env) = self.envs.get_mut(id) {
                    env.runs += 1;
                }
            }
            None => log::trace!(target: "sched", "idle"),
        }
        next
    }

    fn switch(&mut self, frame: &mut TrapFrame, reschedule: bool) -> Option<EnvId> {
        let next = self.pick(reschedule)?;
        if let Ok(env) = self.envs.get(next) {
            *frame = env.frame;
        }
        Some(next)
    }

    fn demand_page(&mut self, id: EnvId, va: usize, code: FaultCode) -> bool {
        if va >= self.config.user_ceiling {
            return false;
        }
        let Ok(env) = self.envs.get_mut(id) else {
            return false;
        };
        let Some(entry) = env.space.entry(va) else {
            return false;
        };
        if entry.frame().is_some() {
            return false;
        }
        let need = if code.contains(FaultCode::WRITE) {
            Prot::WRITE
        } else if code.contains(FaultCode::INSTR) {
            Prot::EXEC
        } else {
            Prot::READ
        };
        if !entry.prot.contains(need | Prot::USER) {
            return false;
        }
        match env.space.materialize(&mut self.mem, va) {
            Ok(_) => true,
            Err(err) => {
                log::warn!(target: "mm", "{:?} demand fill at {:#x} failed: {}", id, va, err);
                false
            }
        }
    }

    /// Pushes a [`FaultRecord`] on the exception stack and redirects to the handler. A
    /// fault taken while already on that stack leaves one scratch word below the
    /// interrupted stack pointer.
    fn deliver_upcall(&mut self, id: EnvId, va: usize, code: FaultCode) -> bool {
        let top = self.config.exception_stack_top;
        let bottom = top - PAGE_SIZE;
        let Ok(env) = self.envs.get_mut(id) else {
            return false;
        };
        let Some(handler) = env.fault_entry else {
            return false;
        };
        let rsp = env.frame.rsp as usize;
        let base = if (bottom..top).contains(&rsp) { rsp.checked_sub(8) } else { Some(top) };
        let Some(sp) = base.and_then(|base| base.checked_sub(FaultRecord::SIZE)).filter(|sp| *sp >= bottom)
        else {
            log::warn!(target: "trap", "{:?} exception stack overflow", id);
            return false;
        };
        let record = FaultRecord {
            fault_va: va as u64,
            code,
            rip: env.frame.rip,
            rflags: env.frame.rflags,
            rsp: env.frame.rsp,
        };
        if let Err(err) = env.space.write(&mut self.mem, sp, &record.to_bytes()) {
            log::warn!(target: "trap", "{:?} cannot push fault record: {}", id, err);
            return false;
        }
        env.frame.rsp = sp as u64;
        env.frame.rip = handler as u64;
        log::debug!(target: "trap", "{:?} fault {:#x} -> handler {:#x}", id, va, handler);
        true
    }
}
