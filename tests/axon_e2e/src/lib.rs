// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host harness for end-to-end kernel tests.
//!
//! [`Machine`] stands in for the CPU: it owns the live trap frame, enters the kernel on
//! behalf of whichever environment is running and follows the context switch the kernel
//! asks for. Environments have no code of their own; tests script them call by call.

#![forbid(unsafe_code)]

use axon::abi::sys::{Sys, Trap};
use axon::abi::{EnvId, EnvStatus, EnvType, Errno, Sysno};
use axon::trap::FaultCode;
use axon::{Kernel, KernelConfig, TrapFrame};

pub use axon::abi::{Prot, PAGE_SIZE};

/// Default entry point of booted environments.
pub const ENTRY: u64 = 0x80_0000;
/// Default stack pointer of booted environments.
pub const STACK: u64 = 0x7000_0000;

pub struct Machine {
    kernel: Kernel,
    frame: TrapFrame,
    running: Option<EnvId>,
}

impl Machine {
    pub fn new(config: KernelConfig) -> Self {
        let kernel = Kernel::new(config, axon::hal::HostPlatform::new()).expect("valid kernel config");
        Self { kernel, frame: TrapFrame::default(), running: None }
    }

    /// 16 environment slots and 128 frames.
    pub fn small() -> Self {
        Self::new(KernelConfig { max_envs: 16, ram_frames: 128, ..KernelConfig::default() })
    }

    /// Creates a RUNNABLE root environment. The first one booted takes the CPU.
    pub fn boot(&mut self, kind: EnvType) -> EnvId {
        let id = self.kernel.spawn(kind, ENTRY, STACK).expect("free environment slot");
        if self.running.is_none() {
            self.frame = self.kernel.run(id).expect("fresh environment is runnable");
            self.running = Some(id);
        }
        id
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn running(&self) -> Option<EnvId> {
        self.running
    }

    pub fn status(&self, id: EnvId) -> Option<EnvStatus> {
        self.kernel.env(id).map(|env| env.status)
    }

    /// Live frame of the running environment.
    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    /// Enters the kernel as `caller`, which must be on the CPU, and returns the caller's
    /// result register as it stands afterwards (still 0 for a parked receiver).
    pub fn trap(&mut self, caller: EnvId, no: Sysno, args: [usize; 6]) -> usize {
        self.trap_raw(caller, no.raw(), args)
    }

    /// Like [`Machine::trap`] with an arbitrary call number.
    pub fn trap_raw(&mut self, caller: EnvId, number: usize, args: [usize; 6]) -> usize {
        assert_eq!(self.running, Some(caller), "{:?} is not on the CPU", caller);
        self.frame.load_syscall(number, args);
        self.running = self.kernel.trap_syscall(&mut self.frame);
        self.result(caller)
    }

    /// Result register of `id`, live or saved.
    pub fn result(&self, id: EnvId) -> usize {
        if self.running == Some(id) {
            return self.frame.return_value();
        }
        self.kernel.frame(id).map_or(0, |frame| frame.return_value())
    }

    /// Typed syscall surface for `caller`.
    pub fn sys(&mut self, caller: EnvId) -> Sys<EnvTrap<'_>> {
        Sys::new(EnvTrap { machine: self, env: caller })
    }

    /// Delivers a page fault taken by the running environment.
    pub fn fault(&mut self, va: usize, code: FaultCode) -> Option<EnvId> {
        self.running = self.kernel.trap_page_fault(&mut self.frame, va, code);
        self.running
    }

    /// Timer interrupt.
    pub fn tick(&mut self) -> Option<EnvId> {
        self.running = self.kernel.trap_timer(&mut self.frame);
        self.running
    }

    /// User load by `id`.
    pub fn read(&mut self, id: EnvId, va: usize, len: usize) -> Result<Vec<u8>, axon::UserAccessError> {
        let mut buf = vec![0u8; len];
        self.kernel.user_read(id, va, &mut buf)?;
        Ok(buf)
    }

    /// User store by `id`.
    pub fn write(&mut self, id: EnvId, va: usize, data: &[u8]) -> Result<(), axon::UserAccessError> {
        self.kernel.user_write(id, va, data)
    }

    pub fn refs(&self, id: EnvId, va: usize) -> u32 {
        self.kernel.ref_count(id, va, PAGE_SIZE)
    }

    pub fn ceiling(&self) -> usize {
        self.kernel.config().user_ceiling
    }
}

/// [`Trap`] that enters the kernel as one environment of a [`Machine`].
pub struct EnvTrap<'m> {
    machine: &'m mut Machine,
    env: EnvId,
}

impl Trap for EnvTrap<'_> {
    fn syscall(&mut self, no: Sysno, args: [usize; 6]) -> usize {
        self.machine.trap(self.env, no, args)
    }
}

/// Decodes a result word.
pub fn errno(word: usize) -> Result<usize, Errno> {
    Errno::decode(word)
}
