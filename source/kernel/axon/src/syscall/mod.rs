// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SysResult
//! DEPENDS_ON: env, ipc, mm, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable numbers (axon_abi::Sysno);
//!             decode/check/execute discipline
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod api;

use crate::abi::{Errno, Sysno};
use crate::env::EnvError;
use crate::ipc::IpcError;
use crate::mm::MemError;

/// Size of the dispatch window.
const MAX_SYSCALL: usize = Sysno::COUNT;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in RDX, RCX, RBX, RDI, RSI and R8.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }

    pub const fn raw(&self) -> [usize; 6] {
        self.regs
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    #[error("no such syscall")]
    InvalidSyscall,
    /// Argument decoding failed before any subsystem was consulted.
    #[error("malformed arguments")]
    InvalidArgs,
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Memory(#[from] MemError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    /// The caller handed the kernel a pointer it may not use. The caller is destroyed.
    #[error("user pointer fault at {va:#x}")]
    Fault { va: usize },
    /// The caller gave up the CPU; its result register is already set.
    #[error("reschedule")]
    Reschedule,
}

impl Error {
    /// Result word kind for the caller, `None` for control outcomes.
    pub fn errno(self) -> Option<Errno> {
        match self {
            Self::InvalidSyscall => Some(Errno::NoSuchCall),
            Self::InvalidArgs => Some(Errno::InvalidArgument),
            Self::Env(err) => Some(env_errno(err)),
            Self::Memory(err) => Some(mem_errno(err)),
            Self::Ipc(IpcError::NotReceiving) => Some(Errno::NotReceiving),
            Self::Ipc(IpcError::InvalidArgs) => Some(Errno::InvalidArgument),
            Self::Ipc(IpcError::Env(err)) => Some(env_errno(err)),
            Self::Ipc(IpcError::Map(err)) => Some(mem_errno(err)),
            Self::Fault { .. } => Some(Errno::Fault),
            Self::Reschedule => None,
        }
    }
}

fn env_errno(err: EnvError) -> Errno {
    match err {
        EnvError::NotFound | EnvError::NoAuthority | EnvError::NotDriver => Errno::BadEnvironment,
        EnvError::TableFull => Errno::NoFreeEnvironment,
        EnvError::InvalidStatus => Errno::InvalidArgument,
    }
}

fn mem_errno(err: MemError) -> Errno {
    match err {
        MemError::NoMemory | MemError::NotDevice => Errno::NoMemory,
        _ => Errno::InvalidArgument,
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: Sysno, handler: Handler) {
        self.handlers[number.raw()] = Some(handler);
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        let handler = self.handlers.get(number).and_then(|entry| *entry).ok_or(Error::InvalidSyscall)?;
        log::trace!(target: "sys", "{:?} {:?} {:x?}", ctx.caller, Sysno::from_raw(number), args.raw());
        handler(ctx, args)
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
