// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]
#![forbid(unsafe_code)]

//! CONTEXT: AXON kernel core (environments, regions, syscalls, rendezvous IPC)
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelConfig, TrapFrame, Platform, Scheduler, syscall::{SyscallTable, Error}
//! DEPENDS_ON: axon-abi, alloc
//! INVARIANTS: Single-core, one call at a time; all user pointers validated before use
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

pub mod config;
pub mod env;
pub mod hal;
pub mod ipc;
mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod trap;
pub mod types;

pub use axon_abi as abi;
pub use config::{ConfigError, DeviceWindow, KernelConfig};
pub use kernel::{Kernel, UserAccessError};
pub use trap::TrapFrame;
