// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous rendezvous IPC (one value plus at most one region per send)
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: recv, try_send, Message, IpcError
//! DEPENDS_ON: env::EnvTable, mm::region::{collect_shared, install_shared}
//! INVARIANTS: At most one outstanding recv per environment; a failed send leaves the
//!             receiver parked and its inbox untouched; the receiver's saved context
//!             carries the delivered value when it resumes
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::cmp;

use crate::abi::{EnvId, EnvStatus, Prot, PAGE_SIZE};
use crate::config::KernelConfig;
use crate::env::{EnvError, EnvTable};
use crate::mm::{region, MemError, PhysMemory};
use crate::types::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("target is not receiving")]
    NotReceiving,
    #[error("invalid send or receive arguments")]
    InvalidArgs,
    #[error(transparent)]
    Env(#[from] EnvError),
    /// The page transfer could not be established.
    #[error("page transfer failed: {0}")]
    Map(MemError),
}

/// Parks `caller` waiting for a message.
///
/// `dst` below the ceiling asks for a page transfer of at most `max_len` bytes there, and
/// the whole window must stay below the ceiling;
/// anything else makes this a value-only receive. The caller's result register is left
/// alone: the matching send writes the delivered value into it.
pub fn recv(
    envs: &mut EnvTable,
    caller: EnvId,
    dst: usize,
    max_len: usize,
    ceiling: usize,
) -> Result<(), IpcError> {
    if max_len % PAGE_SIZE != 0 {
        return Err(IpcError::InvalidArgs);
    }
    let dst = if dst < ceiling {
        if dst % PAGE_SIZE != 0 || max_len == 0 || !VirtAddr::new(dst).range_below(max_len, ceiling) {
            return Err(IpcError::InvalidArgs);
        }
        Some(dst)
    } else {
        None
    };
    let env = envs.get_mut(caller)?;
    env.inbox.recving = true;
    env.inbox.dst = dst;
    env.inbox.max_len = max_len;
    env.status = EnvStatus::NotRunnable;
    log::debug!(target: "ipc", "{:?} recv dst={:?} max={:#x}", caller, dst, max_len);
    Ok(())
}

/// One delivery attempt: a value and an optional page range offered to `target`.
#[derive(Clone, Copy, Debug)]
pub struct Message {
    pub target: EnvId,
    pub value: usize,
    pub src: usize,
    pub len: usize,
    pub perm: Prot,
}

/// Delivers `msg` if its target is parked in `recv`.
///
/// The receive state is consumed only after the optional page mapping is in place, so
/// any failure leaves the target exactly as it was, still waiting.
pub fn try_send(
    envs: &mut EnvTable,
    mem: &mut PhysMemory,
    config: &KernelConfig,
    sender: EnvId,
    msg: Message,
) -> Result<(), IpcError> {
    let ceiling = config.user_ceiling;
    let inbox = envs.live(msg.target)?.inbox;
    if !inbox.recving {
        return Err(IpcError::NotReceiving);
    }

    let offering = msg.src < ceiling;
    if offering {
        if msg.src % PAGE_SIZE != 0
            || msg.len == 0
            || msg.len % PAGE_SIZE != 0
            || !(Prot::ALL | Prot::USER).contains(msg.perm)
        {
            return Err(IpcError::InvalidArgs);
        }
        let need = msg.perm & Prot::WRITE;
        envs.get(sender)?
            .space
            .check(msg.src, msg.len, need)
            .map_err(|_| IpcError::InvalidArgs)?;
    }

    let mut delivered = Prot::empty();
    let mut mapped = 0;
    if let (true, Some(dst)) = (offering, inbox.dst) {
        let len = cmp::min(cmp::min(msg.len, inbox.max_len), config.ipc_max_pages * PAGE_SIZE);
        let frames =
            region::collect_shared(mem, &mut envs.get_mut(sender)?.space, msg.src, len, msg.perm, ceiling)
                .map_err(IpcError::Map)?;
        let source = frames.iter().fold(Prot::ALL, |acc, (_, prot)| acc & *prot);
        let prot = msg.perm & source & Prot::ALL;
        let target = envs.get_mut(msg.target)?;
        if let Err(err) = region::install_shared(mem, &mut target.space, dst, &frames, prot, ceiling) {
            log::warn!(target: "ipc", "{:?} -> {:?}: transfer failed ({}), receiver stays parked", sender, msg.target, err);
            return Err(IpcError::Map(err));
        }
        delivered = prot;
        mapped = len;
    }

    let target = envs.get_mut(msg.target)?;
    target.inbox.recving = false;
    target.inbox.from = Some(sender);
    target.inbox.value = msg.value;
    target.inbox.perm = delivered;
    target.inbox.len = mapped;
    target.status = EnvStatus::Runnable;
    target.frame.set_return(msg.value);
    log::debug!(
        target: "ipc",
        "{:?} -> {:?}: value={:#x} mapped={:#x} perm={:?}",
        sender,
        msg.target,
        msg.value,
        mapped,
        delivered
    );
    Ok(())
}
