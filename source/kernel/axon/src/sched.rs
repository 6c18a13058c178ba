// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scheduler hook ("pick next runnable environment")
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler, RoundRobin
//! DEPENDS_ON: env::EnvTable
//! INVARIANTS: Only RUNNABLE environments are picked; single-core, not Send/Sync

use core::marker::PhantomData;

use crate::abi::{EnvId, EnvStatus};
use crate::env::EnvTable;

/// Policy deciding which environment runs after a scheduling point.
pub trait Scheduler {
    /// Returns the next environment to run, or `None` when nothing is runnable.
    fn pick_next(&mut self, envs: &EnvTable) -> Option<EnvId>;
}

/// Circular scan starting after the environment that ran last.
pub struct RoundRobin {
    last: Option<usize>,
    _not_send_sync: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(RoundRobin: Send, Sync);

impl RoundRobin {
    pub const fn new() -> Self {
        Self { last: None, _not_send_sync: PhantomData }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for RoundRobin {
    fn pick_next(&mut self, envs: &EnvTable) -> Option<EnvId> {
        let capacity = envs.capacity();
        let start = envs
            .current()
            .map(EnvId::index)
            .or(self.last)
            .map_or(0, |index| index + 1);
        let picked = (0..capacity)
            .map(|step| (start + step) % capacity)
            .filter_map(|index| envs.at_index(index))
            .find(|env| env.status == EnvStatus::Runnable)
            .map(|env| env.id);
        if let Some(id) = picked {
            self.last = Some(id.index());
            log::trace!(target: "sched", "next {:?}", id);
        }
        picked
    }
}
