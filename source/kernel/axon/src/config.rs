// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time kernel configuration
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig, DeviceWindow, ConfigError
//! DEPENDS_ON: serde (derive, no_std), thiserror
//! INVARIANTS: validate() runs before any table is sized from these values

use alloc::vec::Vec;

use serde::Deserialize;

use crate::abi::{MAX_ENVS, PAGE_SIZE};

/// Registered device memory window (physical range reachable through `map_physical_region`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceWindow {
    pub base: u64,
    pub len: u64,
}

impl DeviceWindow {
    pub fn end(&self) -> Option<u64> {
        self.base.checked_add(self.len)
    }

    pub fn contains(&self, base: u64, len: u64) -> bool {
        match (base.checked_add(len), self.end()) {
            (Some(end), Some(limit)) => base >= self.base && end <= limit,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Environment table capacity.
    pub max_envs: usize,
    /// Number of RAM page frames (RAM spans `[0, ram_frames * PAGE_SIZE)`).
    pub ram_frames: usize,
    /// First address that is not user space.
    pub user_ceiling: usize,
    /// Top (exclusive) of the one-page user exception stack.
    pub exception_stack_top: usize,
    /// Byte pattern of the shared copy-on-demand template page.
    pub copy_fill_byte: u8,
    /// Largest page count a single IPC send may transfer.
    pub ipc_max_pages: usize,
    /// Reported by `get_cpufreq`.
    pub cpu_frequency_hz: u64,
    pub devices: Vec<DeviceWindow>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_envs: 64,
            ram_frames: 1024,
            user_ceiling: 0x8000_0000_0000,
            exception_stack_top: 0x7fff_ffff_f000,
            copy_fill_byte: 0xff,
            ipc_max_pages: 1,
            cpu_frequency_hz: 2_000_000_000,
            devices: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_envs must be between 1 and {}", MAX_ENVS)]
    EnvCapacity,
    #[error("ram_frames must be at least 2")]
    RamTooSmall,
    #[error("user_ceiling must be a non-zero page multiple")]
    Ceiling,
    #[error("exception stack must be page aligned and lie below user_ceiling")]
    ExceptionStack,
    #[error("ipc_max_pages must be at least 1")]
    IpcWindow,
    #[error("device window {index} is empty, unaligned or overlaps RAM or another window")]
    Device { index: usize },
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_envs == 0 || self.max_envs > MAX_ENVS {
            return Err(ConfigError::EnvCapacity);
        }
        if self.ram_frames < 2 || u32::try_from(self.ram_frames).is_err() {
            return Err(ConfigError::RamTooSmall);
        }
        if self.user_ceiling == 0 || self.user_ceiling % PAGE_SIZE != 0 {
            return Err(ConfigError::Ceiling);
        }
        if self.exception_stack_top < PAGE_SIZE
            || self.exception_stack_top % PAGE_SIZE != 0
            || self.exception_stack_top > self.user_ceiling
        {
            return Err(ConfigError::ExceptionStack);
        }
        if self.ipc_max_pages == 0 {
            return Err(ConfigError::IpcWindow);
        }
        let ram_end = (self.ram_frames as u64) * PAGE_SIZE as u64;
        for (index, window) in self.devices.iter().enumerate() {
            let bad = window.len == 0
                || window.base % PAGE_SIZE as u64 != 0
                || window.len % PAGE_SIZE as u64 != 0
                || window.base < ram_end
                || window.end().is_none()
                || self.devices[..index].iter().any(|prev| overlaps(prev, window));
            if bad {
                return Err(ConfigError::Device { index });
            }
        }
        Ok(())
    }

    /// Returns the window fully containing `[base, base + len)`, if any.
    pub fn device_window(&self, base: u64, len: u64) -> Option<&DeviceWindow> {
        self.devices.iter().find(|window| window.contains(base, len))
    }
}

fn overlaps(a: &DeviceWindow, b: &DeviceWindow) -> bool {
    match (a.end(), b.end()) {
        (Some(a_end), Some(b_end)) => a.base < b_end && b.base < a_end,
        _ => true,
    }
}
