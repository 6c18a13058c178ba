// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory platform for host runs: captured console, scripted input, stepping clock.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::Platform;

/// Nanoseconds the host clock advances on every read.
const TICK_NS: u64 = 1_000;

#[derive(Default)]
pub struct HostPlatform {
    output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
    keys: Mutex<VecDeque<u8>>,
    clock: AtomicU64,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes on the console input device.
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    /// Queues a raw key code.
    pub fn push_key(&self, code: u8) {
        self.keys.lock().push_back(code);
    }

    /// Drains everything written to the console so far.
    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut *self.output.lock())
    }

    pub fn advance(&self, ns: u64) {
        self.clock.fetch_add(ns, Ordering::Relaxed);
    }
}

impl Platform for HostPlatform {
    fn console_write(&self, bytes: &[u8]) {
        self.output.lock().extend_from_slice(bytes);
    }

    fn console_read(&self) -> Option<u8> {
        self.input.lock().pop_front()
    }

    fn poll_keyboard(&self) -> u8 {
        self.keys.lock().pop_front().unwrap_or(0)
    }

    fn now(&self) -> u64 {
        self.clock.fetch_add(TICK_NS, Ordering::Relaxed)
    }
}
