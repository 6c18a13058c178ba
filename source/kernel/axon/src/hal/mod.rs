// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

extern crate alloc;

pub mod font;
pub mod host;

pub use host::HostPlatform;

/// Devices the kernel core talks to.
pub trait Platform {
    /// Writes raw bytes to the console output device.
    fn console_write(&self, bytes: &[u8]);
    /// Returns the next byte from the console input device, if one is pending.
    fn console_read(&self) -> Option<u8>;
    /// Returns the raw code of a pending key press, 0 when none.
    fn poll_keyboard(&self) -> u8;
    /// Returns the current time in nanoseconds.
    fn now(&self) -> u64;
    /// Returns the 8x8 glyph bitmap for `ch`.
    fn glyph(&self, ch: u8) -> [u8; font::GLYPH_SIZE] {
        font::glyph(ch)
    }
}

/// Capacity of the console input ring.
pub const CONSOLE_BUF_SIZE: usize = 512;

/// Console input buffered between device interrupts and `cgetc`.
pub struct ConsoleRing {
    buf: [u8; CONSOLE_BUF_SIZE],
    rpos: usize,
    len: usize,
}

impl ConsoleRing {
    pub const fn new() -> Self {
        Self { buf: [0; CONSOLE_BUF_SIZE], rpos: 0, len: 0 }
    }

    /// Queues a byte; when the ring is full the oldest byte is dropped.
    pub fn push(&mut self, byte: u8) {
        let wpos = (self.rpos + self.len) % CONSOLE_BUF_SIZE;
        self.buf[wpos] = byte;
        if self.len == CONSOLE_BUF_SIZE {
            self.rpos = (self.rpos + 1) % CONSOLE_BUF_SIZE;
        } else {
            self.len += 1;
        }
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.rpos];
        self.rpos = (self.rpos + 1) % CONSOLE_BUF_SIZE;
        self.len -= 1;
        Some(byte)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ConsoleRing {
    fn default() -> Self {
        Self::new()
    }
}
