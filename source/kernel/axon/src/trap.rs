// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Saved execution context and trap-boundary helpers (x86-64)
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, FaultCode, FaultRecord, USER_CS, USER_DS
//! DEPENDS_ON: syscall::Args
//! INVARIANTS: Frames installed from userland always carry user selectors and IF set;
//!             syscall number in RAX, arguments in RDX RCX RBX RDI RSI R8, result in RAX

use bitflags::bitflags;

use crate::syscall::Args;

/// User code segment selector (RPL 3).
pub const USER_CS: u64 = 0x18 | 3;
/// User data segment selector (RPL 3).
pub const USER_DS: u64 = 0x20 | 3;
/// Interrupt-enable flag in RFLAGS.
pub const FL_IF: u64 = 1 << 9;

/// Saved register state of an environment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub ds: u64,
    pub es: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const FRAME_WORDS: usize = 22;

impl TrapFrame {
    /// Encoded size in bytes.
    pub const SIZE: usize = FRAME_WORDS * 8;

    /// Fresh user context starting at `entry` with stack pointer `stack`.
    pub fn user(entry: u64, stack: u64) -> Self {
        let mut frame = Self { rip: entry, rsp: stack, ..Self::default() };
        frame.force_user_mode();
        frame.rflags = FL_IF;
        frame
    }

    /// Extracts the syscall number and its six arguments.
    pub fn syscall_args(&self) -> (usize, Args) {
        (
            self.rax as usize,
            Args::new([
                self.rdx as usize,
                self.rcx as usize,
                self.rbx as usize,
                self.rdi as usize,
                self.rsi as usize,
                self.r8 as usize,
            ]),
        )
    }

    /// Loads a syscall into the registers, as the userland stub does before trapping.
    pub fn load_syscall(&mut self, number: usize, args: [usize; 6]) {
        self.rax = number as u64;
        self.rdx = args[0] as u64;
        self.rcx = args[1] as u64;
        self.rbx = args[2] as u64;
        self.rdi = args[3] as u64;
        self.rsi = args[4] as u64;
        self.r8 = args[5] as u64;
    }

    pub fn set_return(&mut self, value: usize) {
        self.rax = value as u64;
    }

    pub fn return_value(&self) -> usize {
        self.rax as usize
    }

    fn force_user_mode(&mut self) {
        self.cs = USER_CS;
        self.ds = USER_DS;
        self.es = USER_DS;
        self.ss = USER_DS;
    }

    /// Makes a caller-supplied frame safe to resume: user selectors, only the low
    /// arithmetic flags kept, interrupts enabled.
    pub fn sanitize(&mut self) {
        self.force_user_mode();
        self.rflags &= 0xfff;
        self.rflags |= FL_IF;
    }

    fn words(&self) -> [u64; FRAME_WORDS] {
        [
            self.r15, self.r14, self.r13, self.r12, self.r11, self.r10, self.r9, self.r8,
            self.rsi, self.rdi, self.rbp, self.rdx, self.rcx, self.rbx, self.rax, self.ds,
            self.es, self.rip, self.cs, self.rflags, self.rsp, self.ss,
        ]
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut w = [0u64; FRAME_WORDS];
        for (word, chunk) in w.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        Self {
            r15: w[0],
            r14: w[1],
            r13: w[2],
            r12: w[3],
            r11: w[4],
            r10: w[5],
            r9: w[6],
            r8: w[7],
            rsi: w[8],
            rdi: w[9],
            rbp: w[10],
            rdx: w[11],
            rcx: w[12],
            rbx: w[13],
            rax: w[14],
            ds: w[15],
            es: w[16],
            rip: w[17],
            cs: w[18],
            rflags: w[19],
            rsp: w[20],
            ss: w[21],
        }
    }
}

bitflags! {
    /// x86 page-fault error code bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCode: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const INSTR = 1 << 4;
    }
}

/// Record pushed on the user exception stack before entering the fault handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    pub fault_va: u64,
    pub code: FaultCode,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

impl FaultRecord {
    pub const SIZE: usize = 5 * 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [self.fault_va, self.code.bits(), self.rip, self.rflags, self.rsp];
        let mut out = [0u8; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}
