// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Built-in simulator scenarios
//!
//! The simulator plays the CPU: it holds the live trap frame, loads call numbers and
//! arguments into it, and follows whatever environment the kernel switches to.

use anyhow::{bail, ensure, Context as _, Result};
use axon::{Kernel, KernelConfig, TrapFrame};
use axon_abi::{EnvId, EnvStatus, Errno, Prot, Sysno, PAGE_SIZE};
use clap::ValueEnum;
use serde::Serialize;

use crate::config::{BootEnv, SimConfig};

/// Scratch page every scenario works in.
const SCRATCH: usize = 0x20_0000;
/// Where a receiver asks for transferred pages.
const INBOX: usize = 0x30_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// A parks in recv, B sends 42 plus a page.
    PingPong,
    /// One environment prints a greeting through cputs.
    Console,
    /// exofork until the table is full, then tear every child down.
    ForkExhaust,
}

impl Scenario {
    pub fn all() -> &'static [Scenario] {
        &[Scenario::PingPong, Scenario::Console, Scenario::ForkExhaust]
    }
}

#[derive(Debug, Serialize)]
pub struct Outcome {
    pub scenario: Scenario,
    pub notes: Vec<String>,
    pub console: String,
    pub live_envs: usize,
    pub free_frames: usize,
}

/// Live CPU state while a scenario runs.
struct Cpu {
    kernel: Kernel,
    frame: TrapFrame,
    running: Option<EnvId>,
}

impl Cpu {
    fn boot(config: &KernelConfig, boot: &[BootEnv]) -> Result<(Self, Vec<EnvId>)> {
        let mut kernel = Kernel::new(config.clone(), axon::hal::HostPlatform::new())?;
        let mut ids = Vec::with_capacity(boot.len());
        for env in boot {
            let id = kernel
                .spawn(env.kind.into(), env.entry, env.stack)
                .with_context(|| format!("boot {}", env.name))?;
            log::info!(target: "boot", "{} -> {:?} ({:?})", env.name, id, env.kind);
            ids.push(id);
        }
        let (running, frame) = match kernel.schedule() {
            Some((id, frame)) => (Some(id), frame),
            None => (None, TrapFrame::default()),
        };
        Ok((Self { kernel, frame, running }, ids))
    }

    fn expect_running(&self, id: EnvId) -> Result<()> {
        ensure!(self.running == Some(id), "expected {:?} on the CPU, found {:?}", id, self.running);
        Ok(())
    }

    /// Issues `no` as `caller` and returns the caller's result word as it stands afterwards.
    fn call(&mut self, caller: EnvId, no: Sysno, args: [usize; 6]) -> Result<usize> {
        self.expect_running(caller)?;
        self.frame.load_syscall(no.raw(), args);
        self.running = self.kernel.trap_syscall(&mut self.frame);
        if self.running == Some(caller) {
            return Ok(self.frame.return_value());
        }
        Ok(self.kernel.frame(caller).map_or(0, |frame| frame.return_value()))
    }

    fn checked(&mut self, caller: EnvId, no: Sysno, args: [usize; 6]) -> Result<usize> {
        let word = self.call(caller, no, args)?;
        Errno::decode(word).map_err(|errno| anyhow::anyhow!("{:?} from {:?}: {}", no, caller, errno))
    }

    fn alloc_scratch(&mut self, caller: EnvId, va: usize) -> Result<()> {
        let rw = (Prot::RW | Prot::ZERO_FILL).bits() as usize;
        self.checked(caller, Sysno::AllocRegion, [0, va, PAGE_SIZE, rw, 0, 0])?;
        Ok(())
    }

    fn finish(self, scenario: Scenario, notes: Vec<String>) -> Outcome {
        let output = self.kernel.platform().take_output();
        Outcome {
            scenario,
            notes,
            console: String::from_utf8_lossy(&output).into_owned(),
            live_envs: self.kernel.envs().iter().count(),
            free_frames: self.kernel.mem().free_frames(),
        }
    }
}

pub fn run(scenario: Scenario, config: &SimConfig) -> Result<Outcome> {
    log::info!(target: "sim", "scenario {:?}", scenario);
    match scenario {
        Scenario::PingPong => ping_pong(config),
        Scenario::Console => console(config),
        Scenario::ForkExhaust => fork_exhaust(config),
    }
}

fn ping_pong(config: &SimConfig) -> Result<Outcome> {
    let boot = config.boot_list(2);
    let (mut cpu, ids) = Cpu::boot(&config.kernel, &boot[..2])?;
    let (a, b) = (ids[0], ids[1]);
    let mut notes = Vec::new();

    cpu.call(a, Sysno::IpcRecv, [INBOX, PAGE_SIZE, 0, 0, 0, 0])?;
    cpu.expect_running(b)?;
    notes.push(format!("{:?} parked in recv", a));

    cpu.alloc_scratch(b, SCRATCH)?;
    cpu.kernel.user_write(b, SCRATCH, b"ping")?;
    let word = cpu.call(b, Sysno::IpcTrySend, [a.raw(), 42, SCRATCH, PAGE_SIZE, Prot::READ.bits() as usize, 0])?;
    Errno::decode(word).map_err(|errno| anyhow::anyhow!("send failed: {}", errno))?;
    ensure!(cpu.kernel.env(a).map(|env| env.status) == Some(EnvStatus::Runnable), "receiver not woken");

    cpu.call(b, Sysno::Yield, [0; 6])?;
    cpu.expect_running(a)?;
    let value = cpu.frame.return_value();
    ensure!(value == 42, "receiver saw {} instead of 42", value);
    let mut text = [0u8; 4];
    cpu.kernel.user_read(a, INBOX, &mut text)?;
    ensure!(&text == b"ping", "transferred page holds {:?}", text);
    notes.push(format!("{:?} received {} and page {:?}", a, value, String::from_utf8_lossy(&text)));
    notes.push(format!("shared frame refs: {}", cpu.kernel.ref_count(a, INBOX, PAGE_SIZE)));

    let again = cpu.call(a, Sysno::IpcTrySend, [b.raw(), 1, config.kernel.user_ceiling, 0, 0, 0])?;
    ensure!(Errno::decode(again) == Err(Errno::NotReceiving), "send to a busy env must fail");
    notes.push(format!("{:?} -> {:?} while not receiving: {}", a, b, Errno::NotReceiving));
    Ok(cpu.finish(Scenario::PingPong, notes))
}

fn console(config: &SimConfig) -> Result<Outcome> {
    let boot = config.boot_list(1);
    let (mut cpu, ids) = Cpu::boot(&config.kernel, &boot[..1])?;
    let env = ids[0];
    let greeting = format!("hello from {}\n", boot[0].name);

    cpu.alloc_scratch(env, SCRATCH)?;
    cpu.kernel.user_write(env, SCRATCH, greeting.as_bytes())?;
    cpu.checked(env, Sysno::Cputs, [SCRATCH, greeting.len(), 0, 0, 0, 0])?;

    // Past the mapped page: the kernel destroys the caller.
    cpu.call(env, Sysno::Cputs, [SCRATCH + PAGE_SIZE - 1, 2, 0, 0, 0, 0])?;
    ensure!(cpu.kernel.env(env).is_none(), "bad pointer must destroy the caller");
    let notes = vec![format!("{:?} destroyed after passing a bad pointer", env)];
    Ok(cpu.finish(Scenario::Console, notes))
}

fn fork_exhaust(config: &SimConfig) -> Result<Outcome> {
    let boot = config.boot_list(1);
    let (mut cpu, ids) = Cpu::boot(&config.kernel, &boot[..1])?;
    let root = ids[0];
    let baseline = cpu.kernel.mem().free_frames();
    cpu.alloc_scratch(root, SCRATCH)?;

    let mut children = Vec::new();
    loop {
        let word = cpu.call(root, Sysno::Exofork, [0; 6])?;
        match Errno::decode(word) {
            Ok(raw) => match EnvId::from_raw(raw) {
                Some(child) => children.push(child),
                None => bail!("exofork returned {:#x}", raw),
            },
            Err(Errno::NoFreeEnvironment) => break,
            Err(errno) => bail!("exofork: {}", errno),
        }
    }
    let mut notes = vec![format!("{} children before the table filled", children.len())];

    for child in &children {
        cpu.checked(root, Sysno::MapRegion, [0, SCRATCH, child.raw(), SCRATCH, PAGE_SIZE, Prot::READ.bits() as usize])?;
    }
    notes.push(format!("scratch page refs: {}", cpu.kernel.ref_count(root, SCRATCH, PAGE_SIZE)));
    for child in &children {
        cpu.checked(root, Sysno::EnvDestroy, [child.raw(), 0, 0, 0, 0, 0])?;
    }
    cpu.checked(root, Sysno::UnmapRegion, [0, SCRATCH, PAGE_SIZE, 0, 0, 0])?;
    // Drop the root's remaining tables too; frames should be back to the boot count.
    cpu.call(root, Sysno::EnvDestroy, [0; 6])?;
    let recovered = cpu.kernel.mem().free_frames();
    ensure!(recovered == baseline, "leaked {} frames", baseline.saturating_sub(recovered));
    notes.push(format!("all {} frames recovered", recovered));
    Ok(cpu.finish(Scenario::ForkExhaust, notes))
}
