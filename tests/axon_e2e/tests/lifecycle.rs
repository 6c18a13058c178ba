// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use axon::abi::{EnvId, EnvStatus, EnvType, Errno, Sysno};
use axon::config::DeviceWindow;
use axon::trap::{FaultCode, TrapFrame};
use axon::types::PhysAddr;
use axon::KernelConfig;
use axon::hal::Platform;
use axon_e2e::{Machine, Prot, PAGE_SIZE};

const V: usize = 0x20_0000;

#[test]
fn forked_child_starts_from_the_installed_context() {
    let mut m = Machine::small();
    let parent = m.boot(EnvType::User);
    let child = EnvId::from_raw(m.sys(parent).exofork().unwrap()).unwrap();
    assert_eq!(m.status(child), Some(EnvStatus::NotRunnable));
    assert_eq!(m.kernel().env(child).unwrap().parent, Some(parent));

    let mut frame = TrapFrame::user(0x40_1000, 0x6000_0000);
    frame.rflags = u64::MAX;
    m.sys(parent).alloc_region(None, V, PAGE_SIZE, Prot::RW | Prot::ZERO_FILL).unwrap();
    m.write(parent, V, &frame.to_bytes()).unwrap();
    m.sys(parent).env_set_trapframe(Some(child), V).unwrap();
    m.sys(parent).env_set_status(Some(child), EnvStatus::Runnable).unwrap();

    m.sys(parent).yield_();
    assert_eq!(m.running(), Some(child));
    assert_eq!(m.frame().rip, 0x40_1000);
    assert_eq!(m.frame().rflags & !0xfff, 0, "high flag bits are masked");

    // The child has no authority over its parent.
    assert_eq!(m.sys(child).env_destroy(Some(parent)), Err(Errno::BadEnvironment));
    assert_eq!(m.sys(child).getenvid(), Ok(child));
}

#[test]
fn destroying_a_parent_leaves_children_alone() {
    let mut m = Machine::small();
    let parent = m.boot(EnvType::User);
    let child = EnvId::from_raw(m.sys(parent).exofork().unwrap()).unwrap();
    m.sys(parent).env_set_status(Some(child), EnvStatus::Runnable).unwrap();
    m.sys(parent).env_destroy(None).unwrap();
    assert!(m.kernel().env(parent).is_none());
    assert_eq!(m.running(), Some(child));
    // Stale ids stop resolving once the slot is reused.
    let reused = EnvId::from_raw(m.sys(child).exofork().unwrap()).unwrap();
    assert_eq!(reused.index(), parent.index());
    assert_ne!(reused, parent);
    assert_eq!(m.sys(child).env_set_status(Some(parent), EnvStatus::Runnable), Err(Errno::BadEnvironment));
}

#[test]
fn environment_table_runs_out() {
    let mut m = Machine::new(KernelConfig { max_envs: 2, ram_frames: 32, ..KernelConfig::default() });
    let root = m.boot(EnvType::User);
    m.sys(root).exofork().unwrap();
    assert_eq!(m.sys(root).exofork(), Err(Errno::NoFreeEnvironment));
}

#[test]
fn unhandled_fault_destroys_and_handler_catches() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let b = m.boot(EnvType::User);
    let top = m.kernel().config().exception_stack_top;

    m.sys(a).alloc_region(None, top - PAGE_SIZE, PAGE_SIZE, Prot::RW | Prot::ZERO_FILL).unwrap();
    m.sys(a).env_set_pgfault_upcall(None, 0x90_0000).unwrap();
    assert_eq!(m.fault(0xdead_0000, FaultCode::USER | FaultCode::WRITE), Some(a));
    assert_eq!(m.frame().rip, 0x90_0000);
    let sp = m.frame().rsp as usize;
    let record = m.read(a, sp, 8).unwrap();
    assert_eq!(u64::from_le_bytes(record.try_into().unwrap()), 0xdead_0000);

    m.sys(a).yield_();
    assert_eq!(m.running(), Some(b));
    assert_eq!(m.fault(0x1000, FaultCode::USER), Some(a));
    assert!(m.kernel().env(b).is_none());
}

#[test]
fn console_round_trip() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    m.sys(a).alloc_region(None, V, PAGE_SIZE, Prot::RW | Prot::ZERO_FILL).unwrap();
    m.write(a, V, "héllo".as_bytes()).unwrap();
    m.sys(a).cputs(V, "héllo".len()).unwrap();
    let printed = m.kernel().platform().take_output();
    assert!(printed.iter().all(|byte| *byte < 0x80));
    assert_eq!(printed.len(), "héllo".len());

    assert_eq!(m.sys(a).cgetc(), None);
    m.kernel().platform().push_input(b"ok");
    m.kernel_mut().console_interrupt();
    assert_eq!(m.sys(a).cgetc(), Some(b'o'));
    assert_eq!(m.sys(a).cgetc(), Some(b'k'));
}

#[test]
fn clock_and_keyboard() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let t0 = m.sys(a).gettime();
    m.kernel().platform().advance(5_000);
    assert!(m.sys(a).gettime() >= t0 + 5_000);
    assert_eq!(m.sys(a).get_cpufreq() as u64, m.kernel().config().cpu_frequency_hz);
    m.kernel().platform().push_key(0x1c);
    assert_eq!(m.sys(a).poll_kbd(), 0x1c);
    assert_eq!(m.sys(a).poll_kbd(), 0);
}

#[test]
fn drawchar_renders_into_a_mapped_framebuffer() {
    const FB: u64 = 0xfd00_0000;
    let mut m = Machine::new(KernelConfig {
        max_envs: 4,
        ram_frames: 32,
        devices: vec![DeviceWindow { base: FB, len: PAGE_SIZE as u64 }],
        ..KernelConfig::default()
    });
    let vga = m.boot(EnvType::VideoDriver);
    m.sys(vga).map_physical_region(FB as usize, None, V, PAGE_SIZE, Prot::RW).unwrap();

    // 16 pixels per row: cell (1, 0) starts 8 pixels in.
    m.sys(vga).drawchar(V, 1, 0, 0x00ff_ffff, 16, b'A').unwrap();
    let glyph = m.kernel().platform().glyph(b'A');
    let fb = m.kernel().mem().device_bytes(PhysAddr::new(FB)).unwrap();
    for (row, bits) in glyph.iter().enumerate() {
        for col in 0..8 {
            let at = (row * 16 + 8 + col) * 4;
            let pixel = u32::from_le_bytes(fb[at..at + 4].try_into().unwrap());
            let lit = (bits >> col) & 1 == 1;
            assert_eq!(pixel, if lit { 0x00ff_ffff } else { 0 }, "row {row} col {col}");
        }
    }
    // Cell row 8 starts past the mapped page: nothing is stored and the caller dies.
    m.trap(vga, Sysno::DrawChar, [V, 0, 8, 1, 16, usize::from(b'A')]);
    assert!(m.kernel().env(vga).is_none());
    assert_eq!(m.running(), None);
}
