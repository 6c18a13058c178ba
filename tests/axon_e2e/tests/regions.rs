// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use axon::abi::{EnvId, EnvType, Errno};
use axon::config::DeviceWindow;
use axon::types::PhysAddr;
use axon::KernelConfig;
use axon_e2e::{Machine, Prot, PAGE_SIZE};
use proptest::prelude::*;

const V: usize = 0x20_0000;
const W: usize = 0x60_0000;
const FB: u64 = 0xfd00_0000;

fn rw_zero() -> Prot {
    Prot::RW | Prot::ZERO_FILL
}

fn child_of(m: &mut Machine, parent: EnvId) -> EnvId {
    let raw = m.sys(parent).exofork().expect("exofork");
    EnvId::from_raw(raw).expect("child id")
}

#[test]
fn allocate_stays_inside_user_space() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let ceiling = m.ceiling();

    assert_eq!(m.sys(a).alloc_region(None, ceiling - PAGE_SIZE, 2 * PAGE_SIZE, rw_zero()), Err(Errno::InvalidArgument));
    assert_eq!(m.sys(a).alloc_region(None, V + 8, PAGE_SIZE, rw_zero()), Err(Errno::InvalidArgument));
    assert_eq!(m.sys(a).alloc_region(None, V, PAGE_SIZE, Prot::RW), Err(Errno::InvalidArgument));
    assert_eq!(m.sys(a).alloc_region(None, usize::MAX - PAGE_SIZE + 1, PAGE_SIZE, rw_zero()), Err(Errno::InvalidArgument));
    m.sys(a).alloc_region(None, ceiling - PAGE_SIZE, PAGE_SIZE, rw_zero()).unwrap();
    assert!(m.kernel().translate(a, ceiling - PAGE_SIZE).is_none(), "allocation is lazy");
}

#[test]
fn refcount_tracks_live_mappings_and_frames_are_reused() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let baseline = m.kernel().mem().free_frames();

    m.sys(a).alloc_region(None, V, PAGE_SIZE, rw_zero()).unwrap();
    m.write(a, V, b"abc").unwrap();
    let (pa, _) = m.kernel().translate(a, V).unwrap();
    let child = child_of(&mut m, a);

    m.sys(a).map_region(None, V, Some(child), W, PAGE_SIZE, Prot::READ).unwrap();
    assert_eq!(m.refs(a, V), 2);
    assert_eq!(m.refs(child, W), 2);
    assert_eq!(m.read(child, W, 3).unwrap(), b"abc");
    assert!(m.write(child, W, b"x").is_err(), "child mapping is read-only");

    m.sys(a).unmap_region(Some(child), W, PAGE_SIZE).unwrap();
    assert_eq!(m.refs(a, V), 1);
    m.sys(a).unmap_region(None, V, PAGE_SIZE).unwrap();
    assert_eq!(m.kernel().mem().free_frames(), baseline);

    // The freed frame is the next one handed out, and it comes back clean.
    m.sys(a).alloc_region(None, V, PAGE_SIZE, rw_zero()).unwrap();
    assert_eq!(m.read(a, V, 3).unwrap(), [0, 0, 0]);
    assert_eq!(m.kernel().translate(a, V).map(|(pa, _)| pa), Some(pa));
}

#[test]
fn map_cannot_escalate_to_write() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let child = child_of(&mut m, a);
    m.sys(a).alloc_region(None, V, PAGE_SIZE, Prot::READ | Prot::ZERO_FILL).unwrap();

    assert_eq!(
        m.sys(a).map_region(None, V, Some(child), W, PAGE_SIZE, Prot::RW),
        Err(Errno::InvalidArgument)
    );
    assert_eq!(m.kernel().env(child).unwrap().space.mapped_pages(), 0);
    m.sys(a).map_region(None, V, Some(child), W, PAGE_SIZE, Prot::READ).unwrap();
}

#[test]
fn overlapping_self_map_shares_frames_without_losing_any() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let baseline = m.kernel().mem().free_frames();
    m.sys(a).alloc_region(None, V, 2 * PAGE_SIZE, rw_zero()).unwrap();
    m.write(a, V, b"a").unwrap();
    m.write(a, V + PAGE_SIZE, b"b").unwrap();

    m.sys(a).map_region(None, V, None, V + PAGE_SIZE, 2 * PAGE_SIZE, Prot::READ).unwrap();
    assert_eq!(m.refs(a, V), 2);
    assert_eq!(m.refs(a, V + PAGE_SIZE), 2);
    assert_eq!(m.refs(a, V + 2 * PAGE_SIZE), 1);
    assert_eq!(m.read(a, V + PAGE_SIZE, 1).unwrap(), b"a");
    assert_eq!(m.read(a, V + 2 * PAGE_SIZE, 1).unwrap(), b"b");
    assert!(m.write(a, V + PAGE_SIZE, b"x").is_err());

    m.sys(a).unmap_region(None, V, 3 * PAGE_SIZE).unwrap();
    assert_eq!(m.kernel().mem().free_frames(), baseline);
}

#[test]
fn unmapping_the_whole_user_range_is_cheap() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let ceiling = m.ceiling();
    m.sys(a).alloc_region(None, V, PAGE_SIZE, rw_zero()).unwrap();
    m.write(a, V, b"z").unwrap();
    m.sys(a).unmap_region(None, 0, ceiling).unwrap();
    assert_eq!(m.kernel().env(a).unwrap().space.mapped_pages(), 0);
    assert_eq!(m.refs(a, V), 0);
}

#[test]
fn strangers_cannot_touch_each_other() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let b = m.boot(EnvType::User);
    assert_eq!(m.sys(a).alloc_region(Some(b), V, PAGE_SIZE, rw_zero()), Err(Errno::BadEnvironment));
    assert_eq!(m.sys(a).env_destroy(Some(b)), Err(Errno::BadEnvironment));
    assert!(m.kernel().env(b).is_some());
}

fn device_machine() -> Machine {
    Machine::new(KernelConfig {
        max_envs: 8,
        ram_frames: 64,
        devices: vec![DeviceWindow { base: FB, len: 4 * PAGE_SIZE as u64 }],
        ..KernelConfig::default()
    })
}

#[test]
fn map_physical_is_for_drivers_only() {
    let mut m = device_machine();
    let user = m.boot(EnvType::User);
    assert_eq!(
        m.sys(user).map_physical_region(FB as usize, None, V, PAGE_SIZE, Prot::RW),
        Err(Errno::BadEnvironment)
    );
    assert_eq!(m.kernel().env(user).unwrap().space.mapped_pages(), 0);
}

#[test]
fn driver_writes_reach_device_memory() {
    let mut m = device_machine();
    let driver = m.boot(EnvType::VideoDriver);
    let free = m.kernel().mem().free_frames();

    m.sys(driver).map_physical_region(FB as usize, None, V, 2 * PAGE_SIZE, Prot::RW).unwrap();
    m.write(driver, V + PAGE_SIZE + 4, &[0xde, 0xad]).unwrap();
    let page = m.kernel().mem().device_bytes(PhysAddr::new(FB + PAGE_SIZE as u64)).unwrap();
    assert_eq!(&page[4..6], &[0xde, 0xad]);
    // Only a page table came out of RAM.
    assert_eq!(m.kernel().mem().free_frames(), free - 1);

    let outside = FB as usize + 4 * PAGE_SIZE;
    assert_eq!(m.sys(driver).map_physical_region(outside, None, W, PAGE_SIZE, Prot::RW), Err(Errno::NoMemory));
    assert_eq!(m.sys(driver).map_physical_region(FB as usize, None, V, PAGE_SIZE, Prot::RW), Err(Errno::InvalidArgument));
}

#[derive(Clone, Copy, Debug)]
enum Op {
    Map(usize),
    Unmap(usize),
    Touch(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0..4usize).prop_map(Op::Map), (0..4usize).prop_map(Op::Unmap), (0..4usize).prop_map(Op::Touch)]
}

proptest! {
    #[test]
    fn shared_refcount_matches_mapping_count(ops in proptest::collection::vec(op(), 1..40)) {
        let mut m = Machine::small();
        let a = m.boot(EnvType::User);
        m.sys(a).alloc_region(None, V, 4 * PAGE_SIZE, rw_zero()).unwrap();
        for page in 0..4 {
            m.write(a, V + page * PAGE_SIZE, &[page as u8 + 1]).unwrap();
        }
        let settled = m.kernel().mem().free_frames();
        let child = child_of(&mut m, a);
        let mut shared = [false; 4];

        for op in ops {
            match op {
                Op::Map(page) => {
                    let (src, dst) = (V + page * PAGE_SIZE, W + page * PAGE_SIZE);
                    m.sys(a).map_region(None, src, Some(child), dst, PAGE_SIZE, Prot::READ).unwrap();
                    shared[page] = true;
                }
                Op::Unmap(page) => {
                    m.sys(a).unmap_region(Some(child), W + page * PAGE_SIZE, PAGE_SIZE).unwrap();
                    shared[page] = false;
                }
                Op::Touch(page) => {
                    let seen = m.read(child, W + page * PAGE_SIZE, 1);
                    prop_assert_eq!(seen.is_ok(), shared[page]);
                    if let Ok(byte) = seen {
                        prop_assert_eq!(byte[0], page as u8 + 1);
                    }
                }
            }
            for page in 0..4 {
                prop_assert_eq!(m.refs(a, V + page * PAGE_SIZE), 1 + u32::from(shared[page]));
            }
        }

        m.sys(a).env_destroy(Some(child)).unwrap();
        for page in 0..4 {
            prop_assert_eq!(m.refs(a, V + page * PAGE_SIZE), 1);
        }
        prop_assert_eq!(m.kernel().mem().free_frames(), settled);
    }
}
