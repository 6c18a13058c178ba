// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use axon::abi::{EnvStatus, EnvType, Errno, InboxRecord};
use axon_e2e::{errno, Machine, Prot, PAGE_SIZE};

const S: usize = 0x40_0000;
const D: usize = 0x50_0000;

#[test]
fn a_waits_for_b_and_receives_42() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let b = m.boot(EnvType::User);
    let ceiling = m.ceiling();

    m.sys(a).ipc_recv(ceiling, 0);
    assert_eq!(m.running(), Some(b));
    assert_eq!(m.status(a), Some(EnvStatus::NotRunnable));

    m.sys(b).ipc_try_send(a, 42, ceiling, 0, Prot::empty()).unwrap();
    assert_eq!(m.running(), Some(b), "a successful send does not give up the CPU");
    m.sys(b).yield_();
    assert_eq!(m.running(), Some(a));
    assert_eq!(m.result(a), 42);

    let inbox = m.kernel().inbox(a).unwrap();
    assert_eq!(inbox.sender(), Some(b));
    assert_eq!(inbox.value, 42);
    assert_eq!(inbox.len, 0);
}

#[test]
fn recv_blocks_until_a_send_and_is_consumed_once() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let b = m.boot(EnvType::User);
    let ceiling = m.ceiling();
    m.sys(a).ipc_recv(ceiling, 0);

    for _ in 0..5 {
        m.sys(b).yield_();
        assert_eq!(m.tick(), Some(b));
    }
    assert_eq!(m.status(a), Some(EnvStatus::NotRunnable));

    m.sys(b).ipc_try_send(a, 1, ceiling, 0, Prot::empty()).unwrap();
    assert_eq!(m.sys(b).ipc_try_send(a, 2, ceiling, 0, Prot::empty()), Err(Errno::NotReceiving));
    m.sys(b).yield_();
    assert_eq!(m.result(a), 1);
}

#[test]
fn failed_send_changes_nothing() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let b = m.boot(EnvType::User);
    m.sys(a).alloc_region(None, S, PAGE_SIZE, Prot::RW | Prot::ZERO_FILL).unwrap();
    m.write(a, S, b"payload").unwrap();

    assert_eq!(m.sys(a).ipc_try_send(b, 7, S, PAGE_SIZE, Prot::READ), Err(Errno::NotReceiving));
    assert_eq!(m.refs(a, S), 1);
    assert_eq!(m.kernel().env(b).unwrap().space.mapped_pages(), 0);
    assert_eq!(m.status(b), Some(EnvStatus::Runnable));
    assert_eq!(m.kernel().inbox(b).unwrap().sender(), None);
}

#[test]
fn receiver_refusing_pages_gets_the_value_only() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let b = m.boot(EnvType::User);
    let ceiling = m.ceiling();
    m.sys(a).ipc_recv(ceiling, 0);

    m.sys(b).alloc_region(None, S, PAGE_SIZE, Prot::RW | Prot::ZERO_FILL).unwrap();
    m.sys(b).ipc_try_send(a, 9, S, PAGE_SIZE, Prot::RW).unwrap();
    assert_eq!(m.refs(b, S), 0, "lazy page stays lazy when nothing is transferred");
    assert_eq!(m.kernel().env(a).unwrap().space.mapped_pages(), 0);
    let inbox = m.kernel().inbox(a).unwrap();
    assert_eq!((inbox.value, inbox.len, inbox.prot()), (9, 0, Prot::empty()));
}

#[test]
fn page_transfer_shares_the_frame() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let b = m.boot(EnvType::User);
    m.sys(a).ipc_recv(D, 4 * PAGE_SIZE);

    m.sys(b).alloc_region(None, S, PAGE_SIZE, Prot::RW | Prot::ZERO_FILL).unwrap();
    m.write(b, S, b"hello").unwrap();
    m.sys(b).ipc_try_send(a, 3, S, PAGE_SIZE, Prot::RW).unwrap();
    assert_eq!(m.refs(b, S), 2);
    assert_eq!(m.read(a, D, 5).unwrap(), b"hello");
    m.write(a, D, b"J").unwrap();
    assert_eq!(m.read(b, S, 5).unwrap(), b"Jello");

    m.sys(b).yield_();
    let mut raw = [0u8; InboxRecord::SIZE];
    m.sys(a).alloc_region(None, S, PAGE_SIZE, Prot::RW | Prot::ZERO_FILL).unwrap();
    m.sys(a).ipc_inbox(S).unwrap();
    raw.copy_from_slice(&m.read(a, S, InboxRecord::SIZE).unwrap());
    let record = InboxRecord::from_bytes(&raw);
    assert_eq!(record.sender(), Some(b));
    assert_eq!(record.len, PAGE_SIZE as u64);
    assert!(record.prot().contains(Prot::RW));
}

#[test]
fn receiver_stays_parked_when_the_transfer_runs_out_of_memory() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let b = m.boot(EnvType::User);
    m.sys(a).ipc_recv(D, PAGE_SIZE);
    m.sys(b).alloc_region(None, S, PAGE_SIZE, Prot::RW | Prot::ZERO_FILL).unwrap();
    m.write(b, S, b"z").unwrap();

    // The next allocation is a's leaf table.
    m.kernel_mut().deny_next_alloc();
    assert_eq!(m.sys(b).ipc_try_send(a, 5, S, PAGE_SIZE, Prot::READ), Err(Errno::NoMemory));
    assert_eq!(m.status(a), Some(EnvStatus::NotRunnable));
    assert_eq!(m.refs(b, S), 1);

    m.sys(b).ipc_try_send(a, 6, S, PAGE_SIZE, Prot::READ).unwrap();
    m.sys(b).yield_();
    assert_eq!(m.running(), Some(a));
    assert_eq!(m.result(a), 6);
    assert_eq!(m.read(a, D, 1).unwrap(), b"z");
}

#[test]
fn bad_receive_arguments_are_reported_without_parking() {
    let mut m = Machine::small();
    let a = m.boot(EnvType::User);
    let word = m.sys(a).ipc_recv(D + 1, PAGE_SIZE);
    assert_eq!(errno(word), Err(Errno::InvalidArgument));
    let ceiling = m.ceiling();
    let word = m.sys(a).ipc_recv(ceiling - PAGE_SIZE, 2 * PAGE_SIZE);
    assert_eq!(errno(word), Err(Errno::InvalidArgument));
    assert_eq!(m.running(), Some(a));
    assert_eq!(m.status(a), Some(EnvStatus::Runnable));
}
