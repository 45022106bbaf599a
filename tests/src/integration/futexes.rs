//! Futex handshake and timeout semantics.

use serial_test::serial;

use crate::abi;
use crate::futex::{self, WaitOutcome};
use crate::mm::paging;
use crate::process::table;
use crate::process::{Process, ProcessState};
use crate::{scheduler, smp};

fn make_proc(space: u64) -> usize {
    let mut p = Process::empty();
    p.state = ProcessState::Running;
    p.pml4 = space;
    let (slot, _) = table::alloc_slot(p).expect("free slot");
    slot
}

fn cleanup(slots: &[usize]) {
    smp::set_current_slot(None);
    for &s in slots {
        futex::remove_waiter(s);
        table::free_slot(s);
    }
    scheduler::test_take_wakes();
}

#[test]
#[serial]
fn wait_then_wake_handshake() {
    let space = paging::test_space_with(0x70000, 1);
    let a = make_proc(space);
    let b = make_proc(space);
    let word = 0x70010u64;

    // A observes 0 and sleeps.
    paging::copy_to_address_space(space, word, &0u32.to_le_bytes()).unwrap();
    smp::set_current_slot(Some(a));
    match futex::wait(space, word, 0, 0, a) {
        WaitOutcome::Blocked => {}
        _ => panic!("matching value must block"),
    }
    assert_eq!(table::get(a).unwrap().state, ProcessState::Blocked);

    // B stores 1 and wakes one sleeper.
    paging::copy_to_address_space(space, word, &1u32.to_le_bytes()).unwrap();
    smp::set_current_slot(Some(b));
    assert_eq!(futex::wake(space, word, 1), 1);

    let a_proc = table::get(a).unwrap();
    assert_eq!(a_proc.state, ProcessState::Ready);
    assert_eq!(a_proc.syscall_ret, 0);

    let mut out = [0u8; 4];
    paging::copy_from_address_space(space, word, &mut out).unwrap();
    assert_eq!(u32::from_le_bytes(out), 1);

    cleanup(&[a, b]);
}

#[test]
#[serial]
fn value_mismatch_returns_eagain_without_blocking() {
    let space = paging::test_space_with(0x71000, 1);
    let a = make_proc(space);
    paging::copy_to_address_space(space, 0x71000, &5u32.to_le_bytes()).unwrap();

    smp::set_current_slot(Some(a));
    match futex::wait(space, 0x71000, 4, 0, a) {
        WaitOutcome::Mismatch => {}
        _ => panic!("mismatched value must not block"),
    }
    assert_eq!(table::get(a).unwrap().state, ProcessState::Running);
    cleanup(&[a]);
}

#[test]
#[serial]
fn keys_are_per_address_space() {
    let space_a = paging::test_space_with(0x72000, 1);
    let space_b = paging::test_space_with(0x72000, 1);
    let a = make_proc(space_a);
    paging::copy_to_address_space(space_a, 0x72000, &0u32.to_le_bytes()).unwrap();

    smp::set_current_slot(Some(a));
    match futex::wait(space_a, 0x72000, 0, 0, a) {
        WaitOutcome::Blocked => {}
        _ => panic!("must block"),
    }

    // Same address, different space: no waiters match.
    assert_eq!(futex::wake(space_b, 0x72000, 8), 0);
    assert_eq!(table::get(a).unwrap().state, ProcessState::Blocked);

    assert_eq!(futex::wake(space_a, 0x72000, 8), 1);
    cleanup(&[a]);
}

#[test]
#[serial]
fn timed_wait_expires_with_eagain() {
    let space = paging::test_space_with(0x73000, 1);
    let a = make_proc(space);
    paging::copy_to_address_space(space, 0x73000, &0u32.to_le_bytes()).unwrap();

    crate::logger::init();
    smp::set_current_slot(Some(a));
    match futex::wait(space, 0x73000, 0, 50, a) {
        WaitOutcome::Blocked => {}
        _ => panic!("must block"),
    }

    crate::arch::test_advance_ms(100);
    futex::expire_timeouts(crate::logger::boot_time_ms());

    let a_proc = table::get(a).unwrap();
    assert_eq!(a_proc.state, ProcessState::Ready);
    assert_eq!(a_proc.syscall_ret, abi::err(abi::errno::EAGAIN));
    cleanup(&[a]);
}
