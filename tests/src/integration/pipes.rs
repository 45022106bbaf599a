//! Pipe semantics: ring bounds, blocking, EOF, broken pipe.

use serial_test::serial;

use crate::ipc::pipe::{self, IoOutcome, PIPE_BUF_SIZE};
use crate::mm::paging;
use crate::process::table;
use crate::process::{PendingOp, Process, ProcessState};
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
        table::free_slot(s);
    }
    scheduler::test_take_wakes();
}

#[test]
#[serial]
fn write_then_read_round_trips() {
    let space = paging::test_space_with(0x10000, 4);
    let slot = make_proc(space);
    smp::set_current_slot(Some(slot));

    let id = pipe::alloc().expect("pipe slot");
    paging::copy_to_address_space(space, 0x10000, b"12345").unwrap();

    match pipe::write(id, space, 0x10000, 5, slot) {
        IoOutcome::Done(n) => assert_eq!(n, 5),
        IoOutcome::Blocked => panic!("small write must not block"),
    }
    match pipe::read(id, space, 0x11000, 5, slot) {
        IoOutcome::Done(n) => assert_eq!(n, 5),
        IoOutcome::Blocked => panic!("read with data must not block"),
    }
    let mut out = [0u8; 5];
    paging::copy_from_address_space(space, 0x11000, &mut out).unwrap();
    assert_eq!(&out, b"12345");

    pipe::release_reader(id);
    pipe::release_writer(id);
    cleanup(&[slot]);
}

#[test]
#[serial]
fn ring_sized_write_fits_one_more_byte_blocks() {
    let space = paging::test_space_with(0x20000, 4);
    let writer = make_proc(space);
    smp::set_current_slot(Some(writer));

    let id = pipe::alloc().expect("pipe slot");
    let payload = vec![0xAB; PIPE_BUF_SIZE + 1];
    paging::copy_to_address_space(space, 0x20000, &payload[..4096]).unwrap();
    // One page holds 4096; stage the final byte on the next page.
    paging::copy_to_address_space(space, 0x21000, &payload[4096..]).unwrap();

    // Exactly R bytes: no block.
    match pipe::write(id, space, 0x20000, PIPE_BUF_SIZE, writer) {
        IoOutcome::Done(n) => assert_eq!(n as usize, PIPE_BUF_SIZE),
        IoOutcome::Blocked => panic!("exact-capacity write must not block"),
    }

    // Drain, then write R+1: the writer parks after R.
    let drain = make_proc(space);
    match pipe::read(id, space, 0x22000, PIPE_BUF_SIZE, drain) {
        IoOutcome::Done(n) => assert_eq!(n as usize, PIPE_BUF_SIZE),
        IoOutcome::Blocked => panic!("drain must not block"),
    }

    match pipe::write(id, space, 0x20000, PIPE_BUF_SIZE + 1, writer) {
        IoOutcome::Blocked => {}
        IoOutcome::Done(n) => panic!("R+1 write completed early with {}", n),
    }
    assert_eq!(
        table::get(writer).unwrap().pending_op,
        PendingOp::PipeWrite
    );

    // A reader draining the ring completes the writer with the full
    // count.
    smp::set_current_slot(Some(drain));
    match pipe::read(id, space, 0x22000, PIPE_BUF_SIZE, drain) {
        IoOutcome::Done(n) => assert_eq!(n as usize, PIPE_BUF_SIZE),
        IoOutcome::Blocked => panic!("drain must not block"),
    }
    let wakes = scheduler::test_take_wakes();
    assert!(wakes
        .iter()
        .any(|&(s, ret)| s == writer && ret as usize == PIPE_BUF_SIZE + 1));

    pipe::release_reader(id);
    pipe::release_writer(id);
    cleanup(&[writer, drain]);
}

#[test]
#[serial]
fn empty_read_blocks_until_writer_delivers() {
    let space = paging::test_space_with(0x30000, 4);
    let reader = make_proc(space);
    let writer = make_proc(space);

    let id = pipe::alloc().expect("pipe slot");

    smp::set_current_slot(Some(reader));
    match pipe::read(id, space, 0x30000, 16, reader) {
        IoOutcome::Blocked => {}
        IoOutcome::Done(_) => panic!("empty pipe read must block"),
    }
    assert_eq!(table::get(reader).unwrap().state, ProcessState::Blocked);

    smp::set_current_slot(Some(writer));
    paging::copy_to_address_space(space, 0x31000, b"wake").unwrap();
    match pipe::write(id, space, 0x31000, 4, writer) {
        IoOutcome::Done(n) => assert_eq!(n, 4),
        IoOutcome::Blocked => panic!("write into empty ring must not block"),
    }

    // The writer completed the blocked reader directly.
    assert_eq!(table::get(reader).unwrap().state, ProcessState::Ready);
    assert_eq!(table::get(reader).unwrap().syscall_ret, 4);
    let mut out = [0u8; 4];
    paging::copy_from_address_space(space, 0x30000, &mut out).unwrap();
    assert_eq!(&out, b"wake");

    pipe::release_reader(id);
    pipe::release_writer(id);
    cleanup(&[reader, writer]);
}

#[test]
#[serial]
fn eof_and_broken_pipe() {
    let space = paging::test_space_with(0x40000, 2);
    let slot = make_proc(space);
    smp::set_current_slot(Some(slot));

    let id = pipe::alloc().expect("pipe slot");
    paging::copy_to_address_space(space, 0x40000, b"x").unwrap();

    // Last writer gone + drained ring = EOF (0), not an error.
    pipe::write(id, space, 0x40000, 1, slot);
    pipe::release_writer(id);
    match pipe::read(id, space, 0x41000, 8, slot) {
        IoOutcome::Done(n) => assert_eq!(n, 1),
        IoOutcome::Blocked => panic!("buffered read must not block"),
    }
    match pipe::read(id, space, 0x41000, 8, slot) {
        IoOutcome::Done(n) => assert_eq!(n, 0),
        IoOutcome::Blocked => panic!("EOF read must not block"),
    }
    pipe::release_reader(id);

    // Broken pipe: writing with no readers errors, never blocks.
    let id2 = pipe::alloc().expect("pipe slot");
    pipe::release_reader(id2);
    match pipe::write(id2, space, 0x40000, 1, slot) {
        IoOutcome::Done(v) => assert!(crate::abi::is_err(v)),
        IoOutcome::Blocked => panic!("broken-pipe write must not block"),
    }
    pipe::release_writer(id2);
    cleanup(&[slot]);
}
