//! Loopback networking: the TxBatch flush feeds frames addressed to our
//! own MAC back into the receive path, which is enough to run the full
//! TCP handshake and ICMP echo without a driver.

use serial_test::serial;

use crate::mm::paging;
use crate::net::ipv4::Ipv4Address;
use crate::net::{self, icmp, tcp, TxBatch};
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
        table::free_slot(s);
    }
    scheduler::test_take_wakes();
}

#[test]
#[serial]
fn tcp_connect_exchange_and_status_over_loopback() {
    crate::logger::init();
    let space = paging::test_space_with(0x80000, 8);
    let slot = make_proc(space);
    smp::set_current_slot(Some(slot));

    // Server side: announce *!7.
    let listener = tcp::alloc().expect("listener slot");
    tcp::announce(listener, 7).expect("announce");

    // Client side: connect to our own address.
    let client = tcp::alloc().expect("client slot");
    let mut tx = TxBatch::new();
    tcp::connect(client, net::local_ip(), 7, &mut tx).expect("SYN staged");
    net::flush(&mut tx);

    // Loopback completed the whole handshake synchronously.
    assert_eq!(tcp::state_name(client), "Established");
    let child = tcp::accept(listener, slot)
        .expect("listener is listening")
        .expect("child connection established");
    assert_eq!(tcp::state_name(child), "Established");

    // Client writes "hello"; the echo peer reads it from the child.
    paging::copy_to_address_space(space, 0x80000, b"hello").unwrap();
    let mut tx = TxBatch::new();
    match tcp::write(client, space, 0x80000, 5, slot, &mut tx) {
        tcp::ReadOutcome::Done(n) => assert_eq!(n, 5),
        tcp::ReadOutcome::Blocked => panic!("write with space must not block"),
    }
    net::flush(&mut tx);

    let mut tx = TxBatch::new();
    match tcp::read(child, space, 0x81000, 5, slot, &mut tx) {
        tcp::ReadOutcome::Done(n) => assert_eq!(n, 5),
        tcp::ReadOutcome::Blocked => panic!("delivered bytes must be readable"),
    }
    net::flush(&mut tx);
    let mut got = [0u8; 5];
    paging::copy_from_address_space(space, 0x81000, &mut got).unwrap();
    assert_eq!(&got, b"hello");

    // Echo back the other way.
    let mut tx = TxBatch::new();
    match tcp::write(child, space, 0x81000, 5, slot, &mut tx) {
        tcp::ReadOutcome::Done(n) => assert_eq!(n, 5),
        tcp::ReadOutcome::Blocked => panic!("echo write must not block"),
    }
    net::flush(&mut tx);
    let mut tx = TxBatch::new();
    match tcp::read(client, space, 0x82000, 5, slot, &mut tx) {
        tcp::ReadOutcome::Done(n) => assert_eq!(n, 5),
        tcp::ReadOutcome::Blocked => panic!("echo must be readable"),
    }
    let mut echo = [0u8; 5];
    paging::copy_from_address_space(space, 0x82000, &mut echo).unwrap();
    assert_eq!(&echo, b"hello");

    // Tear down all three slots.
    let mut tx = TxBatch::new();
    tcp::close(client, &mut tx);
    net::flush(&mut tx);
    let mut tx = TxBatch::new();
    tcp::close(child, &mut tx);
    tcp::close(listener, &mut tx);
    net::flush(&mut tx);

    // Let TIME_WAIT expire so later tests get clean slots.
    crate::arch::test_advance_ms(3000);
    let mut tx = TxBatch::new();
    tcp::poll(crate::logger::boot_time_ms(), &mut tx);
    net::flush(&mut tx);

    cleanup(&[slot]);
}

#[test]
#[serial]
fn multi_mss_write_drains_fully_over_loopback() {
    crate::logger::init();
    let space = paging::test_space_with(0xC0000, 8);
    let slot = make_proc(space);
    smp::set_current_slot(Some(slot));

    let listener = tcp::alloc().expect("listener slot");
    tcp::announce(listener, 8).expect("announce");
    let client = tcp::alloc().expect("client slot");
    let mut tx = TxBatch::new();
    tcp::connect(client, net::local_ip(), 8, &mut tx).expect("SYN staged");
    net::flush(&mut tx);
    let child = tcp::accept(listener, slot).unwrap().expect("child");

    // Two MSS plus change, staged by a single write.
    const TOTAL: usize = 3000;
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    paging::copy_to_address_space(space, 0xC0000, &payload).unwrap();

    let mut tx = TxBatch::new();
    match tcp::write(client, space, 0xC0000, TOTAL, slot, &mut tx) {
        tcp::ReadOutcome::Done(n) => assert_eq!(n as usize, TOTAL),
        tcp::ReadOutcome::Blocked => panic!("write within buffer space must not block"),
    }
    net::flush(&mut tx);

    // The drain must not strand anything past the first segment; a few
    // poll ticks mirror the idle loop picking up any residue.
    let mut received = 0usize;
    for _ in 0..8 {
        let mut tx = TxBatch::new();
        tcp::poll(crate::logger::boot_time_ms(), &mut tx);
        net::flush(&mut tx);
        let mut tx = TxBatch::new();
        match tcp::read(child, space, 0xC2000 + received as u64, TOTAL - received, slot, &mut tx)
        {
            tcp::ReadOutcome::Done(n) => received += n as usize,
            tcp::ReadOutcome::Blocked => break,
        }
        net::flush(&mut tx);
        if received == TOTAL {
            break;
        }
    }
    assert_eq!(received, TOTAL);

    let mut echo = vec![0u8; TOTAL];
    paging::copy_from_address_space(space, 0xC2000, &mut echo).unwrap();
    assert_eq!(echo, payload);

    let mut tx = TxBatch::new();
    tcp::close(client, &mut tx);
    net::flush(&mut tx);
    let mut tx = TxBatch::new();
    tcp::close(child, &mut tx);
    tcp::close(listener, &mut tx);
    net::flush(&mut tx);
    crate::arch::test_advance_ms(3000);
    let mut tx = TxBatch::new();
    tcp::poll(crate::logger::boot_time_ms(), &mut tx);
    net::flush(&mut tx);
    cleanup(&[slot]);
}

#[test]
#[serial]
fn blocked_tcp_reader_is_completed_by_inbound_data() {
    crate::logger::init();
    let space = paging::test_space_with(0x90000, 8);
    let reader = make_proc(space);
    smp::set_current_slot(Some(reader));

    let listener = tcp::alloc().expect("listener");
    tcp::announce(listener, 9).expect("announce");
    let client = tcp::alloc().expect("client");
    let mut tx = TxBatch::new();
    tcp::connect(client, net::local_ip(), 9, &mut tx).expect("SYN");
    net::flush(&mut tx);
    let child = tcp::accept(listener, reader).unwrap().expect("child");

    // Reader parks on the empty child connection.
    let mut tx = TxBatch::new();
    match tcp::read(child, space, 0x90000, 16, reader, &mut tx) {
        tcp::ReadOutcome::Blocked => {}
        tcp::ReadOutcome::Done(v) => panic!("empty read returned {}", v),
    }
    net::flush(&mut tx);
    assert_eq!(table::get(reader).unwrap().state, ProcessState::Blocked);

    // Peer data arrives and finishes the read in the waker.
    paging::copy_to_address_space(space, 0x91000, b"ping").unwrap();
    let mut tx = TxBatch::new();
    tcp::write(client, space, 0x91000, 4, reader, &mut tx);
    net::flush(&mut tx);

    let proc = table::get(reader).unwrap();
    assert_eq!(proc.state, ProcessState::Ready);
    assert_eq!(proc.syscall_ret, 4);
    let mut got = [0u8; 4];
    paging::copy_from_address_space(space, 0x90000, &mut got).unwrap();
    assert_eq!(&got, b"ping");

    let mut tx = TxBatch::new();
    tcp::close(client, &mut tx);
    tcp::close(child, &mut tx);
    tcp::close(listener, &mut tx);
    net::flush(&mut tx);
    crate::arch::test_advance_ms(3000);
    let mut tx = TxBatch::new();
    tcp::poll(crate::logger::boot_time_ms(), &mut tx);
    net::flush(&mut tx);
    cleanup(&[reader]);
}

#[test]
#[serial]
fn icmp_echo_to_own_address_formats_ping_line() {
    crate::logger::init();
    let space = paging::test_space_with(0xA0000, 2);
    let slot = make_proc(space);
    smp::set_current_slot(Some(slot));

    let session = icmp::alloc().expect("icmp session");
    icmp::connect(session, net::local_ip()).expect("connect");

    let mut tx = TxBatch::new();
    icmp::trigger_echo(session, &mut tx).expect("echo staged");
    net::flush(&mut tx);

    // Loopback answered synchronously; the read returns the line.
    match icmp::read_result(session, space, 0xA0000, 96, slot) {
        icmp::ReadOutcome::Done(n) => {
            let mut line = vec![0u8; n];
            paging::copy_from_address_space(space, 0xA0000, &mut line).unwrap();
            let text = String::from_utf8(line).unwrap();
            assert_eq!(text, format!("64 bytes from {}: seq=0 ttl=64\n", net::local_ip()));
        }
        _ => panic!("echo reply must be available after flush"),
    }

    icmp::release(session);
    cleanup(&[slot]);
}

#[test]
#[serial]
fn icmp_timeout_reports_timeout_line() {
    crate::logger::init();
    let space = paging::test_space_with(0xB0000, 2);
    let slot = make_proc(space);
    smp::set_current_slot(Some(slot));

    let session = icmp::alloc().expect("icmp session");
    // Unreachable: not our address, no driver, so the request vanishes.
    icmp::connect(session, Ipv4Address::new(10, 0, 0, 99)).expect("connect");
    let mut tx = TxBatch::new();
    let _ = icmp::trigger_echo(session, &mut tx);
    net::flush(&mut tx);

    crate::arch::test_advance_ms(4000);
    icmp::poll(crate::logger::boot_time_ms());

    match icmp::read_result(session, space, 0xB0000, 96, slot) {
        icmp::ReadOutcome::Done(n) => {
            let mut line = vec![0u8; n];
            paging::copy_from_address_space(space, 0xB0000, &mut line).unwrap();
            assert_eq!(&line[..], b"timeout\n");
        }
        _ => panic!("timed-out echo must report"),
    }

    icmp::release(session);
    cleanup(&[slot]);
}
