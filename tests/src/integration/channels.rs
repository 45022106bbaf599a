//! Channel rendezvous: request staging, recv, tag-routed replies, and
//! server-death cleanup.

use serial_test::serial;

use crate::abi::{self, errno, ipc_tag, IPC_HEADER_SIZE};
use crate::fs::fd::{self, FdEntry};
use crate::ipc::{self, SendOutcome};
use crate::mm::paging;
use crate::process::table;
use crate::process::{IpcCont, PendingOp, Process, ProcessState};
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
        fd::with_table(s, |t| t.clear());
        table::free_slot(s);
    }
    scheduler::test_take_wakes();
}

#[test]
#[serial]
fn open_request_reaches_parked_server_with_path_payload() {
    let client_space = paging::test_space_with(0x10000, 4);
    let server_space = paging::test_space_with(0x50000, 4);
    let client = make_proc(client_space);
    let server = make_proc(server_space);

    let chan = ipc::alloc(table::get(server).unwrap().pid).expect("channel");

    // Server parks first.
    smp::set_current_slot(Some(server));
    match ipc::recv(chan, server, 0x50000, IPC_HEADER_SIZE + 4096) {
        SendOutcome::Blocked => {}
        SendOutcome::Done(_) => panic!("recv on idle channel must block"),
    }
    assert_eq!(table::get(server).unwrap().pending_op, PendingOp::IpcRecv);

    // Client opens "bar" through the channel.
    smp::set_current_slot(Some(client));
    match ipc::send_request(chan, client, ipc_tag::T_OPEN, IpcCont::Open { chan }, |msg| {
        msg.data[..3].copy_from_slice(b"bar");
        msg.data_len = 3;
    }) {
        SendOutcome::Blocked => {}
        SendOutcome::Done(v) => panic!("send completed early: {}", v),
    }

    // The parked server was completed with the frame.
    let server_proc = table::get(server).unwrap();
    assert_eq!(server_proc.state, ProcessState::Ready);
    let frame_len = server_proc.syscall_ret as usize;
    assert_eq!(frame_len, IPC_HEADER_SIZE + 3);

    let mut frame = [0u8; 64];
    paging::copy_from_address_space(server_space, 0x50000, &mut frame[..frame_len]).unwrap();
    let tag = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    assert_eq!(tag & 0xFF, ipc_tag::T_OPEN);
    let route = tag >> 8;
    assert_ne!(route, 0);
    assert_eq!(&frame[IPC_HEADER_SIZE..IPC_HEADER_SIZE + 3], b"bar");

    // Server replies R_OK with a handle; the client gets a fresh fd.
    let mut reply = abi::IpcMessage::empty();
    reply.set_tag(ipc_tag::R_OK, route);
    reply.data[..4].copy_from_slice(&77u32.to_le_bytes());
    reply.data_len = 4;
    assert_eq!(ipc::reply(chan, &reply), 0);

    let client_proc = table::get(client).unwrap();
    assert_eq!(client_proc.state, ProcessState::Ready);
    let fdn = client_proc.syscall_ret as usize;
    match fd::with_table(client, |t| t.get(fdn)) {
        Some(FdEntry::ChannelClient { chan: c, handle, .. }) => {
            assert_eq!(c, chan);
            assert_eq!(handle, 77);
        }
        other => panic!("expected a channel client fd, got {:?}", other),
    }

    ipc::release_server(chan);
    ipc::release_client(chan);
    cleanup(&[client, server]);
}

#[test]
#[serial]
fn read_reply_lands_in_client_buffer() {
    let client_space = paging::test_space_with(0x10000, 4);
    let client = make_proc(client_space);
    let server = make_proc(client_space);
    let chan = ipc::alloc(1).expect("channel");

    smp::set_current_slot(Some(client));
    match ipc::send_request(
        chan,
        client,
        ipc_tag::T_READ,
        IpcCont::Read {
            buf: 0x12000,
            len: 64,
            fd: usize::MAX,
        },
        |msg| {
            msg.data_len = 0;
        },
    ) {
        SendOutcome::Blocked => {}
        SendOutcome::Done(v) => panic!("send completed early: {}", v),
    }

    // Server picks it up after the fact (request was queued).
    smp::set_current_slot(Some(server));
    let n = match ipc::recv(chan, server, 0x11000, IPC_HEADER_SIZE + 4096) {
        SendOutcome::Done(n) => n as usize,
        SendOutcome::Blocked => panic!("queued request must deliver"),
    };
    let mut header = [0u8; IPC_HEADER_SIZE];
    paging::copy_from_address_space(client_space, 0x11000, &mut header).unwrap();
    let route = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) >> 8;
    assert!(n >= IPC_HEADER_SIZE);

    let mut reply = abi::IpcMessage::empty();
    reply.set_tag(ipc_tag::R_OK, route);
    reply.data[..5].copy_from_slice(b"hello");
    reply.data_len = 5;
    assert_eq!(ipc::reply(chan, &reply), 0);

    let client_proc = table::get(client).unwrap();
    assert_eq!(client_proc.syscall_ret, 5);
    let mut out = [0u8; 5];
    paging::copy_from_address_space(client_space, 0x12000, &mut out).unwrap();
    assert_eq!(&out, b"hello");

    ipc::release_server(chan);
    ipc::release_client(chan);
    cleanup(&[client, server]);
}

#[test]
#[serial]
fn server_error_byte_surfaces_unchanged() {
    let space = paging::test_space_with(0x10000, 2);
    let client = make_proc(space);
    let chan = ipc::alloc(1).expect("channel");

    smp::set_current_slot(Some(client));
    let _ = ipc::send_request(chan, client, ipc_tag::T_REMOVE, IpcCont::Simple, |msg| {
        msg.data_len = 0;
    });
    let route = table::get(client).unwrap().ipc_route;

    // Move the request into the server's hands.
    let server = make_proc(space);
    smp::set_current_slot(Some(server));
    let _ = ipc::recv(chan, server, 0x10000, IPC_HEADER_SIZE + 4096);

    let mut reply = abi::IpcMessage::empty();
    reply.set_tag(ipc_tag::R_ERROR, route);
    reply.data[0] = errno::ENOENT as u8;
    reply.data_len = 1;
    ipc::reply(chan, &reply);

    assert_eq!(
        table::get(client).unwrap().syscall_ret,
        abi::err(errno::ENOENT)
    );

    ipc::release_server(chan);
    ipc::release_client(chan);
    cleanup(&[client, server]);
}

#[test]
#[serial]
fn dead_server_fails_waiting_clients_with_eio() {
    let space = paging::test_space_with(0x10000, 2);
    let client = make_proc(space);
    let chan = ipc::alloc(42).expect("channel");

    smp::set_current_slot(Some(client));
    let _ = ipc::send_request(chan, client, ipc_tag::T_STAT, IpcCont::Simple, |msg| {
        msg.data_len = 0;
    });
    assert_eq!(table::get(client).unwrap().state, ProcessState::Blocked);

    // Last server fd closes with the request still queued.
    ipc::release_server(chan);

    let client_proc = table::get(client).unwrap();
    assert_eq!(client_proc.state, ProcessState::Ready);
    assert_eq!(client_proc.syscall_ret, abi::err(errno::EIO));

    ipc::release_client(chan);
    cleanup(&[client]);
}
