//! IPC channels
//!
//! A channel is a rendezvous between one server endpoint and any number
//! of client fds. Each client has at most one request in flight; the
//! server drains them serially with `ipc_recv`/`ipc_reply`. Requests are
//! staged in a per-client frame and identified by a kernel-assigned
//! routing tag the server echoes in its reply, which is how out-of-order
//! replies find their client.
//!
//! The client always sleeps from send until reply. The kernel finishes
//! the blocked syscall on the client's behalf when the reply lands,
//! driven by the continuation tag recorded at send time (allocate the
//! open fd, copy read bytes out, surface the server's error byte).

pub mod pipe;

use spin::Mutex;

use crate::abi::{self, errno, ipc_tag, IpcMessage, IPC_HEADER_SIZE};
use crate::fs::fd::{self, FdEntry};
use crate::mm::paging;
use crate::process::table;
use crate::process::{IpcCont, Pid, MAX_PROCESSES};
use crate::scheduler;

pub const MAX_CHANNELS: usize = 64;
const MAX_CHAN_WAITERS: usize = 16;
const MAX_INFLIGHT: usize = 16;

struct Channel {
    in_use: bool,
    server_pid: Pid,
    server_refs: u32,
    client_refs: u32,
    next_route: u32,
    /// Server slot blocked in ipc_recv, if any.
    server_waiting: Option<usize>,
    /// Clients whose staged request the server has not yet taken; the
    /// head is the channel's single pending request.
    wait_clients: [usize; MAX_CHAN_WAITERS],
    wait_count: usize,
    /// (client slot, route) pairs the server is currently holding.
    inflight: [Option<(usize, u32)>; MAX_INFLIGHT],
}

impl Channel {
    const fn new() -> Self {
        Self {
            in_use: false,
            server_pid: 0,
            server_refs: 0,
            client_refs: 0,
            next_route: 1,
            server_waiting: None,
            wait_clients: [0; MAX_CHAN_WAITERS],
            wait_count: 0,
            inflight: [None; MAX_INFLIGHT],
        }
    }

    fn push_waiter(&mut self, slot: usize) -> bool {
        if self.wait_count >= MAX_CHAN_WAITERS {
            return false;
        }
        self.wait_clients[self.wait_count] = slot;
        self.wait_count += 1;
        true
    }

    fn pop_waiter(&mut self) -> Option<usize> {
        if self.wait_count == 0 {
            return None;
        }
        let slot = self.wait_clients[0];
        self.wait_clients.copy_within(1..self.wait_count, 0);
        self.wait_count -= 1;
        Some(slot)
    }

    fn add_inflight(&mut self, slot: usize, route: u32) -> bool {
        for entry in self.inflight.iter_mut() {
            if entry.is_none() {
                *entry = Some((slot, route));
                return true;
            }
        }
        false
    }

    fn take_inflight(&mut self, route: u32) -> Option<usize> {
        for entry in self.inflight.iter_mut() {
            if let Some((slot, r)) = *entry {
                if r == route {
                    *entry = None;
                    return Some(slot);
                }
            }
        }
        None
    }
}

static CHANNELS: [Mutex<Channel>; MAX_CHANNELS] = {
    const INIT: Mutex<Channel> = Mutex::new(Channel::new());
    [INIT; MAX_CHANNELS]
};

/// Per-client staging frame for the request awaiting pickup.
static FRAMES: [Mutex<IpcMessage>; MAX_PROCESSES] = {
    const INIT: Mutex<IpcMessage> = Mutex::new(IpcMessage::empty());
    [INIT; MAX_PROCESSES]
};

/// Allocate a channel owned by `server_pid` with one reference on each
/// endpoint.
pub fn alloc(server_pid: Pid) -> Option<usize> {
    for (idx, chan) in CHANNELS.iter().enumerate() {
        let mut c = chan.lock();
        if !c.in_use {
            *c = Channel::new();
            c.in_use = true;
            c.server_pid = server_pid;
            c.server_refs = 1;
            c.client_refs = 1;
            return Some(idx);
        }
    }
    None
}

pub fn retain_client(chan: usize) {
    CHANNELS[chan].lock().client_refs += 1;
}

pub fn retain_server(chan: usize) {
    CHANNELS[chan].lock().server_refs += 1;
}

pub fn release_client(chan: usize) {
    let mut c = CHANNELS[chan].lock();
    c.client_refs = c.client_refs.saturating_sub(1);
    maybe_free(&mut c);
}

/// Dropping the last server reference kills the channel from the
/// clients' point of view: everything queued or held wakes with EIO.
pub fn release_server(chan: usize) {
    let mut c = CHANNELS[chan].lock();
    c.server_refs = c.server_refs.saturating_sub(1);
    if c.server_refs == 0 {
        fail_all_clients(&mut c);
    }
    maybe_free(&mut c);
}

fn maybe_free(c: &mut Channel) {
    if c.server_refs == 0 && c.client_refs == 0 {
        c.in_use = false;
    }
}

fn fail_all_clients(c: &mut Channel) {
    while let Some(slot) = c.pop_waiter() {
        scheduler::complete_and_wake(slot, abi::err(errno::EIO));
    }
    for entry in c.inflight.iter_mut() {
        if let Some((slot, _)) = entry.take() {
            scheduler::complete_and_wake(slot, abi::err(errno::EIO));
        }
    }
}

/// Outcome of a channel operation started from the syscall layer.
pub enum SendOutcome {
    /// Caller must block; delivery/continuation is fully set up.
    Blocked,
    /// Finished immediately with this return value (errors only).
    Done(u64),
}

/// Stage a request on `chan` for the calling client and either hand it
/// to a waiting server or queue it. `build` fills the message in place;
/// `cont` names the reply continuation. The client always blocks.
pub fn send_request(
    chan: usize,
    client_slot: usize,
    op: u32,
    cont: IpcCont,
    build: impl FnOnce(&mut IpcMessage),
) -> SendOutcome {
    let mut c = CHANNELS[chan].lock();
    if !c.in_use || c.server_refs == 0 {
        return SendOutcome::Done(abi::err(errno::EIO));
    }

    let route = c.next_route;
    c.next_route = c.next_route.wrapping_add(1).max(1);

    {
        let mut frame = FRAMES[client_slot].lock();
        *frame = IpcMessage::empty();
        build(&mut frame);
        frame.set_tag(op, route);
    }

    table::with_slot(client_slot, |p| {
        p.ipc_route = route;
        p.ipc_cont = cont;
        p.pending_obj = chan;
    });

    // The client sleeps from send to reply either way; mark it blocked
    // before anything can deliver the reply.
    scheduler::block_current(crate::process::PendingOp::IpcReplyWait);

    if let Some(server_slot) = c.server_waiting {
        // Server parked in ipc_recv: copy straight into its buffer.
        c.server_waiting = None;
        if !c.add_inflight(client_slot, route) {
            scheduler::complete_and_wake(client_slot, abi::err(errno::EAGAIN));
            return SendOutcome::Blocked;
        }
        deliver_to_server(client_slot, server_slot);
    } else if !c.push_waiter(client_slot) {
        scheduler::complete_and_wake(client_slot, abi::err(errno::EAGAIN));
        return SendOutcome::Blocked;
    }
    SendOutcome::Blocked
}

/// Copy the staged frame of `client_slot` into the recv buffer the
/// blocked server recorded, then wake the server with the frame size.
fn deliver_to_server(client_slot: usize, server_slot: usize) {
    let (dest_buf, dest_len) = match table::get(server_slot) {
        Some(p) => (p.pending_buf, p.pending_len),
        None => return,
    };
    let pml4 = table::pml4_of(server_slot);
    let frame = FRAMES[client_slot].lock();
    let total = IPC_HEADER_SIZE + frame.data_len as usize;
    let n = total.min(dest_len);
    let bytes = unsafe {
        core::slice::from_raw_parts(&*frame as *const IpcMessage as *const u8, n)
    };
    if paging::copy_to_address_space(pml4, dest_buf, bytes).is_err() {
        scheduler::complete_and_wake(server_slot, abi::err(errno::EFAULT));
        return;
    }
    scheduler::complete_and_wake(server_slot, n as u64);
}

/// Server-side receive. Delivers the pending request if one is queued,
/// otherwise parks the server.
pub fn recv(chan: usize, server_slot: usize, dest_buf: u64, dest_len: usize) -> SendOutcome {
    let mut c = CHANNELS[chan].lock();
    if !c.in_use {
        return SendOutcome::Done(abi::err(errno::EBADF));
    }
    c.server_pid = table::get(server_slot).map(|p| p.pid).unwrap_or(0);

    if let Some(client_slot) = c.pop_waiter() {
        let route = table::get(client_slot).map(|p| p.ipc_route).unwrap_or(0);
        if !c.add_inflight(client_slot, route) {
            // Put it back; the server retries once a reply frees a slot.
            let keep = c.wait_count.min(MAX_CHAN_WAITERS - 1);
            c.wait_clients.copy_within(0..keep, 1);
            c.wait_clients[0] = client_slot;
            c.wait_count = keep + 1;
            return SendOutcome::Done(abi::err(errno::EAGAIN));
        }
        // Copy straight into the calling server's buffer.
        let pml4 = table::pml4_of(server_slot);
        let frame = FRAMES[client_slot].lock();
        let total = IPC_HEADER_SIZE + frame.data_len as usize;
        let n = total.min(dest_len);
        let bytes =
            unsafe { core::slice::from_raw_parts(&*frame as *const IpcMessage as *const u8, n) };
        if paging::copy_to_address_space(pml4, dest_buf, bytes).is_err() {
            return SendOutcome::Done(abi::err(errno::EFAULT));
        }
        return SendOutcome::Done(n as u64);
    }

    if c.server_waiting.is_some() {
        return SendOutcome::Done(abi::err(errno::EAGAIN));
    }
    c.server_waiting = Some(server_slot);
    scheduler::set_pending_dest(server_slot, chan, dest_buf, dest_len);
    scheduler::block_current(crate::process::PendingOp::IpcRecv);
    SendOutcome::Blocked
}

/// Server-side reply. Routes by the tag echoed in `msg` and finishes the
/// matched client's blocked syscall.
pub fn reply(chan: usize, msg: &IpcMessage) -> u64 {
    let client_slot = {
        let mut c = CHANNELS[chan].lock();
        if !c.in_use {
            return abi::err(errno::EBADF);
        }
        match c.take_inflight(msg.route()) {
            Some(slot) => slot,
            None => return abi::err(errno::EINVAL),
        }
    };
    complete_client(client_slot, msg);
    0
}

/// Apply the reply to the blocked client per its continuation tag.
fn complete_client(client_slot: usize, msg: &IpcMessage) {
    let cont = match table::get(client_slot) {
        Some(p) => p.ipc_cont,
        None => return,
    };
    table::with_slot(client_slot, |p| p.ipc_cont = IpcCont::None);

    if msg.op() == ipc_tag::R_ERROR {
        let e = msg
            .payload()
            .first()
            .map(|&b| b as i32)
            .filter(|&e| e >= 1 && e <= 10)
            .unwrap_or(errno::EIO);
        scheduler::complete_and_wake(client_slot, abi::err(e));
        return;
    }
    if msg.op() != ipc_tag::R_OK {
        scheduler::complete_and_wake(client_slot, abi::err(errno::EIO));
        return;
    }

    let ret = match cont {
        IpcCont::None | IpcCont::Simple => 0,
        IpcCont::Open { chan } => {
            let handle = parse_u32(msg.payload()).unwrap_or(0);
            let rslot = table::resource_slot(client_slot);
            match fd::with_table(rslot, |t| {
                t.alloc(FdEntry::ChannelClient {
                    chan,
                    handle,
                    offset: 0,
                })
            }) {
                Some(fdn) => {
                    retain_client(chan);
                    fdn as u64
                }
                None => abi::err(errno::EMFILE),
            }
        }
        IpcCont::Read { buf, len, fd: fdn } => {
            let payload = msg.payload();
            let n = payload.len().min(len);
            let pml4 = table::pml4_of(client_slot);
            if paging::copy_to_address_space(pml4, buf, &payload[..n]).is_err() {
                abi::err(errno::EFAULT)
            } else {
                advance_offset(client_slot, fdn, n as u64);
                n as u64
            }
        }
        IpcCont::Write { fd: fdn } => {
            let n = parse_u32(msg.payload()).unwrap_or(msg.data_len) as u64;
            advance_offset(client_slot, fdn, n);
            n
        }
        IpcCont::Stat { buf } => {
            let payload = msg.payload();
            let want = core::mem::size_of::<abi::Stat>();
            if payload.len() < want {
                abi::err(errno::EIO)
            } else {
                let pml4 = table::pml4_of(client_slot);
                if paging::copy_to_address_space(pml4, buf, &payload[..want]).is_err() {
                    abi::err(errno::EFAULT)
                } else {
                    0
                }
            }
        }
    };
    scheduler::complete_and_wake(client_slot, ret);
}

fn parse_u32(payload: &[u8]) -> Option<u32> {
    if payload.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

fn advance_offset(client_slot: usize, fdn: usize, by: u64) {
    let rslot = table::resource_slot(client_slot);
    fd::with_table(rslot, |t| {
        if let Some(FdEntry::ChannelClient { offset, .. }) = t.get_mut(fdn) {
            *offset += by;
        }
    });
}

/// Remove a dying process from every channel's queues.
pub fn remove_waiter(slot: usize) {
    for chan in CHANNELS.iter() {
        let mut c = chan.lock();
        if !c.in_use {
            continue;
        }
        if c.server_waiting == Some(slot) {
            c.server_waiting = None;
        }
        for i in (0..c.wait_count).rev() {
            if c.wait_clients[i] == slot {
                let end = c.wait_count;
                c.wait_clients.copy_within(i + 1..end, i);
                c.wait_count -= 1;
            }
        }
        for entry in c.inflight.iter_mut() {
            if matches!(*entry, Some((s, _)) if s == slot) {
                *entry = None;
            }
        }
    }
}

/// (server_refs, client_refs, queued) for tests.
pub fn stat(chan: usize) -> Option<(u32, u32, usize)> {
    let c = CHANNELS[chan].lock();
    if !c.in_use {
        return None;
    }
    Some((c.server_refs, c.client_refs, c.wait_count))
}
