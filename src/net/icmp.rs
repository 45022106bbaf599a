//! ICMP
//!
//! Echo only: inbound echo requests addressed to us are answered
//! directly, and userspace ping sessions live in a small table keyed by
//! the echo identifier. A session tracks one outstanding request at a
//! time and remembers its last outcome; readers of the session's data
//! file block until the reply or the ~3 s timeout.

use core::fmt::Write;
use spin::Mutex;

use super::ipv4::{self, Ipv4Address, PROTO_ICMP};
use super::{NetError, TxBatch};
use crate::logger::BufWriter;
use crate::mm::paging;
use crate::process::table;
use crate::scheduler;

pub const MAX_SESSIONS: usize = 16;
const MAX_WAITERS: usize = 4;

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_ECHO_REQUEST: u8 = 8;

/// Classic ping payload: 56 data bytes -> 64-byte ICMP message.
const ECHO_PAYLOAD: usize = 56;

/// Reply wait deadline.
const REPLY_TIMEOUT_MS: u64 = 3000;

/// Identifiers start here so stray traffic rarely collides.
const ID_BASE: u16 = 0x4658; // "FX"

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    Idle,
    Pending { sent_ms: u64, seq: u16 },
    Received { from: Ipv4Address, seq: u16, ttl: u8 },
    TimedOut,
}

#[derive(Clone, Copy)]
struct IcmpSession {
    in_use: bool,
    fd_refs: u32,
    remote: Ipv4Address,
    connected: bool,
    next_seq: u16,
    reply: ReplyState,
    waiters: [usize; MAX_WAITERS],
    waiter_count: usize,
}

impl IcmpSession {
    const fn new() -> Self {
        Self {
            in_use: false,
            fd_refs: 0,
            remote: Ipv4Address::UNSPECIFIED,
            connected: false,
            next_seq: 0,
            reply: ReplyState::Idle,
            waiters: [0; MAX_WAITERS],
            waiter_count: 0,
        }
    }
}

static SESSIONS: Mutex<[IcmpSession; MAX_SESSIONS]> =
    Mutex::new([IcmpSession::new(); MAX_SESSIONS]);

fn icmp_checksum_fill(msg: &mut [u8]) {
    msg[2] = 0;
    msg[3] = 0;
    let sum = ipv4::checksum(msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
}

pub fn alloc() -> Option<usize> {
    let mut sessions = SESSIONS.lock();
    for (idx, s) in sessions.iter_mut().enumerate() {
        if !s.in_use {
            *s = IcmpSession::new();
            s.in_use = true;
            s.fd_refs = 1;
            return Some(idx);
        }
    }
    None
}

pub fn retain(idx: usize) {
    SESSIONS.lock()[idx].fd_refs += 1;
}

pub fn release(idx: usize) {
    let mut sessions = SESSIONS.lock();
    let s = &mut sessions[idx];
    s.fd_refs = s.fd_refs.saturating_sub(1);
    if s.fd_refs == 0 {
        *s = IcmpSession::new();
    }
}

pub fn connect(idx: usize, remote: Ipv4Address) -> Result<(), NetError> {
    let mut sessions = SESSIONS.lock();
    let s = &mut sessions[idx];
    if !s.in_use {
        return Err(NetError::InvalidState);
    }
    s.remote = remote;
    s.connected = true;
    Ok(())
}

pub fn is_live(idx: usize) -> bool {
    idx < MAX_SESSIONS && SESSIONS.lock()[idx].in_use
}

/// Send one echo request on the session (a write to its data file).
pub fn trigger_echo(idx: usize, tx: &mut TxBatch) -> Result<(), NetError> {
    let (remote, seq) = {
        let mut sessions = SESSIONS.lock();
        let s = &mut sessions[idx];
        if !s.in_use || !s.connected {
            return Err(NetError::InvalidState);
        }
        let seq = s.next_seq;
        s.next_seq = s.next_seq.wrapping_add(1);
        s.reply = ReplyState::Pending {
            sent_ms: crate::logger::boot_time_ms(),
            seq,
        };
        (s.remote, seq)
    };

    let mut msg = [0u8; 8 + ECHO_PAYLOAD];
    msg[0] = TYPE_ECHO_REQUEST;
    msg[4..6].copy_from_slice(&(ID_BASE + idx as u16).to_be_bytes());
    msg[6..8].copy_from_slice(&seq.to_be_bytes());
    for (i, b) in msg[8..].iter_mut().enumerate() {
        *b = i as u8;
    }
    icmp_checksum_fill(&mut msg);
    super::send_ipv4(remote, PROTO_ICMP, &msg, tx)?;
    Ok(())
}

fn format_outcome(out: &mut [u8], state: ReplyState) -> usize {
    let mut w = BufWriter::new(out);
    match state {
        ReplyState::Received { from, seq, ttl } => {
            let _ = write!(w, "64 bytes from {}: seq={} ttl={}\n", from, seq, ttl);
        }
        ReplyState::TimedOut => {
            let _ = write!(w, "timeout\n");
        }
        _ => {}
    }
    w.len()
}

/// Outcome of a data-file read.
pub enum ReadOutcome {
    Done(usize),
    Blocked,
    Error(NetError),
}

/// Read the session's last outcome into the caller's buffer, blocking
/// while a request is outstanding.
pub fn read_result(idx: usize, pml4: u64, buf: u64, len: usize, caller_slot: usize) -> ReadOutcome {
    let mut sessions = SESSIONS.lock();
    let s = &mut sessions[idx];
    if !s.in_use {
        return ReadOutcome::Error(NetError::InvalidState);
    }
    match s.reply {
        ReplyState::Received { .. } | ReplyState::TimedOut => {
            let mut line = [0u8; 96];
            let n = format_outcome(&mut line, s.reply).min(len);
            s.reply = ReplyState::Idle;
            if paging::copy_to_address_space(pml4, buf, &line[..n]).is_err() {
                return ReadOutcome::Error(NetError::Malformed);
            }
            ReadOutcome::Done(n)
        }
        ReplyState::Pending { .. } => {
            if s.waiter_count >= MAX_WAITERS {
                return ReadOutcome::Error(NetError::NoSlot);
            }
            s.waiters[s.waiter_count] = caller_slot;
            s.waiter_count += 1;
            scheduler::set_pending_dest(caller_slot, idx, buf, len);
            scheduler::block_current(crate::process::PendingOp::NetRead);
            ReadOutcome::Blocked
        }
        ReplyState::Idle => ReadOutcome::Done(0),
    }
}

/// Complete all blocked readers with the formatted outcome.
fn wake_waiters(s: &mut IcmpSession) {
    let mut line = [0u8; 96];
    let n = format_outcome(&mut line, s.reply);
    let woke_any = s.waiter_count > 0;
    for i in 0..s.waiter_count {
        let slot = s.waiters[i];
        let (pml4, buf, len) = match table::get(slot) {
            Some(p) => (table::pml4_of(slot), p.pending_buf, p.pending_len),
            None => continue,
        };
        let take = n.min(len);
        if paging::copy_to_address_space(pml4, buf, &line[..take]).is_ok() {
            scheduler::complete_and_wake(slot, take as u64);
        } else {
            scheduler::complete_and_wake(slot, crate::abi::err(crate::abi::errno::EFAULT));
        }
    }
    s.waiter_count = 0;
    if woke_any {
        s.reply = ReplyState::Idle;
    }
}

/// Inbound ICMP: answer echo requests for us, match replies to sessions.
pub fn handle_packet(src: Ipv4Address, ttl: u8, payload: &[u8], tx: &mut TxBatch) {
    if payload.len() < 8 {
        return;
    }
    if ipv4::checksum(payload) != 0 {
        return;
    }

    match payload[0] {
        TYPE_ECHO_REQUEST => {
            let mut reply = [0u8; super::MAX_FRAME_SIZE];
            let n = payload.len().min(super::MAX_FRAME_SIZE);
            reply[..n].copy_from_slice(&payload[..n]);
            reply[0] = TYPE_ECHO_REPLY;
            icmp_checksum_fill(&mut reply[..n]);
            let _ = super::send_ipv4(src, PROTO_ICMP, &reply[..n], tx);
        }
        TYPE_ECHO_REPLY => {
            let id = u16::from_be_bytes([payload[4], payload[5]]);
            let seq = u16::from_be_bytes([payload[6], payload[7]]);
            if id < ID_BASE {
                return;
            }
            let idx = (id - ID_BASE) as usize;
            if idx >= MAX_SESSIONS {
                return;
            }
            let mut sessions = SESSIONS.lock();
            let s = &mut sessions[idx];
            if !s.in_use {
                return;
            }
            if let ReplyState::Pending { seq: want, .. } = s.reply {
                if want == seq {
                    s.reply = ReplyState::Received { from: src, seq, ttl };
                    wake_waiters(s);
                }
            }
        }
        _ => {}
    }
}

/// Expire outstanding requests.
pub fn poll(now_ms: u64) {
    let mut sessions = SESSIONS.lock();
    for s in sessions.iter_mut() {
        if !s.in_use {
            continue;
        }
        if let ReplyState::Pending { sent_ms, .. } = s.reply {
            if now_ms.saturating_sub(sent_ms) >= REPLY_TIMEOUT_MS {
                s.reply = ReplyState::TimedOut;
                wake_waiters(s);
            }
        }
    }
}

/// Remote endpoint, for the ctl/status files.
pub fn remote_of(idx: usize) -> Option<Ipv4Address> {
    let sessions = SESSIONS.lock();
    let s = &sessions[idx];
    if s.in_use && s.connected {
        Some(s.remote)
    } else {
        None
    }
}
