//! TCP
//!
//! RFC 793 state machine over a fixed pool of connection slots.
//! Established-segment demux is O(1) through a 256-bucket FNV-1a hash
//! over (local_port, remote_port, remote_ip) with index chains; listener
//! lookup is a linear scan (rare). Each slot carries a 16 KiB receive
//! ring and a 4 KiB transmit buffer that doubles as the retransmission
//! store, with exponential backoff from ~1 s and up to 8 retries.
//!
//! Lock order is `conn -> alloc`, never the reverse: `handle_segment`
//! does the hash lookup under the alloc lock, releases it, then locks
//! the connection. Allocation and hash insertion hold both.

use spin::Mutex;

use super::ipv4::{self, Ipv4Address, PROTO_TCP};
use super::{NetError, TxBatch};
use crate::abi::{self, errno};
use crate::mm::paging;
use crate::process::table;
use crate::scheduler;

pub const MAX_CONNS: usize = 256;
const HASH_BUCKETS: usize = 256;
const MAX_WAITERS: usize = 4;

/// Receive ring capacity; the advertised window is its free space.
pub const RX_BUF_SIZE: usize = 16 * 1024;
/// Transmit/retransmission buffer capacity.
pub const TX_BUF_SIZE: usize = 4 * 1024;

/// Default maximum segment size.
pub const MSS: usize = 1460;

const INITIAL_RTO_MS: u64 = 1000;
const MAX_RETRANSMIT: u8 = 8;
/// TIME_WAIT linger before slot reuse.
const TIME_WAIT_MS: u64 = 2000;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

const TCP_HEADER_LEN: usize = 20;

/// TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub fn name(self) -> &'static str {
        match self {
            TcpState::Closed => "Closed",
            TcpState::Listen => "Listen",
            TcpState::SynSent => "SynSent",
            TcpState::SynReceived => "SynReceived",
            TcpState::Established => "Established",
            TcpState::FinWait1 => "FinWait1",
            TcpState::FinWait2 => "FinWait2",
            TcpState::CloseWait => "CloseWait",
            TcpState::Closing => "Closing",
            TcpState::LastAck => "LastAck",
            TcpState::TimeWait => "TimeWait",
        }
    }
}

struct TcpConn {
    state: TcpState,
    fd_refs: u32,
    local_port: u16,
    remote_ip: Ipv4Address,
    remote_port: u16,

    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    rcv_nxt: u32,
    iss: u32,
    mss: usize,
    /// A SYN or FIN of ours is consuming sequence space.
    phantom_in_flight: bool,
    /// Peer's FIN arrived; readers drain whatever is left then see EOF.
    peer_closed: bool,

    rx: [u8; RX_BUF_SIZE],
    rx_head: usize,
    rx_count: usize,

    /// Unacknowledged outbound bytes, snd_una..snd_nxt.
    txb: [u8; TX_BUF_SIZE],
    tx_count: usize,

    rto_ms: u64,
    rtx_deadline_ms: u64,
    rtx_count: u8,
    time_wait_ms: u64,

    read_waiters: [usize; MAX_WAITERS],
    read_waiter_count: usize,
    write_waiters: [usize; MAX_WAITERS],
    write_waiter_count: usize,
    connect_waiters: [usize; MAX_WAITERS],
    connect_waiter_count: usize,
    accept_waiters: [usize; MAX_WAITERS],
    accept_waiter_count: usize,

    /// Listener that spawned this connection, if any.
    parent: i16,
    /// Set once a listen-read handed this child to userspace.
    accepted: bool,
}

impl TcpConn {
    const fn new() -> Self {
        Self {
            state: TcpState::Closed,
            fd_refs: 0,
            local_port: 0,
            remote_ip: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            rcv_nxt: 0,
            iss: 0,
            mss: MSS,
            phantom_in_flight: false,
            peer_closed: false,
            rx: [0; RX_BUF_SIZE],
            rx_head: 0,
            rx_count: 0,
            txb: [0; TX_BUF_SIZE],
            tx_count: 0,
            rto_ms: INITIAL_RTO_MS,
            rtx_deadline_ms: 0,
            rtx_count: 0,
            time_wait_ms: 0,
            read_waiters: [0; MAX_WAITERS],
            read_waiter_count: 0,
            write_waiters: [0; MAX_WAITERS],
            write_waiter_count: 0,
            connect_waiters: [0; MAX_WAITERS],
            connect_waiter_count: 0,
            accept_waiters: [0; MAX_WAITERS],
            accept_waiter_count: 0,
            parent: -1,
            accepted: false,
        }
    }

    fn window(&self) -> u16 {
        (RX_BUF_SIZE - self.rx_count) as u16
    }

    fn rx_push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(RX_BUF_SIZE - self.rx_count);
        for &b in &data[..n] {
            let at = (self.rx_head + self.rx_count) % RX_BUF_SIZE;
            self.rx[at] = b;
            self.rx_count += 1;
        }
        n
    }

    fn rx_pop(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.rx_count);
        for b in out[..n].iter_mut() {
            *b = self.rx[self.rx_head];
            self.rx_head = (self.rx_head + 1) % RX_BUF_SIZE;
            self.rx_count -= 1;
        }
        n
    }

    fn outstanding(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }
}

struct TcpAlloc {
    in_use: [bool; MAX_CONNS],
    /// Demux keys mirrored here so chains walk without conn locks.
    keys: [(u16, u16, [u8; 4]); MAX_CONNS],
    hash_head: [i16; HASH_BUCKETS],
    hash_next: [i16; MAX_CONNS],
    /// Listener ports mirrored for the linear fallback scan.
    listen_port: [u16; MAX_CONNS],
}

static ALLOC: Mutex<TcpAlloc> = Mutex::new(TcpAlloc {
    in_use: [false; MAX_CONNS],
    keys: [(0, 0, [0; 4]); MAX_CONNS],
    hash_head: [-1; HASH_BUCKETS],
    hash_next: [-1; MAX_CONNS],
    listen_port: [0; MAX_CONNS],
});

static CONNS: [Mutex<TcpConn>; MAX_CONNS] = {
    const INIT: Mutex<TcpConn> = Mutex::new(TcpConn::new());
    [INIT; MAX_CONNS]
};

/// FNV-1a over the demux key.
fn hash_key(local_port: u16, remote_port: u16, remote_ip: [u8; 4]) -> usize {
    let mut h: u32 = 0x811C_9DC5;
    let mut eat = |b: u8| {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    };
    eat(local_port as u8);
    eat((local_port >> 8) as u8);
    eat(remote_port as u8);
    eat((remote_port >> 8) as u8);
    for b in remote_ip {
        eat(b);
    }
    (h as usize) % HASH_BUCKETS
}

fn hash_insert(alloc: &mut TcpAlloc, idx: usize) {
    let (lp, rp, rip) = alloc.keys[idx];
    let bucket = hash_key(lp, rp, rip);
    alloc.hash_next[idx] = alloc.hash_head[bucket];
    alloc.hash_head[bucket] = idx as i16;
}

fn hash_remove(alloc: &mut TcpAlloc, idx: usize) {
    let (lp, rp, rip) = alloc.keys[idx];
    let bucket = hash_key(lp, rp, rip);
    let mut cur = alloc.hash_head[bucket];
    if cur == idx as i16 {
        alloc.hash_head[bucket] = alloc.hash_next[idx];
        alloc.hash_next[idx] = -1;
        return;
    }
    while cur >= 0 {
        let next = alloc.hash_next[cur as usize];
        if next == idx as i16 {
            alloc.hash_next[cur as usize] = alloc.hash_next[idx];
            alloc.hash_next[idx] = -1;
            return;
        }
        cur = next;
    }
}

fn hash_lookup(alloc: &TcpAlloc, local_port: u16, remote_port: u16, remote_ip: [u8; 4]) -> Option<usize> {
    let bucket = hash_key(local_port, remote_port, remote_ip);
    let mut cur = alloc.hash_head[bucket];
    while cur >= 0 {
        let idx = cur as usize;
        if alloc.in_use[idx] && alloc.keys[idx] == (local_port, remote_port, remote_ip) {
            return Some(idx);
        }
        cur = alloc.hash_next[idx];
    }
    None
}

fn generate_isn() -> u32 {
    (crate::logger::boot_time_us() as u32) ^ 0x1357_9BDF
}

// ---------------------------------------------------------------------------
// Segment emission
// ---------------------------------------------------------------------------

/// RFC 1071 checksum over pseudo-header + segment.
pub fn tcp_checksum(src: &[u8; 4], dst: &[u8; 4], segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(src);
    pseudo[4..8].copy_from_slice(dst);
    pseudo[9] = PROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let mut sum = 0u32;
    for chunk in pseudo.chunks(2) {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    let mut i = 0;
    while i < segment.len() {
        let hi = segment[i];
        let lo = if i + 1 < segment.len() { segment[i + 1] } else { 0 };
        sum = sum.wrapping_add(u16::from_be_bytes([hi, lo]) as u32);
        i += 2;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Build and stage one segment. `seq` is explicit so retransmission can
/// replay from `snd_una`.
fn emit_segment(
    conn: &TcpConn,
    seq: u32,
    flags: u8,
    payload: &[u8],
    tx: &mut TxBatch,
) -> Result<(), NetError> {
    let mut segment = [0u8; TCP_HEADER_LEN + MSS];
    let total = TCP_HEADER_LEN + payload.len();
    segment[0..2].copy_from_slice(&conn.local_port.to_be_bytes());
    segment[2..4].copy_from_slice(&conn.remote_port.to_be_bytes());
    segment[4..8].copy_from_slice(&seq.to_be_bytes());
    let ack = if flags & TCP_ACK != 0 { conn.rcv_nxt } else { 0 };
    segment[8..12].copy_from_slice(&ack.to_be_bytes());
    segment[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    segment[13] = flags;
    segment[14..16].copy_from_slice(&conn.window().to_be_bytes());
    segment[16..18].copy_from_slice(&[0, 0]);
    segment[18..20].copy_from_slice(&[0, 0]);
    segment[TCP_HEADER_LEN..total].copy_from_slice(payload);

    let sum = tcp_checksum(
        super::local_ip().as_bytes(),
        conn.remote_ip.as_bytes(),
        &segment[..total],
    );
    segment[16..18].copy_from_slice(&sum.to_be_bytes());

    super::send_ipv4(conn.remote_ip, PROTO_TCP, &segment[..total], tx)
}

/// Stand-alone RST for a segment that matched nothing.
fn emit_rst(local_port: u16, remote_ip: Ipv4Address, remote_port: u16, seq: u32, ack: u32, tx: &mut TxBatch) {
    let mut segment = [0u8; TCP_HEADER_LEN];
    segment[0..2].copy_from_slice(&local_port.to_be_bytes());
    segment[2..4].copy_from_slice(&remote_port.to_be_bytes());
    segment[4..8].copy_from_slice(&seq.to_be_bytes());
    segment[8..12].copy_from_slice(&ack.to_be_bytes());
    segment[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    segment[13] = TCP_RST | TCP_ACK;
    let sum = tcp_checksum(
        super::local_ip().as_bytes(),
        remote_ip.as_bytes(),
        &segment,
    );
    segment[16..18].copy_from_slice(&sum.to_be_bytes());
    let _ = super::send_ipv4(remote_ip, PROTO_TCP, &segment, tx);
}

fn arm_retransmit(conn: &mut TcpConn, now: u64) {
    if conn.rtx_deadline_ms == 0 {
        conn.rtx_deadline_ms = now + conn.rto_ms;
    }
}

// ---------------------------------------------------------------------------
// Allocation and userspace operations
// ---------------------------------------------------------------------------

/// Claim a free slot (the `/net/tcp/clone` open). Holds conn then alloc.
pub fn alloc() -> Option<usize> {
    for idx in 0..MAX_CONNS {
        let mut conn = CONNS[idx].lock();
        let mut alloc = ALLOC.lock();
        if !alloc.in_use[idx] {
            alloc.in_use[idx] = true;
            alloc.keys[idx] = (0, 0, [0; 4]);
            alloc.listen_port[idx] = 0;
            *conn = TcpConn::new();
            conn.fd_refs = 1;
            return Some(idx);
        }
    }
    None
}

pub fn retain(idx: usize) {
    CONNS[idx].lock().fd_refs += 1;
}

/// Drop an fd reference; the last one initiates close.
pub fn release(idx: usize, tx: &mut TxBatch) {
    let mut conn = CONNS[idx].lock();
    conn.fd_refs = conn.fd_refs.saturating_sub(1);
    if conn.fd_refs == 0 {
        close_locked(idx, &mut conn, tx);
    }
}

pub fn is_live(idx: usize) -> bool {
    idx < MAX_CONNS && ALLOC.lock().in_use[idx]
}

fn free_slot(idx: usize, conn: &mut TcpConn) {
    let mut alloc = ALLOC.lock();
    hash_remove(&mut alloc, idx);
    alloc.in_use[idx] = false;
    alloc.listen_port[idx] = 0;
    *conn = TcpConn::new();
}

fn fail_waiters(conn: &mut TcpConn, ret: u64) {
    for i in 0..conn.read_waiter_count {
        scheduler::complete_and_wake(conn.read_waiters[i], ret);
    }
    conn.read_waiter_count = 0;
    for i in 0..conn.write_waiter_count {
        scheduler::complete_and_wake(conn.write_waiters[i], ret);
    }
    conn.write_waiter_count = 0;
    for i in 0..conn.connect_waiter_count {
        scheduler::complete_and_wake(conn.connect_waiters[i], ret);
    }
    conn.connect_waiter_count = 0;
    for i in 0..conn.accept_waiter_count {
        scheduler::complete_and_wake(conn.accept_waiters[i], ret);
    }
    conn.accept_waiter_count = 0;
}

/// Active open: `connect IP!PORT` written to the ctl file. The caller
/// blocks until ESTABLISHED or reset.
pub fn connect(idx: usize, remote_ip: Ipv4Address, remote_port: u16, tx: &mut TxBatch) -> Result<(), NetError> {
    let mut conn = CONNS[idx].lock();
    if conn.state != TcpState::Closed {
        return Err(NetError::InvalidState);
    }
    conn.local_port = ephemeral_port();
    conn.remote_ip = remote_ip;
    conn.remote_port = remote_port;
    conn.iss = generate_isn();
    conn.snd_una = conn.iss;
    conn.snd_nxt = conn.iss.wrapping_add(1);
    conn.phantom_in_flight = true;
    conn.state = TcpState::SynSent;

    {
        let mut alloc = ALLOC.lock();
        alloc.keys[idx] = (conn.local_port, remote_port, remote_ip.0);
        hash_insert(&mut alloc, idx);
    }

    let now = crate::logger::boot_time_ms();
    emit_segment(&conn, conn.iss, TCP_SYN, &[], tx)?;
    arm_retransmit(&mut conn, now);
    Ok(())
}

static NEXT_PORT: Mutex<u16> = Mutex::new(50000);

fn ephemeral_port() -> u16 {
    let mut port = NEXT_PORT.lock();
    let out = *port;
    *port = if *port >= 65500 { 50000 } else { *port + 1 };
    out
}

/// Passive open: `announce *!PORT`.
pub fn announce(idx: usize, port: u16) -> Result<(), NetError> {
    let mut conn = CONNS[idx].lock();
    if conn.state != TcpState::Closed {
        return Err(NetError::InvalidState);
    }
    conn.local_port = port;
    conn.state = TcpState::Listen;
    ALLOC.lock().listen_port[idx] = port;
    Ok(())
}

/// Register the caller as a connect waiter (the ctl write blocks on the
/// handshake). Returns false when the connection is already up.
pub fn add_connect_waiter(idx: usize, slot: usize) -> bool {
    let mut conn = CONNS[idx].lock();
    if conn.state == TcpState::Established {
        return false; // already connected, no need to block
    }
    if conn.connect_waiter_count >= MAX_WAITERS {
        return false;
    }
    let at = conn.connect_waiter_count;
    conn.connect_waiters[at] = slot;
    conn.connect_waiter_count += 1;
    scheduler::block_current(crate::process::PendingOp::TcpConnect);
    true
}

pub enum ReadOutcome {
    Done(u64),
    Blocked,
}

/// Data-file read: drain the receive ring, or block until bytes arrive,
/// EOF, or reset. Emits a window-update ACK when the drain reopens a
/// window that had shrunk below one MSS.
pub fn read(idx: usize, pml4: u64, buf: u64, len: usize, caller_slot: usize, tx: &mut TxBatch) -> ReadOutcome {
    let mut conn = CONNS[idx].lock();
    match conn.state {
        TcpState::Closed => return ReadOutcome::Done(abi::err(errno::ECONNRESET)),
        TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => {
            return ReadOutcome::Done(abi::err(errno::EINVAL))
        }
        _ => {}
    }

    if conn.rx_count > 0 {
        let tight_before = (conn.window() as usize) < conn.mss;
        let mut tmp = [0u8; 1024];
        let mut copied = 0usize;
        while copied < len {
            let n = {
                let want = (len - copied).min(tmp.len());
                conn.rx_pop(&mut tmp[..want])
            };
            if n == 0 {
                break;
            }
            if paging::copy_to_address_space(pml4, buf + copied as u64, &tmp[..n]).is_err() {
                return ReadOutcome::Done(abi::err(errno::EFAULT));
            }
            copied += n;
        }
        if tight_before && (conn.window() as usize) >= conn.mss {
            let _ = emit_segment(&conn, conn.snd_nxt, TCP_ACK, &[], tx);
        }
        return ReadOutcome::Done(copied as u64);
    }

    if conn.peer_closed {
        return ReadOutcome::Done(0); // EOF
    }
    if conn.read_waiter_count >= MAX_WAITERS {
        return ReadOutcome::Done(abi::err(errno::EAGAIN));
    }
    let at = conn.read_waiter_count;
    conn.read_waiters[at] = caller_slot;
    conn.read_waiter_count += 1;
    scheduler::set_pending_dest(caller_slot, idx, buf, len);
    scheduler::block_current(crate::process::PendingOp::NetRead);
    ReadOutcome::Blocked
}

/// Staged transmit bytes not yet put on the wire: everything in `txb`
/// past the sent-but-unacknowledged prefix.
fn unsent_bytes(conn: &TcpConn) -> usize {
    let outstanding_data = (conn.outstanding() as usize)
        .saturating_sub(if conn.phantom_in_flight { 1 } else { 0 });
    conn.tx_count.saturating_sub(outstanding_data)
}

/// Drain staged bytes onto the wire in segments of at most MSS while
/// the peer's window has room. Runs at write time, on every ACK, and
/// from the poll tick, so a write larger than one MSS keeps moving
/// without further userspace activity.
fn send_pending(conn: &mut TcpConn, tx: &mut TxBatch) {
    if conn.state != TcpState::Established && conn.state != TcpState::CloseWait {
        return;
    }
    loop {
        let unsent = unsent_bytes(conn);
        if unsent == 0 {
            return;
        }
        let window_available = (conn.snd_una.wrapping_add(conn.snd_wnd as u32))
            .wrapping_sub(conn.snd_nxt) as usize;
        if window_available == 0 || window_available > i32::MAX as usize {
            // Zero (or overshot) window: the peer's next window-update
            // ACK re-enters here through process_ack.
            return;
        }
        let start = conn.tx_count - unsent;
        let chunk = unsent.min(conn.mss).min(window_available);
        let mut payload = [0u8; MSS];
        payload[..chunk].copy_from_slice(&conn.txb[start..start + chunk]);
        let seq = conn.snd_nxt;
        if emit_segment(conn, seq, TCP_ACK | TCP_PSH, &payload[..chunk], tx).is_err() {
            // Batch full; the next ACK or poll tick continues the drain.
            return;
        }
        conn.snd_nxt = conn.snd_nxt.wrapping_add(chunk as u32);
        let now = crate::logger::boot_time_ms();
        arm_retransmit(conn, now);
    }
}

/// Core of the send path, shared by the syscall edge and the blocked-
/// writer drain: copy from the user buffer into the transmit buffer up
/// to its free space, then drain what the window allows. Returns the
/// bytes accepted.
fn push_and_emit(conn: &mut TcpConn, pml4: u64, buf: u64, len: usize, tx: &mut TxBatch) -> Result<usize, NetError> {
    let space = TX_BUF_SIZE - conn.tx_count;
    let accepted = len.min(space);
    if accepted == 0 {
        return Ok(0);
    }
    let base = conn.tx_count;
    let mut staged = [0u8; TX_BUF_SIZE];
    paging::copy_from_address_space(pml4, buf, &mut staged[..accepted])
        .map_err(|_| NetError::Malformed)?;
    conn.txb[base..base + accepted].copy_from_slice(&staged[..accepted]);
    conn.tx_count += accepted;

    send_pending(conn, tx);
    Ok(accepted)
}

/// Data-file write. Zero free transmit space blocks the caller until
/// ACKs free some; the drain path then completes its write.
pub fn write(idx: usize, pml4: u64, buf: u64, len: usize, caller_slot: usize, tx: &mut TxBatch) -> ReadOutcome {
    let mut conn = CONNS[idx].lock();
    match conn.state {
        TcpState::Established | TcpState::CloseWait => {}
        TcpState::Closed => return ReadOutcome::Done(abi::err(errno::ECONNRESET)),
        _ => return ReadOutcome::Done(abi::err(errno::EINVAL)),
    }

    if TX_BUF_SIZE - conn.tx_count == 0 {
        if conn.write_waiter_count >= MAX_WAITERS {
            return ReadOutcome::Done(abi::err(errno::EAGAIN));
        }
        let at = conn.write_waiter_count;
        conn.write_waiters[at] = caller_slot;
        conn.write_waiter_count += 1;
        scheduler::set_pending_dest(caller_slot, idx, buf, len);
        scheduler::block_current(crate::process::PendingOp::NetWrite);
        return ReadOutcome::Blocked;
    }

    match push_and_emit(&mut conn, pml4, buf, len, tx) {
        Ok(n) => ReadOutcome::Done(n as u64),
        Err(_) => ReadOutcome::Done(abi::err(errno::EFAULT)),
    }
}

/// ACKs freed transmit space: complete parked writers.
fn service_write_waiters(conn: &mut TcpConn, tx: &mut TxBatch) {
    if conn.state != TcpState::Established && conn.state != TcpState::CloseWait {
        return;
    }
    while conn.tx_count < TX_BUF_SIZE && conn.write_waiter_count > 0 {
        let slot = conn.write_waiters[0];
        conn.write_waiters.copy_within(1..conn.write_waiter_count, 0);
        conn.write_waiter_count -= 1;

        let (buf, len) = match table::get(slot) {
            Some(p) => (p.pending_buf, p.pending_len),
            None => continue,
        };
        let pml4 = table::pml4_of(slot);
        match push_and_emit(conn, pml4, buf, len, tx) {
            Ok(n) => scheduler::complete_and_wake(slot, n as u64),
            Err(_) => scheduler::complete_and_wake(slot, abi::err(errno::EFAULT)),
        }
    }
}

/// Listen-file read: hand out the next un-accepted ESTABLISHED child.
/// `Ok(Some(child))` is immediate; `Ok(None)` means the caller was
/// registered and must block.
pub fn accept(idx: usize, caller_slot: usize) -> Result<Option<usize>, NetError> {
    if let Some(child) = find_acceptable_child(idx) {
        CONNS[child].lock().accepted = true;
        return Ok(Some(child));
    }
    let mut conn = CONNS[idx].lock();
    if conn.state != TcpState::Listen {
        return Err(NetError::InvalidState);
    }
    if conn.accept_waiter_count >= MAX_WAITERS {
        return Err(NetError::NoSlot);
    }
    let at = conn.accept_waiter_count;
    conn.accept_waiters[at] = caller_slot;
    conn.accept_waiter_count += 1;
    scheduler::block_current(crate::process::PendingOp::TcpAccept);
    Ok(None)
}

fn find_acceptable_child(listener: usize) -> Option<usize> {
    for idx in 0..MAX_CONNS {
        if idx == listener {
            continue;
        }
        {
            let alloc = ALLOC.lock();
            if !alloc.in_use[idx] {
                continue;
            }
        }
        let conn = CONNS[idx].lock();
        if conn.parent == listener as i16 && conn.state == TcpState::Established && !conn.accepted
        {
            return Some(idx);
        }
    }
    None
}

/// User-initiated close per the state machine; abort states send RST.
pub fn close(idx: usize, tx: &mut TxBatch) {
    let mut conn = CONNS[idx].lock();
    close_locked(idx, &mut conn, tx);
}

fn close_locked(idx: usize, conn: &mut TcpConn, tx: &mut TxBatch) {
    match conn.state {
        TcpState::Closed => {
            free_slot(idx, conn);
        }
        TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => {
            if conn.state != TcpState::Listen {
                emit_rst(
                    conn.local_port,
                    conn.remote_ip,
                    conn.remote_port,
                    conn.snd_nxt,
                    conn.rcv_nxt,
                    tx,
                );
            }
            fail_waiters(conn, abi::err(errno::ECONNRESET));
            free_slot(idx, conn);
        }
        TcpState::Established => {
            let seq = conn.snd_nxt;
            let _ = emit_segment(conn, seq, TCP_FIN | TCP_ACK, &[], tx);
            conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
            conn.phantom_in_flight = true;
            conn.state = TcpState::FinWait1;
            let now = crate::logger::boot_time_ms();
            arm_retransmit(conn, now);
        }
        TcpState::CloseWait => {
            let seq = conn.snd_nxt;
            let _ = emit_segment(conn, seq, TCP_FIN | TCP_ACK, &[], tx);
            conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
            conn.phantom_in_flight = true;
            conn.state = TcpState::LastAck;
            let now = crate::logger::boot_time_ms();
            arm_retransmit(conn, now);
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Inbound path
// ---------------------------------------------------------------------------

struct Segment<'a> {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &'a [u8],
}

fn parse_segment<'a>(src: Ipv4Address, data: &'a [u8]) -> Option<Segment<'a>> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }
    if tcp_checksum(src.as_bytes(), super::local_ip().as_bytes(), data) != 0 {
        return None;
    }
    let offset = ((data[12] >> 4) * 4) as usize;
    if offset < TCP_HEADER_LEN || offset > data.len() {
        return None;
    }
    Some(Segment {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: data[13],
        window: u16::from_be_bytes([data[14], data[15]]),
        payload: &data[offset..],
    })
}

/// Demux and process one inbound segment.
pub fn handle_segment(src: Ipv4Address, data: &[u8], tx: &mut TxBatch) {
    let Some(seg) = parse_segment(src, data) else {
        return;
    };

    // Hash lookup under the alloc lock, released before the conn lock.
    let hit = {
        let alloc = ALLOC.lock();
        hash_lookup(&alloc, seg.dst_port, seg.src_port, src.0)
    };

    if let Some(idx) = hit {
        let notify = {
            let mut conn = CONNS[idx].lock();
            process_segment(idx, &mut conn, src, &seg, tx)
        };
        // Accept notification locks the parent and the child; it must
        // run with the child's lock already dropped.
        if let Some(parent) = notify {
            notify_accept_waiters(parent, idx);
        }
        return;
    }

    // Listener fallback: linear scan of announced ports.
    let listener = {
        let alloc = ALLOC.lock();
        let mut found = None;
        for idx in 0..MAX_CONNS {
            if alloc.in_use[idx] && alloc.listen_port[idx] == seg.dst_port {
                found = Some(idx);
                break;
            }
        }
        found
    };

    if let Some(idx) = listener {
        if seg.flags & TCP_SYN != 0 && seg.flags & TCP_ACK == 0 {
            spawn_child(idx, src, &seg, tx);
        }
        return;
    }

    if seg.flags & TCP_RST == 0 {
        emit_rst(seg.dst_port, src, seg.src_port, seg.ack, seg.seq.wrapping_add(1), tx);
    }
}

/// A SYN hit a listener: allocate a child in SYN_RECEIVED, key it on the
/// remote 4-tuple, answer SYN+ACK, and remember the parent.
fn spawn_child(listener: usize, src: Ipv4Address, seg: &Segment<'_>, tx: &mut TxBatch) {
    let Some(child) = alloc() else {
        return;
    };
    let mut conn = CONNS[child].lock();
    conn.fd_refs = 0; // owned by the listener until accepted
    conn.local_port = seg.dst_port;
    conn.remote_ip = src;
    conn.remote_port = seg.src_port;
    conn.rcv_nxt = seg.seq.wrapping_add(1);
    conn.iss = generate_isn();
    conn.snd_una = conn.iss;
    conn.snd_nxt = conn.iss.wrapping_add(1);
    conn.snd_wnd = seg.window;
    conn.phantom_in_flight = true;
    conn.parent = listener as i16;
    conn.state = TcpState::SynReceived;

    {
        let mut alloc = ALLOC.lock();
        alloc.keys[child] = (conn.local_port, conn.remote_port, conn.remote_ip.0);
        hash_insert(&mut alloc, child);
        alloc.listen_port[child] = 0;
    }

    let iss = conn.iss;
    let _ = emit_segment(&conn, iss, TCP_SYN | TCP_ACK, &[], tx);
    let now = crate::logger::boot_time_ms();
    arm_retransmit(&mut conn, now);
}

fn process_ack(conn: &mut TcpConn, ack: u32, window: u16) {
    let in_flight = conn.outstanding();
    let acked = ack.wrapping_sub(conn.snd_una);
    if acked == 0 || acked > in_flight {
        return;
    }
    conn.snd_wnd = window;

    let mut data_acked = acked as usize;
    if conn.phantom_in_flight {
        // One sequence number belongs to our SYN/FIN, not the buffer.
        if ack == conn.snd_nxt {
            conn.phantom_in_flight = false;
            data_acked = data_acked.saturating_sub(1);
        }
    }
    let drop = data_acked.min(conn.tx_count);
    conn.txb.copy_within(drop..conn.tx_count, 0);
    conn.tx_count -= drop;
    conn.snd_una = ack;

    if conn.outstanding() == 0 {
        conn.rtx_deadline_ms = 0;
        conn.rto_ms = INITIAL_RTO_MS;
        conn.rtx_count = 0;
    }
}

/// Complete blocked readers with freshly arrived ring data.
fn service_read_waiters(conn: &mut TcpConn) {
    while conn.rx_count > 0 && conn.read_waiter_count > 0 {
        let slot = conn.read_waiters[0];
        conn.read_waiters.copy_within(1..conn.read_waiter_count, 0);
        conn.read_waiter_count -= 1;

        let (pml4, buf, len) = match table::get(slot) {
            Some(p) => (table::pml4_of(slot), p.pending_buf, p.pending_len),
            None => continue,
        };
        if len == 0 {
            // A parked writer: space may be free now, report it.
            let space = TX_BUF_SIZE - conn.tx_count;
            scheduler::complete_and_wake(slot, space.min(1) as u64);
            continue;
        }
        let mut tmp = [0u8; 1024];
        let mut copied = 0usize;
        while copied < len {
            let want = (len - copied).min(tmp.len());
            let n = conn.rx_pop(&mut tmp[..want]);
            if n == 0 {
                break;
            }
            if paging::copy_to_address_space(pml4, buf + copied as u64, &tmp[..n]).is_err() {
                copied = 0;
                break;
            }
            copied += n;
        }
        scheduler::complete_and_wake(slot, copied as u64);
    }

    if conn.peer_closed && conn.rx_count == 0 {
        for i in 0..conn.read_waiter_count {
            scheduler::complete_and_wake(conn.read_waiters[i], 0);
        }
        conn.read_waiter_count = 0;
    }
}

/// `ret` of 0 means success; the waiter's ctl write then reports its
/// own byte count (stashed in pending_len when it parked).
fn wake_connect_waiters(conn: &mut TcpConn, ret: u64) {
    for i in 0..conn.connect_waiter_count {
        let slot = conn.connect_waiters[i];
        let value = if ret == 0 {
            table::get(slot).map(|p| p.pending_len as u64).unwrap_or(0)
        } else {
            ret
        };
        scheduler::complete_and_wake(slot, value);
    }
    conn.connect_waiter_count = 0;
}

/// Tell a listener's accept waiters about a newly established child.
fn notify_accept_waiters(listener: i16, child: usize) {
    if listener < 0 {
        return;
    }
    let mut parent = CONNS[listener as usize].lock();
    if parent.accept_waiter_count == 0 {
        return;
    }
    let slot = parent.accept_waiters[0];
    let count = parent.accept_waiter_count;
    parent.accept_waiters.copy_within(1..count, 0);
    parent.accept_waiter_count -= 1;
    drop(parent);

    CONNS[child].lock().accepted = true;

    // Listen reads return the child index as text.
    let (pml4, buf, len) = match table::get(slot) {
        Some(p) => (table::pml4_of(slot), p.pending_buf, p.pending_len),
        None => return,
    };
    let mut line = [0u8; 16];
    let n = super::netfs::format_index(&mut line, child);
    let take = n.min(len);
    if paging::copy_to_address_space(pml4, buf, &line[..take]).is_ok() {
        scheduler::complete_and_wake(slot, take as u64);
    } else {
        scheduler::complete_and_wake(slot, abi::err(errno::EFAULT));
    }
}

/// Returns the parent listener index when the segment just promoted a
/// child to ESTABLISHED, so the caller can notify accept waiters after
/// dropping the child's lock.
fn process_segment(
    idx: usize,
    conn: &mut TcpConn,
    _src: Ipv4Address,
    seg: &Segment<'_>,
    tx: &mut TxBatch,
) -> Option<i16> {
    if seg.flags & TCP_RST != 0 {
        fail_waiters(conn, abi::err(errno::ECONNRESET));
        free_slot(idx, conn);
        return None;
    }

    match conn.state {
        TcpState::SynSent => {
            if seg.flags & (TCP_SYN | TCP_ACK) == (TCP_SYN | TCP_ACK) && seg.ack == conn.snd_nxt {
                conn.rcv_nxt = seg.seq.wrapping_add(1);
                conn.snd_una = seg.ack;
                conn.snd_wnd = seg.window;
                conn.phantom_in_flight = false;
                conn.rtx_deadline_ms = 0;
                conn.rtx_count = 0;
                conn.state = TcpState::Established;
                let snd_nxt = conn.snd_nxt;
                let _ = emit_segment(conn, snd_nxt, TCP_ACK, &[], tx);
                wake_connect_waiters(conn, 0);
            }
        }
        TcpState::SynReceived => {
            if seg.flags & TCP_ACK != 0 && seg.ack == conn.snd_nxt {
                conn.snd_una = seg.ack;
                conn.snd_wnd = seg.window;
                conn.phantom_in_flight = false;
                conn.rtx_deadline_ms = 0;
                conn.rtx_count = 0;
                conn.state = TcpState::Established;
                return Some(conn.parent);
            }
        }
        TcpState::Established
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::CloseWait
        | TcpState::Closing
        | TcpState::LastAck => {
            if seg.flags & TCP_ACK != 0 {
                process_ack(conn, seg.ack, seg.window);
                // ACK clocking: staged bytes first, then parked writers
                // into whatever buffer space the ACK freed.
                send_pending(conn, tx);
                service_write_waiters(conn, tx);
            }

            if !seg.payload.is_empty() {
                if seg.seq == conn.rcv_nxt {
                    let n = conn.rx_push(seg.payload);
                    conn.rcv_nxt = conn.rcv_nxt.wrapping_add(n as u32);
                    let snd_nxt = conn.snd_nxt;
                    let _ = emit_segment(conn, snd_nxt, TCP_ACK, &[], tx);
                    service_read_waiters(conn);
                } else {
                    // Out of order: drop but still send a duplicate ACK.
                    let snd_nxt = conn.snd_nxt;
                    let _ = emit_segment(conn, snd_nxt, TCP_ACK, &[], tx);
                }
            }

            if seg.flags & TCP_FIN != 0 && seg.seq.wrapping_add(seg.payload.len() as u32) == conn.rcv_nxt {
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
                conn.peer_closed = true;
                let snd_nxt = conn.snd_nxt;
                let _ = emit_segment(conn, snd_nxt, TCP_ACK, &[], tx);
                service_read_waiters(conn);
                match conn.state {
                    TcpState::Established => conn.state = TcpState::CloseWait,
                    TcpState::FinWait1 => {
                        conn.state = if conn.outstanding() == 0 {
                            conn.time_wait_ms = crate::logger::boot_time_ms();
                            TcpState::TimeWait
                        } else {
                            TcpState::Closing
                        };
                    }
                    TcpState::FinWait2 => {
                        conn.time_wait_ms = crate::logger::boot_time_ms();
                        conn.state = TcpState::TimeWait;
                    }
                    _ => {}
                }
            }

            // Our FIN fully acknowledged?
            if conn.outstanding() == 0 {
                match conn.state {
                    TcpState::FinWait1 => conn.state = TcpState::FinWait2,
                    TcpState::Closing => {
                        conn.time_wait_ms = crate::logger::boot_time_ms();
                        conn.state = TcpState::TimeWait;
                    }
                    TcpState::LastAck => {
                        free_slot(idx, conn);
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    None
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Retransmission and TIME_WAIT processing; called from the idle loop.
pub fn poll(now_ms: u64, tx: &mut TxBatch) {
    for idx in 0..MAX_CONNS {
        {
            let alloc = ALLOC.lock();
            if !alloc.in_use[idx] {
                continue;
            }
        }
        let mut conn = CONNS[idx].lock();

        if conn.state == TcpState::TimeWait {
            if now_ms.saturating_sub(conn.time_wait_ms) >= TIME_WAIT_MS {
                free_slot(idx, &mut conn);
            }
            continue;
        }

        // Keep draining staged bytes every tick; a fully-ACKed first
        // segment clears the retransmit timer but must not strand the
        // rest of the buffer.
        if unsent_bytes(&conn) > 0 {
            send_pending(&mut conn, tx);
        }

        if conn.rtx_deadline_ms == 0 || now_ms < conn.rtx_deadline_ms {
            continue;
        }

        if conn.rtx_count >= MAX_RETRANSMIT {
            // Retry budget exhausted: unwind with ECONNRESET.
            fail_waiters(&mut conn, abi::err(errno::ECONNRESET));
            free_slot(idx, &mut conn);
            continue;
        }

        conn.rtx_count += 1;
        conn.rto_ms *= 2;
        conn.rtx_deadline_ms = now_ms + conn.rto_ms;

        match conn.state {
            TcpState::SynSent => {
                let iss = conn.iss;
                let _ = emit_segment(&conn, iss, TCP_SYN, &[], tx);
            }
            TcpState::SynReceived => {
                let iss = conn.iss;
                let _ = emit_segment(&conn, iss, TCP_SYN | TCP_ACK, &[], tx);
            }
            TcpState::FinWait1 | TcpState::LastAck | TcpState::Closing => {
                let seq = conn.snd_nxt.wrapping_sub(1);
                let _ = emit_segment(&conn, seq, TCP_FIN | TCP_ACK, &[], tx);
            }
            _ => {
                // Replay the oldest unacknowledged data chunk.
                let chunk = conn.tx_count.min(conn.mss);
                if chunk > 0 {
                    let mut payload = [0u8; MSS];
                    payload[..chunk].copy_from_slice(&conn.txb[..chunk]);
                    let seq = conn.snd_una;
                    let _ = emit_segment(&conn, seq, TCP_ACK | TCP_PSH, &payload[..chunk], tx);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Introspection for netfs
// ---------------------------------------------------------------------------

pub fn state_name(idx: usize) -> &'static str {
    CONNS[idx].lock().state.name()
}

pub fn local_endpoint(idx: usize) -> (Ipv4Address, u16) {
    let conn = CONNS[idx].lock();
    (super::local_ip(), conn.local_port)
}

pub fn remote_endpoint(idx: usize) -> (Ipv4Address, u16) {
    let conn = CONNS[idx].lock();
    (conn.remote_ip, conn.remote_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_verifies_to_zero_on_generated_segment() {
        let src = [10, 0, 0, 1];
        let dst = [10, 0, 0, 2];
        let mut segment = [0u8; 28];
        segment[0..2].copy_from_slice(&1234u16.to_be_bytes());
        segment[2..4].copy_from_slice(&80u16.to_be_bytes());
        segment[12] = 5 << 4;
        segment[13] = TCP_ACK;
        let sum = tcp_checksum(&src, &dst, &segment);
        segment[16..18].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(tcp_checksum(&src, &dst, &segment), 0);
    }

    #[test]
    fn hash_distributes_and_matches_exact_key() {
        let a = hash_key(80, 50000, [10, 0, 0, 2]);
        let b = hash_key(80, 50001, [10, 0, 0, 2]);
        assert!(a < HASH_BUCKETS && b < HASH_BUCKETS);
        // Different remote ports should not be forced into one bucket.
        let mut alloc = TcpAlloc {
            in_use: [false; MAX_CONNS],
            keys: [(0, 0, [0; 4]); MAX_CONNS],
            hash_head: [-1; HASH_BUCKETS],
            hash_next: [-1; MAX_CONNS],
            listen_port: [0; MAX_CONNS],
        };
        alloc.in_use[3] = true;
        alloc.keys[3] = (80, 50000, [10, 0, 0, 2]);
        hash_insert(&mut alloc, 3);
        assert_eq!(hash_lookup(&alloc, 80, 50000, [10, 0, 0, 2]), Some(3));
        assert_eq!(hash_lookup(&alloc, 80, 50001, [10, 0, 0, 2]), None);
        hash_remove(&mut alloc, 3);
        assert_eq!(hash_lookup(&alloc, 80, 50000, [10, 0, 0, 2]), None);
    }

    #[test]
    fn hash_chain_survives_middle_removal() {
        let mut alloc = TcpAlloc {
            in_use: [false; MAX_CONNS],
            keys: [(0, 0, [0; 4]); MAX_CONNS],
            hash_head: [-1; HASH_BUCKETS],
            hash_next: [-1; MAX_CONNS],
            listen_port: [0; MAX_CONNS],
        };
        // Force three entries into one bucket by reusing the key, then
        // differentiate via in_use keys match (same key chains anyway).
        for idx in [1usize, 2, 3] {
            alloc.in_use[idx] = true;
            alloc.keys[idx] = (80, 1000 + idx as u16, [10, 0, 0, 2]);
            // Same bucket regardless of natural hash: rewrite heads.
        }
        // Insert into whatever buckets they hash to.
        hash_insert(&mut alloc, 1);
        hash_insert(&mut alloc, 2);
        hash_insert(&mut alloc, 3);
        hash_remove(&mut alloc, 2);
        assert_eq!(hash_lookup(&alloc, 80, 1001, [10, 0, 0, 2]), Some(1));
        assert_eq!(hash_lookup(&alloc, 80, 1002, [10, 0, 0, 2]), None);
        assert_eq!(hash_lookup(&alloc, 80, 1003, [10, 0, 0, 2]), Some(3));
    }

    #[test]
    fn state_names_match_status_file_format() {
        assert_eq!(TcpState::Established.name(), "Established");
        assert_eq!(TcpState::TimeWait.name(), "TimeWait");
        assert_eq!(TcpState::SynReceived.name(), "SynReceived");
    }
}
