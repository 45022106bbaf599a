//! UDP
//!
//! Connectionless slots with a single-datagram receive buffer: a burst
//! overwrites an undrained datagram, which is acceptable for the
//! low-rate control traffic UDP carries here. Allocation picks an
//! ephemeral local port from 49152; `bind` fixes it; `connect` filters
//! inbound traffic to one remote endpoint and gives writes a default
//! destination.

use core::sync::atomic::{AtomicU16, Ordering};
use spin::Mutex;

use super::ipv4::{self, Ipv4Address, PROTO_UDP};
use super::{NetError, TxBatch};
use crate::mm::paging;
use crate::process::table;
use crate::scheduler;

pub const MAX_SOCKETS: usize = 16;
const MAX_WAITERS: usize = 4;

/// UDP header size.
pub const HEADER_LEN: usize = 8;

/// Largest datagram payload we carry.
pub const MAX_DATAGRAM: usize = super::MAX_FRAME_SIZE - 14 - ipv4::HEADER_LEN - HEADER_LEN;

static NEXT_EPHEMERAL: AtomicU16 = AtomicU16::new(49152);

#[derive(Clone, Copy)]
struct UdpSocket {
    in_use: bool,
    fd_refs: u32,
    /// Kernel-owned sockets (DNS) bypass the rx buffer into a callback.
    kernel_owned: bool,
    local_port: u16,
    remote: Ipv4Address,
    remote_port: u16,
    connected: bool,
    rx: [u8; MAX_DATAGRAM],
    rx_len: usize,
    rx_from: Ipv4Address,
    rx_from_port: u16,
    rx_full: bool,
    waiters: [usize; MAX_WAITERS],
    waiter_count: usize,
}

impl UdpSocket {
    const fn new() -> Self {
        Self {
            in_use: false,
            fd_refs: 0,
            kernel_owned: false,
            local_port: 0,
            remote: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
            connected: false,
            rx: [0; MAX_DATAGRAM],
            rx_len: 0,
            rx_from: Ipv4Address::UNSPECIFIED,
            rx_from_port: 0,
            rx_full: false,
            waiters: [0; MAX_WAITERS],
            waiter_count: 0,
        }
    }
}

static SOCKETS: Mutex<[UdpSocket; MAX_SOCKETS]> = Mutex::new([UdpSocket::new(); MAX_SOCKETS]);

fn ephemeral_port() -> u16 {
    let port = NEXT_EPHEMERAL.fetch_add(1, Ordering::Relaxed);
    if port == 0 || port < 49152 {
        NEXT_EPHEMERAL.store(49153, Ordering::Relaxed);
        return 49152;
    }
    port
}

pub fn alloc() -> Option<usize> {
    let mut sockets = SOCKETS.lock();
    for (idx, s) in sockets.iter_mut().enumerate() {
        if !s.in_use {
            *s = UdpSocket::new();
            s.in_use = true;
            s.fd_refs = 1;
            s.local_port = ephemeral_port();
            return Some(idx);
        }
    }
    None
}

pub fn retain(idx: usize) {
    SOCKETS.lock()[idx].fd_refs += 1;
}

pub fn release(idx: usize) {
    let mut sockets = SOCKETS.lock();
    let s = &mut sockets[idx];
    s.fd_refs = s.fd_refs.saturating_sub(1);
    if s.fd_refs == 0 && !s.kernel_owned {
        *s = UdpSocket::new();
    }
}

pub fn is_live(idx: usize) -> bool {
    idx < MAX_SOCKETS && SOCKETS.lock()[idx].in_use
}

pub fn bind(idx: usize, port: u16) -> Result<(), NetError> {
    let mut sockets = SOCKETS.lock();
    let s = &mut sockets[idx];
    if !s.in_use {
        return Err(NetError::InvalidState);
    }
    s.local_port = port;
    Ok(())
}

pub fn connect(idx: usize, remote: Ipv4Address, port: u16) -> Result<(), NetError> {
    let mut sockets = SOCKETS.lock();
    let s = &mut sockets[idx];
    if !s.in_use {
        return Err(NetError::InvalidState);
    }
    s.remote = remote;
    s.remote_port = port;
    s.connected = true;
    Ok(())
}

/// Claim a socket for in-kernel use (DNS): fixed local port, responses
/// routed to the owner's handler instead of the rx buffer.
pub fn alloc_kernel(port: u16) -> Option<usize> {
    let idx = alloc()?;
    let mut sockets = SOCKETS.lock();
    sockets[idx].kernel_owned = true;
    sockets[idx].local_port = port;
    Some(idx)
}

pub fn endpoints(idx: usize) -> Option<(u16, Option<(Ipv4Address, u16)>)> {
    let sockets = SOCKETS.lock();
    let s = &sockets[idx];
    if !s.in_use {
        return None;
    }
    let remote = if s.connected {
        Some((s.remote, s.remote_port))
    } else {
        None
    };
    Some((s.local_port, remote))
}

fn udp_checksum(src: Ipv4Address, dst: Ipv4Address, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.0);
    pseudo[4..8].copy_from_slice(&dst.0);
    pseudo[9] = PROTO_UDP;
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
    let folded = !sum as u16;
    // All-zero means "no checksum" on the wire; transmit the complement.
    if folded == 0 {
        0xFFFF
    } else {
        folded
    }
}

/// Send one datagram from `idx` to an explicit destination.
pub fn send_to(
    idx: usize,
    dst: Ipv4Address,
    dst_port: u16,
    payload: &[u8],
    tx: &mut TxBatch,
) -> Result<usize, NetError> {
    if payload.len() > MAX_DATAGRAM {
        return Err(NetError::BufferTooSmall);
    }
    let local_port = {
        let sockets = SOCKETS.lock();
        let s = &sockets[idx];
        if !s.in_use {
            return Err(NetError::InvalidState);
        }
        s.local_port
    };

    let mut segment = [0u8; HEADER_LEN + MAX_DATAGRAM];
    let total = HEADER_LEN + payload.len();
    segment[0..2].copy_from_slice(&local_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[4..6].copy_from_slice(&(total as u16).to_be_bytes());
    segment[6..8].copy_from_slice(&[0, 0]);
    segment[HEADER_LEN..total].copy_from_slice(payload);
    let sum = udp_checksum(super::local_ip(), dst, &segment[..total]);
    segment[6..8].copy_from_slice(&sum.to_be_bytes());

    super::send_ipv4(dst, PROTO_UDP, &segment[..total], tx)?;
    Ok(payload.len())
}

/// Send on a connected socket.
pub fn send(idx: usize, payload: &[u8], tx: &mut TxBatch) -> Result<usize, NetError> {
    let (dst, port) = {
        let sockets = SOCKETS.lock();
        let s = &sockets[idx];
        if !s.in_use || !s.connected {
            return Err(NetError::InvalidState);
        }
        (s.remote, s.remote_port)
    };
    send_to(idx, dst, port, payload, tx)
}

/// Outcome of a data-file read.
pub enum ReadOutcome {
    Done(usize),
    Blocked,
    Error(NetError),
}

/// Read the buffered datagram, or block until one arrives.
pub fn recv(idx: usize, pml4: u64, buf: u64, len: usize, caller_slot: usize) -> ReadOutcome {
    let mut sockets = SOCKETS.lock();
    let s = &mut sockets[idx];
    if !s.in_use {
        return ReadOutcome::Error(NetError::InvalidState);
    }
    if s.rx_full {
        let n = s.rx_len.min(len);
        let data: [u8; MAX_DATAGRAM] = s.rx;
        s.rx_full = false;
        s.rx_len = 0;
        if paging::copy_to_address_space(pml4, buf, &data[..n]).is_err() {
            return ReadOutcome::Error(NetError::Malformed);
        }
        return ReadOutcome::Done(n);
    }
    if s.waiter_count >= MAX_WAITERS {
        return ReadOutcome::Error(NetError::NoSlot);
    }
    s.waiters[s.waiter_count] = caller_slot;
    s.waiter_count += 1;
    scheduler::set_pending_dest(caller_slot, idx, buf, len);
    scheduler::block_current(crate::process::PendingOp::NetRead);
    ReadOutcome::Blocked
}

/// Inbound datagram: deliver to the first matching bound slot.
pub fn handle_packet(src: Ipv4Address, dst: Ipv4Address, payload: &[u8], _tx: &mut TxBatch) {
    if payload.len() < HEADER_LEN {
        return;
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let length = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    if length < HEADER_LEN || length > payload.len() {
        return;
    }
    let wire_sum = u16::from_be_bytes([payload[6], payload[7]]);
    if wire_sum != 0 {
        let mut sum_input = [0u8; HEADER_LEN + MAX_DATAGRAM];
        sum_input[..length].copy_from_slice(&payload[..length]);
        if udp_checksum_verify(src, dst, &sum_input[..length]) {
            // ok
        } else {
            return;
        }
    }
    let data = &payload[HEADER_LEN..length];

    let mut sockets = SOCKETS.lock();
    let target = sockets.iter().position(|s| {
        s.in_use
            && s.local_port == dst_port
            && (!s.connected || (s.remote == src && s.remote_port == src_port))
    });
    let Some(idx) = target else {
        return;
    };

    if sockets[idx].kernel_owned {
        drop(sockets);
        #[cfg(feature = "net_dns")]
        super::dns::handle_response(src, data);
        #[cfg(not(feature = "net_dns"))]
        let _ = data;
        return;
    }

    // Single-datagram buffer: the next one overwrites if undrained.
    let s = &mut sockets[idx];
    let n = data.len().min(MAX_DATAGRAM);
    s.rx[..n].copy_from_slice(&data[..n]);
    s.rx_len = n;
    s.rx_from = src;
    s.rx_from_port = src_port;
    s.rx_full = true;
    deliver_to_waiters(s);
}

fn udp_checksum_verify(src: Ipv4Address, dst: Ipv4Address, segment: &[u8]) -> bool {
    let mut copy = [0u8; HEADER_LEN + MAX_DATAGRAM];
    copy[..segment.len()].copy_from_slice(segment);
    let wire = u16::from_be_bytes([copy[6], copy[7]]);
    copy[6] = 0;
    copy[7] = 0;
    let computed = udp_checksum(src, dst, &copy[..segment.len()]);
    wire == computed
}

fn deliver_to_waiters(s: &mut UdpSocket) {
    if s.waiter_count == 0 || !s.rx_full {
        return;
    }
    let slot = s.waiters[0];
    s.waiters.copy_within(1..s.waiter_count, 0);
    s.waiter_count -= 1;

    let (pml4, buf, len) = match table::get(slot) {
        Some(p) => (table::pml4_of(slot), p.pending_buf, p.pending_len),
        None => return,
    };
    let n = s.rx_len.min(len);
    let data: [u8; MAX_DATAGRAM] = s.rx;
    s.rx_full = false;
    s.rx_len = 0;
    if paging::copy_to_address_space(pml4, buf, &data[..n]).is_ok() {
        scheduler::complete_and_wake(slot, n as u64);
    } else {
        scheduler::complete_and_wake(slot, crate::abi::err(crate::abi::errno::EFAULT));
    }
}
