//! Fornax network stack
//!
//! Protocol modules are feature-gated the same way the rest of the
//! kernel is; `net_full` (default) enables everything. The stack is
//! driven from three edges: inbound frames handed up by the NIC driver
//! (`rx_frame`), syscalls entering through the `/net` file tree
//! (`netfs`), and the scheduler's idle loop pumping timers (`poll`).
//!
//! Outbound frames are staged in a `TxBatch` while subsystem locks are
//! held and only flushed afterwards; the flush short-circuits frames
//! addressed to our own MAC back into the receive path, which is what
//! makes same-host TCP/ICMP ("loopback") work without a driver.

use spin::Mutex;

use crate::logger;

#[cfg(feature = "net_arp")]
pub mod arp;

#[cfg(feature = "net_dns")]
pub mod dns;

#[cfg(feature = "net_ethernet")]
pub mod ethernet;

#[cfg(feature = "net_icmp")]
pub mod icmp;

#[cfg(feature = "net_ipv4")]
pub mod ipv4;

pub mod netfs;

#[cfg(feature = "net_tcp")]
pub mod tcp;

#[cfg(feature = "net_udp")]
pub mod udp;

use ethernet::MacAddress;
use ipv4::Ipv4Address;

/// Largest frame the stack will build or accept.
pub const MAX_FRAME_SIZE: usize = 1536;

const TX_BATCH_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    NoSlot,
    InvalidState,
    WouldBlock,
    BufferTooSmall,
    TxFull,
    NoRoute,
    Malformed,
    ConnectionClosed,
}

/// Staged outbound frames. Built under protocol locks, flushed after
/// they are released so loopback re-injection cannot deadlock.
pub struct TxBatch {
    buffers: [[u8; MAX_FRAME_SIZE]; TX_BATCH_CAPACITY],
    lengths: [usize; TX_BATCH_CAPACITY],
    count: usize,
}

impl TxBatch {
    pub const fn new() -> Self {
        Self {
            buffers: [[0u8; MAX_FRAME_SIZE]; TX_BATCH_CAPACITY],
            lengths: [0; TX_BATCH_CAPACITY],
            count: 0,
        }
    }

    pub fn push(&mut self, frame: &[u8]) -> Result<(), NetError> {
        if self.count >= TX_BATCH_CAPACITY {
            return Err(NetError::TxFull);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(NetError::BufferTooSmall);
        }
        self.buffers[self.count][..frame.len()].copy_from_slice(frame);
        self.lengths[self.count] = frame.len();
        self.count += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn frames(&self) -> impl Iterator<Item = &[u8]> {
        (0..self.count).map(move |i| &self.buffers[i][..self.lengths[i]])
    }
}

// ---------------------------------------------------------------------------
// Interface configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct NetConfig {
    pub ip: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub mac: MacAddress,
}

impl NetConfig {
    const fn default_config() -> Self {
        Self {
            ip: Ipv4Address::new(10, 0, 0, 1),
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: Ipv4Address::new(10, 0, 0, 254),
            mac: MacAddress::new([0x52, 0x54, 0x00, 0xFC, 0x00, 0x01]),
        }
    }

    /// Starting point the boot path mutates from the command line.
    pub const fn default_for_boot() -> Self {
        Self::default_config()
    }
}

static CONFIG: Mutex<NetConfig> = Mutex::new(NetConfig::default_config());

pub fn configure(config: NetConfig) {
    *CONFIG.lock() = config;
    crate::kinfo!("net: interface {} ({})", config.ip, config.mac);
}

pub fn local_ip() -> Ipv4Address {
    CONFIG.lock().ip
}

pub fn local_mac() -> MacAddress {
    CONFIG.lock().mac
}

pub fn gateway() -> Ipv4Address {
    CONFIG.lock().gateway
}

fn on_subnet(dst: Ipv4Address) -> bool {
    let c = CONFIG.lock();
    for i in 0..4 {
        if (dst.0[i] & c.netmask.0[i]) != (c.ip.0[i] & c.netmask.0[i]) {
            return false;
        }
    }
    true
}

/// Is this destination delivered to ourselves without touching the wire?
pub fn is_local_dst(dst: Ipv4Address) -> bool {
    dst == local_ip() || dst.is_loopback()
}

// ---------------------------------------------------------------------------
// Driver hook
// ---------------------------------------------------------------------------

/// Installed by the NIC driver during bring-up; frames with a remote
/// destination go through it. Without a driver they are dropped.
static NIC_TX: Mutex<Option<fn(&[u8])>> = Mutex::new(None);

pub fn register_driver(tx: fn(&[u8])) {
    *NIC_TX.lock() = Some(tx);
    crate::kinfo!("net: driver transmit hook registered");
}

// ---------------------------------------------------------------------------
// Frame paths
// ---------------------------------------------------------------------------

/// Demux one inbound frame. Replies are staged into `tx`.
pub fn handle_frame(frame: &[u8], tx: &mut TxBatch) {
    let Some(eth) = ethernet::parse(frame) else {
        return;
    };
    let our_mac = local_mac();
    if eth.dst != our_mac && !eth.dst.is_broadcast() {
        return;
    }

    match eth.ethertype {
        #[cfg(feature = "net_arp")]
        ethernet::EtherType::Arp => arp::handle_packet(eth.payload, tx),
        ethernet::EtherType::Ipv4 => handle_ipv4(eth.src, eth.payload, tx),
        _ => {}
    }
}

fn handle_ipv4(src_mac: MacAddress, payload: &[u8], tx: &mut TxBatch) {
    let Some(pkt) = ipv4::parse(payload) else {
        return;
    };
    if pkt.dst != local_ip() && !pkt.dst.is_loopback() && pkt.dst != Ipv4Address::BROADCAST {
        return;
    }

    #[cfg(feature = "net_arp")]
    arp::learn(pkt.src, src_mac);
    #[cfg(not(feature = "net_arp"))]
    let _ = src_mac;

    match pkt.protocol {
        #[cfg(feature = "net_icmp")]
        ipv4::PROTO_ICMP => icmp::handle_packet(pkt.src, pkt.ttl, pkt.payload, tx),
        #[cfg(feature = "net_udp")]
        ipv4::PROTO_UDP => udp::handle_packet(pkt.src, pkt.dst, pkt.payload, tx),
        #[cfg(feature = "net_tcp")]
        ipv4::PROTO_TCP => tcp::handle_segment(pkt.src, pkt.payload, tx),
        _ => {}
    }
}

/// Build and stage a full frame around an IPv4 payload. Local
/// destinations are framed to our own MAC so `flush` loops them back;
/// remote ones resolve the next hop through ARP, kicking off a request
/// and reporting NoRoute while unresolved (senders retry on their own
/// timers).
pub fn send_ipv4(
    dst: Ipv4Address,
    protocol: u8,
    payload: &[u8],
    tx: &mut TxBatch,
) -> Result<(), NetError> {
    let our_mac = local_mac();
    let dst_mac = if is_local_dst(dst) {
        our_mac
    } else {
        let next_hop = if on_subnet(dst) { dst } else { gateway() };
        match resolve_next_hop(next_hop, tx) {
            Some(mac) => mac,
            None => return Err(NetError::NoRoute),
        }
    };

    let total = ethernet::HEADER_LEN + ipv4::HEADER_LEN + payload.len();
    if total > MAX_FRAME_SIZE {
        return Err(NetError::BufferTooSmall);
    }
    let mut frame = [0u8; MAX_FRAME_SIZE];
    let mut at = ethernet::build_header(&mut frame, dst_mac, our_mac, ethernet::EtherType::Ipv4);
    at += ipv4::build_header(&mut frame[at..], local_ip(), dst, protocol, payload.len());
    frame[at..at + payload.len()].copy_from_slice(payload);
    tx.push(&frame[..total])
}

#[cfg(feature = "net_arp")]
fn resolve_next_hop(next_hop: Ipv4Address, tx: &mut TxBatch) -> Option<MacAddress> {
    match arp::lookup(next_hop) {
        Some(mac) => Some(mac),
        None => {
            arp::request(next_hop, tx);
            None
        }
    }
}

#[cfg(not(feature = "net_arp"))]
fn resolve_next_hop(_next_hop: Ipv4Address, _tx: &mut TxBatch) -> Option<MacAddress> {
    Some(MacAddress::BROADCAST)
}

/// Transmit a batch: loopback frames re-enter the stack (any replies
/// they generate go out in follow-up rounds), the rest go to the NIC.
pub fn flush(tx: &mut TxBatch) {
    let our_mac = local_mac();
    let mut current = core::mem::replace(tx, TxBatch::new());
    // Bounded rounds: a pure ACK generates no reply, so ping-pong decays.
    for _ in 0..16 {
        if current.is_empty() {
            return;
        }
        let mut next = TxBatch::new();
        for frame in current.frames() {
            let loopback = ethernet::parse(frame)
                .map(|eth| eth.dst == our_mac)
                .unwrap_or(false);
            if loopback {
                handle_frame(frame, &mut next);
            } else if let Some(nic) = *NIC_TX.lock() {
                nic(frame);
            } else {
                crate::kdebug!("net: no driver, dropping {} byte frame", frame.len());
            }
        }
        current = next;
    }
}

/// Entry point for the NIC driver's receive path.
pub fn rx_frame(frame: &[u8]) {
    let mut tx = TxBatch::new();
    handle_frame(frame, &mut tx);
    flush(&mut tx);
}

/// Timer pump: TCP retransmit/TIME_WAIT, ICMP timeouts, DNS retries.
pub fn poll() {
    let now = logger::boot_time_ms();
    let mut tx = TxBatch::new();
    #[cfg(feature = "net_tcp")]
    tcp::poll(now, &mut tx);
    #[cfg(feature = "net_icmp")]
    icmp::poll(now);
    #[cfg(feature = "net_dns")]
    dns::poll(now, &mut tx);
    flush(&mut tx);
}

pub fn init() {
    crate::kinfo!("net: stack up, ip {} gw {}", local_ip(), gateway());
}
