//! ARP
//!
//! Small cache with round-robin eviction. Both requests and replies
//! teach us the sender's mapping; requests for our IP are answered
//! immediately.

use spin::Mutex;

use super::ethernet::{self, EtherType, MacAddress};
use super::ipv4::Ipv4Address;
use super::TxBatch;

const CACHE_SIZE: usize = 16;

/// Wire size of an Ethernet/IPv4 ARP packet.
const ARP_LEN: usize = 28;

const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;

#[derive(Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Address,
    mac: MacAddress,
    valid: bool,
}

struct ArpCache {
    entries: [ArpEntry; CACHE_SIZE],
    /// Next eviction victim.
    cursor: usize,
}

static CACHE: Mutex<ArpCache> = Mutex::new(ArpCache {
    entries: [ArpEntry {
        ip: Ipv4Address::UNSPECIFIED,
        mac: MacAddress::ZERO,
        valid: false,
    }; CACHE_SIZE],
    cursor: 0,
});

pub fn lookup(ip: Ipv4Address) -> Option<MacAddress> {
    let cache = CACHE.lock();
    for entry in cache.entries.iter() {
        if entry.valid && entry.ip == ip {
            return Some(entry.mac);
        }
    }
    None
}

/// Insert or refresh a mapping, evicting round-robin when full.
pub fn learn(ip: Ipv4Address, mac: MacAddress) {
    if ip == Ipv4Address::UNSPECIFIED {
        return;
    }
    let mut cache = CACHE.lock();
    for entry in cache.entries.iter_mut() {
        if entry.valid && entry.ip == ip {
            entry.mac = mac;
            return;
        }
    }
    for entry in cache.entries.iter_mut() {
        if !entry.valid {
            *entry = ArpEntry {
                ip,
                mac,
                valid: true,
            };
            return;
        }
    }
    let victim = cache.cursor;
    cache.cursor = (victim + 1) % CACHE_SIZE;
    cache.entries[victim] = ArpEntry {
        ip,
        mac,
        valid: true,
    };
}

fn build(out: &mut [u8], op: u16, sender_mac: MacAddress, sender_ip: Ipv4Address, target_mac: MacAddress, target_ip: Ipv4Address) {
    out[0..2].copy_from_slice(&1u16.to_be_bytes()); // Ethernet
    out[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // IPv4
    out[4] = 6;
    out[5] = 4;
    out[6..8].copy_from_slice(&op.to_be_bytes());
    out[8..14].copy_from_slice(&sender_mac.0);
    out[14..18].copy_from_slice(&sender_ip.0);
    out[18..24].copy_from_slice(&target_mac.0);
    out[24..28].copy_from_slice(&target_ip.0);
}

/// Broadcast a who-has request.
pub fn request(target: Ipv4Address, tx: &mut TxBatch) {
    let our_mac = super::local_mac();
    let mut frame = [0u8; ethernet::HEADER_LEN + ARP_LEN];
    let at = ethernet::build_header(&mut frame, MacAddress::BROADCAST, our_mac, EtherType::Arp);
    build(
        &mut frame[at..],
        OP_REQUEST,
        our_mac,
        super::local_ip(),
        MacAddress::ZERO,
        target,
    );
    let _ = tx.push(&frame);
}

/// Handle an inbound ARP packet: learn the sender, reply to requests
/// for our address.
pub fn handle_packet(payload: &[u8], tx: &mut TxBatch) {
    if payload.len() < ARP_LEN {
        return;
    }
    let htype = u16::from_be_bytes([payload[0], payload[1]]);
    let ptype = u16::from_be_bytes([payload[2], payload[3]]);
    if htype != 1 || ptype != 0x0800 || payload[4] != 6 || payload[5] != 4 {
        return;
    }
    let op = u16::from_be_bytes([payload[6], payload[7]]);
    let sender_mac = MacAddress([
        payload[8], payload[9], payload[10], payload[11], payload[12], payload[13],
    ]);
    let sender_ip = Ipv4Address([payload[14], payload[15], payload[16], payload[17]]);
    let target_ip = Ipv4Address([payload[24], payload[25], payload[26], payload[27]]);

    learn(sender_ip, sender_mac);

    if op == OP_REQUEST && target_ip == super::local_ip() {
        let our_mac = super::local_mac();
        let mut frame = [0u8; ethernet::HEADER_LEN + ARP_LEN];
        let at = ethernet::build_header(&mut frame, sender_mac, our_mac, EtherType::Arp);
        build(
            &mut frame[at..],
            OP_REPLY,
            our_mac,
            super::local_ip(),
            sender_mac,
            sender_ip,
        );
        let _ = tx.push(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddress {
        MacAddress([n; 6])
    }

    #[test]
    fn learn_then_lookup() {
        let ip = Ipv4Address::new(192, 168, 1, 9);
        learn(ip, mac(9));
        assert_eq!(lookup(ip), Some(mac(9)));
    }

    #[test]
    fn relearn_updates_in_place() {
        let ip = Ipv4Address::new(192, 168, 1, 10);
        learn(ip, mac(1));
        learn(ip, mac(2));
        assert_eq!(lookup(ip), Some(mac(2)));
    }

    #[test]
    fn eviction_is_round_robin_when_full() {
        for i in 0..(CACHE_SIZE as u8 + 4) {
            learn(Ipv4Address::new(10, 99, 0, i), mac(i));
        }
        // The most recent insertions must still be present.
        let last = CACHE_SIZE as u8 + 3;
        assert_eq!(lookup(Ipv4Address::new(10, 99, 0, last)), Some(mac(last)));
    }

    #[test]
    fn request_for_our_ip_is_answered() {
        let mut req = [0u8; ARP_LEN];
        build(
            &mut req,
            OP_REQUEST,
            mac(7),
            Ipv4Address::new(10, 0, 0, 77),
            MacAddress::ZERO,
            crate::net::local_ip(),
        );
        let mut tx = TxBatch::new();
        handle_packet(&req, &mut tx);
        let reply = tx.frames().next().expect("reply staged");
        let eth = ethernet::parse(reply).unwrap();
        assert_eq!(eth.ethertype, EtherType::Arp);
        assert_eq!(eth.dst, mac(7));
        let op = u16::from_be_bytes([eth.payload[6], eth.payload[7]]);
        assert_eq!(op, OP_REPLY);
        // And we learned the asker.
        assert_eq!(lookup(Ipv4Address::new(10, 0, 0, 77)), Some(mac(7)));
    }
}
