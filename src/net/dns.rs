//! DNS resolver
//!
//! A-record lookups over UDP from a fixed source port, with ~1 s retries
//! up to 5 attempts and a small TTL cache (capped at 10 minutes). Cache
//! lookups are case-exact and check expiry. Queries past their retry
//! budget fail with ENOENT at the syscall boundary.

extern crate alloc;

use alloc::string::String;
use core::fmt::Write;
use spin::Mutex;

use super::ipv4::Ipv4Address;
use super::{udp, NetError, TxBatch};
use crate::abi::{self, errno};
use crate::logger::BufWriter;
use crate::mm::paging;
use crate::process::table;
use crate::scheduler;

/// Fixed local port for all resolver traffic.
const RESOLVER_PORT: u16 = 5533;
const DNS_PORT: u16 = 53;

const RETRY_INTERVAL_MS: u64 = 1000;
const MAX_ATTEMPTS: u8 = 5;
/// TTL cap: 10 minutes.
const TTL_CAP_SECS: u32 = 600;

const MAX_QUERIES: usize = 8;
const MAX_NAME: usize = 64;
const MAX_WAITERS: usize = 4;
const CACHE_SIZE: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq)]
enum QueryState {
    Pending,
    Resolved(Ipv4Address),
    Failed,
}

#[derive(Clone, Copy)]
struct DnsQuery {
    in_use: bool,
    fd_refs: u32,
    id: u16,
    name: [u8; MAX_NAME],
    name_len: usize,
    attempts: u8,
    next_retry_ms: u64,
    state: QueryState,
    waiters: [usize; MAX_WAITERS],
    waiter_count: usize,
}

impl DnsQuery {
    const fn new() -> Self {
        Self {
            in_use: false,
            fd_refs: 0,
            id: 0,
            name: [0; MAX_NAME],
            name_len: 0,
            attempts: 0,
            next_retry_ms: 0,
            state: QueryState::Pending,
            waiters: [0; MAX_WAITERS],
            waiter_count: 0,
        }
    }

    fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("")
    }
}

struct CacheEntry {
    name: String,
    addr: Ipv4Address,
    expiry_ms: u64,
}

static QUERIES: Mutex<[DnsQuery; MAX_QUERIES]> = Mutex::new([DnsQuery::new(); MAX_QUERIES]);

static CACHE: Mutex<[Option<CacheEntry>; CACHE_SIZE]> = Mutex::new({
    const EMPTY: Option<CacheEntry> = None;
    [EMPTY; CACHE_SIZE]
});

static NAMESERVER: Mutex<Ipv4Address> = Mutex::new(Ipv4Address::new(10, 0, 0, 254));

static NEXT_ID: Mutex<u16> = Mutex::new(1);

static SOCKET: Mutex<Option<usize>> = Mutex::new(None);

/// Bind the resolver's UDP socket; called once at boot.
pub fn init() {
    let socket = udp::alloc_kernel(RESOLVER_PORT);
    *SOCKET.lock() = socket;
    if socket.is_none() {
        crate::kwarn!("dns: no UDP slot for resolver");
    }
}

pub fn set_nameserver(ip: Ipv4Address) {
    *NAMESERVER.lock() = ip;
    crate::kinfo!("dns: nameserver {}", ip);
}

pub fn nameserver() -> Ipv4Address {
    *NAMESERVER.lock()
}

fn cache_lookup(name: &str) -> Option<Ipv4Address> {
    let now = crate::logger::boot_time_ms();
    let cache = CACHE.lock();
    for entry in cache.iter().flatten() {
        if entry.name == name && entry.expiry_ms > now {
            return Some(entry.addr);
        }
    }
    None
}

/// Insert into the cache, reclaiming the oldest-expiring slot.
fn cache_insert(name: &str, addr: Ipv4Address, ttl_secs: u32) {
    let ttl = ttl_secs.min(TTL_CAP_SECS) as u64;
    let now = crate::logger::boot_time_ms();
    let mut cache = CACHE.lock();

    let mut victim = 0usize;
    let mut victim_expiry = u64::MAX;
    for (i, entry) in cache.iter().enumerate() {
        match entry {
            None => {
                victim = i;
                victim_expiry = 0;
                break;
            }
            Some(e) => {
                if e.expiry_ms < victim_expiry {
                    victim = i;
                    victim_expiry = e.expiry_ms;
                }
            }
        }
    }
    cache[victim] = Some(CacheEntry {
        name: String::from(name),
        addr,
        expiry_ms: now + ttl * 1000,
    });
}

/// Text dump for `/net/dns/cache`.
pub fn cache_dump(out: &mut [u8]) -> usize {
    let now = crate::logger::boot_time_ms();
    let cache = CACHE.lock();
    let mut w = BufWriter::new(out);
    for entry in cache.iter().flatten() {
        if entry.expiry_ms > now {
            let _ = write!(
                w,
                "{} {} {}\n",
                entry.name,
                entry.addr,
                (entry.expiry_ms - now) / 1000
            );
        }
    }
    w.len()
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

fn build_query(out: &mut [u8], id: u16, name: &str) -> Option<usize> {
    if out.len() < 17 + name.len() {
        return None;
    }
    out[0..2].copy_from_slice(&id.to_be_bytes());
    out[2..4].copy_from_slice(&0x0100u16.to_be_bytes()); // RD
    out[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out[6..12].fill(0);
    let mut at = 12;
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
        out[at] = label.len() as u8;
        at += 1;
        out[at..at + label.len()].copy_from_slice(label.as_bytes());
        at += label.len();
    }
    out[at] = 0;
    at += 1;
    out[at..at + 2].copy_from_slice(&1u16.to_be_bytes()); // QTYPE A
    at += 2;
    out[at..at + 2].copy_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    at += 2;
    Some(at)
}

/// Skip a (possibly compressed) name at `at`.
fn skip_name(data: &[u8], mut at: usize) -> Option<usize> {
    loop {
        let len = *data.get(at)? as usize;
        if len == 0 {
            return Some(at + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(at + 2);
        }
        at += 1 + len;
    }
}

/// Walk the answer RRs and return the first A record with its TTL.
fn parse_response(data: &[u8], want_id: u16) -> Option<(Ipv4Address, u32)> {
    if data.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([data[0], data[1]]);
    if id != want_id {
        return None;
    }
    let flags = u16::from_be_bytes([data[2], data[3]]);
    if flags & 0x8000 == 0 {
        return None; // not a response
    }
    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

    let mut at = 12;
    for _ in 0..qdcount {
        at = skip_name(data, at)?;
        at += 4;
    }
    for _ in 0..ancount {
        at = skip_name(data, at)?;
        if at + 10 > data.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([data[at], data[at + 1]]);
        let rclass = u16::from_be_bytes([data[at + 2], data[at + 3]]);
        let ttl = u32::from_be_bytes([data[at + 4], data[at + 5], data[at + 6], data[at + 7]]);
        let rdlen = u16::from_be_bytes([data[at + 8], data[at + 9]]) as usize;
        at += 10;
        if at + rdlen > data.len() {
            return None;
        }
        if rtype == 1 && rclass == 1 && rdlen == 4 {
            return Some((
                Ipv4Address([data[at], data[at + 1], data[at + 2], data[at + 3]]),
                ttl,
            ));
        }
        at += rdlen;
    }
    None
}

// ---------------------------------------------------------------------------
// Query lifecycle
// ---------------------------------------------------------------------------

fn send_query(q: &DnsQuery, tx: &mut TxBatch) {
    let Some(socket) = *SOCKET.lock() else {
        return;
    };
    let mut packet = [0u8; 512];
    if let Some(len) = build_query(&mut packet, q.id, q.name_str()) {
        let _ = udp::send_to(socket, nameserver(), DNS_PORT, &packet[..len], tx);
    }
}

/// Begin (or short-circuit via cache) a lookup. Returns a query slot the
/// caller's fd holds a reference on.
pub fn start_query(name: &str, tx: &mut TxBatch) -> Result<usize, NetError> {
    if name.is_empty() || name.len() > MAX_NAME {
        return Err(NetError::Malformed);
    }

    let cached = cache_lookup(name);
    let mut queries = QUERIES.lock();
    for (idx, q) in queries.iter_mut().enumerate() {
        if !q.in_use {
            *q = DnsQuery::new();
            q.in_use = true;
            q.fd_refs = 1;
            q.name[..name.len()].copy_from_slice(name.as_bytes());
            q.name_len = name.len();
            let mut id = NEXT_ID.lock();
            q.id = *id;
            *id = id.wrapping_add(1).max(1);

            if let Some(addr) = cached {
                q.state = QueryState::Resolved(addr);
            } else {
                q.state = QueryState::Pending;
                q.attempts = 1;
                q.next_retry_ms = crate::logger::boot_time_ms() + RETRY_INTERVAL_MS;
                send_query(q, tx);
            }
            return Ok(idx);
        }
    }
    Err(NetError::NoSlot)
}

pub fn retain(idx: usize) {
    QUERIES.lock()[idx].fd_refs += 1;
}

pub fn release(idx: usize) {
    let mut queries = QUERIES.lock();
    let q = &mut queries[idx];
    q.fd_refs = q.fd_refs.saturating_sub(1);
    if q.fd_refs == 0 {
        *q = DnsQuery::new();
    }
}

pub enum ReadOutcome {
    Done(usize),
    Blocked,
    Failed,
}

/// Read the lookup result ("IP\n") into the caller's buffer, blocking
/// while the query is outstanding.
pub fn read_result(idx: usize, pml4: u64, buf: u64, len: usize, caller_slot: usize) -> ReadOutcome {
    let mut queries = QUERIES.lock();
    let q = &mut queries[idx];
    if !q.in_use {
        return ReadOutcome::Failed;
    }
    match q.state {
        QueryState::Resolved(addr) => {
            let mut line = [0u8; 20];
            let n = {
                let mut w = BufWriter::new(&mut line);
                let _ = write!(w, "{}\n", addr);
                w.len()
            }
            .min(len);
            if paging::copy_to_address_space(pml4, buf, &line[..n]).is_err() {
                return ReadOutcome::Failed;
            }
            ReadOutcome::Done(n)
        }
        QueryState::Failed => ReadOutcome::Failed,
        QueryState::Pending => {
            if q.waiter_count >= MAX_WAITERS {
                return ReadOutcome::Failed;
            }
            q.waiters[q.waiter_count] = caller_slot;
            q.waiter_count += 1;
            scheduler::set_pending_dest(caller_slot, idx, buf, len);
            scheduler::block_current(crate::process::PendingOp::Dns);
            ReadOutcome::Blocked
        }
    }
}

fn wake_waiters(q: &mut DnsQuery) {
    for i in 0..q.waiter_count {
        let slot = q.waiters[i];
        let ret = match q.state {
            QueryState::Resolved(addr) => {
                let (pml4, buf, len) = match table::get(slot) {
                    Some(p) => (table::pml4_of(slot), p.pending_buf, p.pending_len),
                    None => continue,
                };
                let mut line = [0u8; 20];
                let n = {
                    let mut w = BufWriter::new(&mut line);
                    let _ = write!(w, "{}\n", addr);
                    w.len()
                }
                .min(len);
                if paging::copy_to_address_space(pml4, buf, &line[..n]).is_ok() {
                    n as u64
                } else {
                    abi::err(errno::EFAULT)
                }
            }
            QueryState::Failed => abi::err(errno::ENOENT),
            QueryState::Pending => continue,
        };
        scheduler::complete_and_wake(slot, ret);
    }
    q.waiter_count = 0;
}

/// Response datagrams from the resolver socket land here.
pub fn handle_response(_src: Ipv4Address, data: &[u8]) {
    let mut resolved: Option<([u8; MAX_NAME], usize, Ipv4Address, u32)> = None;
    {
        let mut queries = QUERIES.lock();
        for q in queries.iter_mut() {
            if !q.in_use || q.state != QueryState::Pending {
                continue;
            }
            if let Some((addr, ttl)) = parse_response(data, q.id) {
                q.state = QueryState::Resolved(addr);
                wake_waiters(q);
                resolved = Some((q.name, q.name_len, addr, ttl));
                break;
            }
        }
    }
    if let Some((name, len, addr, ttl)) = resolved {
        if let Ok(name) = core::str::from_utf8(&name[..len]) {
            cache_insert(name, addr, ttl);
        }
    }
}

/// Retry pump.
pub fn poll(now_ms: u64, tx: &mut TxBatch) {
    let mut queries = QUERIES.lock();
    for q in queries.iter_mut() {
        if !q.in_use || q.state != QueryState::Pending {
            continue;
        }
        if now_ms < q.next_retry_ms {
            continue;
        }
        if q.attempts >= MAX_ATTEMPTS {
            q.state = QueryState::Failed;
            wake_waiters(q);
            continue;
        }
        q.attempts += 1;
        q.next_retry_ms = now_ms + RETRY_INTERVAL_MS;
        send_query(q, tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_builds_labels_and_footer() {
        let mut out = [0u8; 512];
        let n = build_query(&mut out, 7, "example.com").expect("builds");
        assert_eq!(&out[0..2], &7u16.to_be_bytes());
        // 12 header + 1+7 + 1+3 + 1 root + 4 footer
        assert_eq!(n, 12 + 8 + 4 + 1 + 4);
        assert_eq!(out[12], 7);
        assert_eq!(&out[13..20], b"example");
        assert_eq!(out[20], 3);
        assert_eq!(&out[21..24], b"com");
        assert_eq!(out[24], 0);
    }

    #[test]
    fn response_parse_extracts_first_a_record() {
        // Build a response: header, one question, one A answer with a
        // compressed name pointer.
        let mut msg = [0u8; 512];
        let qlen = build_query(&mut msg, 42, "host.test").unwrap();
        msg[2] = 0x81; // QR + RD
        msg[3] = 0x80; // RA
        msg[6..8].copy_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        let mut at = qlen;
        msg[at..at + 2].copy_from_slice(&0xC00Cu16.to_be_bytes()); // ptr to qname
        at += 2;
        msg[at..at + 2].copy_from_slice(&1u16.to_be_bytes()); // TYPE A
        at += 2;
        msg[at..at + 2].copy_from_slice(&1u16.to_be_bytes()); // CLASS IN
        at += 2;
        msg[at..at + 4].copy_from_slice(&300u32.to_be_bytes()); // TTL
        at += 4;
        msg[at..at + 2].copy_from_slice(&4u16.to_be_bytes()); // RDLEN
        at += 2;
        msg[at..at + 4].copy_from_slice(&[93, 184, 216, 34]);
        at += 4;

        let (addr, ttl) = parse_response(&msg[..at], 42).expect("parses");
        assert_eq!(addr, Ipv4Address::new(93, 184, 216, 34));
        assert_eq!(ttl, 300);
    }

    #[test]
    fn response_with_wrong_id_is_ignored() {
        let mut msg = [0u8; 64];
        let qlen = build_query(&mut msg, 1, "a.b").unwrap();
        msg[2] = 0x80;
        assert!(parse_response(&msg[..qlen], 2).is_none());
    }

    #[test]
    fn cache_respects_expiry_and_case() {
        cache_insert("Exact.Name", Ipv4Address::new(1, 2, 3, 4), 60);
        assert_eq!(
            cache_lookup("Exact.Name"),
            Some(Ipv4Address::new(1, 2, 3, 4))
        );
        // Case-exact: different case misses.
        assert_eq!(cache_lookup("exact.name"), None);
    }

    #[test]
    fn ttl_is_capped() {
        cache_insert("long.ttl", Ipv4Address::new(9, 9, 9, 9), 86400);
        let mut out = [0u8; 256];
        let n = cache_dump(&mut out);
        let text = core::str::from_utf8(&out[..n]).unwrap();
        let line = text.lines().find(|l| l.starts_with("long.ttl")).unwrap();
        let remaining: u64 = line.rsplit(' ').next().unwrap().parse().unwrap();
        assert!(remaining <= TTL_CAP_SECS as u64);
    }
}
