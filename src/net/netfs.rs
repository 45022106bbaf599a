//! The /net file tree
//!
//! Plan 9 style network access: `/net/tcp/clone` hands out a connection
//! slot whose index a read returns as text; `/net/tcp/N/ctl` takes
//! `connect IP!PORT` and `announce *!PORT`; `data` carries the byte
//! stream; `listen` blocks until a child connection exists; `status`,
//! `local` and `remote` synthesize one-shot text. `/net/udp` and
//! `/net/icmp` are analogous, and `/net/dns` resolves names written as
//! `query NAME`.

use core::fmt::Write;
use core::str::FromStr;

use crate::abi::{self, errno};
use crate::fs::kfile::{KFile, KFileKind};
use crate::logger::BufWriter;
use crate::mm::paging;
use crate::scheduler;

use super::ipv4::Ipv4Address;
use super::TxBatch;

/// "N\n" for clone and listen reads.
pub fn format_index(out: &mut [u8], idx: usize) -> usize {
    let mut w = BufWriter::new(out);
    let _ = write!(w, "{}\n", idx);
    w.len()
}

fn format_endpoint(out: &mut [u8], ip: Ipv4Address, port: u16) -> usize {
    let mut w = BufWriter::new(out);
    let _ = write!(w, "{}!{}\n", ip, port);
    w.len()
}

/// Parse "IP!PORT" (trailing newline tolerated).
fn parse_endpoint(s: &str) -> Option<(Ipv4Address, u16)> {
    let s = s.trim_end_matches('\n').trim();
    let (ip, port) = s.split_once('!')?;
    Some((Ipv4Address::from_str(ip).ok()?, port.parse().ok()?))
}

/// Result of a netfs operation.
pub enum NetfsResult {
    Done(u64),
    /// The protocol module parked and blocked the caller already.
    Blocked,
    /// Synthesized text the syscall layer copies out.
    Text([u8; 96], usize),
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

/// Resolve a `/net/...` path to a virtual file, allocating protocol
/// resources for the clone files.
pub fn open(path: &str) -> Result<KFile, i32> {
    let rest = path.strip_prefix("/net").ok_or(errno::ENOENT)?;
    let rest = rest.strip_prefix('/').unwrap_or(rest);

    if rest.is_empty() {
        return Err(errno::ENOENT);
    }

    #[cfg(feature = "net_tcp")]
    if let Some(sub) = rest.strip_prefix("tcp") {
        return open_tcp(sub.strip_prefix('/').unwrap_or(sub));
    }
    #[cfg(feature = "net_udp")]
    if let Some(sub) = rest.strip_prefix("udp") {
        return open_udp(sub.strip_prefix('/').unwrap_or(sub));
    }
    #[cfg(feature = "net_icmp")]
    if let Some(sub) = rest.strip_prefix("icmp") {
        return open_icmp(sub.strip_prefix('/').unwrap_or(sub));
    }
    #[cfg(feature = "net_dns")]
    if rest == "dns" {
        return Ok(KFile::new(KFileKind::Dns, 0));
    }
    #[cfg(feature = "net_dns")]
    if rest == "dns/ctl" {
        return Ok(KFile::new(KFileKind::DnsCtl, 0));
    }
    #[cfg(feature = "net_dns")]
    if rest == "dns/cache" {
        return Ok(KFile::new(KFileKind::DnsCache, 0));
    }
    Err(errno::ENOENT)
}

#[cfg(feature = "net_tcp")]
fn open_tcp(sub: &str) -> Result<KFile, i32> {
    if sub == "clone" {
        let idx = super::tcp::alloc().ok_or(errno::EMFILE)?;
        return Ok(KFile::new(KFileKind::TcpClone, idx));
    }
    let (idx, file) = split_conn_path(sub)?;
    if !super::tcp::is_live(idx) {
        return Err(errno::ENOENT);
    }
    let kind = match file {
        "ctl" => KFileKind::TcpCtl,
        "data" => KFileKind::TcpData,
        "status" => KFileKind::TcpStatus,
        "local" => KFileKind::TcpLocal,
        "remote" => KFileKind::TcpRemote,
        "listen" => KFileKind::TcpListen,
        _ => return Err(errno::ENOENT),
    };
    super::tcp::retain(idx);
    Ok(KFile::new(kind, idx))
}

#[cfg(feature = "net_udp")]
fn open_udp(sub: &str) -> Result<KFile, i32> {
    if sub == "clone" {
        let idx = super::udp::alloc().ok_or(errno::EMFILE)?;
        return Ok(KFile::new(KFileKind::UdpClone, idx));
    }
    let (idx, file) = split_conn_path(sub)?;
    if !super::udp::is_live(idx) {
        return Err(errno::ENOENT);
    }
    let kind = match file {
        "ctl" => KFileKind::UdpCtl,
        "data" => KFileKind::UdpData,
        "status" => KFileKind::UdpStatus,
        "local" => KFileKind::UdpLocal,
        "remote" => KFileKind::UdpRemote,
        _ => return Err(errno::ENOENT),
    };
    super::udp::retain(idx);
    Ok(KFile::new(kind, idx))
}

#[cfg(feature = "net_icmp")]
fn open_icmp(sub: &str) -> Result<KFile, i32> {
    if sub == "clone" {
        let idx = super::icmp::alloc().ok_or(errno::EMFILE)?;
        return Ok(KFile::new(KFileKind::IcmpClone, idx));
    }
    let (idx, file) = split_conn_path(sub)?;
    if !super::icmp::is_live(idx) {
        return Err(errno::ENOENT);
    }
    let kind = match file {
        "ctl" => KFileKind::IcmpCtl,
        "data" => KFileKind::IcmpData,
        "status" => KFileKind::IcmpStatus,
        _ => return Err(errno::ENOENT),
    };
    super::icmp::retain(idx);
    Ok(KFile::new(kind, idx))
}

/// Split "N/file" into the slot index and file name.
fn split_conn_path(sub: &str) -> Result<(usize, &str), i32> {
    let (num, file) = sub.split_once('/').ok_or(errno::ENOENT)?;
    let idx: usize = num.parse().map_err(|_| errno::ENOENT)?;
    Ok((idx, file))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// One-shot text synthesis shared by status/local/remote/clone reads.
fn text_once(kf: &mut KFile, fill: impl FnOnce(&mut [u8]) -> usize) -> NetfsResult {
    if kf.read_done {
        return NetfsResult::Done(0);
    }
    kf.read_done = true;
    let mut buf = [0u8; 96];
    let n = fill(&mut buf);
    NetfsResult::Text(buf, n)
}

pub fn read(kf: &mut KFile, pml4: u64, buf: u64, len: usize, caller_slot: usize) -> NetfsResult {
    let obj = kf.obj;
    match kf.kind {
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpClone => text_once(kf, |out| format_index(out, obj)),
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpStatus => text_once(kf, |out| {
            let mut w = BufWriter::new(out);
            let _ = write!(w, "{}\n", super::tcp::state_name(obj));
            w.len()
        }),
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpLocal => text_once(kf, |out| {
            let (ip, port) = super::tcp::local_endpoint(obj);
            format_endpoint(out, ip, port)
        }),
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpRemote => text_once(kf, |out| {
            let (ip, port) = super::tcp::remote_endpoint(obj);
            format_endpoint(out, ip, port)
        }),
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpData => {
            let mut tx = TxBatch::new();
            let out = super::tcp::read(kf.obj, pml4, buf, len, caller_slot, &mut tx);
            super::flush(&mut tx);
            match out {
                super::tcp::ReadOutcome::Done(v) => NetfsResult::Done(v),
                super::tcp::ReadOutcome::Blocked => NetfsResult::Blocked,
            }
        }
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpListen => {
            scheduler::set_pending_dest(caller_slot, kf.obj, buf, len);
            match super::tcp::accept(kf.obj, caller_slot) {
                Ok(Some(child)) => {
                    let mut line = [0u8; 96];
                    let n = format_index(&mut line, child);
                    NetfsResult::Text(line, n)
                }
                Ok(None) => NetfsResult::Blocked,
                Err(_) => NetfsResult::Done(abi::err(errno::EINVAL)),
            }
        }
        #[cfg(feature = "net_udp")]
        KFileKind::UdpClone => text_once(kf, |out| format_index(out, obj)),
        #[cfg(feature = "net_udp")]
        KFileKind::UdpStatus => text_once(kf, |out| {
            let mut w = BufWriter::new(out);
            let _ = match super::udp::endpoints(obj) {
                Some((_, Some(_))) => write!(w, "Connected\n"),
                Some((_, None)) => write!(w, "Open\n"),
                None => write!(w, "Closed\n"),
            };
            w.len()
        }),
        #[cfg(feature = "net_udp")]
        KFileKind::UdpLocal => text_once(kf, |out| {
            match super::udp::endpoints(obj) {
                Some((port, _)) => format_endpoint(out, super::local_ip(), port),
                None => 0,
            }
        }),
        #[cfg(feature = "net_udp")]
        KFileKind::UdpRemote => text_once(kf, |out| {
            match super::udp::endpoints(obj) {
                Some((_, Some((ip, port)))) => format_endpoint(out, ip, port),
                _ => 0,
            }
        }),
        #[cfg(feature = "net_udp")]
        KFileKind::UdpData => match super::udp::recv(kf.obj, pml4, buf, len, caller_slot) {
            super::udp::ReadOutcome::Done(n) => NetfsResult::Done(n as u64),
            super::udp::ReadOutcome::Blocked => NetfsResult::Blocked,
            super::udp::ReadOutcome::Error(_) => NetfsResult::Done(abi::err(errno::EIO)),
        },
        #[cfg(feature = "net_icmp")]
        KFileKind::IcmpClone => text_once(kf, |out| format_index(out, obj)),
        #[cfg(feature = "net_icmp")]
        KFileKind::IcmpStatus => text_once(kf, |out| {
            let mut w = BufWriter::new(out);
            let _ = match super::icmp::remote_of(obj) {
                Some(ip) => write!(w, "Connected {}\n", ip),
                None => write!(w, "Open\n"),
            };
            w.len()
        }),
        #[cfg(feature = "net_icmp")]
        KFileKind::IcmpData => match super::icmp::read_result(kf.obj, pml4, buf, len, caller_slot)
        {
            super::icmp::ReadOutcome::Done(n) => NetfsResult::Done(n as u64),
            super::icmp::ReadOutcome::Blocked => NetfsResult::Blocked,
            super::icmp::ReadOutcome::Error(_) => NetfsResult::Done(abi::err(errno::EIO)),
        },
        #[cfg(feature = "net_dns")]
        KFileKind::Dns => {
            if kf.obj == 0 {
                return NetfsResult::Done(abi::err(errno::EINVAL));
            }
            match super::dns::read_result(kf.obj - 1, pml4, buf, len, caller_slot) {
                super::dns::ReadOutcome::Done(n) => NetfsResult::Done(n as u64),
                super::dns::ReadOutcome::Blocked => NetfsResult::Blocked,
                super::dns::ReadOutcome::Failed => NetfsResult::Done(abi::err(errno::ENOENT)),
            }
        }
        #[cfg(feature = "net_dns")]
        KFileKind::DnsCtl => text_once(kf, |out| {
            let mut w = BufWriter::new(out);
            let _ = write!(w, "nameserver {}\n", super::dns::nameserver());
            w.len()
        }),
        #[cfg(feature = "net_dns")]
        KFileKind::DnsCache => {
            if kf.read_done {
                return NetfsResult::Done(0);
            }
            kf.read_done = true;
            let mut dump = [0u8; 1024];
            let n = super::dns::cache_dump(&mut dump).min(len);
            if paging::copy_to_address_space(pml4, buf, &dump[..n]).is_err() {
                return NetfsResult::Done(abi::err(errno::EFAULT));
            }
            NetfsResult::Done(n as u64)
        }
        _ => NetfsResult::Done(abi::err(errno::EINVAL)),
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

/// `data` is the (already copied-in) user payload for control files;
/// stream writes go through the user buffer directly.
pub fn write(
    kf: &mut KFile,
    pml4: u64,
    buf: u64,
    len: usize,
    data: &[u8],
    caller_slot: usize,
) -> NetfsResult {
    match kf.kind {
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpCtl => tcp_ctl(kf.obj, data, len, caller_slot),
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpData => {
            let mut tx = TxBatch::new();
            let out = super::tcp::write(kf.obj, pml4, buf, len, caller_slot, &mut tx);
            super::flush(&mut tx);
            match out {
                super::tcp::ReadOutcome::Done(v) => NetfsResult::Done(v),
                super::tcp::ReadOutcome::Blocked => NetfsResult::Blocked,
            }
        }
        #[cfg(feature = "net_udp")]
        KFileKind::UdpCtl => udp_ctl(kf.obj, data, len),
        #[cfg(feature = "net_udp")]
        KFileKind::UdpData => {
            let mut tx = TxBatch::new();
            let r = super::udp::send(kf.obj, data, &mut tx);
            super::flush(&mut tx);
            match r {
                Ok(n) => NetfsResult::Done(n as u64),
                Err(super::NetError::InvalidState) => NetfsResult::Done(abi::err(errno::EINVAL)),
                Err(_) => NetfsResult::Done(abi::err(errno::EIO)),
            }
        }
        #[cfg(feature = "net_icmp")]
        KFileKind::IcmpCtl => icmp_ctl(kf.obj, data, len),
        #[cfg(feature = "net_icmp")]
        KFileKind::IcmpData => {
            let mut tx = TxBatch::new();
            let r = super::icmp::trigger_echo(kf.obj, &mut tx);
            super::flush(&mut tx);
            match r {
                Ok(()) => NetfsResult::Done(len as u64),
                Err(_) => NetfsResult::Done(abi::err(errno::EINVAL)),
            }
        }
        #[cfg(feature = "net_dns")]
        KFileKind::Dns => {
            let text = core::str::from_utf8(data).map_err(|_| ()).unwrap_or("");
            let Some(name) = text.trim_end_matches('\n').strip_prefix("query ") else {
                return NetfsResult::Done(abi::err(errno::EINVAL));
            };
            let mut tx = TxBatch::new();
            let r = super::dns::start_query(name.trim(), &mut tx);
            super::flush(&mut tx);
            match r {
                Ok(qidx) => {
                    if kf.obj != 0 {
                        super::dns::release(kf.obj - 1);
                    }
                    kf.obj = qidx + 1;
                    NetfsResult::Done(len as u64)
                }
                Err(_) => NetfsResult::Done(abi::err(errno::EAGAIN)),
            }
        }
        #[cfg(feature = "net_dns")]
        KFileKind::DnsCtl => {
            let text = core::str::from_utf8(data).unwrap_or("");
            let Some(ip) = text.trim_end_matches('\n').strip_prefix("nameserver ") else {
                return NetfsResult::Done(abi::err(errno::EINVAL));
            };
            match Ipv4Address::from_str(ip.trim()) {
                Ok(addr) => {
                    super::dns::set_nameserver(addr);
                    NetfsResult::Done(len as u64)
                }
                Err(()) => NetfsResult::Done(abi::err(errno::EINVAL)),
            }
        }
        _ => NetfsResult::Done(abi::err(errno::EINVAL)),
    }
}

#[cfg(feature = "net_tcp")]
fn tcp_ctl(idx: usize, data: &[u8], len: usize, caller_slot: usize) -> NetfsResult {
    let text = core::str::from_utf8(data).unwrap_or("");
    let text = text.trim_end_matches('\n').trim();

    if let Some(arg) = text.strip_prefix("connect ") {
        let Some((ip, port)) = parse_endpoint(arg) else {
            return NetfsResult::Done(abi::err(errno::EINVAL));
        };
        let mut tx = TxBatch::new();
        let r = super::tcp::connect(idx, ip, port, &mut tx);
        if r.is_ok() {
            // Record the byte count the ctl write reports once the
            // handshake completes, then park the caller.
            scheduler::set_pending_dest(caller_slot, idx, 0, len);
            let parked = super::tcp::add_connect_waiter(idx, caller_slot);
            super::flush(&mut tx);
            if parked {
                return NetfsResult::Blocked;
            }
            return NetfsResult::Done(len as u64);
        }
        super::flush(&mut tx);
        return NetfsResult::Done(abi::err(errno::EINVAL));
    }

    if let Some(arg) = text.strip_prefix("announce ") {
        let Some(port_str) = arg.strip_prefix("*!") else {
            return NetfsResult::Done(abi::err(errno::EINVAL));
        };
        let Ok(port) = port_str.parse() else {
            return NetfsResult::Done(abi::err(errno::EINVAL));
        };
        return match super::tcp::announce(idx, port) {
            Ok(()) => NetfsResult::Done(len as u64),
            Err(_) => NetfsResult::Done(abi::err(errno::EINVAL)),
        };
    }

    NetfsResult::Done(abi::err(errno::EINVAL))
}

#[cfg(feature = "net_udp")]
fn udp_ctl(idx: usize, data: &[u8], len: usize) -> NetfsResult {
    let text = core::str::from_utf8(data).unwrap_or("");
    let text = text.trim_end_matches('\n').trim();

    if let Some(arg) = text.strip_prefix("connect ") {
        let Some((ip, port)) = parse_endpoint(arg) else {
            return NetfsResult::Done(abi::err(errno::EINVAL));
        };
        return match super::udp::connect(idx, ip, port) {
            Ok(()) => NetfsResult::Done(len as u64),
            Err(_) => NetfsResult::Done(abi::err(errno::EINVAL)),
        };
    }
    if let Some(arg) = text.strip_prefix("announce ") {
        let Some(port_str) = arg.strip_prefix("*!") else {
            return NetfsResult::Done(abi::err(errno::EINVAL));
        };
        let Ok(port) = port_str.parse() else {
            return NetfsResult::Done(abi::err(errno::EINVAL));
        };
        return match super::udp::bind(idx, port) {
            Ok(()) => NetfsResult::Done(len as u64),
            Err(_) => NetfsResult::Done(abi::err(errno::EINVAL)),
        };
    }
    NetfsResult::Done(abi::err(errno::EINVAL))
}

#[cfg(feature = "net_icmp")]
fn icmp_ctl(idx: usize, data: &[u8], len: usize) -> NetfsResult {
    let text = core::str::from_utf8(data).unwrap_or("");
    let text = text.trim_end_matches('\n').trim();
    if let Some(arg) = text.strip_prefix("connect ") {
        return match Ipv4Address::from_str(arg.trim()) {
            Ok(ip) => match super::icmp::connect(idx, ip) {
                Ok(()) => NetfsResult::Done(len as u64),
                Err(_) => NetfsResult::Done(abi::err(errno::EINVAL)),
            },
            Err(()) => NetfsResult::Done(abi::err(errno::EINVAL)),
        };
    }
    NetfsResult::Done(abi::err(errno::EINVAL))
}

// ---------------------------------------------------------------------------
// Close
// ---------------------------------------------------------------------------

pub fn retain(kf: &KFile) {
    match kf.kind {
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpClone
        | KFileKind::TcpCtl
        | KFileKind::TcpData
        | KFileKind::TcpStatus
        | KFileKind::TcpLocal
        | KFileKind::TcpRemote
        | KFileKind::TcpListen => super::tcp::retain(kf.obj),
        #[cfg(feature = "net_udp")]
        KFileKind::UdpClone
        | KFileKind::UdpCtl
        | KFileKind::UdpData
        | KFileKind::UdpStatus
        | KFileKind::UdpLocal
        | KFileKind::UdpRemote => super::udp::retain(kf.obj),
        #[cfg(feature = "net_icmp")]
        KFileKind::IcmpClone | KFileKind::IcmpCtl | KFileKind::IcmpData | KFileKind::IcmpStatus => {
            super::icmp::retain(kf.obj)
        }
        #[cfg(feature = "net_dns")]
        KFileKind::Dns => {
            if kf.obj != 0 {
                super::dns::retain(kf.obj - 1);
            }
        }
        _ => {}
    }
}

pub fn release(kf: &KFile) {
    match kf.kind {
        #[cfg(feature = "net_tcp")]
        KFileKind::TcpClone
        | KFileKind::TcpCtl
        | KFileKind::TcpData
        | KFileKind::TcpStatus
        | KFileKind::TcpLocal
        | KFileKind::TcpRemote
        | KFileKind::TcpListen => {
            let mut tx = TxBatch::new();
            super::tcp::release(kf.obj, &mut tx);
            super::flush(&mut tx);
        }
        #[cfg(feature = "net_udp")]
        KFileKind::UdpClone
        | KFileKind::UdpCtl
        | KFileKind::UdpData
        | KFileKind::UdpStatus
        | KFileKind::UdpLocal
        | KFileKind::UdpRemote => super::udp::release(kf.obj),
        #[cfg(feature = "net_icmp")]
        KFileKind::IcmpClone | KFileKind::IcmpCtl | KFileKind::IcmpData | KFileKind::IcmpStatus => {
            super::icmp::release(kf.obj)
        }
        #[cfg(feature = "net_dns")]
        KFileKind::Dns => {
            if kf.obj != 0 {
                super::dns::release(kf.obj - 1);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("10.0.0.2!7\n"),
            Some((Ipv4Address::new(10, 0, 0, 2), 7))
        );
        assert_eq!(parse_endpoint("10.0.0.2"), None);
        assert_eq!(parse_endpoint("nonsense!x"), None);
    }

    #[test]
    fn index_formatting() {
        let mut buf = [0u8; 16];
        let n = format_index(&mut buf, 1);
        assert_eq!(&buf[..n], b"1\n");
    }
}
