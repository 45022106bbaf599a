//! Kernel-backed virtual files
//!
//! Everything a namespace resolves in-kernel ends up as a `KFile`: a
//! kind tag plus per-fd state (object index, read offset, one-shot
//! flag). Dispatch fans out to netfs, procfs, the initrd, `/dev/time`,
//! and the kernel log.

use core::fmt::Write;

use crate::abi::{self, errno, Stat};
use crate::logger::BufWriter;
use crate::mm::paging;
use crate::net::netfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KFileKind {
    InitrdFile,
    ProcDir,
    ProcStatus,
    ProcCtl,
    ProcMeminfo,
    DevTime,
    Klog,
    TcpClone,
    TcpCtl,
    TcpData,
    TcpStatus,
    TcpLocal,
    TcpRemote,
    TcpListen,
    UdpClone,
    UdpCtl,
    UdpData,
    UdpStatus,
    UdpLocal,
    UdpRemote,
    IcmpClone,
    IcmpCtl,
    IcmpData,
    IcmpStatus,
    Dns,
    DnsCtl,
    DnsCache,
}

/// One virtual-file fd: the kind, an object index (connection slot,
/// initrd entry, target pid), a byte offset, and the one-shot flag for
/// synthesized text files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KFile {
    pub kind: KFileKind,
    pub obj: usize,
    pub offset: u64,
    pub read_done: bool,
}

impl KFile {
    pub const fn new(kind: KFileKind, obj: usize) -> Self {
        Self {
            kind,
            obj,
            offset: 0,
            read_done: false,
        }
    }

    fn is_net(&self) -> bool {
        matches!(
            self.kind,
            KFileKind::TcpClone
                | KFileKind::TcpCtl
                | KFileKind::TcpData
                | KFileKind::TcpStatus
                | KFileKind::TcpLocal
                | KFileKind::TcpRemote
                | KFileKind::TcpListen
                | KFileKind::UdpClone
                | KFileKind::UdpCtl
                | KFileKind::UdpData
                | KFileKind::UdpStatus
                | KFileKind::UdpLocal
                | KFileKind::UdpRemote
                | KFileKind::IcmpClone
                | KFileKind::IcmpCtl
                | KFileKind::IcmpData
                | KFileKind::IcmpStatus
                | KFileKind::Dns
                | KFileKind::DnsCtl
                | KFileKind::DnsCache
        )
    }
}

/// Outcome of a virtual-file operation at the syscall layer.
pub enum KfResult {
    Done(u64),
    /// The resource registered and blocked the caller; the dispatcher
    /// just yields.
    Blocked,
}

/// Resolve a kernel-internal path.
pub fn open(path: &str) -> Result<KFile, i32> {
    if path.starts_with("/net") {
        return netfs::open(path);
    }
    #[cfg(feature = "fs_procfs")]
    if path.starts_with("/proc") {
        return super::procfs::open(path);
    }
    if path == "/dev/time" {
        return Ok(KFile::new(KFileKind::DevTime, 0));
    }
    if path == "/dev/klog" {
        return Ok(KFile::new(KFileKind::Klog, 0));
    }
    #[cfg(feature = "fs_initrd")]
    if let Some(name) = path.strip_prefix("/boot/") {
        let entry = super::initrd::lookup_index(name).ok_or(errno::ENOENT)?;
        return Ok(KFile::new(KFileKind::InitrdFile, entry));
    }
    Err(errno::ENOENT)
}

/// Copy already-synthesized text out to the user, honoring the request
/// length.
fn copy_text(pml4: u64, buf: u64, len: usize, text: &[u8]) -> u64 {
    let n = text.len().min(len);
    match paging::copy_to_address_space(pml4, buf, &text[..n]) {
        Ok(()) => n as u64,
        Err(_) => abi::err(errno::EFAULT),
    }
}

pub fn read(kf: &mut KFile, pml4: u64, buf: u64, len: usize, caller_slot: usize) -> KfResult {
    if kf.is_net() {
        return match netfs::read(kf, pml4, buf, len, caller_slot) {
            netfs::NetfsResult::Done(v) => KfResult::Done(v),
            netfs::NetfsResult::Blocked => KfResult::Blocked,
            netfs::NetfsResult::Text(text, n) => {
                KfResult::Done(copy_text(pml4, buf, len, &text[..n]))
            }
        };
    }

    match kf.kind {
        #[cfg(feature = "fs_initrd")]
        KFileKind::InitrdFile => {
            let Some(data) = super::initrd::entry_data(kf.obj) else {
                return KfResult::Done(abi::err(errno::EIO));
            };
            let start = (kf.offset as usize).min(data.len());
            let n = (data.len() - start).min(len);
            match paging::copy_to_address_space(pml4, buf, &data[start..start + n]) {
                Ok(()) => {
                    kf.offset += n as u64;
                    KfResult::Done(n as u64)
                }
                Err(_) => KfResult::Done(abi::err(errno::EFAULT)),
            }
        }
        #[cfg(feature = "fs_procfs")]
        KFileKind::ProcDir | KFileKind::ProcStatus | KFileKind::ProcMeminfo => {
            if kf.read_done {
                return KfResult::Done(0);
            }
            kf.read_done = true;
            let mut text = [0u8; 2048];
            let n = super::procfs::synthesize(kf.kind, kf.obj, &mut text);
            KfResult::Done(copy_text(pml4, buf, len, &text[..n]))
        }
        KFileKind::DevTime => {
            if kf.read_done {
                return KfResult::Done(0);
            }
            kf.read_done = true;
            let mut text = [0u8; 64];
            let n = {
                let mut w = BufWriter::new(&mut text);
                let uptime = crate::logger::boot_time_us() / 1_000_000;
                // No RTC in scope: epoch seconds count from boot.
                let _ = write!(w, "{} {}\n", uptime, uptime);
                w.len()
            };
            KfResult::Done(copy_text(pml4, buf, len, &text[..n]))
        }
        KFileKind::Klog => {
            let mut chunk = [0u8; 1024];
            let n = crate::logger::klog_read(kf.offset, &mut chunk[..len.min(1024)]);
            if n == 0 {
                return KfResult::Done(0);
            }
            kf.offset += n as u64;
            KfResult::Done(copy_text(pml4, buf, len, &chunk[..n]))
        }
        _ => KfResult::Done(abi::err(errno::EINVAL)),
    }
}

pub fn write(
    kf: &mut KFile,
    pml4: u64,
    buf: u64,
    len: usize,
    caller_slot: usize,
) -> KfResult {
    // Stage the written bytes: ctl files take short text commands, UDP
    // data takes up to one unfragmented datagram. TCP streams bypass
    // this and pull straight from the user buffer.
    let mut data = [0u8; 1494];
    let staged = len.min(data.len());
    if paging::copy_from_address_space(pml4, buf, &mut data[..staged]).is_err() {
        return KfResult::Done(abi::err(errno::EFAULT));
    }

    if kf.is_net() {
        return match netfs::write(kf, pml4, buf, len, &data[..staged], caller_slot) {
            netfs::NetfsResult::Done(v) => KfResult::Done(v),
            netfs::NetfsResult::Blocked => KfResult::Blocked,
            netfs::NetfsResult::Text(..) => KfResult::Done(abi::err(errno::EINVAL)),
        };
    }

    match kf.kind {
        #[cfg(feature = "fs_procfs")]
        KFileKind::ProcCtl => {
            KfResult::Done(super::procfs::ctl_write(kf.obj, &data[..staged], len))
        }
        // /boot and the synthesized files are read-only.
        _ => KfResult::Done(abi::err(errno::EINVAL)),
    }
}

/// Synthesize a stat record: content length for sized files, zero for
/// streams.
pub fn fstat(kf: &KFile) -> Stat {
    let mut st = Stat::zeroed();
    match kf.kind {
        #[cfg(feature = "fs_initrd")]
        KFileKind::InitrdFile => {
            if let Some(data) = super::initrd::entry_data(kf.obj) {
                st.size = data.len() as u64;
            }
        }
        KFileKind::ProcDir => {
            st.file_type = abi::file_type::DIRECTORY;
            st.mode = 0o555;
        }
        _ => {}
    }
    st
}

pub fn retain(kf: &KFile) {
    if kf.is_net() {
        netfs::retain(kf);
    }
}

pub fn release(kf: &KFile) {
    if kf.is_net() {
        netfs::release(kf);
    }
}
