//! File I/O syscalls
//!
//! open/create/read/write/close/stat/seek/remove/rename/truncate/wstat
//! plus the positional and fd-duplication variants. Every path goes
//! through the caller's namespace: kernel prefixes are served inline,
//! everything else becomes an IPC request to the owning server and the
//! caller sleeps until the reply.

use crate::abi::{self, errno, ipc_tag, open_flags, seek, Stat, IPC_DATA_MAX};
use crate::fs::fd::{self, FdEntry};
use crate::fs::kfile::{self, KfResult};
use crate::fs::ns::{self, Resolved};
use crate::ipc::{self, SendOutcome};
use crate::process::table;
use crate::process::IpcCont;

use super::types::{self, PATH_MAX};

fn current_slot() -> Result<usize, i32> {
    table::current().ok_or(errno::EINVAL)
}

fn ret(r: Result<u64, i32>) -> u64 {
    match r {
        Ok(v) => v,
        Err(e) => abi::err(e),
    }
}

/// Store a possibly mutated kernel-file entry back into the table.
fn store_kfile(rslot: usize, fdn: usize, kf: kfile::KFile) {
    fd::with_table(rslot, |t| {
        if let Some(FdEntry::Kernel(entry)) = t.get_mut(fdn) {
            *entry = kf;
        }
    });
}

// ---------------------------------------------------------------------------
// open / create
// ---------------------------------------------------------------------------

fn open_common(path_ptr: u64, path_len: u64, create_flags: Option<u64>) -> Result<u64, i32> {
    let slot = current_slot()?;
    let rslot = table::resource_slot(slot);
    let mut path_buf = [0u8; PATH_MAX];
    let path = types::read_path(slot, path_ptr, path_len as usize, &mut path_buf)?;

    match ns::with_ns(rslot, |n| n.resolve(path)) {
        Resolved::Kernel => {
            if create_flags.is_some() {
                // Kernel trees are not writable namespaces.
                return Err(errno::EINVAL);
            }
            let kf = kfile::open(path)?;
            match fd::with_table(rslot, |t| t.alloc(FdEntry::Kernel(kf))) {
                Some(fdn) => Ok(fdn as u64),
                None => {
                    kfile::release(&kf);
                    Err(errno::EMFILE)
                }
            }
        }
        Resolved::Channel { chan, remainder } => {
            let rest = &path[remainder..];
            let (op, cont) = match create_flags {
                None => (ipc_tag::T_OPEN, IpcCont::Open { chan }),
                Some(_) => (ipc_tag::T_CREATE, IpcCont::Open { chan }),
            };
            let outcome = ipc::send_request(chan, slot, op, cont, |msg| {
                let mut at = 0;
                if let Some(flags) = create_flags {
                    msg.data[..4].copy_from_slice(&(flags as u32).to_le_bytes());
                    at = 4;
                }
                let n = rest.len().min(IPC_DATA_MAX - at);
                msg.data[at..at + n].copy_from_slice(&rest.as_bytes()[..n]);
                msg.data_len = (at + n) as u32;
            });
            match outcome {
                SendOutcome::Blocked => Ok(0),
                SendOutcome::Done(v) => Ok(v),
            }
        }
        Resolved::NotFound => Err(errno::ENOENT),
    }
}

pub fn open(path_ptr: u64, path_len: u64) -> u64 {
    ret(open_common(path_ptr, path_len, None))
}

pub fn create(path_ptr: u64, path_len: u64, flags: u64) -> u64 {
    if flags & !(open_flags::O_DIR | open_flags::O_APPEND) != 0 {
        return abi::err(errno::EINVAL);
    }
    ret(open_common(path_ptr, path_len, Some(flags)))
}

// ---------------------------------------------------------------------------
// read / write
// ---------------------------------------------------------------------------

fn read_common(fdn: u64, buf: u64, len: u64, offset: Option<u64>) -> Result<u64, i32> {
    let slot = current_slot()?;
    let rslot = table::resource_slot(slot);
    let fdn = fdn as usize;
    let len = len as usize;
    if !types::user_buffer_in_range(buf, len) {
        return Err(errno::EFAULT);
    }
    let pml4 = table::pml4_of(slot);

    let entry = fd::with_table(rslot, |t| t.get(fdn)).ok_or(errno::EBADF)?;
    match entry {
        FdEntry::Kernel(mut kf) => {
            if let Some(off) = offset {
                // Positional read: do not disturb the stored offset.
                let mut probe = kf;
                probe.offset = off;
                probe.read_done = false;
                return match kfile::read(&mut probe, pml4, buf, len, slot) {
                    KfResult::Done(v) => Ok(v),
                    KfResult::Blocked => Ok(0),
                };
            }
            match kfile::read(&mut kf, pml4, buf, len, slot) {
                KfResult::Done(v) => {
                    store_kfile(rslot, fdn, kf);
                    Ok(v)
                }
                KfResult::Blocked => {
                    store_kfile(rslot, fdn, kf);
                    Ok(0)
                }
            }
        }
        FdEntry::PipeRead { pipe } => {
            match crate::ipc::pipe::read(pipe, pml4, buf, len, slot) {
                crate::ipc::pipe::IoOutcome::Done(v) => Ok(v),
                crate::ipc::pipe::IoOutcome::Blocked => Ok(0),
            }
        }
        FdEntry::PipeWrite { .. } => Err(errno::EBADF),
        FdEntry::ChannelClient { chan, handle, offset: foff } => {
            let off = offset.unwrap_or(foff);
            let count = len.min(IPC_DATA_MAX) as u32;
            let cont = if offset.is_some() {
                // pread leaves the fd offset alone; reuse the read
                // continuation with an out-of-table fd index.
                IpcCont::Read { buf, len, fd: usize::MAX }
            } else {
                IpcCont::Read { buf, len, fd: fdn }
            };
            let outcome = ipc::send_request(chan, slot, ipc_tag::T_READ, cont, |msg| {
                msg.data[..4].copy_from_slice(&handle.to_le_bytes());
                msg.data[4..8].copy_from_slice(&count.to_le_bytes());
                msg.data[8..16].copy_from_slice(&off.to_le_bytes());
                msg.data_len = 16;
            });
            match outcome {
                SendOutcome::Blocked => Ok(0),
                SendOutcome::Done(v) => Ok(v),
            }
        }
        FdEntry::ChannelServer { .. } => Err(errno::EBADF),
    }
}

pub fn read(fdn: u64, buf: u64, len: u64) -> u64 {
    ret(read_common(fdn, buf, len, None))
}

pub fn pread(fdn: u64, buf: u64, len: u64, offset: u64) -> u64 {
    ret(read_common(fdn, buf, len, Some(offset)))
}

fn write_common(fdn: u64, buf: u64, len: u64, offset: Option<u64>) -> Result<u64, i32> {
    let slot = current_slot()?;
    let rslot = table::resource_slot(slot);
    let fdn = fdn as usize;
    let len = len as usize;
    if !types::user_buffer_in_range(buf, len) {
        return Err(errno::EFAULT);
    }
    let pml4 = table::pml4_of(slot);

    let entry = fd::with_table(rslot, |t| t.get(fdn)).ok_or(errno::EBADF)?;
    match entry {
        FdEntry::Kernel(mut kf) => {
            let r = match kfile::write(&mut kf, pml4, buf, len, slot) {
                KfResult::Done(v) => v,
                KfResult::Blocked => 0,
            };
            store_kfile(rslot, fdn, kf);
            Ok(r)
        }
        FdEntry::PipeWrite { pipe } => {
            match crate::ipc::pipe::write(pipe, pml4, buf, len, slot) {
                crate::ipc::pipe::IoOutcome::Done(v) => Ok(v),
                crate::ipc::pipe::IoOutcome::Blocked => Ok(0),
            }
        }
        FdEntry::PipeRead { .. } => Err(errno::EBADF),
        FdEntry::ChannelClient { chan, handle, offset: foff } => {
            let off = offset.unwrap_or(foff);
            let data_len = len.min(IPC_DATA_MAX - 16);
            let mut staged = [0u8; IPC_DATA_MAX];
            types::copy_in(slot, buf, &mut staged[..data_len])?;
            let cont = if offset.is_some() {
                IpcCont::Write { fd: usize::MAX }
            } else {
                IpcCont::Write { fd: fdn }
            };
            let outcome = ipc::send_request(chan, slot, ipc_tag::T_WRITE, cont, |msg| {
                msg.data[..4].copy_from_slice(&handle.to_le_bytes());
                msg.data[4..8].copy_from_slice(&[0; 4]);
                msg.data[8..16].copy_from_slice(&off.to_le_bytes());
                msg.data[16..16 + data_len].copy_from_slice(&staged[..data_len]);
                msg.data_len = (16 + data_len) as u32;
            });
            match outcome {
                SendOutcome::Blocked => Ok(0),
                SendOutcome::Done(v) => Ok(v),
            }
        }
        FdEntry::ChannelServer { .. } => Err(errno::EBADF),
    }
}

pub fn write(fdn: u64, buf: u64, len: u64) -> u64 {
    ret(write_common(fdn, buf, len, None))
}

pub fn pwrite(fdn: u64, buf: u64, len: u64, offset: u64) -> u64 {
    ret(write_common(fdn, buf, len, Some(offset)))
}

// ---------------------------------------------------------------------------
// stat / seek / close
// ---------------------------------------------------------------------------

pub fn stat(fdn: u64, statbuf: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        if !types::user_buffer_in_range(statbuf, core::mem::size_of::<Stat>()) {
            return Err(errno::EFAULT);
        }
        let entry = fd::with_table(rslot, |t| t.get(fdn as usize)).ok_or(errno::EBADF)?;
        match entry {
            FdEntry::Kernel(kf) => {
                let st = kfile::fstat(&kf);
                let bytes = unsafe {
                    core::slice::from_raw_parts(
                        &st as *const Stat as *const u8,
                        core::mem::size_of::<Stat>(),
                    )
                };
                types::copy_out(slot, statbuf, bytes)?;
                Ok(0)
            }
            FdEntry::PipeRead { .. } | FdEntry::PipeWrite { .. } => {
                let st = Stat::zeroed();
                let bytes = unsafe {
                    core::slice::from_raw_parts(
                        &st as *const Stat as *const u8,
                        core::mem::size_of::<Stat>(),
                    )
                };
                types::copy_out(slot, statbuf, bytes)?;
                Ok(0)
            }
            FdEntry::ChannelClient { chan, handle, .. } => {
                let outcome = ipc::send_request(
                    chan,
                    slot,
                    ipc_tag::T_STAT,
                    IpcCont::Stat { buf: statbuf },
                    |msg| {
                        msg.data[..4].copy_from_slice(&handle.to_le_bytes());
                        msg.data_len = 4;
                    },
                );
                match outcome {
                    SendOutcome::Blocked => Ok(0),
                    SendOutcome::Done(v) => Ok(v),
                }
            }
            FdEntry::ChannelServer { .. } => Err(errno::EBADF),
        }
    })();
    ret(r)
}

pub fn seek(fdn: u64, off: u64, whence: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        let fdn = fdn as usize;
        fd::with_table(rslot, |t| {
            let entry = t.get_mut(fdn).ok_or(errno::EBADF)?;
            match entry {
                FdEntry::Kernel(kf) => {
                    let size = kfile::fstat(kf).size;
                    let new = seek_target(kf.offset, size, off, whence)?;
                    kf.offset = new;
                    kf.read_done = false;
                    Ok(new)
                }
                FdEntry::ChannelClient { offset, .. } => {
                    let new = seek_target(*offset, 0, off, whence)?;
                    *offset = new;
                    Ok(new)
                }
                _ => Err(errno::EINVAL),
            }
        })
    })();
    ret(r)
}

fn seek_target(current: u64, size: u64, off: u64, whence: u64) -> Result<u64, i32> {
    let delta = off as i64;
    let base = match whence {
        seek::SET => 0i64,
        seek::CUR => current as i64,
        seek::END => size as i64,
        _ => return Err(errno::EINVAL),
    };
    let target = base.checked_add(delta).ok_or(errno::EINVAL)?;
    if target < 0 {
        return Err(errno::EINVAL);
    }
    Ok(target as u64)
}

pub fn close(fdn: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        let entry = fd::with_table(rslot, |t| t.take(fdn as usize)).ok_or(errno::EBADF)?;
        fd::release_entry(&entry);
        Ok(0)
    })();
    ret(r)
}

// ---------------------------------------------------------------------------
// remove / rename / truncate / wstat
// ---------------------------------------------------------------------------

fn path_request(path_ptr: u64, path_len: u64, op: u32) -> Result<u64, i32> {
    let slot = current_slot()?;
    let rslot = table::resource_slot(slot);
    let mut path_buf = [0u8; PATH_MAX];
    let path = types::read_path(slot, path_ptr, path_len as usize, &mut path_buf)?;

    match ns::with_ns(rslot, |n| n.resolve(path)) {
        Resolved::Kernel => Err(errno::EINVAL),
        Resolved::Channel { chan, remainder } => {
            let rest = &path[remainder..];
            let outcome = ipc::send_request(chan, slot, op, IpcCont::Simple, |msg| {
                let n = rest.len().min(IPC_DATA_MAX);
                msg.data[..n].copy_from_slice(&rest.as_bytes()[..n]);
                msg.data_len = n as u32;
            });
            match outcome {
                SendOutcome::Blocked => Ok(0),
                SendOutcome::Done(v) => Ok(v),
            }
        }
        Resolved::NotFound => Err(errno::ENOENT),
    }
}

pub fn remove(path_ptr: u64, path_len: u64) -> u64 {
    ret(path_request(path_ptr, path_len, ipc_tag::T_REMOVE))
}

pub fn rename(old_ptr: u64, old_len: u64, new_ptr: u64, new_len: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        let mut old_buf = [0u8; PATH_MAX];
        let mut new_buf = [0u8; PATH_MAX];
        let old = types::read_path(slot, old_ptr, old_len as usize, &mut old_buf)?;
        let new = types::read_path(slot, new_ptr, new_len as usize, &mut new_buf)?;

        match ns::with_ns(rslot, |n| n.resolve(old)) {
            Resolved::Kernel => Err(errno::EINVAL),
            Resolved::Channel { chan, remainder } => {
                let old_rest = &old[remainder..];
                // The new name goes to the same server, stripped of the
                // same mount prefix when it matches.
                let new_rest = match ns::with_ns(rslot, |n| n.resolve(new)) {
                    Resolved::Channel { chan: c2, remainder: r2 } if c2 == chan => &new[r2..],
                    _ => return Err(errno::EINVAL),
                };
                let outcome =
                    ipc::send_request(chan, slot, ipc_tag::T_RENAME, IpcCont::Simple, |msg| {
                        let ol = old_rest.len().min(256) as u32;
                        msg.data[..4].copy_from_slice(&ol.to_le_bytes());
                        msg.data[4..4 + ol as usize]
                            .copy_from_slice(&old_rest.as_bytes()[..ol as usize]);
                        let at = 4 + ol as usize;
                        let nl = new_rest.len().min(IPC_DATA_MAX - at);
                        msg.data[at..at + nl].copy_from_slice(&new_rest.as_bytes()[..nl]);
                        msg.data_len = (at + nl) as u32;
                    });
                match outcome {
                    SendOutcome::Blocked => Ok(0),
                    SendOutcome::Done(v) => Ok(v),
                }
            }
            Resolved::NotFound => Err(errno::ENOENT),
        }
    })();
    ret(r)
}

pub fn truncate(fdn: u64, size: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        let entry = fd::with_table(rslot, |t| t.get(fdn as usize)).ok_or(errno::EBADF)?;
        match entry {
            FdEntry::ChannelClient { chan, handle, .. } => {
                let outcome =
                    ipc::send_request(chan, slot, ipc_tag::T_TRUNCATE, IpcCont::Simple, |msg| {
                        msg.data[..4].copy_from_slice(&handle.to_le_bytes());
                        msg.data[4..8].copy_from_slice(&[0; 4]);
                        msg.data[8..16].copy_from_slice(&size.to_le_bytes());
                        msg.data_len = 16;
                    });
                match outcome {
                    SendOutcome::Blocked => Ok(0),
                    SendOutcome::Done(v) => Ok(v),
                }
            }
            _ => Err(errno::EINVAL),
        }
    })();
    ret(r)
}

pub fn wstat(fdn: u64, mode: u64, uid: u64, gid: u64, mask: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        let entry = fd::with_table(rslot, |t| t.get(fdn as usize)).ok_or(errno::EBADF)?;
        match entry {
            FdEntry::ChannelClient { chan, handle, .. } => {
                let outcome =
                    ipc::send_request(chan, slot, ipc_tag::T_WSTAT, IpcCont::Simple, |msg| {
                        msg.data[..4].copy_from_slice(&handle.to_le_bytes());
                        msg.data[4..8].copy_from_slice(&(mode as u32).to_le_bytes());
                        msg.data[8..10].copy_from_slice(&(uid as u16).to_le_bytes());
                        msg.data[10..12].copy_from_slice(&(gid as u16).to_le_bytes());
                        msg.data[12..16].copy_from_slice(&(mask as u32).to_le_bytes());
                        msg.data_len = 16;
                    });
                match outcome {
                    SendOutcome::Blocked => Ok(0),
                    SendOutcome::Done(v) => Ok(v),
                }
            }
            _ => Err(errno::EINVAL),
        }
    })();
    ret(r)
}

// ---------------------------------------------------------------------------
// dup
// ---------------------------------------------------------------------------

pub fn dup(fdn: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        fd::with_table(rslot, |t| {
            let entry = t.get(fdn as usize).ok_or(errno::EBADF)?;
            let new = t.alloc(entry).ok_or(errno::EMFILE)?;
            fd::retain_entry(&entry);
            Ok(new as u64)
        })
    })();
    ret(r)
}

pub fn dup2(old: u64, new: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        if new as usize >= fd::NOFILE {
            return Err(errno::EBADF);
        }
        if old == new {
            fd::with_table(rslot, |t| t.get(old as usize)).ok_or(errno::EBADF)?;
            return Ok(new);
        }
        let (entry, displaced) = fd::with_table(rslot, |t| {
            let entry = t.get(old as usize).ok_or(errno::EBADF)?;
            fd::retain_entry(&entry);
            Ok::<_, i32>((entry, t.install_at(new as usize, entry)))
        })?;
        let _ = entry;
        if let Some(prev) = displaced {
            fd::release_entry(&prev);
        }
        Ok(new)
    })();
    ret(r)
}
