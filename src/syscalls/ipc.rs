//! IPC syscalls: pipe, ipc_pair, ipc_recv, ipc_reply, mount, unmount

use crate::abi::{self, errno, IpcMessage, IPC_DATA_MAX, IPC_HEADER_SIZE};
use crate::fs::fd::{self, FdEntry};
use crate::fs::ns;
use crate::ipc::{self, SendOutcome};
use crate::process::table;

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

/// Allocate a pipe and install both ends; writes the two fds as u32s.
pub fn pipe(out_ptr: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        if !types::user_buffer_in_range(out_ptr, 8) {
            return Err(errno::EFAULT);
        }
        let id = crate::ipc::pipe::alloc().ok_or(errno::EAGAIN)?;
        let fds = fd::with_table(rslot, |t| {
            let rfd = t.alloc(FdEntry::PipeRead { pipe: id })?;
            let wfd = match t.alloc(FdEntry::PipeWrite { pipe: id }) {
                Some(w) => w,
                None => {
                    t.take(rfd);
                    return None;
                }
            };
            Some((rfd, wfd))
        });
        let Some((rfd, wfd)) = fds else {
            crate::ipc::pipe::release_reader(id);
            crate::ipc::pipe::release_writer(id);
            return Err(errno::EMFILE);
        };
        types::write_u32(slot, out_ptr, rfd as u32)?;
        types::write_u32(slot, out_ptr + 4, wfd as u32)?;
        Ok(0)
    })();
    ret(r)
}

/// Allocate a channel; out[0] = server fd, out[1] = client fd.
pub fn ipc_pair(out_ptr: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        if !types::user_buffer_in_range(out_ptr, 8) {
            return Err(errno::EFAULT);
        }
        let pid = table::current_pid().unwrap_or(0);
        let chan = ipc::alloc(pid).ok_or(errno::EAGAIN)?;
        let fds = fd::with_table(rslot, |t| {
            let sfd = t.alloc(FdEntry::ChannelServer { chan })?;
            let cfd = match t.alloc(FdEntry::ChannelClient {
                chan,
                handle: 0,
                offset: 0,
            }) {
                Some(c) => c,
                None => {
                    t.take(sfd);
                    return None;
                }
            };
            Some((sfd, cfd))
        });
        let Some((sfd, cfd)) = fds else {
            ipc::release_server(chan);
            ipc::release_client(chan);
            return Err(errno::EMFILE);
        };
        types::write_u32(slot, out_ptr, sfd as u32)?;
        types::write_u32(slot, out_ptr + 4, cfd as u32)?;
        Ok(0)
    })();
    ret(r)
}

/// Block until a client request arrives on the server fd and copy it
/// (with its routing tag) into the caller's message buffer.
pub fn ipc_recv(fdn: u64, msg_ptr: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        let size = IPC_HEADER_SIZE + IPC_DATA_MAX;
        if !types::user_buffer_in_range(msg_ptr, size) {
            return Err(errno::EFAULT);
        }
        let entry = fd::with_table(rslot, |t| t.get(fdn as usize)).ok_or(errno::EBADF)?;
        let FdEntry::ChannelServer { chan } = entry else {
            return Err(errno::EBADF);
        };
        match ipc::recv(chan, slot, msg_ptr, size) {
            SendOutcome::Done(v) => Ok(v),
            SendOutcome::Blocked => Ok(0),
        }
    })();
    ret(r)
}

/// Deliver a reply to the client whose routing tag the message echoes.
pub fn ipc_reply(fdn: u64, msg_ptr: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        let entry = fd::with_table(rslot, |t| t.get(fdn as usize)).ok_or(errno::EBADF)?;
        let FdEntry::ChannelServer { chan } = entry else {
            return Err(errno::EBADF);
        };

        let mut header = [0u8; IPC_HEADER_SIZE];
        types::copy_in(slot, msg_ptr, &mut header)?;
        let mut msg = IpcMessage::empty();
        msg.tag = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        msg.data_len =
            u32::from_le_bytes([header[4], header[5], header[6], header[7]]).min(IPC_DATA_MAX as u32);
        let len = msg.data_len as usize;
        if len > 0 {
            let data_ptr = msg_ptr + IPC_HEADER_SIZE as u64;
            types::copy_in(slot, data_ptr, &mut msg.data[..len])?;
        }
        Ok(ipc::reply(chan, &msg))
    })();
    ret(r)
}

/// Attach a channel client fd at a path prefix in the caller's
/// namespace.
pub fn mount(fdn: u64, path_ptr: u64, path_len: u64, flags: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        let mut path_buf = [0u8; PATH_MAX];
        let path = types::read_path(slot, path_ptr, path_len as usize, &mut path_buf)?;
        if !path.starts_with('/') {
            return Err(errno::EINVAL);
        }
        let entry = fd::with_table(rslot, |t| t.get(fdn as usize)).ok_or(errno::EBADF)?;
        let FdEntry::ChannelClient { chan, .. } = entry else {
            return Err(errno::EBADF);
        };
        // The mount holds its own client reference, dropped at unmount.
        ipc::retain_client(chan);
        let ok = ns::with_ns(rslot, |n| n.mount(path, chan, flags as u32));
        if ok.is_err() {
            ipc::release_client(chan);
            return Err(errno::EMFILE);
        }
        Ok(0)
    })();
    ret(r)
}

/// `bind` shares mount's mechanics: attach an existing channel under a
/// second prefix.
pub fn bind(fdn: u64, path_ptr: u64, path_len: u64, flags: u64) -> u64 {
    mount(fdn, path_ptr, path_len, flags)
}

pub fn unmount(path_ptr: u64, path_len: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);
        let mut path_buf = [0u8; PATH_MAX];
        let path = types::read_path(slot, path_ptr, path_len as usize, &mut path_buf)?;
        match ns::with_ns(rslot, |n| n.unmount(path)) {
            Some(chan) => {
                ipc::release_client(chan);
                Ok(0)
            }
            None => Err(errno::ENOENT),
        }
    })();
    ret(r)
}
