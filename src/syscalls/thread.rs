//! Thread syscalls: clone, futex, arch_prctl

use crate::abi::{self, errno, futex_op};
use crate::futex;
use crate::process::table;
use crate::process::{group, Process, ProcessState};

use super::process::ensure_thread_group;
use super::types;

fn ret(r: Result<u64, i32>) -> u64 {
    match r {
        Ok(v) => v,
        Err(e) => abi::err(e),
    }
}

/// POSIX-thread style clone: a sibling in the caller's thread group
/// (created on first use) sharing page tables, fds, and namespace. The
/// child resumes at the caller's return point with value 0, on the
/// stack the caller provided.
pub fn clone(stack_top: u64, tls: u64, ctid_ptr: u64, ptid_ptr: u64, _flags: u64) -> u64 {
    let r = (|| {
        let slot = table::current().ok_or(errno::EINVAL)?;
        let parent = table::get(slot).ok_or(errno::EINVAL)?;
        if stack_top == 0 || !types::user_buffer_in_range(stack_top - 16, 16) {
            return Err(errno::EINVAL);
        }

        let gid = ensure_thread_group(slot)?;
        group::add_ref(gid);

        let mut child = Process::empty();
        child.ppid = parent.pid;
        child.state = ProcessState::New;
        child.group = Some(gid);
        child.pml4 = 0;
        child.uid = parent.uid;
        child.fs_base = if tls != 0 { tls } else { parent.fs_base };
        child.ctx = parent.ctx;
        child.ctx.rsp = stack_top;
        child.syscall_ret = 0; // child's clone returns 0
        child.clear_child_tid = ctid_ptr;

        let (child_slot, child_pid) = table::alloc_slot(child).ok_or_else(|| {
            // The caller still holds its own reference, so the group
            // cannot die from dropping the child's.
            let _ = group::release(gid);
            errno::EAGAIN
        })?;

        if ptid_ptr != 0 {
            types::write_u64(slot, ptid_ptr, child_pid)?;
        }

        table::with_slot(child_slot, |p| p.state = ProcessState::Ready);
        Ok(child_pid)
    })();
    ret(r)
}

/// FUTEX_WAIT / FUTEX_WAKE keyed on (address-space identity, address).
pub fn futex_syscall(addr: u64, op: u64, val: u64, timeout_ms: u64) -> u64 {
    let Some(slot) = table::current() else {
        return abi::err(errno::EINVAL);
    };
    if addr == 0 || addr % 4 != 0 || !types::user_buffer_in_range(addr, 4) {
        return abi::err(errno::EFAULT);
    }
    let space = table::address_space_id(slot);

    match op {
        futex_op::FUTEX_WAIT => match futex::wait(space, addr, val as u32, timeout_ms, slot) {
            futex::WaitOutcome::Mismatch => abi::err(errno::EAGAIN),
            futex::WaitOutcome::Blocked => 0,
            futex::WaitOutcome::NoSpace => abi::err(errno::EAGAIN),
            futex::WaitOutcome::Fault => abi::err(errno::EFAULT),
        },
        futex_op::FUTEX_WAKE => futex::wake(space, addr, val as u32),
        _ => abi::err(errno::ENOSYS),
    }
}

const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;

pub fn arch_prctl(op: u64, addr: u64) -> u64 {
    let r = (|| {
        let slot = table::current().ok_or(errno::EINVAL)?;
        match op {
            ARCH_SET_FS => {
                if !types::user_buffer_in_range(addr, 0) {
                    return Err(errno::EFAULT);
                }
                table::with_slot(slot, |p| p.fs_base = addr);
                crate::arch::set_fs_base(addr);
                Ok(0)
            }
            ARCH_GET_FS => {
                let base = table::get(slot).map(|p| p.fs_base).unwrap_or(0);
                types::write_u64(slot, addr, base)?;
                Ok(0)
            }
            _ => Err(errno::EINVAL),
        }
    })();
    ret(r)
}
