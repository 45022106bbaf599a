//! System syscalls: sysinfo, klog, shutdown

use crate::abi::{self, errno};
use crate::mm::{pmm, PAGE_SIZE};
use crate::process::table;
use crate::smp;

use super::types;

/// Layout written by sysinfo; userland sees four u64s.
#[repr(C)]
struct SysInfo {
    total_pages: u64,
    free_pages: u64,
    page_size: u64,
    uptime_secs: u64,
}

pub fn sysinfo(buf: u64) -> u64 {
    let Some(slot) = table::current() else {
        return abi::err(errno::EINVAL);
    };
    let (total, free) = pmm::stats();
    let info = SysInfo {
        total_pages: total,
        free_pages: free,
        page_size: PAGE_SIZE as u64,
        uptime_secs: crate::logger::boot_time_us() / 1_000_000,
    };
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &info as *const SysInfo as *const u8,
            core::mem::size_of::<SysInfo>(),
        )
    };
    match types::copy_out(slot, buf, bytes) {
        Ok(()) => 0,
        Err(e) => abi::err(e),
    }
}

/// Read the kernel log ring from an explicit byte offset.
pub fn klog(buf: u64, len: u64, offset: u64) -> u64 {
    let Some(slot) = table::current() else {
        return abi::err(errno::EINVAL);
    };
    let len = (len as usize).min(4096);
    if !types::user_buffer_in_range(buf, len) {
        return abi::err(errno::EFAULT);
    }
    let mut chunk = [0u8; 4096];
    let n = crate::logger::klog_read(offset, &mut chunk[..len]);
    match types::copy_out(slot, buf, &chunk[..n]) {
        Ok(()) => n as u64,
        Err(e) => abi::err(e),
    }
}

/// Mode 0 halts every core; mode 1 reboots the machine.
pub fn shutdown(mode: u64) -> u64 {
    match mode {
        0 => {
            crate::kinfo!("shutdown: halting");
            smp::ipi::halt_others();
            crate::arch::halt_loop()
        }
        1 => {
            crate::kinfo!("shutdown: rebooting");
            smp::ipi::halt_others();
            crate::arch::reboot()
        }
        _ => abi::err(errno::EINVAL),
    }
}
