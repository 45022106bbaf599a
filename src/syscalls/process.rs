//! Process lifecycle syscalls
//!
//! spawn/exec/wait/exit plus the Plan 9 rfork flag bundle. Exit policy:
//! a dying process recursively kills its descendants — there is no
//! re-parenting — then turns zombie until its parent reaps it (or is
//! reaped immediately under RFNOWAIT).

use crate::abi::{self, errno, rfork_flags, wait_flags, FdMapEntry, ARGV_BLOCK_MAX, SPAWN_ELF_MAX};
use crate::fs::{fd, ns};
use crate::mm::paging;
use crate::process::loader;
use crate::process::table;
use crate::process::{group, PendingOp, Process, ProcessState, USER_MMAP_BASE};
use crate::scheduler;
use crate::smp;

use super::types;

fn current_slot() -> Result<usize, i32> {
    table::current().ok_or(errno::EINVAL)
}

fn ret(r: Result<u64, i32>) -> u64 {
    match r {
        Ok(v) => v,
        Err(e) => abi::err(e),
    }
}

pub fn getpid() -> u64 {
    table::current_pid().unwrap_or(0)
}

pub fn getuid() -> u64 {
    table::current()
        .and_then(table::get)
        .map(|p| p.uid as u64)
        .unwrap_or(0)
}

pub fn setuid(uid: u64) -> u64 {
    match table::current() {
        Some(slot) => {
            table::with_slot(slot, |p| p.uid = uid as u16);
            0
        }
        None => abi::err(errno::EINVAL),
    }
}

pub fn sleep(ms: u64) -> u64 {
    let Some(slot) = table::current() else {
        return abi::err(errno::EINVAL);
    };
    if ms == 0 {
        // Pure yield.
        scheduler::force_resched();
        return 0;
    }
    let deadline = crate::logger::boot_time_ms() + ms;
    table::with_slot(slot, |p| p.sleep_deadline_ms = deadline);
    scheduler::block_current(PendingOp::Sleep);
    0
}

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

/// Build a ready child from an ELF image in the parent's memory, an fd
/// inheritance map, and an argv block.
pub fn spawn(elf_ptr: u64, elf_len: u64, fd_map_ptr: u64, fd_map_len: u64, argv_ptr: u64) -> u64 {
    let r = (|| {
        let parent_slot = current_slot()?;
        let parent = table::get(parent_slot).ok_or(errno::EINVAL)?;
        let parent_rslot = table::resource_slot(parent_slot);

        let elf_len = elf_len as usize;
        if elf_len == 0 || elf_len > SPAWN_ELF_MAX {
            return Err(errno::EINVAL);
        }
        if !types::user_buffer_in_range(elf_ptr, elf_len) {
            return Err(errno::EFAULT);
        }
        let map_count = fd_map_len as usize;
        if map_count > fd::NOFILE
            || !types::user_buffer_in_range(fd_map_ptr, map_count * core::mem::size_of::<FdMapEntry>())
        {
            return Err(errno::EFAULT);
        }

        // The image is read straight out of the parent's (current)
        // address space while the child's tables are filled.
        let image = unsafe { core::slice::from_raw_parts(elf_ptr as *const u8, elf_len) };

        let pml4 = paging::new_user_pml4().map_err(|_| errno::ENOMEM)?;
        let loaded = loader::load_image(pml4, image).map_err(|e| {
            paging::free_pml4(pml4);
            match e {
                loader::LoadError::NoMemory => errno::ENOMEM,
                _ => errno::EINVAL,
            }
        })?;

        // Argv block, bounded to one page.
        let mut argv = [0u8; ARGV_BLOCK_MAX];
        if argv_ptr != 0 {
            let mut header = [0u8; 8];
            types::copy_in(parent_slot, argv_ptr, &mut header)?;
            let total = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let n = (8 + total).min(ARGV_BLOCK_MAX);
            types::copy_in(parent_slot, argv_ptr, &mut argv[..n])?;
        }
        loader::install_argv(pml4, &argv).map_err(|_| {
            paging::free_pml4(pml4);
            errno::ENOMEM
        })?;

        let mut child = Process::empty();
        child.ppid = parent.pid;
        child.state = ProcessState::New;
        child.pml4 = pml4;
        child.brk_base = loaded.brk_base;
        child.brk = loaded.brk_base;
        child.mmap_next = USER_MMAP_BASE;
        child.uid = parent.uid;
        child.ctx.rip = loaded.entry;
        child.ctx.rsp = loaded.stack_top;

        let (child_slot, child_pid) = table::alloc_slot(child).ok_or_else(|| {
            paging::free_pml4(pml4);
            errno::EAGAIN
        })?;

        // The pool entries for a reused slot must start empty.
        fd::with_table(child_slot, |t| t.clear());
        ns::with_ns(child_slot, |n| n.clear());

        // Namespace: byte-for-byte copy at this instant; later mounts on
        // either side do not perturb the other. Refcounts are bumped
        // after the namespace locks drop.
        let (chans, nchans) = ns::with_two_ns(parent_rslot, child_slot, |pns, cns| {
            cns.clone_from_ns(pns);
            cns.channels()
        });
        for &chan in &chans[..nchans] {
            crate::ipc::retain_client(chan);
        }

        // Fds: only what the map names, at the indices it names.
        for i in 0..map_count {
            let mut rec = [0u8; 8];
            if types::copy_in(
                parent_slot,
                fd_map_ptr + (i * core::mem::size_of::<FdMapEntry>()) as u64,
                &mut rec,
            )
            .is_err()
            {
                break;
            }
            let child_fd = u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]) as usize;
            let parent_fd = u32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]) as usize;
            let entry = fd::with_table(parent_rslot, |t| t.get(parent_fd));
            if let Some(entry) = entry {
                fd::retain_entry(&entry);
                fd::with_table(child_slot, |t| t.install_at(child_fd, entry));
            }
        }

        table::with_slot(child_slot, |p| p.state = ProcessState::Ready);
        Ok(child_pid)
    })();
    ret(r)
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

/// Replace the caller's image. Fds and namespace survive; the old
/// address space is torn down after the new one is built, so the image
/// bytes can come from the old space.
pub fn exec(elf_ptr: u64, elf_len: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let proc = table::get(slot).ok_or(errno::EINVAL)?;
        if proc.group.is_some() {
            // Exec inside a thread group is unsupported.
            return Err(errno::EINVAL);
        }
        let elf_len = elf_len as usize;
        if elf_len == 0 || elf_len > SPAWN_ELF_MAX {
            return Err(errno::EINVAL);
        }
        if !types::user_buffer_in_range(elf_ptr, elf_len) {
            return Err(errno::EFAULT);
        }
        let image = unsafe { core::slice::from_raw_parts(elf_ptr as *const u8, elf_len) };

        let new_pml4 = paging::new_user_pml4().map_err(|_| errno::ENOMEM)?;
        let loaded = loader::load_image(new_pml4, image).map_err(|e| {
            paging::free_pml4(new_pml4);
            match e {
                loader::LoadError::NoMemory => errno::ENOMEM,
                _ => errno::EINVAL,
            }
        })?;
        loader::install_argv(new_pml4, &[0u8; 16]).map_err(|_| {
            paging::free_pml4(new_pml4);
            errno::ENOMEM
        })?;

        let old_pml4 = proc.pml4;
        let cores = proc.cores_ran_on;

        table::with_slot(slot, |p| {
            p.pml4 = new_pml4;
            p.brk_base = loaded.brk_base;
            p.brk = loaded.brk_base;
            p.mmap_next = USER_MMAP_BASE;
            p.fs_base = 0;
            p.ctx = crate::process::Context::zero();
            p.ctx.rip = loaded.entry;
            p.ctx.rsp = loaded.stack_top;
            p.syscall_ret = 0;
            p.state = ProcessState::Ready;
        });

        // Switch off the dying tree before freeing it.
        unsafe { crate::arch::write_cr3(paging::kernel_pml4_phys()) };
        smp::ipi::tlb_shootdown(cores);
        paging::free_pml4(old_pml4);

        // Resume through the scheduler into the fresh context.
        scheduler::force_resched();
        Ok(0)
    })();
    ret(r)
}

// ---------------------------------------------------------------------------
// rfork / wait / exit
// ---------------------------------------------------------------------------

pub fn rfork(flags: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let rslot = table::resource_slot(slot);

        if flags & rfork_flags::RFPROC == 0 {
            // In-place changes to the caller.
            if flags & rfork_flags::RFCFDG != 0 {
                let entries: heapless_vec::FdVec = fd::with_table(rslot, |t| {
                    let v = t.iter_live().collect();
                    t.clear();
                    v
                });
                for (_, entry) in entries {
                    fd::release_entry(&entry);
                }
            }
            if flags & rfork_flags::RFNAMEG != 0 {
                let (chans, nchans) = ns::with_ns(rslot, |n| {
                    let c = n.channels();
                    n.clear();
                    c
                });
                for &chan in &chans[..nchans] {
                    crate::ipc::release_client(chan);
                }
            }
            return Ok(0);
        }

        let parent = table::get(slot).ok_or(errno::EINVAL)?;

        // Address space: shared (RFMEM) or an eager deep copy.
        let (child_pml4, child_group) = if flags & rfork_flags::RFMEM != 0 {
            let gid = ensure_group(slot)?;
            group::add_ref(gid);
            (0, Some(gid))
        } else {
            let src = table::pml4_of(slot);
            let pml4 = paging::deep_copy_user(src).map_err(|_| errno::ENOMEM)?;
            (pml4, None)
        };

        let mut child = Process::empty();
        child.ppid = parent.pid;
        child.state = ProcessState::New;
        child.group = child_group;
        child.pml4 = child_pml4;
        child.brk_base = parent.brk_base;
        child.brk = parent.brk;
        child.mmap_next = parent.mmap_next;
        child.uid = parent.uid;
        child.fs_base = parent.fs_base;
        child.ctx = parent.ctx;
        child.syscall_ret = 0; // child's rfork returns 0
        child.auto_reap = flags & rfork_flags::RFNOWAIT != 0;

        let (child_slot, child_pid) = table::alloc_slot(child).ok_or(errno::EAGAIN)?;

        // Fd table: copy (RFFDG), clean (RFCFDG), or empty by default.
        if flags & rfork_flags::RFFDG != 0 && child_group.is_none() {
            let entries: heapless_vec::FdVec = fd::with_two_tables(rslot, child_slot, |pt, ct| {
                ct.clone_from_table(pt);
                ct.iter_live().collect()
            });
            for (_, entry) in entries {
                fd::retain_entry(&entry);
            }
        }

        // Namespace: fresh and empty under RFNAMEG, else a deep copy.
        if child_group.is_none() && flags & rfork_flags::RFNAMEG == 0 {
            let (chans, nchans) = ns::with_two_ns(rslot, child_slot, |pns, cns| {
                cns.clone_from_ns(pns);
                cns.channels()
            });
            for &chan in &chans[..nchans] {
                crate::ipc::retain_client(chan);
            }
        }

        table::with_slot(child_slot, |p| p.state = ProcessState::Ready);
        Ok(child_pid)
    })();
    ret(r)
}

/// Move the caller's resources into a (possibly new) thread group.
pub fn ensure_group(slot: usize) -> Result<usize, i32> {
    let proc = table::get(slot).ok_or(errno::EINVAL)?;
    if let Some(gid) = proc.group {
        return Ok(gid);
    }
    let rslot = table::resource_slot(slot);
    let gid = group::create(
        rslot,
        proc.pml4,
        proc.brk_base,
        proc.brk,
        proc.mmap_next,
        proc.cores_ran_on,
    )
    .ok_or(errno::EAGAIN)?;
    table::with_slot(slot, |p| {
        p.group = Some(gid);
        p.pml4 = 0;
    });
    Ok(gid)
}

pub use self::ensure_group as ensure_thread_group;

pub fn wait(pid: u64, flags: u64) -> u64 {
    let r = (|| {
        let slot = current_slot()?;
        let me = table::get(slot).ok_or(errno::EINVAL)?;
        let want = pid as i64;

        let mut children = [0usize; crate::process::MAX_PROCESSES];
        let count = table::children_of(me.pid, &mut children);
        if count == 0 {
            return Err(errno::ENOENT);
        }

        for &child_slot in &children[..count] {
            let Some(child) = table::get(child_slot) else { continue };
            if want > 0 && child.pid != want as u64 {
                continue;
            }
            if child.state == ProcessState::Zombie {
                let packed = abi::pack_wait(child.pid, child.exit_status);
                table::with_slot(child_slot, |p| p.state = ProcessState::Dead);
                table::free_slot(child_slot);
                return Ok(packed);
            }
        }

        if flags & wait_flags::WNOHANG != 0 {
            return Ok(0);
        }

        table::with_slot(slot, |p| p.waiting_for_pid = want);
        scheduler::block_current(PendingOp::Wait);
        Ok(0)
    })();
    ret(r)
}

pub fn exit(status: u64) -> u64 {
    if let Some(slot) = table::current() {
        exit_slot(slot, status as i32);
        scheduler::force_resched();
    }
    0
}

/// Close every fd and drop every mount owned by a resource slot. One
/// entry at a time: this runs inside the recursive kill of a process
/// tree and must keep its stack frame small.
fn release_fds_and_ns(rslot: usize) {
    for fdn in 0..fd::NOFILE {
        if let Some(entry) = fd::with_table(rslot, |t| t.take(fdn)) {
            fd::release_entry(&entry);
        }
    }
    let (chans, nchans) = ns::with_ns(rslot, |n| {
        let c = n.channels();
        n.clear();
        c
    });
    for &chan in &chans[..nchans] {
        crate::ipc::release_client(chan);
    }
}

/// Tear down an address-space tree once no core references it.
fn free_address_space(pml4: u64, cores: u64) {
    if pml4 == 0 {
        return;
    }
    if crate::arch::read_cr3() == pml4 {
        unsafe { crate::arch::write_cr3(paging::kernel_pml4_phys()) };
    }
    smp::ipi::tlb_shootdown(cores);
    paging::free_pml4(pml4);
}

/// Release everything `slot` owns: waiter-queue registrations, plus —
/// for the last (or only) user of them — the fd table, namespace, and
/// address space. A thread's shared resources survive until the group's
/// final member exits. The caller guarantees the process is not
/// executing user code anywhere.
fn teardown_resources(slot: usize) {
    crate::ipc::pipe::remove_waiter(slot);
    crate::ipc::remove_waiter(slot);
    crate::futex::remove_waiter(slot);

    let proc = match table::get(slot) {
        Some(p) => p,
        None => return,
    };

    match proc.group {
        Some(gid) => {
            let resource_slot = group::get(gid).resource_slot;
            if let Some((pml4, cores)) = group::release(gid) {
                // Last member: shared fds, namespace, and tree all go.
                release_fds_and_ns(resource_slot);
                free_address_space(pml4, cores);
            }
        }
        None => {
            release_fds_and_ns(slot);
            free_address_space(proc.pml4, proc.cores_ran_on);
        }
    }
    table::with_slot(slot, |p| {
        p.pml4 = 0;
        p.group = None;
    });
}

/// Full exit path for the current process (status from the syscall) and
/// for `/proc/N/ctl` kills (status -1).
pub fn exit_slot(slot: usize, status: i32) {
    let proc = match table::get(slot) {
        Some(p) => p,
        None => return,
    };

    // Thread-exit handshake: zero the registered child-tid word and
    // wake one futex waiter on it.
    if proc.clear_child_tid != 0 {
        let space = table::address_space_id(slot);
        let _ = paging::copy_to_address_space(space, proc.clear_child_tid, &0u32.to_le_bytes());
        crate::futex::wake_one(space, proc.clear_child_tid);
    }

    // No re-parenting: descendants die with us.
    let mut children = [0usize; crate::process::MAX_PROCESSES];
    let count = table::children_of(proc.pid, &mut children);
    for &child in &children[..count] {
        kill_slot(child);
    }

    teardown_resources(slot);

    table::with_slot(slot, |p| {
        p.exit_status = status;
        p.pending_op = PendingOp::None;
        p.state = ProcessState::Zombie;
    });

    if proc.auto_reap || proc.ppid == 0 {
        table::with_slot(slot, |p| p.state = ProcessState::Dead);
        table::free_slot(slot);
        return;
    }

    // Wake a parent blocked in wait; the parent's syscall completes
    // here, including the reap.
    if let Some(parent_slot) = table::find_by_pid(proc.ppid) {
        let waiting = table::get(parent_slot)
            .map(|p| {
                p.state == ProcessState::Blocked
                    && p.pending_op == PendingOp::Wait
                    && (p.waiting_for_pid <= 0 || p.waiting_for_pid as u64 == proc.pid)
            })
            .unwrap_or(false);
        if waiting {
            let packed = abi::pack_wait(proc.pid, status);
            table::with_slot(slot, |p| p.state = ProcessState::Dead);
            table::free_slot(slot);
            scheduler::complete_and_wake(parent_slot, packed);
        }
    }
}

/// Complete an external kill on the victim's own core (its state was
/// flipped to zombie while it was running user code).
pub fn finish_kill(slot: usize) {
    let status = table::get(slot).map(|p| p.exit_status).unwrap_or(-1);
    exit_slot(slot, status);
}

/// Kill a process (recursively, `/proc/N/ctl` or parent exit). Targets
/// currently executing on another core are marked zombie and finish
/// their teardown at their next kernel entry.
pub fn kill_slot(slot: usize) {
    let running_elsewhere = table::get(slot)
        .map(|p| p.state == ProcessState::Running && table::current() != Some(slot))
        .unwrap_or(false);

    if running_elsewhere {
        table::with_slot(slot, |p| {
            p.exit_status = -1;
            p.state = ProcessState::Zombie;
        });
        return;
    }
    exit_slot(slot, -1);
}

/// Tiny fixed-capacity Vec so teardown can iterate a table while
/// mutating it without the kernel heap.
mod heapless_vec {
    use crate::fs::fd::{FdEntry, NOFILE};

    pub struct FdVec {
        items: [Option<(usize, FdEntry)>; NOFILE],
        len: usize,
    }

    impl FromIterator<(usize, FdEntry)> for FdVec {
        fn from_iter<T: IntoIterator<Item = (usize, FdEntry)>>(iter: T) -> Self {
            let mut v = FdVec {
                items: [None; NOFILE],
                len: 0,
            };
            for item in iter {
                if v.len < NOFILE {
                    v.items[v.len] = Some(item);
                    v.len += 1;
                }
            }
            v
        }
    }

    impl IntoIterator for FdVec {
        type Item = (usize, FdEntry);
        type IntoIter = FdVecIter;
        fn into_iter(self) -> FdVecIter {
            FdVecIter { vec: self, at: 0 }
        }
    }

    pub struct FdVecIter {
        vec: FdVec,
        at: usize,
    }

    impl Iterator for FdVecIter {
        type Item = (usize, FdEntry);
        fn next(&mut self) -> Option<Self::Item> {
            if self.at >= self.vec.len {
                return None;
            }
            let item = self.vec.items[self.at].take();
            self.at += 1;
            item
        }
    }
}
