//! Process table
//!
//! A static array of slots guarded by one allocation lock. Individual
//! state transitions happen either on the owning core or under this
//! lock; nothing here ever calls back into a subsystem that takes its
//! own lock first.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use super::group;
use super::types::{Pid, Process, MAX_PROCESSES};
use crate::smp;

static PROCESS_TABLE: Mutex<[Option<Process>; MAX_PROCESSES]> =
    Mutex::new([None; MAX_PROCESSES]);

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Issue a fresh pid; never reused while any slot still carries it.
pub fn issue_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::SeqCst)
}

pub fn table_lock() -> MutexGuard<'static, [Option<Process>; MAX_PROCESSES]> {
    PROCESS_TABLE.lock()
}

/// Claim a free slot for `process`, assigning it a fresh pid.
pub fn alloc_slot(mut process: Process) -> Option<(usize, Pid)> {
    let pid = issue_pid();
    process.pid = pid;
    let mut table = PROCESS_TABLE.lock();
    for (idx, slot) in table.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(process);
            return Some((idx, pid));
        }
    }
    None
}

/// Release a slot entirely (reap).
pub fn free_slot(slot: usize) {
    let mut table = PROCESS_TABLE.lock();
    table[slot] = None;
}

/// Run `f` on the process in `slot`, if live.
pub fn with_slot<R>(slot: usize, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let mut table = PROCESS_TABLE.lock();
    table[slot].as_mut().map(f)
}

/// Copy out the process in `slot`.
pub fn get(slot: usize) -> Option<Process> {
    PROCESS_TABLE.lock()[slot]
}

pub fn find_by_pid(pid: Pid) -> Option<usize> {
    let table = PROCESS_TABLE.lock();
    for (idx, slot) in table.iter().enumerate() {
        if let Some(p) = slot {
            if p.pid == pid {
                return Some(idx);
            }
        }
    }
    None
}

/// Slot of the process running on this core.
pub fn current() -> Option<usize> {
    smp::current_slot()
}

pub fn current_pid() -> Option<Pid> {
    let slot = current()?;
    get(slot).map(|p| p.pid)
}

/// The slot whose fd-table and namespace pool entries this process uses:
/// its own when ungrouped, the group leader's otherwise.
pub fn resource_slot(slot: usize) -> usize {
    match get(slot).and_then(|p| p.group) {
        Some(gid) => group::get(gid).resource_slot,
        None => slot,
    }
}

/// Page-table root of the process in `slot`.
pub fn pml4_of(slot: usize) -> u64 {
    match get(slot) {
        Some(p) => match p.group {
            Some(gid) => group::get(gid).pml4,
            None => p.pml4,
        },
        None => 0,
    }
}

/// Address-space identity for futex keys: the physical address of the
/// root page table.
pub fn address_space_id(slot: usize) -> u64 {
    pml4_of(slot)
}

/// Slots of all direct children of `pid`.
pub fn children_of(pid: Pid, out: &mut [usize; MAX_PROCESSES]) -> usize {
    let table = PROCESS_TABLE.lock();
    let mut n = 0;
    for (idx, slot) in table.iter().enumerate() {
        if let Some(p) = slot {
            if p.ppid == pid {
                out[n] = idx;
                n += 1;
            }
        }
    }
    n
}

/// Record that this core ran `slot`'s address space, for later shootdown.
pub fn note_core_footprint(slot: usize) {
    let cpu = smp::current_cpu_id();
    let gid = with_slot(slot, |p| {
        p.cores_ran_on |= 1 << cpu;
        p.group
    })
    .flatten();
    if let Some(gid) = gid {
        group::note_core(gid, cpu);
    }
}
