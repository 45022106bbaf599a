//! Scheduler
//!
//! Cooperative within a core: a process runs until its syscall blocks or
//! it exits. Suspension is continuation-free — the register file was
//! already saved at syscall entry, so blocking is just a state flip plus
//! whatever waiter registration the resource did. The waker finishes the
//! blocked operation (copies data, sets `syscall_ret`) and marks the
//! process ready; `run_next` later reloads it with `syscall_ret` in RAX.

pub mod context;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::process::table;
use crate::process::{PendingOp, Pid, ProcessState, MAX_PROCESSES};
use crate::{arch, smp};

/// Set when the running syscall blocked; consumed by the epilogue.
static BLOCK_PENDING: [AtomicBool; smp::MAX_CPUS] = {
    const INIT: AtomicBool = AtomicBool::new(false);
    [INIT; smp::MAX_CPUS]
};

/// Round-robin pick cursor, per core.
static mut NEXT_SCAN: [usize; smp::MAX_CPUS] = [0; smp::MAX_CPUS];

pub fn init() {
    crate::kinfo!(
        "scheduler: cooperative per-core, {} process slots",
        MAX_PROCESSES
    );
}

/// Mark the current process blocked on `op`. Resource modules call this
/// at waiter-registration time, while still holding the resource lock,
/// so a waker can never observe the registration before the block. The
/// completion destination goes in `pending_buf`/`pending_len` via
/// `set_pending_dest`.
pub fn block_current(op: PendingOp) {
    let slot = match table::current() {
        Some(s) => s,
        None => return,
    };
    table::with_slot(slot, |p| {
        p.state = ProcessState::Blocked;
        p.pending_op = op;
    });
    BLOCK_PENDING[smp::current_cpu_id()].store(true, Ordering::SeqCst);
}

/// Record where a waker should complete the in-flight operation.
pub fn set_pending_dest(slot: usize, obj: usize, buf: u64, len: usize) {
    table::with_slot(slot, |p| {
        p.pending_obj = obj;
        p.pending_buf = buf;
        p.pending_len = len;
    });
}

/// Did the syscall that just returned block? Clears the flag.
pub fn take_block_pending() -> bool {
    BLOCK_PENDING[smp::current_cpu_id()].swap(false, Ordering::SeqCst)
}

/// Route the syscall return through `run_next` without blocking: used
/// by exec (fresh context), exit, and yield-style sleeps.
pub fn force_resched() {
    BLOCK_PENDING[smp::current_cpu_id()].store(true, Ordering::SeqCst);
}

/// Finish a blocked process's operation: store its return value and make
/// it runnable. Safe to call from any core and from wakers holding
/// subsystem locks (takes only the process-table lock).
pub fn complete_and_wake(slot: usize, ret: u64) {
    table::with_slot(slot, |p| {
        if p.state == ProcessState::Blocked {
            p.syscall_ret = ret;
            p.pending_op = PendingOp::None;
            p.pending_buf = 0;
            p.pending_len = 0;
            p.state = ProcessState::Ready;
        }
    });
}

/// Wake by pid, preserving whatever `syscall_ret` was already stored.
pub fn wake_pid(pid: Pid) {
    if let Some(slot) = table::find_by_pid(pid) {
        table::with_slot(slot, |p| {
            if p.state == ProcessState::Blocked {
                p.pending_op = PendingOp::None;
                p.state = ProcessState::Ready;
            }
        });
    }
}

/// Wake sleepers whose deadline has passed.
fn wake_expired_sleepers(now_ms: u64) {
    let mut table = table::table_lock();
    for slot in table.iter_mut() {
        let Some(p) = slot else { continue };
        if p.state == ProcessState::Blocked
            && p.pending_op == PendingOp::Sleep
            && now_ms >= p.sleep_deadline_ms
        {
            p.syscall_ret = 0;
            p.pending_op = PendingOp::None;
            p.state = ProcessState::Ready;
        }
    }
}

/// One round of timer-driven housekeeping; runs on the idle path.
pub fn poll_timers() {
    let now = crate::logger::boot_time_ms();
    wake_expired_sleepers(now);
    crate::net::poll();
    crate::futex::expire_timeouts(now);
}

/// Pick a ready process, scanning round-robin from the last pick.
fn pick_ready(cpu: usize) -> Option<usize> {
    let mut table = table::table_lock();
    let start = unsafe { NEXT_SCAN[cpu] };
    for offset in 0..MAX_PROCESSES {
        let idx = (start + offset) % MAX_PROCESSES;
        if let Some(p) = &mut table[idx] {
            if p.state == ProcessState::Ready {
                p.state = ProcessState::Running;
                unsafe { NEXT_SCAN[cpu] = (idx + 1) % MAX_PROCESSES };
                return Some(idx);
            }
        }
    }
    None
}

/// Hand the core to some ready process; never returns to the caller.
/// With nothing runnable the core polls timers until work appears.
pub fn run_next() -> ! {
    let cpu = smp::current_cpu_id();
    loop {
        if let Some(slot) = pick_ready(cpu) {
            smp::set_current_slot(Some(slot));
            table::note_core_footprint(slot);

            let (mut ctx, fs_base) = match table::get(slot) {
                Some(p) => (p.ctx, p.fs_base),
                None => continue,
            };
            ctx.rax = table::get(slot).map(|p| p.syscall_ret).unwrap_or(0);

            let pml4 = table::pml4_of(slot);
            if pml4 != 0 && arch::read_cr3() != pml4 {
                unsafe { arch::write_cr3(pml4) };
            }
            arch::set_fs_base(fs_base);
            context::resume(ctx);
        }

        smp::set_current_slot(None);
        // Idle: drive retransmit/sleep/DNS timers while waiting.
        poll_timers();
        arch::pause();
    }
}
