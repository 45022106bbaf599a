//! Mock scheduler: same state transitions as the kernel's, minus the
//! actual context switch, plus a record of every wake for assertions.

use spin::Mutex;

use crate::process::table;
use crate::process::{PendingOp, Pid, ProcessState};

static WAKES: Mutex<Vec<(usize, u64)>> = Mutex::new(Vec::new());
static BLOCK_PENDING: Mutex<bool> = Mutex::new(false);

pub fn init() {}

pub fn block_current(op: PendingOp) {
    let Some(slot) = table::current() else { return };
    table::with_slot(slot, |p| {
        p.state = ProcessState::Blocked;
        p.pending_op = op;
    });
    *BLOCK_PENDING.lock() = true;
}

pub fn set_pending_dest(slot: usize, obj: usize, buf: u64, len: usize) {
    table::with_slot(slot, |p| {
        p.pending_obj = obj;
        p.pending_buf = buf;
        p.pending_len = len;
    });
}

pub fn take_block_pending() -> bool {
    let mut pending = BLOCK_PENDING.lock();
    core::mem::replace(&mut *pending, false)
}

pub fn force_resched() {
    *BLOCK_PENDING.lock() = true;
}

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
    WAKES.lock().push((slot, ret));
}

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

pub fn poll_timers() {}

/// Test hook: drain the recorded (slot, return value) wake log.
pub fn test_take_wakes() -> Vec<(usize, u64)> {
    core::mem::take(&mut *WAKES.lock())
}
