//! Mock syscall layer: the real user-pointer validation helpers plus a
//! recording stand-in for what included kernel modules call back into
//! (procfs kill).

#[path = "../../../src/syscalls/types.rs"]
pub mod types;

use spin::Mutex;

static KILLED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

pub fn kill_slot(slot: usize) {
    KILLED.lock().push(slot);
}

pub fn test_take_killed() -> Vec<usize> {
    core::mem::take(&mut *KILLED.lock())
}
