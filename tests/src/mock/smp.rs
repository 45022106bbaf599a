//! Mock per-CPU state: single core, test-settable current process.

use spin::Mutex;

pub const MAX_CPUS: usize = 16;

static CURRENT: Mutex<Option<usize>> = Mutex::new(None);

pub fn current_cpu_id() -> usize {
    0
}

pub fn cpu_total() -> usize {
    1
}

pub fn is_ready() -> bool {
    false
}

pub fn current_slot() -> Option<usize> {
    *CURRENT.lock()
}

pub fn set_current_slot(slot: Option<usize>) {
    *CURRENT.lock() = slot;
}

pub mod ipi {
    pub const IPI_TLB_FLUSH: u8 = 0xF1;
    pub const IPI_HALT: u8 = 0xF3;

    pub fn tlb_shootdown(_cores: u64) {}

    pub fn halt_others() {}
}
