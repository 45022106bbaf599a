//! Mock CPU layer: a hand-cranked TSC and no-op privileged operations.

use core::sync::atomic::{AtomicU64, Ordering};

static MOCK_TSC: AtomicU64 = AtomicU64::new(1);

pub fn rdtsc() -> u64 {
    MOCK_TSC.load(Ordering::SeqCst)
}

/// 1 MHz: one tick is one microsecond, so tests reason in wall time.
pub fn detect_tsc_frequency() -> Option<u64> {
    Some(1_000_000)
}

/// Test hook: advance the fake clock.
pub fn test_advance_us(us: u64) {
    MOCK_TSC.fetch_add(us, Ordering::SeqCst);
}

pub fn test_advance_ms(ms: u64) {
    test_advance_us(ms * 1000);
}

pub fn halt_loop() -> ! {
    panic!("halt_loop reached in tests");
}

pub fn pause() {}

pub fn read_cr3() -> u64 {
    0
}

pub unsafe fn write_cr3(_pml4: u64) {}

pub fn flush_tlb() {}

pub fn invlpg(_addr: u64) {}

pub fn set_fs_base(_base: u64) {}

pub fn fs_base() -> u64 {
    0
}

pub fn set_kernel_gs_base(_base: u64) {}

pub fn interrupts_off() {}

pub fn interrupts_on() {}

pub fn reboot() -> ! {
    panic!("reboot reached in tests");
}
