//! Local APIC access
//!
//! Only what the kernel core needs: identify the running core and send
//! fixed-vector IPIs for TLB shootdown and halt.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::model_specific::Msr;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

const REG_ID: u64 = 0x20;
const REG_EOI: u64 = 0xB0;
const REG_SPURIOUS: u64 = 0xF0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;

const ICR_DELIVERY_PENDING: u32 = 1 << 12;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Map and software-enable the local APIC on the calling core.
pub fn init() {
    let mut msr = Msr::new(IA32_APIC_BASE);
    let value = unsafe { msr.read() };
    let base = value & 0xF_FFFF_F000;
    unsafe { msr.write(value | APIC_BASE_ENABLE) };
    LAPIC_BASE.store(crate::mm::paging::phys_to_virt(base), Ordering::SeqCst);

    unsafe {
        // Spurious vector 0xFF, APIC software enable.
        write(REG_SPURIOUS, 0x1FF);
    }
}

unsafe fn read(reg: u64) -> u32 {
    let base = LAPIC_BASE.load(Ordering::SeqCst);
    read_volatile((base + reg) as *const u32)
}

unsafe fn write(reg: u64, value: u32) {
    let base = LAPIC_BASE.load(Ordering::SeqCst);
    write_volatile((base + reg) as *mut u32, value);
}

/// APIC id of the calling core.
pub fn current_apic_id() -> u32 {
    if LAPIC_BASE.load(Ordering::SeqCst) == 0 {
        return 0;
    }
    unsafe { read(REG_ID) >> 24 }
}

/// Acknowledge the in-service interrupt.
pub fn send_eoi() {
    unsafe { write(REG_EOI, 0) };
}

/// Send a fixed-delivery IPI to `apic_id` with the given vector.
pub fn send_ipi(apic_id: u32, vector: u8) {
    if LAPIC_BASE.load(Ordering::SeqCst) == 0 {
        return;
    }
    unsafe {
        while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
            crate::arch::pause();
        }
        write(REG_ICR_HIGH, apic_id << 24);
        write(REG_ICR_LOW, vector as u32);
    }
}
