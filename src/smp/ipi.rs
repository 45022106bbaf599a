//! Inter-processor interrupts
//!
//! Fornax needs exactly two cross-core signals: flush-your-TLB when an
//! address space is edited or torn down, and halt-for-shutdown. Targets
//! for shootdown come from the per-process `cores_ran_on` bitmap, so a
//! core that never loaded a page-table tree is never interrupted for it.

use super::{apic_id_of, cpu_total, current_cpu_id, is_ready};
use crate::arch::{self, lapic};

/// IPI vector for TLB flush requests.
pub const IPI_TLB_FLUSH: u8 = 0xF1;

/// IPI vector for halt requests.
pub const IPI_HALT: u8 = 0xF3;

/// Flush the TLB on every core in `cores` that is not the caller; the
/// caller flushes directly.
pub fn tlb_shootdown(cores: u64) {
    let current = current_cpu_id();
    if is_ready() {
        let total = cpu_total();
        for cpu in 0..total {
            if cpu == current {
                continue;
            }
            if cores & (1 << cpu) != 0 {
                lapic::send_ipi(apic_id_of(cpu), IPI_TLB_FLUSH);
            }
        }
    }
    if cores & (1 << current) != 0 {
        arch::flush_tlb();
    }
}

/// Halt every other core (shutdown path).
pub fn halt_others() {
    if !is_ready() {
        return;
    }
    let current = current_cpu_id();
    for cpu in 0..cpu_total() {
        if cpu != current {
            lapic::send_ipi(apic_id_of(cpu), IPI_HALT);
        }
    }
}
