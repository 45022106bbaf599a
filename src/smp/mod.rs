//! Per-CPU state
//!
//! Each core owns a `PerCpuArea` reached through the kernel GS base. The
//! syscall entry stub spills the user register file into fixed slots of
//! that area; the dispatcher lifts them into the process table. The area
//! also carries the core id and the slot index of the process currently
//! running on this core.

pub mod ipi;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;

pub const MAX_CPUS: usize = 16;

/// GS-relative layout consumed by the syscall entry asm. Field order is
/// load-bearing; see `syscalls::ENTRY_ASM`.
#[repr(C, align(64))]
pub struct PerCpuArea {
    pub user_rsp: u64,    // gs:[0]
    pub kernel_rsp: u64,  // gs:[8]
    pub cpu_id: u64,      // gs:[16]
    pub current_slot: i64, // gs:[24]
    pub saved_rcx: u64,   // gs:[32] user rip
    pub saved_r11: u64,   // gs:[40] user rflags
    pub saved_rbx: u64,   // gs:[48]
    pub saved_rbp: u64,   // gs:[56]
    pub saved_r12: u64,   // gs:[64]
    pub saved_r13: u64,   // gs:[72]
    pub saved_r14: u64,   // gs:[80]
    pub saved_r15: u64,   // gs:[88]
    pub saved_rdi: u64,   // gs:[96]
    pub saved_rsi: u64,   // gs:[104]
    pub saved_rdx: u64,   // gs:[112]
    pub saved_r10: u64,   // gs:[120]
    pub saved_r8: u64,    // gs:[128]
    pub saved_r9: u64,    // gs:[136]
    pub apic_id: u64,
}

impl PerCpuArea {
    const fn new() -> Self {
        Self {
            user_rsp: 0,
            kernel_rsp: 0,
            cpu_id: 0,
            current_slot: -1,
            saved_rcx: 0,
            saved_r11: 0,
            saved_rbx: 0,
            saved_rbp: 0,
            saved_r12: 0,
            saved_r13: 0,
            saved_r14: 0,
            saved_r15: 0,
            saved_rdi: 0,
            saved_rsi: 0,
            saved_rdx: 0,
            saved_r10: 0,
            saved_r8: 0,
            saved_r9: 0,
            apic_id: 0,
        }
    }
}

static mut AREAS: [PerCpuArea; MAX_CPUS] = {
    const INIT: PerCpuArea = PerCpuArea::new();
    [INIT; MAX_CPUS]
};

static SMP_READY: AtomicBool = AtomicBool::new(false);
static CPU_TOTAL: AtomicUsize = AtomicUsize::new(1);

/// Wire up this core's area and GS base. Called once per core during
/// bring-up, after the GDT is loaded.
pub fn init_cpu(cpu: usize) {
    let area = unsafe { &mut *core::ptr::addr_of_mut!(AREAS[cpu]) };
    area.cpu_id = cpu as u64;
    area.kernel_rsp = arch::gdt::kernel_stack_top(cpu);
    area.current_slot = -1;
    area.apic_id = arch::lapic::current_apic_id() as u64;
    arch::set_kernel_gs_base(area as *const _ as u64);
    if cpu == 0 {
        SMP_READY.store(true, Ordering::SeqCst);
    }
}

pub fn set_cpu_total(total: usize) {
    CPU_TOTAL.store(total.min(MAX_CPUS), Ordering::SeqCst);
}

pub fn cpu_total() -> usize {
    CPU_TOTAL.load(Ordering::SeqCst)
}

pub fn is_ready() -> bool {
    SMP_READY.load(Ordering::SeqCst)
}

/// Id of the calling core.
pub fn current_cpu_id() -> usize {
    if !is_ready() {
        return 0;
    }
    let id: u64;
    unsafe {
        core::arch::asm!(
            "mov {0}, gs:[16]",
            out(reg) id,
            options(nostack, preserves_flags)
        );
    }
    (id as usize).min(MAX_CPUS - 1)
}

pub(crate) fn area(cpu: usize) -> &'static PerCpuArea {
    unsafe { &*core::ptr::addr_of!(AREAS[cpu]) }
}

pub(crate) fn area_mut(cpu: usize) -> &'static mut PerCpuArea {
    unsafe { &mut *core::ptr::addr_of_mut!(AREAS[cpu]) }
}

/// Process-table slot currently executing on this core.
pub fn current_slot() -> Option<usize> {
    if !is_ready() {
        return None;
    }
    let slot = area(current_cpu_id()).current_slot;
    if slot < 0 {
        None
    } else {
        Some(slot as usize)
    }
}

pub fn set_current_slot(slot: Option<usize>) {
    let cpu = current_cpu_id();
    area_mut(cpu).current_slot = slot.map(|s| s as i64).unwrap_or(-1);
}

pub fn apic_id_of(cpu: usize) -> u32 {
    area(cpu).apic_id as u32
}
