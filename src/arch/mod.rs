//! Architecture-specific code (x86_64)
//!
//! Thin wrappers over the instructions the rest of the kernel needs:
//! TSC, CR3, TLB maintenance, MSRs, and the descriptor tables. Everything
//! above this module is architecture-agnostic logic.

pub mod gdt;
pub mod idt;
pub mod lapic;
pub mod pic;

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::registers::model_specific::{FsBase, GsBase, KernelGsBase};
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

/// Halt this core forever.
pub fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Spin-wait hint.
#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Read the time-stamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Detect the invariant TSC frequency via CPUID leaves 0x15/0x16.
/// Returns None when the firmware does not report it.
pub fn detect_tsc_frequency() -> Option<u64> {
    unsafe {
        use core::arch::x86_64::__cpuid;

        let max_leaf = __cpuid(0).eax;
        if max_leaf >= 0x15 {
            let leaf = __cpuid(0x15);
            if leaf.eax != 0 && leaf.ebx != 0 && leaf.ecx != 0 {
                return Some((leaf.ecx as u64 * leaf.ebx as u64) / leaf.eax as u64);
            }
        }
        if max_leaf >= 0x16 {
            let leaf = __cpuid(0x16);
            if leaf.eax != 0 {
                return Some(leaf.eax as u64 * 1_000_000);
            }
        }
        None
    }
}

/// Physical address of the active PML4.
#[inline]
pub fn read_cr3() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

/// Switch to the page-table tree rooted at `pml4_phys`.
///
/// # Safety
/// The frame must hold a valid PML4 mapping the kernel half.
pub unsafe fn write_cr3(pml4_phys: u64) {
    let frame = PhysFrame::containing_address(PhysAddr::new(pml4_phys));
    Cr3::write(frame, Cr3Flags::empty());
}

/// Flush the entire TLB on this core.
#[inline]
pub fn flush_tlb() {
    x86_64::instructions::tlb::flush_all();
}

/// Invalidate one page mapping on this core.
#[inline]
pub fn invlpg(addr: u64) {
    x86_64::instructions::tlb::flush(VirtAddr::new(addr));
}

/// Set the user-visible FS base (thread-local storage).
pub fn set_fs_base(base: u64) {
    FsBase::write(VirtAddr::new(base));
}

pub fn fs_base() -> u64 {
    FsBase::read().as_u64()
}

/// Point KERNEL_GS_BASE at this core's per-CPU area. The syscall entry
/// swapgs picks it up.
pub fn set_kernel_gs_base(base: u64) {
    KernelGsBase::write(VirtAddr::new(base));
    GsBase::write(VirtAddr::new(base));
}

/// Disable interrupts on this core; IPIs stay pending until re-enabled.
#[inline]
pub fn interrupts_off() {
    x86_64::instructions::interrupts::disable();
}

#[inline]
pub fn interrupts_on() {
    x86_64::instructions::interrupts::enable();
}

/// ACPI-less reboot via the keyboard controller pulse line.
pub fn reboot() -> ! {
    unsafe {
        let mut port = x86_64::instructions::port::Port::<u8>::new(0x64);
        loop {
            port.write(0xFEu8);
            pause();
        }
    }
}
