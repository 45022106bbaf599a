//! Global Descriptor Table and per-CPU kernel stacks
//!
//! One GDT/TSS pair per core. Segment layout is dictated by sysret:
//! kernel code, kernel data, then user data immediately before user code
//! so a single STAR value covers both rings.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};
use x86_64::instructions::segmentation::{Segment, CS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::model_specific::{Efer, EferFlags, Star};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::smp::MAX_CPUS;

const KERNEL_STACK_SIZE: usize = 4096 * 8;

#[repr(align(16))]
struct KernelStack {
    bytes: [u8; KERNEL_STACK_SIZE],
}

static mut KERNEL_STACKS: [KernelStack; MAX_CPUS] = {
    const EMPTY: KernelStack = KernelStack {
        bytes: [0; KERNEL_STACK_SIZE],
    };
    [EMPTY; MAX_CPUS]
};

static mut PER_CPU_TSS: [MaybeUninit<TaskStateSegment>; MAX_CPUS] =
    unsafe { MaybeUninit::uninit().assume_init() };

static mut PER_CPU_GDT: [MaybeUninit<GlobalDescriptorTable>; MAX_CPUS] =
    unsafe { MaybeUninit::uninit().assume_init() };

static GDT_READY: [AtomicBool; MAX_CPUS] = {
    const INIT: AtomicBool = AtomicBool::new(false);
    [INIT; MAX_CPUS]
};

/// Segment selectors; identical on every core.
#[derive(Clone, Copy)]
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub tss: SegmentSelector,
}

static mut SELECTORS: MaybeUninit<Selectors> = MaybeUninit::uninit();
static SELECTORS_READY: AtomicBool = AtomicBool::new(false);

/// Top of the given core's kernel stack (16-byte aligned).
pub fn kernel_stack_top(cpu: usize) -> u64 {
    let base = unsafe { core::ptr::addr_of!(KERNEL_STACKS[cpu]) as u64 };
    (base + KERNEL_STACK_SIZE as u64) & !0xF
}

/// Build and load this core's GDT and TSS, and program STAR/EFER for
/// the syscall instruction.
pub fn init(cpu: usize) {
    assert!(cpu < MAX_CPUS, "cpu index out of range");
    if GDT_READY[cpu].swap(true, Ordering::SeqCst) {
        return;
    }

    unsafe {
        let tss_slot = &mut PER_CPU_TSS[cpu];
        tss_slot.write(TaskStateSegment::new());
        let tss = tss_slot.assume_init_mut();
        tss.privilege_stack_table[0] = VirtAddr::new(kernel_stack_top(cpu));

        let gdt_slot = &mut PER_CPU_GDT[cpu];
        gdt_slot.write(GlobalDescriptorTable::new());
        let gdt = gdt_slot.assume_init_mut();

        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss_sel = gdt.add_entry(Descriptor::tss_segment(tss_slot.assume_init_ref()));

        gdt.load_unsafe();
        CS::set_reg(kernel_code);
        SS::set_reg(kernel_data);
        load_tss(tss_sel);

        if !SELECTORS_READY.swap(true, Ordering::SeqCst) {
            SELECTORS.write(Selectors {
                kernel_code,
                kernel_data,
                user_data,
                user_code,
                tss: tss_sel,
            });
        }

        Star::write(user_code, user_data, kernel_code, kernel_data)
            .expect("selector layout compatible with STAR");
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
}

pub fn selectors() -> Selectors {
    assert!(SELECTORS_READY.load(Ordering::SeqCst), "gdt not initialized");
    unsafe { *(&*core::ptr::addr_of!(SELECTORS)).assume_init_ref() }
}
