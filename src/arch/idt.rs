//! Interrupt descriptor table
//!
//! Hand-rolled gate descriptors: the only vectors Fornax services are the
//! TLB-shootdown and halt IPIs, entered through small asm stubs that call
//! into Rust and EOI before returning.

use core::arch::global_asm;
use core::mem::size_of;
use spin::Mutex;
use x86_64::instructions::tables::lidt;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use crate::smp::ipi::{IPI_HALT, IPI_TLB_FLUSH};

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set(&mut self, handler: u64, selector: u16) {
        self.offset_low = handler as u16;
        self.selector = selector;
        self.ist = 0;
        self.type_attr = 0x8E; // present, DPL 0, interrupt gate
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
        self.reserved = 0;
    }
}

static IDT: Mutex<[IdtEntry; 256]> = Mutex::new([IdtEntry::missing(); 256]);

extern "C" {
    fn ipi_tlb_flush_stub();
    fn ipi_halt_stub();
}

/// Fill in the IPI gates and load the IDT on the calling core.
pub fn init() {
    let kernel_code = super::gdt::selectors().kernel_code.0;
    let base;
    {
        let mut idt = IDT.lock();
        idt[IPI_TLB_FLUSH as usize].set(ipi_tlb_flush_stub as u64, kernel_code);
        idt[IPI_HALT as usize].set(ipi_halt_stub as u64, kernel_code);
        base = idt.as_ptr() as u64;
    }

    let pointer = DescriptorTablePointer {
        limit: (256 * size_of::<IdtEntry>() - 1) as u16,
        base: VirtAddr::new(base),
    };
    unsafe { lidt(&pointer) };
}

/// Load the already-built IDT on a secondary core.
pub fn load() {
    let base = IDT.lock().as_ptr() as u64;
    let pointer = DescriptorTablePointer {
        limit: (256 * size_of::<IdtEntry>() - 1) as u16,
        base: VirtAddr::new(base),
    };
    unsafe { lidt(&pointer) };
}

#[no_mangle]
extern "C" fn ipi_tlb_flush_handler() {
    super::flush_tlb();
    super::lapic::send_eoi();
}

#[no_mangle]
extern "C" fn ipi_halt_handler() -> ! {
    super::lapic::send_eoi();
    super::halt_loop()
}

global_asm!(
    ".global ipi_tlb_flush_stub",
    "ipi_tlb_flush_stub:",
    "push rax",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "call ipi_tlb_flush_handler",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rax",
    "iretq",
    ".global ipi_halt_stub",
    "ipi_halt_stub:",
    "call ipi_halt_handler",
);
