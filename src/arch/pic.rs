//! Legacy PIC bring-up
//!
//! Fornax takes interrupts only as LAPIC IPIs, but the 8259 pair powers
//! up mapped over the exception vectors and must be remapped and masked
//! before interrupts are ever enabled.

use pic8259::ChainedPics;
use spin::Mutex;

/// First vector of the (masked) remapped range, clear of CPU exceptions.
pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap both PICs away from the exception range, then mask every line.
pub fn init() {
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.disable();
    }
}
