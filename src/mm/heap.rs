//! Kernel heap
//!
//! Backs the few ambient allocations the kernel makes (mount-prefix
//! strings, DNS names). The core tables are static pools and never touch
//! this.

use linked_list_allocator::LockedHeap;

use crate::mm::{pmm, PAGE_SIZE};

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Heap size in pages (1 MiB).
const HEAP_PAGES: usize = 256;

/// Carve a physically contiguous-enough heap out of the frame pool.
/// Frames are handed over page by page through the direct map, so the
/// heap region does not need physical contiguity guarantees beyond what
/// the allocator links internally.
pub fn init() {
    let first = pmm::alloc_frame().expect("frame for kernel heap");
    let mut last = first;
    let mut contiguous = 1usize;

    // The bitmap allocator hands out ascending frames on a fresh pool;
    // fall back to whatever contiguous run we got.
    for _ in 1..HEAP_PAGES {
        match pmm::alloc_frame() {
            Some(phys) if phys == last + PAGE_SIZE as u64 => {
                last = phys;
                contiguous += 1;
            }
            Some(phys) => {
                pmm::free_frame(phys);
                break;
            }
            None => break,
        }
    }

    let base = crate::mm::paging::phys_to_virt(first);
    unsafe {
        ALLOCATOR
            .lock()
            .init(base as *mut u8, contiguous * PAGE_SIZE);
    }
    crate::kinfo!(
        "heap: {} KiB at {:#x}",
        contiguous * PAGE_SIZE / 1024,
        base
    );
}
