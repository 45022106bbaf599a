//! Page tables
//!
//! Every address space shares the kernel half (PML4 entries 256..512);
//! the user half is private. Anonymous user pages are always mapped
//! Read+User, with Write and NX taken from the request. Device mappings
//! can ask for write-combining via the PAT bit. The physical address of
//! an address space's PML4 doubles as its identity for futex keys and
//! thread groups.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use x86_64::registers::model_specific::Msr;

use crate::arch;
use crate::mm::{pmm, PAGE_SIZE};

pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_WRITABLE: u64 = 1 << 1;
pub const PTE_USER: u64 = 1 << 2;
pub const PTE_HUGE: u64 = 1 << 7;
/// PAT bit in a 4 KiB PTE; selects the write-combining PAT slot.
pub const PTE_PAT_WC: u64 = 1 << 7;
pub const PTE_NX: u64 = 1 << 63;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Base of the higher-half direct map of physical memory.
pub const PHYS_OFFSET: u64 = 0xFFFF_8000_0000_0000;

/// First virtual address owned by the kernel; user pointers must be below.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Exclusive upper bound of user-half virtual addresses.
pub const USER_VA_END: u64 = 0x0000_8000_0000_0000;

static HIGHER_HALF_ACTIVE: AtomicBool = AtomicBool::new(false);
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);

/// Mapping flags requested by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapFlags {
    pub write: bool,
    pub exec: bool,
    pub write_combining: bool,
}

impl MapFlags {
    pub const fn rw() -> Self {
        Self {
            write: true,
            exec: false,
            write_combining: false,
        }
    }

    pub const fn ro() -> Self {
        Self {
            write: false,
            exec: false,
            write_combining: false,
        }
    }

    pub const fn rx() -> Self {
        Self {
            write: false,
            exec: true,
            write_combining: false,
        }
    }

    fn to_pte_bits(self) -> u64 {
        let mut bits = PTE_PRESENT | PTE_USER;
        if self.write {
            bits |= PTE_WRITABLE;
        }
        if !self.exec {
            bits |= PTE_NX;
        }
        if self.write_combining {
            bits |= PTE_PAT_WC;
        }
        bits
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    NoMemory,
    NotUserAddress,
    NotMapped,
}

/// Translate a physical address through the direct map. Before the
/// kernel tables are live the bootloader's identity map is in effect.
#[inline]
pub fn phys_to_virt(phys: u64) -> u64 {
    if HIGHER_HALF_ACTIVE.load(Ordering::Relaxed) {
        PHYS_OFFSET + phys
    } else {
        phys
    }
}

#[inline]
fn table_mut(phys: u64) -> &'static mut [u64; 512] {
    unsafe { &mut *(phys_to_virt(phys) as *mut [u64; 512]) }
}

/// Program PAT so slot 4 (PAT bit set, PCD/PWT clear) is write-combining.
fn init_pat() {
    const IA32_PAT: u32 = 0x277;
    // Slots 0..3 keep reset defaults (WB, WT, UC-, UC); slot 4 = WC (0x01).
    let value: u64 = 0x0001_0406_0007_0406;
    unsafe { Msr::new(IA32_PAT).write(value) };
}

/// Build the kernel address space: direct-map the first 4 GiB with 1 GiB
/// pages in the higher half (plus a transitional identity view) and
/// activate it.
pub fn init() {
    init_pat();

    let pml4_phys = pmm::alloc_frame().expect("frame for kernel pml4");
    let pdpt_phys = pmm::alloc_frame().expect("frame for kernel pdpt");

    {
        let pdpt = table_mut(pdpt_phys);
        for gib in 0..4u64 {
            pdpt[gib as usize] =
                (gib * 0x4000_0000) | PTE_PRESENT | PTE_WRITABLE | PTE_HUGE;
        }
    }

    {
        let pml4 = table_mut(pml4_phys);
        // Higher-half direct map at PHYS_OFFSET (entry 256) and the
        // transitional identity view the bootloader handed us (entry 0).
        pml4[256] = pdpt_phys | PTE_PRESENT | PTE_WRITABLE;
        pml4[0] = pdpt_phys | PTE_PRESENT | PTE_WRITABLE;
        // Kernel image mapping in the top entry, shared by every space.
        pml4[511] = pdpt_phys | PTE_PRESENT | PTE_WRITABLE;
    }

    KERNEL_PML4.store(pml4_phys, Ordering::SeqCst);
    unsafe { arch::write_cr3(pml4_phys) };
    HIGHER_HALF_ACTIVE.store(true, Ordering::SeqCst);

    crate::kinfo!("paging: kernel tables active, pml4 {:#x}", pml4_phys);
}

pub fn kernel_pml4_phys() -> u64 {
    KERNEL_PML4.load(Ordering::SeqCst)
}

/// Create a fresh user address space sharing the kernel half.
pub fn new_user_pml4() -> Result<u64, MapError> {
    let pml4_phys = pmm::alloc_frame().ok_or(MapError::NoMemory)?;
    let kernel = table_mut(kernel_pml4_phys());
    let new = table_mut(pml4_phys);
    for i in 256..512 {
        new[i] = kernel[i];
    }
    Ok(pml4_phys)
}

fn ensure_table(entry: &mut u64) -> Result<u64, MapError> {
    if *entry & PTE_PRESENT == 0 {
        let phys = pmm::alloc_frame().ok_or(MapError::NoMemory)?;
        *entry = phys | PTE_PRESENT | PTE_WRITABLE | PTE_USER;
        return Ok(phys);
    }
    Ok(*entry & ADDR_MASK)
}

fn indices(va: u64) -> (usize, usize, usize, usize) {
    (
        ((va >> 39) & 0x1FF) as usize,
        ((va >> 30) & 0x1FF) as usize,
        ((va >> 21) & 0x1FF) as usize,
        ((va >> 12) & 0x1FF) as usize,
    )
}

/// Map an existing frame at a user address.
pub fn map_user_frame(pml4: u64, va: u64, phys: u64, flags: MapFlags) -> Result<(), MapError> {
    if va >= USER_VA_END {
        return Err(MapError::NotUserAddress);
    }
    let (i4, i3, i2, i1) = indices(va);
    let l4 = table_mut(pml4);
    let l3_phys = ensure_table(&mut l4[i4])?;
    let l3 = table_mut(l3_phys);
    let l2_phys = ensure_table(&mut l3[i3])?;
    let l2 = table_mut(l2_phys);
    let l1_phys = ensure_table(&mut l2[i2])?;
    let l1 = table_mut(l1_phys);
    l1[i1] = (phys & ADDR_MASK) | flags.to_pte_bits();
    if arch::read_cr3() == pml4 {
        arch::invlpg(va);
    }
    Ok(())
}

/// Allocate and map one anonymous zeroed page.
pub fn map_user_page(pml4: u64, va: u64, flags: MapFlags) -> Result<(), MapError> {
    let phys = pmm::alloc_frame().ok_or(MapError::NoMemory)?;
    map_user_frame(pml4, va, phys, flags)
}

/// Unmap one user page, returning its frame to the pool.
pub fn unmap_user_page(pml4: u64, va: u64) -> Result<(), MapError> {
    if va >= USER_VA_END {
        return Err(MapError::NotUserAddress);
    }
    let (i4, i3, i2, i1) = indices(va);
    let l4 = table_mut(pml4);
    if l4[i4] & PTE_PRESENT == 0 {
        return Err(MapError::NotMapped);
    }
    let l3 = table_mut(l4[i4] & ADDR_MASK);
    if l3[i3] & PTE_PRESENT == 0 {
        return Err(MapError::NotMapped);
    }
    let l2 = table_mut(l3[i3] & ADDR_MASK);
    if l2[i2] & PTE_PRESENT == 0 {
        return Err(MapError::NotMapped);
    }
    let l1 = table_mut(l2[i2] & ADDR_MASK);
    if l1[i1] & PTE_PRESENT == 0 {
        return Err(MapError::NotMapped);
    }
    pmm::free_frame(l1[i1] & ADDR_MASK);
    l1[i1] = 0;
    if arch::read_cr3() == pml4 {
        arch::invlpg(va);
    }
    Ok(())
}

/// Translate a user virtual address to a physical address.
pub fn translate(pml4: u64, va: u64) -> Option<u64> {
    if va >= USER_VA_END {
        return None;
    }
    let (i4, i3, i2, i1) = indices(va);
    let l4 = table_mut(pml4);
    if l4[i4] & PTE_PRESENT == 0 {
        return None;
    }
    let l3 = table_mut(l4[i4] & ADDR_MASK);
    if l3[i3] & PTE_PRESENT == 0 {
        return None;
    }
    let l2 = table_mut(l3[i3] & ADDR_MASK);
    if l2[i2] & PTE_PRESENT == 0 {
        return None;
    }
    let l1 = table_mut(l2[i2] & ADDR_MASK);
    if l1[i1] & PTE_PRESENT == 0 {
        return None;
    }
    Some((l1[i1] & ADDR_MASK) + (va & 0xFFF))
}

/// Copy bytes into another address space. Fails without partial effect
/// tracking when a page is unmapped.
pub fn copy_to_address_space(pml4: u64, mut va: u64, mut src: &[u8]) -> Result<(), MapError> {
    while !src.is_empty() {
        let phys = translate(pml4, va).ok_or(MapError::NotMapped)?;
        let in_page = PAGE_SIZE - (va as usize & 0xFFF);
        let n = in_page.min(src.len());
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), phys_to_virt(phys) as *mut u8, n);
        }
        va += n as u64;
        src = &src[n..];
    }
    Ok(())
}

/// Copy bytes out of another address space.
pub fn copy_from_address_space(
    pml4: u64,
    mut va: u64,
    mut dst: &mut [u8],
) -> Result<(), MapError> {
    while !dst.is_empty() {
        let phys = translate(pml4, va).ok_or(MapError::NotMapped)?;
        let in_page = PAGE_SIZE - (va as usize & 0xFFF);
        let n = in_page.min(dst.len());
        unsafe {
            core::ptr::copy_nonoverlapping(phys_to_virt(phys) as *const u8, dst.as_mut_ptr(), n);
        }
        va += n as u64;
        let rest = dst;
        dst = &mut rest[n..];
    }
    Ok(())
}

/// Count mapped user pages (procfs status).
pub fn count_user_pages(pml4: u64) -> u64 {
    if pml4 == 0 {
        return 0;
    }
    let mut count = 0u64;
    let l4 = table_mut(pml4);
    for i4 in 0..256 {
        if l4[i4] & PTE_PRESENT == 0 {
            continue;
        }
        let l3 = table_mut(l4[i4] & ADDR_MASK);
        for i3 in 0..512 {
            if l3[i3] & PTE_PRESENT == 0 {
                continue;
            }
            let l2 = table_mut(l3[i3] & ADDR_MASK);
            for i2 in 0..512 {
                if l2[i2] & PTE_PRESENT == 0 {
                    continue;
                }
                let l1 = table_mut(l2[i2] & ADDR_MASK);
                for i1 in 0..512 {
                    if l1[i1] & PTE_PRESENT != 0 {
                        count += 1;
                    }
                }
            }
        }
    }
    count
}

/// Eagerly duplicate the user half of an address space (rfork without
/// shared memory). Pages are copied byte for byte with their flags.
pub fn deep_copy_user(src_pml4: u64) -> Result<u64, MapError> {
    let dst_pml4 = new_user_pml4()?;
    let src_l4 = table_mut(src_pml4);
    for i4 in 0..256 {
        if src_l4[i4] & PTE_PRESENT == 0 {
            continue;
        }
        let src_l3 = table_mut(src_l4[i4] & ADDR_MASK);
        for i3 in 0..512 {
            if src_l3[i3] & PTE_PRESENT == 0 {
                continue;
            }
            let src_l2 = table_mut(src_l3[i3] & ADDR_MASK);
            for i2 in 0..512 {
                if src_l2[i2] & PTE_PRESENT == 0 {
                    continue;
                }
                let src_l1 = table_mut(src_l2[i2] & ADDR_MASK);
                for i1 in 0..512 {
                    let pte = src_l1[i1];
                    if pte & PTE_PRESENT == 0 {
                        continue;
                    }
                    let va = ((i4 as u64) << 39)
                        | ((i3 as u64) << 30)
                        | ((i2 as u64) << 21)
                        | ((i1 as u64) << 12);
                    let flags = MapFlags {
                        write: pte & PTE_WRITABLE != 0,
                        exec: pte & PTE_NX == 0,
                        write_combining: false,
                    };
                    let new_phys = pmm::alloc_frame().ok_or(MapError::NoMemory)?;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            phys_to_virt(pte & ADDR_MASK) as *const u8,
                            phys_to_virt(new_phys) as *mut u8,
                            PAGE_SIZE,
                        );
                    }
                    map_user_frame(dst_pml4, va, new_phys, flags)?;
                }
            }
        }
    }
    Ok(dst_pml4)
}

/// Free every user-half page and table. The PML4 frame itself survives
/// so exec can rebuild into it; `free_pml4` finishes the job for exit.
/// The caller must have switched CR3 away first.
pub fn free_user_space(pml4: u64) {
    let l4 = table_mut(pml4);
    for i4 in 0..256 {
        if l4[i4] & PTE_PRESENT == 0 {
            continue;
        }
        let l3_phys = l4[i4] & ADDR_MASK;
        let l3 = table_mut(l3_phys);
        for i3 in 0..512 {
            if l3[i3] & PTE_PRESENT == 0 {
                continue;
            }
            let l2_phys = l3[i3] & ADDR_MASK;
            let l2 = table_mut(l2_phys);
            for i2 in 0..512 {
                if l2[i2] & PTE_PRESENT == 0 {
                    continue;
                }
                let l1_phys = l2[i2] & ADDR_MASK;
                let l1 = table_mut(l1_phys);
                for i1 in 0..512 {
                    if l1[i1] & PTE_PRESENT != 0 {
                        pmm::free_frame(l1[i1] & ADDR_MASK);
                    }
                }
                pmm::free_frame(l1_phys);
            }
            pmm::free_frame(l2_phys);
        }
        l4[i4] = 0;
    }
}

/// Tear down an entire address space including the root.
pub fn free_pml4(pml4: u64) {
    free_user_space(pml4);
    pmm::free_frame(pml4);
}
