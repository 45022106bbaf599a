//! Program image loading
//!
//! Walks PT_LOAD headers and materializes them in a target address
//! space: pages are always Read+User, Write and Execute follow the
//! segment flags, and the `p_memsz - p_filesz` tail is zero. The user
//! stack is mapped just below the canonical top with the argv block on
//! its highest page.

use crate::abi;
use crate::elf::{ph_flags, ElfImage, PT_LOAD};
use crate::mm::paging::{self, MapFlags};
use crate::mm::PAGE_SIZE;

use super::types::{ARGV_ADDR, USER_STACK_SIZE, USER_STACK_TOP};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    BadImage,
    NoMemory,
    TooLarge,
}

/// Result of loading an image: the entry point, initial stack pointer,
/// and the first address past the highest loaded segment (heap base).
#[derive(Clone, Copy, Debug)]
pub struct LoadedImage {
    pub entry: u64,
    pub stack_top: u64,
    pub brk_base: u64,
}

/// Load `image` into the address space rooted at `pml4` and prepare the
/// stack. The space must not already contain user mappings at the
/// segment addresses.
pub fn load_image(pml4: u64, image: &[u8]) -> Result<LoadedImage, LoadError> {
    if image.len() > abi::SPAWN_ELF_MAX {
        return Err(LoadError::TooLarge);
    }
    let elf = ElfImage::parse(image).map_err(|_| LoadError::BadImage)?;

    let mut brk_base = 0u64;
    for ph in elf.program_headers() {
        if ph.p_type != PT_LOAD {
            continue;
        }
        let data = elf.segment_data(ph).map_err(|_| LoadError::BadImage)?;
        let flags = MapFlags {
            write: ph.p_flags & ph_flags::PF_W != 0,
            exec: ph.p_flags & ph_flags::PF_X != 0,
            write_combining: false,
        };

        let start = ph.p_vaddr & !(PAGE_SIZE as u64 - 1);
        let end = ph.p_vaddr + ph.p_memsz;
        let mut va = start;
        while va < end {
            // Segments may share a page boundary; remap is harmless
            // because the frame is reused through translate below.
            if paging::translate(pml4, va).is_none() {
                paging::map_user_page(pml4, va, flags).map_err(|e| match e {
                    paging::MapError::NoMemory => LoadError::NoMemory,
                    _ => LoadError::BadImage,
                })?;
            }
            va += PAGE_SIZE as u64;
        }

        paging::copy_to_address_space(pml4, ph.p_vaddr, data)
            .map_err(|_| LoadError::BadImage)?;
        // Bytes [filesz, memsz) stay zero: fresh frames are pre-zeroed.

        brk_base = brk_base.max((end + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1));
    }

    // User stack directly below the canonical top.
    let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE;
    let mut va = stack_bottom;
    while va < USER_STACK_TOP {
        paging::map_user_page(pml4, va, MapFlags::rw()).map_err(|_| LoadError::NoMemory)?;
        va += PAGE_SIZE as u64;
    }

    Ok(LoadedImage {
        entry: elf.entry_point(),
        // Initial RSP sits below the argv page, 16-byte aligned.
        stack_top: ARGV_ADDR & !0xF,
        brk_base,
    })
}

/// Copy an argv block (`argc: u32, total_bytes: u32`, NUL-separated
/// strings) to the fixed user-visible page. Malformed blocks degrade to
/// an empty argv rather than failing the spawn.
pub fn install_argv(pml4: u64, block: &[u8]) -> Result<(), LoadError> {
    let mut page = [0u8; PAGE_SIZE];
    let n = block.len().min(PAGE_SIZE);
    page[..n].copy_from_slice(&block[..n]);
    if n < 8 {
        page[..8].fill(0);
    }
    paging::copy_to_address_space(pml4, ARGV_ADDR, &page).map_err(|_| LoadError::BadImage)
}
