//! ELF loading into a target address space.

use serial_test::serial;

use crate::abi;
use crate::mm::paging;
use crate::process::loader;
use crate::process::{ARGV_ADDR, USER_STACK_TOP};

/// Minimal ELF64 with one PT_LOAD: 16 file bytes at 0x400000, 32 in
/// memory (the tail must load as zero).
fn tiny_elf() -> Vec<u8> {
    let mut img = vec![0u8; 0x100];
    img[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    img[4] = 2; // 64-bit
    img[5] = 1; // little endian
    img[6] = 1; // version
    img[18] = 0x3E; // x86_64
    img[24..32].copy_from_slice(&0x400040u64.to_le_bytes()); // e_entry
    img[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
    img[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    img[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

    // Program header at 64.
    img[64..68].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    img[68..72].copy_from_slice(&5u32.to_le_bytes()); // R+X
    img[72..80].copy_from_slice(&0xC0u64.to_le_bytes()); // p_offset
    img[80..88].copy_from_slice(&0x400000u64.to_le_bytes()); // p_vaddr
    img[96..104].copy_from_slice(&16u64.to_le_bytes()); // p_filesz
    img[104..112].copy_from_slice(&32u64.to_le_bytes()); // p_memsz

    // Segment bytes at 0xC0.
    for i in 0..16 {
        img[0xC0 + i] = 0x90 + i as u8;
    }
    img
}

#[test]
#[serial]
fn segments_load_at_vaddr_with_zeroed_tail() {
    let pml4 = paging::new_user_pml4().unwrap();
    let img = tiny_elf();
    let loaded = loader::load_image(pml4, &img).expect("loads");

    assert_eq!(loaded.entry, 0x400040);
    assert_eq!(loaded.stack_top, ARGV_ADDR & !0xF);
    assert!(loaded.brk_base >= 0x400000 + 32);

    let mut seg = [0u8; 32];
    paging::copy_from_address_space(pml4, 0x400000, &mut seg).unwrap();
    for i in 0..16 {
        assert_eq!(seg[i], 0x90 + i as u8);
    }
    // Bytes [filesz, memsz) are zero.
    assert!(seg[16..32].iter().all(|&b| b == 0));

    // The stack pages below the canonical top are mapped.
    assert!(paging::translate(pml4, USER_STACK_TOP - 4096).is_some());
    paging::free_pml4(pml4);
}

#[test]
#[serial]
fn argv_block_lands_at_fixed_page() {
    let pml4 = paging::new_user_pml4().unwrap();
    let img = tiny_elf();
    loader::load_image(pml4, &img).expect("loads");

    // {argc=2, total=8, "ab\0cdef\0"}
    let mut block = [0u8; 16];
    block[0..4].copy_from_slice(&2u32.to_le_bytes());
    block[4..8].copy_from_slice(&8u32.to_le_bytes());
    block[8..16].copy_from_slice(b"ab\0cdef\0");
    loader::install_argv(pml4, &block).expect("argv installed");

    let mut out = [0u8; 16];
    paging::copy_from_address_space(pml4, ARGV_ADDR, &mut out).unwrap();
    assert_eq!(&out, &block);
    paging::free_pml4(pml4);
}

#[test]
fn oversized_images_are_rejected() {
    let pml4 = paging::new_user_pml4().unwrap();
    let too_big = vec![0u8; abi::SPAWN_ELF_MAX + 1];
    assert!(matches!(
        loader::load_image(pml4, &too_big),
        Err(loader::LoadError::TooLarge)
    ));
    paging::free_pml4(pml4);
}
