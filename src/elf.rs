/// ELF64 image parsing for the program loader
use core::mem::size_of;
use core::slice;

/// ELF magic number
pub const ELF_MAGIC: u32 = 0x464C_457F; // 0x7F 'E' 'L' 'F'

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_X86_64: u16 = 0x3E;

/// Program header type values we care about
pub const PT_LOAD: u32 = 1;

/// Program header flags
pub mod ph_flags {
    pub const PF_X: u32 = 0x1;
    pub const PF_W: u32 = 0x2;
    pub const PF_R: u32 = 0x4;
}

/// ELF64 header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF64 program header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Elf64Header {
    /// Class, endianness, version, and machine checks.
    pub fn is_valid(&self) -> bool {
        let magic = u32::from_le_bytes([
            self.e_ident[0],
            self.e_ident[1],
            self.e_ident[2],
            self.e_ident[3],
        ]);
        if magic != ELF_MAGIC {
            return false;
        }
        if self.e_ident[4] != ELFCLASS64 {
            return false;
        }
        if self.e_ident[5] != ELFDATA2LSB {
            return false;
        }
        if self.e_ident[6] != 1 {
            return false;
        }
        if self.e_machine != EM_X86_64 {
            return false;
        }
        true
    }
}

/// Borrowed view over an ELF image held in kernel memory.
pub struct ElfImage<'a> {
    data: &'a [u8],
    header: Elf64Header,
}

impl<'a> ElfImage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, &'static str> {
        if data.len() < size_of::<Elf64Header>() {
            return Err("image smaller than ELF header");
        }
        let header = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };
        if !header.is_valid() {
            return Err("not a little-endian x86_64 ELF64 image");
        }
        let ph_end = header.e_phoff as usize
            + header.e_phnum as usize * size_of::<Elf64ProgramHeader>();
        if header.e_phentsize as usize != size_of::<Elf64ProgramHeader>() || ph_end > data.len() {
            return Err("program header table out of bounds");
        }
        Ok(Self { data, header })
    }

    pub fn entry_point(&self) -> u64 {
        self.header.e_entry
    }

    pub fn program_headers(&self) -> &'a [Elf64ProgramHeader] {
        let offset = self.header.e_phoff as usize;
        let count = self.header.e_phnum as usize;
        let ptr = unsafe { self.data.as_ptr().add(offset) as *const Elf64ProgramHeader };
        unsafe { slice::from_raw_parts(ptr, count) }
    }

    /// File bytes backing a segment.
    pub fn segment_data(&self, ph: &Elf64ProgramHeader) -> Result<&'a [u8], &'static str> {
        let offset = ph.p_offset as usize;
        let filesz = ph.p_filesz as usize;
        if offset + filesz > self.data.len() {
            return Err("segment extends beyond image");
        }
        Ok(&self.data[offset..offset + filesz])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header() -> [u8; 64] {
        let mut h = [0u8; 64];
        h[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        h[4] = 2; // ELFCLASS64
        h[5] = 1; // little endian
        h[6] = 1; // version
        h[18] = 0x3E; // e_machine x86_64
        h[24..32].copy_from_slice(&0x401000u64.to_le_bytes()); // e_entry
        h[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        h[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        h
    }

    #[test]
    fn parses_minimal_image() {
        let img = minimal_header();
        let elf = ElfImage::parse(&img).expect("valid header");
        assert_eq!(elf.entry_point(), 0x401000);
        assert_eq!(elf.program_headers().len(), 0);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut img = minimal_header();
        img[0] = 0;
        assert!(ElfImage::parse(&img).is_err());
    }

    #[test]
    fn rejects_elf32() {
        let mut img = minimal_header();
        img[4] = 1;
        assert!(ElfImage::parse(&img).is_err());
    }

    #[test]
    fn rejects_foreign_machine() {
        let mut img = minimal_header();
        img[18] = 0x28; // ARM
        assert!(ElfImage::parse(&img).is_err());
    }

    #[test]
    fn rejects_truncated_phdr_table() {
        let mut img = minimal_header();
        img[56..58].copy_from_slice(&4u16.to_le_bytes()); // e_phnum = 4, no room
        assert!(ElfImage::parse(&img).is_err());
    }
}
