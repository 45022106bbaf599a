//! Mock memory layer: address spaces are sparse page maps keyed by a
//! fake PML4 id, so cross-space copies (pipe/IPC/TCP wakers, the
//! loader) behave like the real kernel without touching hardware.

pub const PAGE_SIZE: usize = 4096;

pub mod pmm {
    pub fn stats() -> (u64, u64) {
        (4096, 1024)
    }
}

pub mod paging {
    use super::PAGE_SIZE;
    use spin::Mutex;
    use std::collections::BTreeMap;

    pub const USER_VA_END: u64 = 0x0000_8000_0000_0000;
    pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;
    pub const PHYS_OFFSET: u64 = 0xFFFF_8000_0000_0000;

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
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum MapError {
        NoMemory,
        NotUserAddress,
        NotMapped,
    }

    struct Space {
        pages: BTreeMap<u64, Box<[u8; PAGE_SIZE]>>,
    }

    static SPACES: Mutex<BTreeMap<u64, Space>> = Mutex::new(BTreeMap::new());
    static NEXT_ID: Mutex<u64> = Mutex::new(0x1000);

    pub fn phys_to_virt(phys: u64) -> u64 {
        phys
    }

    pub fn kernel_pml4_phys() -> u64 {
        0
    }

    pub fn init() {}

    pub fn new_user_pml4() -> Result<u64, MapError> {
        let mut next = NEXT_ID.lock();
        let id = *next;
        *next += 0x1000;
        SPACES.lock().insert(
            id,
            Space {
                pages: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    pub fn map_user_frame(pml4: u64, va: u64, _phys: u64, flags: MapFlags) -> Result<(), MapError> {
        map_user_page(pml4, va, flags)
    }

    pub fn map_user_page(pml4: u64, va: u64, _flags: MapFlags) -> Result<(), MapError> {
        if va >= USER_VA_END {
            return Err(MapError::NotUserAddress);
        }
        let mut spaces = SPACES.lock();
        let space = spaces.get_mut(&pml4).ok_or(MapError::NoMemory)?;
        space
            .pages
            .entry(va & !(PAGE_SIZE as u64 - 1))
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
        Ok(())
    }

    pub fn unmap_user_page(pml4: u64, va: u64) -> Result<(), MapError> {
        let mut spaces = SPACES.lock();
        let space = spaces.get_mut(&pml4).ok_or(MapError::NotMapped)?;
        space
            .pages
            .remove(&(va & !(PAGE_SIZE as u64 - 1)))
            .map(|_| ())
            .ok_or(MapError::NotMapped)
    }

    pub fn translate(pml4: u64, va: u64) -> Option<u64> {
        let spaces = SPACES.lock();
        let space = spaces.get(&pml4)?;
        space
            .pages
            .contains_key(&(va & !(PAGE_SIZE as u64 - 1)))
            .then_some(va)
    }

    pub fn copy_to_address_space(pml4: u64, mut va: u64, mut src: &[u8]) -> Result<(), MapError> {
        let mut spaces = SPACES.lock();
        let space = spaces.get_mut(&pml4).ok_or(MapError::NotMapped)?;
        while !src.is_empty() {
            let page = va & !(PAGE_SIZE as u64 - 1);
            let at = (va - page) as usize;
            let n = (PAGE_SIZE - at).min(src.len());
            let frame = space.pages.get_mut(&page).ok_or(MapError::NotMapped)?;
            frame[at..at + n].copy_from_slice(&src[..n]);
            va += n as u64;
            src = &src[n..];
        }
        Ok(())
    }

    pub fn copy_from_address_space(
        pml4: u64,
        mut va: u64,
        mut dst: &mut [u8],
    ) -> Result<(), MapError> {
        let spaces = SPACES.lock();
        let space = spaces.get(&pml4).ok_or(MapError::NotMapped)?;
        while !dst.is_empty() {
            let page = va & !(PAGE_SIZE as u64 - 1);
            let at = (va - page) as usize;
            let n = (PAGE_SIZE - at).min(dst.len());
            let frame = space.pages.get(&page).ok_or(MapError::NotMapped)?;
            dst[..n].copy_from_slice(&frame[at..at + n]);
            va += n as u64;
            let rest = dst;
            dst = &mut rest[n..];
        }
        Ok(())
    }

    pub fn count_user_pages(pml4: u64) -> u64 {
        SPACES
            .lock()
            .get(&pml4)
            .map(|s| s.pages.len() as u64)
            .unwrap_or(0)
    }

    pub fn deep_copy_user(src_pml4: u64) -> Result<u64, MapError> {
        let dst = new_user_pml4()?;
        let mut spaces = SPACES.lock();
        let pages = spaces
            .get(&src_pml4)
            .ok_or(MapError::NotMapped)?
            .pages
            .clone();
        spaces.get_mut(&dst).unwrap().pages = pages;
        Ok(dst)
    }

    pub fn free_user_space(pml4: u64) {
        if let Some(space) = SPACES.lock().get_mut(&pml4) {
            space.pages.clear();
        }
    }

    pub fn free_pml4(pml4: u64) {
        SPACES.lock().remove(&pml4);
    }

    /// Test helper: a fresh space with `pages` pages mapped at `base`.
    pub fn test_space_with(base: u64, pages: usize) -> u64 {
        let id = new_user_pml4().unwrap();
        for i in 0..pages {
            map_user_page(id, base + (i * PAGE_SIZE) as u64, MapFlags::rw()).unwrap();
        }
        id
    }
}
