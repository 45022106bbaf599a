//! Memory syscalls: brk, mmap, munmap
//!
//! Anonymous memory only. The heap break grows upward from the end of
//! the loaded image; mmap carves downward from a per-process cursor
//! below the stack. Grouped threads share both cursors through their
//! thread group.

use crate::abi::{self, errno};
use crate::mm::paging::{self, MapFlags};
use crate::mm::PAGE_SIZE;
use crate::process::table;
use crate::process::group;

const PROT_EXEC: u64 = 0x4;

fn ret(r: Result<u64, i32>) -> u64 {
    match r {
        Ok(v) => v,
        Err(e) => abi::err(e),
    }
}

fn page_up(v: u64) -> u64 {
    (v + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Read-modify helpers that pick the group or inline cursors.
fn with_cursors<R>(slot: usize, f: impl FnOnce(&mut u64, &mut u64, &mut u64) -> R) -> R {
    match table::get(slot).and_then(|p| p.group) {
        Some(gid) => group::with_group(gid, |g| f(&mut g.brk_base, &mut g.brk, &mut g.mmap_next)),
        None => table::with_slot(slot, |p| {
            let mut base = p.brk_base;
            let mut brk = p.brk;
            let mut next = p.mmap_next;
            let r = f(&mut base, &mut brk, &mut next);
            p.brk_base = base;
            p.brk = brk;
            p.mmap_next = next;
            r
        })
        .expect("current slot is live"),
    }
}

pub fn brk(new_brk: u64) -> u64 {
    let r = (|| {
        let slot = table::current().ok_or(errno::EINVAL)?;
        let pml4 = table::pml4_of(slot);

        with_cursors(slot, |base, brk, _next| {
            if new_brk == 0 {
                return Ok(*brk);
            }
            if new_brk < *base {
                return Err(errno::EINVAL);
            }
            if new_brk - *base > (1 << 32) {
                return Err(errno::ENOMEM);
            }
            let old_top = page_up(*brk);
            let new_top = page_up(new_brk);
            if new_top > old_top {
                let mut va = old_top;
                while va < new_top {
                    paging::map_user_page(pml4, va, MapFlags::rw())
                        .map_err(|_| errno::ENOMEM)?;
                    va += PAGE_SIZE as u64;
                }
            } else if new_top < old_top {
                let mut va = new_top;
                while va < old_top {
                    let _ = paging::unmap_user_page(pml4, va);
                    va += PAGE_SIZE as u64;
                }
            }
            *brk = new_brk;
            Ok(new_brk)
        })
    })();
    ret(r)
}

pub fn mmap(_addr: u64, len: u64, prot: u64, _flags: u64) -> u64 {
    let r = (|| {
        let slot = table::current().ok_or(errno::EINVAL)?;
        let pml4 = table::pml4_of(slot);
        if len == 0 || len > (1 << 32) {
            return Err(errno::EINVAL);
        }
        let len = page_up(len);

        let flags = MapFlags {
            write: true,
            exec: prot & PROT_EXEC != 0,
            write_combining: false,
        };

        with_cursors(slot, |_base, _brk, next| {
            let base = (*next - len) & !(PAGE_SIZE as u64 - 1);
            let mut va = base;
            while va < base + len {
                paging::map_user_page(pml4, va, flags).map_err(|_| errno::ENOMEM)?;
                va += PAGE_SIZE as u64;
            }
            *next = base;
            Ok(base)
        })
    })();
    ret(r)
}

pub fn munmap(addr: u64, len: u64) -> u64 {
    let r = (|| {
        let slot = table::current().ok_or(errno::EINVAL)?;
        let pml4 = table::pml4_of(slot);
        if addr % PAGE_SIZE as u64 != 0 || len == 0 || len > (1 << 32) {
            return Err(errno::EINVAL);
        }
        let len = page_up(len);
        let mut va = addr;
        while va < addr + len {
            let _ = paging::unmap_user_page(pml4, va);
            va += PAGE_SIZE as u64;
        }
        Ok(0)
    })();
    ret(r)
}
