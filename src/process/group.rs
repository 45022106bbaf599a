//! Thread groups
//!
//! Shared state for threads created by `clone` with shared memory: one
//! page-table root with a reference count, a redirect to the leader's fd
//! table and namespace slots, the shared heap break and mmap cursor, and
//! the union of every member's TLB footprint. The group is freed when
//! the last member exits; the page-table tree is torn down by the caller
//! only after switching CR3 off it.

use spin::Mutex;

pub const MAX_GROUPS: usize = 64;

#[derive(Clone, Copy)]
pub struct ThreadGroup {
    pub in_use: bool,
    pub refs: u32,
    pub pml4: u64,
    /// Process-table slot whose fd-table/namespace pool entries the
    /// whole group uses.
    pub resource_slot: usize,
    pub brk_base: u64,
    pub brk: u64,
    pub mmap_next: u64,
    /// Union of member `cores_ran_on` bitmaps, for shootdown at teardown.
    pub cores_ran_on: u64,
}

impl ThreadGroup {
    const fn empty() -> Self {
        Self {
            in_use: false,
            refs: 0,
            pml4: 0,
            resource_slot: 0,
            brk_base: 0,
            brk: 0,
            mmap_next: 0,
            cores_ran_on: 0,
        }
    }
}

static GROUPS: Mutex<[ThreadGroup; MAX_GROUPS]> = Mutex::new([ThreadGroup::empty(); MAX_GROUPS]);

/// Create a group seeded from the leader's resources with one reference.
pub fn create(
    resource_slot: usize,
    pml4: u64,
    brk_base: u64,
    brk: u64,
    mmap_next: u64,
    cores: u64,
) -> Option<usize> {
    let mut groups = GROUPS.lock();
    for (idx, group) in groups.iter_mut().enumerate() {
        if !group.in_use {
            *group = ThreadGroup {
                in_use: true,
                refs: 1,
                pml4,
                resource_slot,
                brk_base,
                brk,
                mmap_next,
                cores_ran_on: cores,
            };
            return Some(idx);
        }
    }
    None
}

pub fn add_ref(gid: usize) {
    let mut groups = GROUPS.lock();
    groups[gid].refs += 1;
}

/// Drop one reference. Returns `Some((pml4, cores_ran_on))` when the
/// group just died and its address space must be torn down.
pub fn release(gid: usize) -> Option<(u64, u64)> {
    let mut groups = GROUPS.lock();
    let group = &mut groups[gid];
    group.refs -= 1;
    if group.refs == 0 {
        group.in_use = false;
        Some((group.pml4, group.cores_ran_on))
    } else {
        None
    }
}

pub fn get(gid: usize) -> ThreadGroup {
    GROUPS.lock()[gid]
}

pub fn ref_count(gid: usize) -> u32 {
    GROUPS.lock()[gid].refs
}

pub fn note_core(gid: usize, cpu: usize) {
    GROUPS.lock()[gid].cores_ran_on |= 1 << cpu;
}

/// Run `f` on the group record under the group-table lock; guards the
/// shared brk/mmap cursors and the TLB footprint union.
pub fn with_group<R>(gid: usize, f: impl FnOnce(&mut ThreadGroup) -> R) -> R {
    let mut groups = GROUPS.lock();
    f(&mut groups[gid])
}
