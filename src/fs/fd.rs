//! File descriptor tables
//!
//! One fixed table per resource slot (a process, or a thread group
//! through its leader slot). Entries are a tagged union; all refcounts
//! live in the underlying resource, so duplicating an entry is a copy
//! plus a reference bump there.

use spin::Mutex;

use crate::fs::kfile::KFile;
use crate::process::MAX_PROCESSES;

/// Fd table capacity per process. Indices are dense small integers;
/// 0/1/2 are stdin/stdout/stderr by convention.
pub const NOFILE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdEntry {
    /// Client end of an IPC channel; carries the server-issued file
    /// handle and the per-fd byte offset forwarded with T_READ/T_WRITE.
    ChannelClient { chan: usize, handle: u32, offset: u64 },
    /// Server end; the only entry kind that accepts ipc_recv/ipc_reply.
    ChannelServer { chan: usize },
    PipeRead { pipe: usize },
    PipeWrite { pipe: usize },
    /// Kernel-backed virtual file with per-fd state.
    Kernel(KFile),
}

pub struct FdTable {
    entries: [Option<FdEntry>; NOFILE],
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            entries: [None; NOFILE],
        }
    }

    /// Install at the lowest free index.
    pub fn alloc(&mut self, entry: FdEntry) -> Option<usize> {
        for (fd, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Some(fd);
            }
        }
        None
    }

    pub fn install_at(&mut self, fd: usize, entry: FdEntry) -> Option<FdEntry> {
        if fd >= NOFILE {
            return None;
        }
        self.entries[fd].replace(entry)
    }

    pub fn get(&self, fd: usize) -> Option<FdEntry> {
        if fd >= NOFILE {
            return None;
        }
        self.entries[fd]
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FdEntry> {
        if fd >= NOFILE {
            return None;
        }
        self.entries[fd].as_mut()
    }

    pub fn take(&mut self, fd: usize) -> Option<FdEntry> {
        if fd >= NOFILE {
            return None;
        }
        self.entries[fd].take()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (usize, FdEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(fd, e)| e.map(|e| (fd, e)))
    }

    pub fn clear(&mut self) {
        self.entries = [None; NOFILE];
    }

    /// Byte-for-byte copy used by rfork(RFFDG); the caller bumps the
    /// underlying resource refcounts for every copied entry.
    pub fn clone_from_table(&mut self, other: &FdTable) {
        self.entries = other.entries;
    }
}

static FD_TABLES: [Mutex<FdTable>; MAX_PROCESSES] = {
    const INIT: Mutex<FdTable> = Mutex::new(FdTable::new());
    [INIT; MAX_PROCESSES]
};

/// Run `f` on the fd table of a resource slot.
pub fn with_table<R>(resource_slot: usize, f: impl FnOnce(&mut FdTable) -> R) -> R {
    f(&mut FD_TABLES[resource_slot].lock())
}

/// Run `f` on two distinct tables at once, parent first. The caller
/// guarantees the slots differ; lock order is by slot index to keep the
/// pair deadlock-free.
pub fn with_two_tables<R>(
    a: usize,
    b: usize,
    f: impl FnOnce(&mut FdTable, &mut FdTable) -> R,
) -> R {
    debug_assert!(a != b);
    if a < b {
        let mut ta = FD_TABLES[a].lock();
        let mut tb = FD_TABLES[b].lock();
        f(&mut ta, &mut tb)
    } else {
        let mut tb = FD_TABLES[b].lock();
        let mut ta = FD_TABLES[a].lock();
        f(&mut ta, &mut tb)
    }
}

/// Bump the underlying resource's refcount for a copied entry.
pub fn retain_entry(entry: &FdEntry) {
    match entry {
        FdEntry::ChannelClient { chan, .. } => crate::ipc::retain_client(*chan),
        FdEntry::ChannelServer { chan } => crate::ipc::retain_server(*chan),
        FdEntry::PipeRead { pipe } => crate::ipc::pipe::retain_reader(*pipe),
        FdEntry::PipeWrite { pipe } => crate::ipc::pipe::retain_writer(*pipe),
        FdEntry::Kernel(kfile) => crate::fs::kfile::retain(kfile),
    }
}

/// Drop the underlying resource's refcount for a removed entry.
pub fn release_entry(entry: &FdEntry) {
    match entry {
        FdEntry::ChannelClient { chan, .. } => crate::ipc::release_client(*chan),
        FdEntry::ChannelServer { chan } => crate::ipc::release_server(*chan),
        FdEntry::PipeRead { pipe } => crate::ipc::pipe::release_reader(*pipe),
        FdEntry::PipeWrite { pipe } => crate::ipc::pipe::release_writer(*pipe),
        FdEntry::Kernel(kfile) => crate::fs::kfile::release(kfile),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::kfile::{KFile, KFileKind};

    fn kentry() -> FdEntry {
        FdEntry::Kernel(KFile::new(KFileKind::DevTime, 0))
    }

    #[test]
    fn alloc_returns_lowest_free_index() {
        let mut t = FdTable::new();
        assert_eq!(t.alloc(kentry()), Some(0));
        assert_eq!(t.alloc(kentry()), Some(1));
        t.take(0);
        assert_eq!(t.alloc(kentry()), Some(0));
    }

    #[test]
    fn install_at_replaces_and_returns_previous() {
        let mut t = FdTable::new();
        assert!(t.install_at(5, kentry()).is_none());
        assert!(t.install_at(5, kentry()).is_some());
        assert!(t.get(5).is_some());
        assert!(t.install_at(NOFILE, kentry()).is_none());
    }

    #[test]
    fn cloned_table_is_independent() {
        let mut parent = FdTable::new();
        parent.alloc(kentry());
        let mut child = FdTable::new();
        child.clone_from_table(&parent);
        child.take(0);
        assert!(parent.get(0).is_some());
        assert!(child.get(0).is_none());
    }
}
