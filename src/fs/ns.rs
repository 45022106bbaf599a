//! Per-process namespaces
//!
//! A namespace is a short table of (path prefix → channel) associations.
//! Resolution checks the kernel-internal prefixes first in a fixed
//! order, then picks the table entry with the longest segment-aware
//! prefix match and forwards the remainder to the server. Namespaces are
//! deep-copied on spawn/rfork; a mount holds a client reference on its
//! channel for as long as the entry lives.

extern crate alloc;

use alloc::string::String;
use spin::Mutex;

use crate::process::MAX_PROCESSES;

pub const MAX_MOUNTS: usize = 32;

#[derive(Clone, Debug)]
pub struct Mount {
    pub prefix: String,
    pub chan: usize,
    pub flags: u32,
}

pub struct Namespace {
    mounts: [Option<Mount>; MAX_MOUNTS],
}

/// Where a path leads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolved {
    /// Kernel-internal tree; the full path is handled in-kernel.
    Kernel,
    /// Userspace server: channel id plus the byte offset where the
    /// forwarded remainder starts (skipping the matched prefix and any
    /// leading slash).
    Channel { chan: usize, remainder: usize },
    NotFound,
}

/// Kernel-internal prefixes, tried before the mount table in this order.
const KERNEL_PREFIXES: [&str; 5] = ["/net", "/proc", "/dev/time", "/dev/klog", "/boot"];

/// Segment-aware prefix match: `/foo` matches `/foo` and `/foo/bar` but
/// not `/foobar`. Returns the matched length.
fn prefix_match(prefix: &str, path: &str) -> Option<usize> {
    if prefix == "/" {
        return if path.starts_with('/') { Some(1) } else { None };
    }
    if !path.starts_with(prefix) {
        return None;
    }
    let rest = &path[prefix.len()..];
    if rest.is_empty() || rest.starts_with('/') {
        Some(prefix.len())
    } else {
        None
    }
}

impl Namespace {
    pub const fn new() -> Self {
        const EMPTY: Option<Mount> = None;
        Self {
            mounts: [EMPTY; MAX_MOUNTS],
        }
    }

    /// Add an entry. Fails when the table is full.
    pub fn mount(&mut self, prefix: &str, chan: usize, flags: u32) -> Result<(), ()> {
        for slot in self.mounts.iter_mut() {
            if slot.is_none() {
                *slot = Some(Mount {
                    prefix: String::from(prefix),
                    chan,
                    flags,
                });
                return Ok(());
            }
        }
        Err(())
    }

    /// Remove one entry by exact prefix. Returns its channel so the
    /// caller can drop the client reference.
    pub fn unmount(&mut self, prefix: &str) -> Option<usize> {
        for slot in self.mounts.iter_mut() {
            if let Some(m) = slot {
                if m.prefix == prefix {
                    let chan = m.chan;
                    *slot = None;
                    return Some(chan);
                }
            }
        }
        None
    }

    pub fn resolve(&self, path: &str) -> Resolved {
        for kp in KERNEL_PREFIXES {
            if prefix_match(kp, path).is_some() {
                return Resolved::Kernel;
            }
        }

        let mut best: Option<(usize, usize)> = None; // (matched len, chan)
        for slot in self.mounts.iter() {
            let Some(m) = slot else { continue };
            if let Some(len) = prefix_match(&m.prefix, path) {
                if best.map(|(l, _)| len > l).unwrap_or(true) {
                    best = Some((len, m.chan));
                }
            }
        }

        match best {
            Some((len, chan)) => {
                let mut remainder = len;
                if path[remainder..].starts_with('/') {
                    remainder += 1;
                }
                Resolved::Channel { chan, remainder }
            }
            None => Resolved::NotFound,
        }
    }

    pub fn iter_live(&self) -> impl Iterator<Item = &Mount> + '_ {
        self.mounts.iter().filter_map(|m| m.as_ref())
    }

    pub fn clear(&mut self) {
        const EMPTY: Option<Mount> = None;
        self.mounts = [EMPTY; MAX_MOUNTS];
    }

    /// Full copy; the caller bumps channel client refcounts per entry.
    pub fn clone_from_ns(&mut self, other: &Namespace) {
        for (dst, src) in self.mounts.iter_mut().zip(other.mounts.iter()) {
            *dst = src.clone();
        }
    }

    /// Channel ids of all live mounts, for refcount fixes done outside
    /// the namespace lock.
    pub fn channels(&self) -> ([usize; MAX_MOUNTS], usize) {
        let mut out = [0usize; MAX_MOUNTS];
        let mut n = 0;
        for m in self.iter_live() {
            out[n] = m.chan;
            n += 1;
        }
        (out, n)
    }
}

static NAMESPACES: [Mutex<Namespace>; MAX_PROCESSES] = {
    const INIT: Mutex<Namespace> = Mutex::new(Namespace::new());
    [INIT; MAX_PROCESSES]
};

/// Run `f` on the namespace of a resource slot.
pub fn with_ns<R>(resource_slot: usize, f: impl FnOnce(&mut Namespace) -> R) -> R {
    f(&mut NAMESPACES[resource_slot].lock())
}

/// Run `f` on two distinct namespaces, ordered by slot index.
pub fn with_two_ns<R>(a: usize, b: usize, f: impl FnOnce(&mut Namespace, &mut Namespace) -> R) -> R {
    debug_assert!(a != b);
    if a < b {
        let mut na = NAMESPACES[a].lock();
        let mut nb = NAMESPACES[b].lock();
        f(&mut na, &mut nb)
    } else {
        let mut nb = NAMESPACES[b].lock();
        let mut na = NAMESPACES[a].lock();
        f(&mut na, &mut nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_aware_prefix_matching() {
        assert_eq!(prefix_match("/foo", "/foo"), Some(4));
        assert_eq!(prefix_match("/foo", "/foo/bar"), Some(4));
        assert_eq!(prefix_match("/foo", "/foobar"), None);
        assert_eq!(prefix_match("/", "/anything"), Some(1));
    }

    #[test]
    fn kernel_prefixes_win_over_mounts() {
        let mut ns = Namespace::new();
        ns.mount("/", 3, 0).unwrap();
        assert_eq!(ns.resolve("/net/tcp/clone"), Resolved::Kernel);
        assert_eq!(ns.resolve("/proc/1/status"), Resolved::Kernel);
        assert_eq!(ns.resolve("/dev/time"), Resolved::Kernel);
        assert_eq!(ns.resolve("/boot/init"), Resolved::Kernel);
    }

    #[test]
    fn longest_prefix_wins() {
        let mut ns = Namespace::new();
        ns.mount("/", 1, 0).unwrap();
        ns.mount("/srv", 2, 0).unwrap();
        ns.mount("/srv/data", 3, 0).unwrap();
        match ns.resolve("/srv/data/file.txt") {
            Resolved::Channel { chan, remainder } => {
                assert_eq!(chan, 3);
                assert_eq!(&"/srv/data/file.txt"[remainder..], "file.txt");
            }
            other => panic!("unexpected resolution {:?}", other),
        }
        match ns.resolve("/srv/other") {
            Resolved::Channel { chan, .. } => assert_eq!(chan, 2),
            other => panic!("unexpected resolution {:?}", other),
        }
    }

    #[test]
    fn unmount_removes_exactly_one_entry() {
        let mut ns = Namespace::new();
        ns.mount("/a", 1, 0).unwrap();
        ns.mount("/b", 2, 0).unwrap();
        assert_eq!(ns.unmount("/a"), Some(1));
        assert_eq!(ns.unmount("/a"), None);
        assert!(matches!(ns.resolve("/b/x"), Resolved::Channel { chan: 2, .. }));
    }

    #[test]
    fn cloned_namespace_does_not_alias() {
        let mut parent = Namespace::new();
        parent.mount("/data", 7, 0).unwrap();
        let mut child = Namespace::new();
        child.clone_from_ns(&parent);
        child.unmount("/data");
        assert!(matches!(
            parent.resolve("/data/x"),
            Resolved::Channel { chan: 7, .. }
        ));
        assert_eq!(child.resolve("/data/x"), Resolved::NotFound);
    }

    #[test]
    fn resolve_without_match_is_not_found() {
        let ns = Namespace::new();
        assert_eq!(ns.resolve("/nowhere"), Resolved::NotFound);
    }
}
