//! Process table and thread-group bookkeeping.

use serial_test::serial;

use crate::process::table;
use crate::process::{group, Process, ProcessState};
use crate::{scheduler, smp};

fn cleanup(slots: &[usize]) {
    smp::set_current_slot(None);
    for &s in slots {
        table::free_slot(s);
    }
    scheduler::test_take_wakes();
}

#[test]
#[serial]
fn pids_are_monotonic_and_slots_reusable() {
    let (s1, p1) = table::alloc_slot(Process::empty()).unwrap();
    let (s2, p2) = table::alloc_slot(Process::empty()).unwrap();
    assert!(p2 > p1);

    table::free_slot(s1);
    let (s3, p3) = table::alloc_slot(Process::empty()).unwrap();
    // The slot is reused; the pid never is.
    assert_eq!(s3, s1);
    assert!(p3 > p2);
    cleanup(&[s2, s3]);
}

#[test]
#[serial]
fn children_enumeration_follows_ppid() {
    let (parent, ppid) = table::alloc_slot(Process::empty()).unwrap();
    let mut c = Process::empty();
    c.ppid = ppid;
    let (c1, _) = table::alloc_slot(c).unwrap();
    let (c2, _) = table::alloc_slot(c).unwrap();

    let mut out = [0usize; crate::process::MAX_PROCESSES];
    let n = table::children_of(ppid, &mut out);
    assert_eq!(n, 2);
    assert!(out[..n].contains(&c1));
    assert!(out[..n].contains(&c2));
    cleanup(&[parent, c1, c2]);
}

#[test]
#[serial]
fn group_refcount_tracks_members() {
    let (leader, _) = table::alloc_slot(Process::empty()).unwrap();
    let gid = group::create(leader, 0x9000, 0, 0, 0, 0).expect("group slot");
    assert_eq!(group::ref_count(gid), 1);

    group::add_ref(gid);
    assert_eq!(group::ref_count(gid), 2);

    assert!(group::release(gid).is_none());
    // Last reference returns the tree for teardown.
    let (pml4, _cores) = group::release(gid).expect("group died");
    assert_eq!(pml4, 0x9000);
    cleanup(&[leader]);
}

#[test]
#[serial]
fn resource_slot_redirects_through_group() {
    let (leader, _) = table::alloc_slot(Process::empty()).unwrap();
    let gid = group::create(leader, 0x9000, 0, 0, 0, 0).unwrap();

    let mut thread = Process::empty();
    thread.group = Some(gid);
    let (t, _) = table::alloc_slot(thread).unwrap();
    group::add_ref(gid);

    assert_eq!(table::resource_slot(t), leader);
    assert_eq!(table::pml4_of(t), 0x9000);
    assert_eq!(table::address_space_id(t), 0x9000);

    let _ = group::release(gid);
    let _ = group::release(gid);
    cleanup(&[leader, t]);
}
