//! /proc synthesis and ctl commands.

use serial_test::serial;

use crate::fs::kfile::KFileKind;
use crate::fs::procfs;
use crate::process::table;
use crate::process::{Process, ProcessState};
use crate::{scheduler, smp, syscalls};

fn cleanup(slots: &[usize]) {
    smp::set_current_slot(None);
    for &s in slots {
        table::free_slot(s);
    }
    scheduler::test_take_wakes();
    syscalls::test_take_killed();
}

#[test]
#[serial]
fn status_file_lists_pid_ppid_state_pages() {
    let mut p = Process::empty();
    p.state = ProcessState::Ready;
    p.ppid = 1;
    let (slot, pid) = table::alloc_slot(p).unwrap();

    let mut out = [0u8; 512];
    let n = procfs::synthesize(KFileKind::ProcStatus, pid as usize, &mut out);
    let text = core::str::from_utf8(&out[..n]).unwrap();
    assert!(text.contains(&format!("pid {}\n", pid)));
    assert!(text.contains("ppid 1\n"));
    assert!(text.contains("state ready\n"));
    assert!(text.contains("pages "));
    cleanup(&[slot]);
}

#[test]
#[serial]
fn proc_dir_lists_live_pids() {
    let (s1, p1) = table::alloc_slot(Process::empty()).unwrap();
    let (s2, p2) = table::alloc_slot(Process::empty()).unwrap();

    let mut out = [0u8; 2048];
    let n = procfs::synthesize(KFileKind::ProcDir, 0, &mut out);
    let text = core::str::from_utf8(&out[..n]).unwrap();
    assert!(text.lines().any(|l| l == format!("{}", p1)));
    assert!(text.lines().any(|l| l == format!("{}", p2)));
    cleanup(&[s1, s2]);
}

#[test]
fn meminfo_reports_frame_pool() {
    let mut out = [0u8; 256];
    let n = procfs::synthesize(KFileKind::ProcMeminfo, 0, &mut out);
    let text = core::str::from_utf8(&out[..n]).unwrap();
    assert!(text.contains("total_pages "));
    assert!(text.contains("free_pages "));
    assert!(text.contains("page_size 4096\n"));
}

#[test]
#[serial]
fn ctl_kill_routes_to_process_teardown() {
    let (slot, pid) = table::alloc_slot(Process::empty()).unwrap();

    let r = procfs::ctl_write(pid as usize, b"kill", 4);
    assert_eq!(r, 4);
    assert_eq!(syscalls::test_take_killed(), vec![slot]);

    // Unknown commands and dead pids error out.
    assert!(crate::abi::is_err(procfs::ctl_write(pid as usize, b"frobnicate", 10)));
    table::free_slot(slot);
    assert!(crate::abi::is_err(procfs::ctl_write(pid as usize, b"kill", 4)));
    cleanup(&[]);
}

#[test]
#[serial]
fn open_resolves_proc_paths() {
    let (slot, pid) = table::alloc_slot(Process::empty()).unwrap();

    assert!(procfs::open("/proc").is_ok());
    assert!(procfs::open("/proc/meminfo").is_ok());
    assert!(procfs::open(&format!("/proc/{}/status", pid)).is_ok());
    assert!(procfs::open(&format!("/proc/{}/ctl", pid)).is_ok());
    assert!(procfs::open("/proc/999999/status").is_err());
    assert!(procfs::open(&format!("/proc/{}/oops", pid)).is_err());
    cleanup(&[slot]);
}
