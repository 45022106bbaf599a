//! procfs
//!
//! `/proc` lists live pids, `/proc/N/status` and `/proc/N/ctl` expose
//! one process each, `/proc/meminfo` summarizes the frame pool. All
//! content is synthesized into a caller buffer at read time.

use core::fmt::Write;

use crate::abi::{self, errno};
use crate::fs::kfile::{KFile, KFileKind};
use crate::logger::BufWriter;
use crate::mm::pmm;
use crate::process::table;
use crate::process::ProcessState;

pub fn open(path: &str) -> Result<KFile, i32> {
    let rest = path.strip_prefix("/proc").ok_or(errno::ENOENT)?;
    let rest = rest.strip_prefix('/').unwrap_or(rest);

    if rest.is_empty() {
        return Ok(KFile::new(KFileKind::ProcDir, 0));
    }
    if rest == "meminfo" {
        return Ok(KFile::new(KFileKind::ProcMeminfo, 0));
    }

    let (pid_str, file) = rest.split_once('/').ok_or(errno::ENOENT)?;
    let pid: u64 = pid_str.parse().map_err(|_| errno::ENOENT)?;
    if table::find_by_pid(pid).is_none() {
        return Err(errno::ENOENT);
    }
    match file {
        "status" => Ok(KFile::new(KFileKind::ProcStatus, pid as usize)),
        "ctl" => Ok(KFile::new(KFileKind::ProcCtl, pid as usize)),
        _ => Err(errno::ENOENT),
    }
}

fn state_name(state: ProcessState) -> &'static str {
    match state {
        ProcessState::New => "new",
        ProcessState::Ready => "ready",
        ProcessState::Running => "running",
        ProcessState::Blocked => "blocked",
        ProcessState::Zombie => "zombie",
        ProcessState::Dead => "dead",
    }
}

/// Fill `out` with the file's current content.
pub fn synthesize(kind: KFileKind, obj: usize, out: &mut [u8]) -> usize {
    let mut w = BufWriter::new(out);
    match kind {
        KFileKind::ProcDir => {
            let table = table::table_lock();
            for slot in table.iter() {
                if let Some(p) = slot {
                    if p.state != ProcessState::Dead {
                        let _ = write!(w, "{}\n", p.pid);
                    }
                }
            }
        }
        KFileKind::ProcStatus => {
            let pid = obj as u64;
            if let Some(slot) = table::find_by_pid(pid) {
                let pml4 = table::pml4_of(slot);
                let pages = crate::mm::paging::count_user_pages(pml4);
                if let Some(p) = table::get(slot) {
                    let _ = write!(
                        w,
                        "pid {}\nppid {}\nstate {}\npages {}\n",
                        p.pid,
                        p.ppid,
                        state_name(p.state),
                        pages
                    );
                }
            }
        }
        KFileKind::ProcMeminfo => {
            let (total, free) = pmm::stats();
            let _ = write!(
                w,
                "total_pages {}\nfree_pages {}\npage_size 4096\n",
                total, free
            );
        }
        _ => {}
    }
    w.len()
}

/// `/proc/N/ctl` commands. `kill` marks the target zombie, wakes its
/// parent, and releases its resources.
pub fn ctl_write(pid: usize, data: &[u8], len: usize) -> u64 {
    let text = core::str::from_utf8(data).unwrap_or("");
    match text.trim_end_matches('\n').trim() {
        "kill" => match table::find_by_pid(pid as u64) {
            Some(slot) => {
                crate::syscalls::kill_slot(slot);
                len as u64
            }
            None => abi::err(errno::ENOENT),
        },
        _ => abi::err(errno::EINVAL),
    }
}
