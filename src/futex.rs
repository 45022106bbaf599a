//! Futex
//!
//! A small fixed table of waiters keyed by (address-space identity, user
//! address), where the identity is the physical address of the root page
//! table — threads of one group share it, separate processes never
//! collide. Lookups are linear; the table is sized for the practical
//! number of simultaneously blocked threads.

use spin::Mutex;

use crate::abi::{self, errno};
use crate::mm::paging;
use crate::scheduler;

const MAX_FUTEX_WAITERS: usize = 64;

#[derive(Clone, Copy)]
struct FutexWaiter {
    slot: usize,
    addr: u64,
    space: u64,
    /// 0 = no deadline.
    deadline_ms: u64,
    active: bool,
}

impl FutexWaiter {
    const fn empty() -> Self {
        Self {
            slot: 0,
            addr: 0,
            space: 0,
            deadline_ms: 0,
            active: false,
        }
    }
}

static WAITERS: Mutex<[FutexWaiter; MAX_FUTEX_WAITERS]> =
    Mutex::new([FutexWaiter::empty(); MAX_FUTEX_WAITERS]);

pub enum WaitOutcome {
    /// Value mismatch; syscall returns EAGAIN immediately.
    Mismatch,
    /// Caller enqueued; block it.
    Blocked,
    /// Table full.
    NoSpace,
    /// The futex word was unreadable.
    Fault,
}

/// FUTEX_WAIT: atomically (under the table lock) compare the word at
/// `addr` in address space `space` with `expected`, and enqueue the
/// caller on match. `timeout_ms` of 0 means wait forever.
pub fn wait(space: u64, addr: u64, expected: u32, timeout_ms: u64, caller_slot: usize) -> WaitOutcome {
    let mut waiters = WAITERS.lock();

    let mut word = [0u8; 4];
    if paging::copy_from_address_space(space, addr, &mut word).is_err() {
        return WaitOutcome::Fault;
    }
    if u32::from_le_bytes(word) != expected {
        return WaitOutcome::Mismatch;
    }

    for w in waiters.iter_mut() {
        if !w.active {
            *w = FutexWaiter {
                slot: caller_slot,
                addr,
                space,
                deadline_ms: if timeout_ms == 0 {
                    0
                } else {
                    crate::logger::boot_time_ms() + timeout_ms
                },
                active: true,
            };
            scheduler::block_current(crate::process::PendingOp::Futex);
            return WaitOutcome::Blocked;
        }
    }
    WaitOutcome::NoSpace
}

/// FUTEX_WAKE: wake up to `count` sleepers on (space, addr). Returns the
/// number woken.
pub fn wake(space: u64, addr: u64, count: u32) -> u64 {
    let mut waiters = WAITERS.lock();
    let mut woken = 0u64;
    for w in waiters.iter_mut() {
        if woken >= count as u64 {
            break;
        }
        if w.active && w.space == space && w.addr == addr {
            w.active = false;
            scheduler::complete_and_wake(w.slot, 0);
            woken += 1;
        }
    }
    woken
}

/// Wake exactly one waiter; used by thread exit for the child-tid word.
pub fn wake_one(space: u64, addr: u64) {
    wake(space, addr, 1);
}

/// Expire timed waits; called from the scheduler's idle path.
pub fn expire_timeouts(now_ms: u64) {
    let mut waiters = WAITERS.lock();
    for w in waiters.iter_mut() {
        if w.active && w.deadline_ms != 0 && now_ms >= w.deadline_ms {
            w.active = false;
            scheduler::complete_and_wake(w.slot, abi::err(errno::EAGAIN));
        }
    }
}

/// Clear a dying process's waiter entries.
pub fn remove_waiter(slot: usize) {
    let mut waiters = WAITERS.lock();
    for w in waiters.iter_mut() {
        if w.active && w.slot == slot {
            w.active = false;
        }
    }
}
