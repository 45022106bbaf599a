//! Pipes
//!
//! Bounded byte rings with reader/writer reference counts. Reads block
//! when the ring is empty while writers remain; writes block when it is
//! full while readers remain, resuming as the reader drains. EOF is an
//! empty ring with no writers; writing with no readers is an error, not
//! a process kill.
//!
//! Blocked operations are finished by their peer: the side that makes
//! progress copies through the waiter's recorded user buffer (possibly
//! in another address space) and wakes it with the final byte count.

use spin::Mutex;

use crate::abi::errno;
use crate::mm::paging;
use crate::process::table;
use crate::scheduler;

pub const PIPE_BUF_SIZE: usize = 4096;
pub const MAX_PIPES: usize = 32;
const MAX_PIPE_WAITERS: usize = 8;

struct Pipe {
    data: [u8; PIPE_BUF_SIZE],
    read_pos: usize,
    count: usize,
    readers: u32,
    writers: u32,
    read_waiters: [usize; MAX_PIPE_WAITERS],
    read_waiter_count: usize,
    write_waiters: [usize; MAX_PIPE_WAITERS],
    write_waiter_count: usize,
    in_use: bool,
}

impl Pipe {
    const fn new() -> Self {
        Self {
            data: [0; PIPE_BUF_SIZE],
            read_pos: 0,
            count: 0,
            readers: 0,
            writers: 0,
            read_waiters: [0; MAX_PIPE_WAITERS],
            read_waiter_count: 0,
            write_waiters: [0; MAX_PIPE_WAITERS],
            write_waiter_count: 0,
            in_use: false,
        }
    }

    fn push(&mut self, src: &[u8]) -> usize {
        let to_write = src.len().min(PIPE_BUF_SIZE - self.count);
        for &b in &src[..to_write] {
            let wp = (self.read_pos + self.count) % PIPE_BUF_SIZE;
            self.data[wp] = b;
            self.count += 1;
        }
        to_write
    }

    fn pop(&mut self, dst: &mut [u8]) -> usize {
        let to_read = dst.len().min(self.count);
        for b in dst[..to_read].iter_mut() {
            *b = self.data[self.read_pos];
            self.read_pos = (self.read_pos + 1) % PIPE_BUF_SIZE;
            self.count -= 1;
        }
        to_read
    }

    fn push_read_waiter(&mut self, slot: usize) -> bool {
        if self.read_waiter_count >= MAX_PIPE_WAITERS {
            return false;
        }
        self.read_waiters[self.read_waiter_count] = slot;
        self.read_waiter_count += 1;
        true
    }

    fn push_write_waiter(&mut self, slot: usize) -> bool {
        if self.write_waiter_count >= MAX_PIPE_WAITERS {
            return false;
        }
        self.write_waiters[self.write_waiter_count] = slot;
        self.write_waiter_count += 1;
        true
    }

    fn pop_read_waiter(&mut self) -> Option<usize> {
        if self.read_waiter_count == 0 {
            return None;
        }
        let slot = self.read_waiters[0];
        self.read_waiters.copy_within(1..self.read_waiter_count, 0);
        self.read_waiter_count -= 1;
        Some(slot)
    }

    fn pop_write_waiter(&mut self) -> Option<usize> {
        if self.write_waiter_count == 0 {
            return None;
        }
        let slot = self.write_waiters[0];
        self.write_waiters.copy_within(1..self.write_waiter_count, 0);
        self.write_waiter_count -= 1;
        Some(slot)
    }
}

static PIPES: [Mutex<Pipe>; MAX_PIPES] = {
    const INIT: Mutex<Pipe> = Mutex::new(Pipe::new());
    [INIT; MAX_PIPES]
};

/// Outcome of a read/write attempt from the syscall layer.
pub enum IoOutcome {
    /// Finished; value is the syscall return.
    Done(u64),
    /// Caller must block; the waiter is already registered.
    Blocked,
}

/// Allocate a pipe with one reader and one writer reference.
pub fn alloc() -> Option<usize> {
    for (idx, pipe) in PIPES.iter().enumerate() {
        let mut p = pipe.lock();
        if !p.in_use {
            *p = Pipe::new();
            p.in_use = true;
            p.readers = 1;
            p.writers = 1;
            return Some(idx);
        }
    }
    None
}

pub fn retain_reader(id: usize) {
    PIPES[id].lock().readers += 1;
}

pub fn retain_writer(id: usize) {
    PIPES[id].lock().writers += 1;
}

pub fn release_reader(id: usize) {
    let mut p = PIPES[id].lock();
    p.readers = p.readers.saturating_sub(1);
    if p.readers == 0 {
        // Writers see a broken pipe.
        while let Some(slot) = p.pop_write_waiter() {
            scheduler::complete_and_wake(slot, crate::abi::err(errno::EIO));
        }
    }
    maybe_free(&mut p);
}

pub fn release_writer(id: usize) {
    let mut p = PIPES[id].lock();
    p.writers = p.writers.saturating_sub(1);
    if p.writers == 0 && p.count == 0 {
        // Readers at EOF.
        while let Some(slot) = p.pop_read_waiter() {
            scheduler::complete_and_wake(slot, 0);
        }
    }
    maybe_free(&mut p);
}

fn maybe_free(p: &mut Pipe) {
    if p.readers == 0 && p.writers == 0 {
        p.in_use = false;
    }
}

/// Feed blocked writers as ring space frees up; each writer's remaining
/// bytes are pulled straight from its user buffer in its own address
/// space, and it wakes once its whole write landed.
fn service_write_waiters(p: &mut Pipe) {
    while p.count < PIPE_BUF_SIZE && p.write_waiter_count > 0 {
        let slot = p.write_waiters[0];
        let (pml4, buf, remaining, progress) = match table::get(slot) {
            Some(proc) => (
                table::pml4_of(slot),
                proc.pending_buf,
                proc.pending_len,
                proc.pending_progress,
            ),
            None => {
                p.pop_write_waiter();
                continue;
            }
        };

        let space = PIPE_BUF_SIZE - p.count;
        let chunk = remaining.min(space).min(512);
        let mut tmp = [0u8; 512];
        if paging::copy_from_address_space(pml4, buf, &mut tmp[..chunk]).is_err() {
            p.pop_write_waiter();
            scheduler::complete_and_wake(slot, crate::abi::err(errno::EFAULT));
            continue;
        }
        let pushed = p.push(&tmp[..chunk]);

        if pushed == remaining {
            p.pop_write_waiter();
            scheduler::complete_and_wake(slot, (progress + pushed) as u64);
        } else {
            table::with_slot(slot, |proc| {
                proc.pending_buf += pushed as u64;
                proc.pending_len -= pushed;
                proc.pending_progress += pushed;
            });
            if pushed == 0 {
                break;
            }
        }
    }
}

/// Complete blocked readers as data arrives. A reader returns as soon as
/// at least one byte is available.
fn service_read_waiters(p: &mut Pipe) {
    while p.count > 0 && p.read_waiter_count > 0 {
        let slot = p.read_waiters[0];
        let (pml4, buf, len) = match table::get(slot) {
            Some(proc) => (table::pml4_of(slot), proc.pending_buf, proc.pending_len),
            None => {
                p.pop_read_waiter();
                continue;
            }
        };

        let mut tmp = [0u8; PIPE_BUF_SIZE];
        let n = p.pop(&mut tmp[..len.min(PIPE_BUF_SIZE)]);
        if paging::copy_to_address_space(pml4, buf, &tmp[..n]).is_err() {
            p.pop_read_waiter();
            scheduler::complete_and_wake(slot, crate::abi::err(errno::EFAULT));
            continue;
        }
        p.pop_read_waiter();
        scheduler::complete_and_wake(slot, n as u64);
    }
    if p.writers == 0 && p.count == 0 {
        while let Some(slot) = p.pop_read_waiter() {
            scheduler::complete_and_wake(slot, 0);
        }
    }
}

/// Read up to `len` bytes into the caller's buffer at `buf`. A read
/// returns as soon as any bytes are available; with the ring empty it
/// blocks unless the writers are gone (EOF). The caller is registered
/// as a waiter before `Blocked` is reported.
pub fn read(id: usize, pml4: u64, buf: u64, len: usize, caller_slot: usize) -> IoOutcome {
    let mut p = PIPES[id].lock();
    if !p.in_use {
        return IoOutcome::Done(crate::abi::err(errno::EBADF));
    }
    if p.count > 0 {
        let mut tmp = [0u8; PIPE_BUF_SIZE];
        let n = p.pop(&mut tmp[..len.min(PIPE_BUF_SIZE)]);
        if paging::copy_to_address_space(pml4, buf, &tmp[..n]).is_err() {
            return IoOutcome::Done(crate::abi::err(errno::EFAULT));
        }
        service_write_waiters(&mut p);
        return IoOutcome::Done(n as u64);
    }
    if p.writers == 0 {
        return IoOutcome::Done(0); // EOF
    }
    if !p.push_read_waiter(caller_slot) {
        return IoOutcome::Done(crate::abi::err(errno::EAGAIN));
    }
    scheduler::set_pending_dest(caller_slot, id, buf, len);
    scheduler::block_current(crate::process::PendingOp::PipeRead);
    IoOutcome::Blocked
}

/// Write `len` bytes from the caller's buffer at `buf`. Accepts what
/// fits; when the ring fills first, the caller blocks with its progress
/// recorded and the drain path finishes the write.
pub fn write(id: usize, pml4: u64, buf: u64, len: usize, caller_slot: usize) -> IoOutcome {
    let mut p = PIPES[id].lock();
    if !p.in_use {
        return IoOutcome::Done(crate::abi::err(errno::EBADF));
    }
    if p.readers == 0 {
        return IoOutcome::Done(crate::abi::err(errno::EIO));
    }

    let mut written = 0usize;
    loop {
        while written < len && p.count < PIPE_BUF_SIZE {
            let chunk = (len - written).min(PIPE_BUF_SIZE - p.count).min(512);
            let mut tmp = [0u8; 512];
            if paging::copy_from_address_space(pml4, buf + written as u64, &mut tmp[..chunk])
                .is_err()
            {
                return IoOutcome::Done(crate::abi::err(errno::EFAULT));
            }
            written += p.push(&tmp[..chunk]);
        }
        if written == len {
            break;
        }
        // Ring full: let blocked readers drain it, then keep filling.
        let before = p.count;
        service_read_waiters(&mut p);
        if p.count >= before {
            break;
        }
    }
    if written > 0 {
        service_read_waiters(&mut p);
    }
    if written == len {
        return IoOutcome::Done(written as u64);
    }
    if !p.push_write_waiter(caller_slot) {
        return IoOutcome::Done(written as u64);
    }
    scheduler::set_pending_dest(caller_slot, id, buf + written as u64, len - written);
    table::with_slot(caller_slot, |proc| {
        proc.pending_progress = written;
    });
    scheduler::block_current(crate::process::PendingOp::PipeWrite);
    IoOutcome::Blocked
}

/// Drop a dead process's waiter registrations during teardown.
pub fn remove_waiter(slot: usize) {
    for pipe in PIPES.iter() {
        let mut p = pipe.lock();
        if !p.in_use {
            continue;
        }
        for i in (0..p.read_waiter_count).rev() {
            if p.read_waiters[i] == slot {
                let end = p.read_waiter_count;
                p.read_waiters.copy_within(i + 1..end, i);
                p.read_waiter_count -= 1;
            }
        }
        for i in (0..p.write_waiter_count).rev() {
            if p.write_waiters[i] == slot {
                let end = p.write_waiter_count;
                p.write_waiters.copy_within(i + 1..end, i);
                p.write_waiter_count -= 1;
            }
        }
    }
}

/// (readers, writers, buffered) for tests and proc introspection.
pub fn stat(id: usize) -> Option<(u32, u32, usize)> {
    let p = PIPES[id].lock();
    if !p.in_use && p.readers == 0 && p.writers == 0 {
        return None;
    }
    Some((p.readers, p.writers, p.count))
}
