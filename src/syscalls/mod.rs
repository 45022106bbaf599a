//! Syscall subsystem
//!
//! - `numbers`: the enumerated ABI
//! - `types`: user-pointer validation and copy helpers
//! - `file`: open/create/read/write/close/stat and friends
//! - `process`: spawn/exec/wait/exit/rfork and lifecycle policy
//! - `thread`: clone/futex/arch_prctl
//! - `ipc`: pipe/ipc_pair/ipc_recv/ipc_reply/mount/unmount
//! - `memory`: brk/mmap/munmap
//! - `system`: sysinfo/klog/shutdown
//!
//! Entry is the syscall instruction: the stub spills the user register
//! file into this core's per-CPU area, switches to the kernel stack,
//! and calls `syscall_dispatch`. The prologue mirrors the register file
//! into the process table, which is what makes continuation-free
//! blocking possible: any core can later resume the process from its
//! saved frame with `syscall_ret` in RAX. The epilogue either sysrets
//! straight back or, when the syscall blocked (or the process stopped
//! being runnable), hands the core to the scheduler and never returns.

mod file;
mod ipc;
mod memory;
pub mod numbers;
mod process;
mod system;
mod thread;
pub mod types;

pub use numbers::*;
pub use process::kill_slot;

use core::arch::global_asm;
use x86_64::registers::model_specific::{LStar, SFMask};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use crate::abi::{self, errno};
use crate::process::table;
use crate::process::ProcessState;
use crate::scheduler;
use crate::smp;

extern "C" {
    fn syscall_entry_stub();
}

/// Program LSTAR/SFMASK on the calling core. STAR and EFER.SCE are set
/// by the GDT module, which owns the selector layout.
pub fn init_cpu() {
    LStar::write(VirtAddr::new(syscall_entry_stub as u64));
    // Interrupts off while on the entry path; the dispatcher re-enables.
    SFMask::write(RFlags::INTERRUPT_FLAG);
}

/// Copy the per-CPU saved user frame into the current process so any
/// core can resume it later.
fn save_user_context() {
    let Some(slot) = table::current() else {
        return;
    };
    let area = smp::area(smp::current_cpu_id());
    table::with_slot(slot, |p| {
        p.ctx.rip = area.saved_rcx;
        p.ctx.rflags = area.saved_r11;
        p.ctx.rsp = area.user_rsp;
        p.ctx.rbx = area.saved_rbx;
        p.ctx.rbp = area.saved_rbp;
        p.ctx.r12 = area.saved_r12;
        p.ctx.r13 = area.saved_r13;
        p.ctx.r14 = area.saved_r14;
        p.ctx.r15 = area.saved_r15;
        p.ctx.rdi = area.saved_rdi;
        p.ctx.rsi = area.saved_rsi;
        p.ctx.rdx = area.saved_rdx;
        p.ctx.r10 = area.saved_r10;
        p.ctx.r8 = area.saved_r8;
        p.ctx.r9 = area.saved_r9;
    });
}

/// Main syscall dispatcher
#[no_mangle]
pub extern "C" fn syscall_dispatch(
    nr: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
) -> u64 {
    save_user_context();
    crate::arch::interrupts_on();

    let result = match nr {
        SYS_OPEN => file::open(arg1, arg2),
        SYS_CREATE => file::create(arg1, arg2, arg3),
        SYS_READ => file::read(arg1, arg2, arg3),
        SYS_WRITE => file::write(arg1, arg2, arg3),
        SYS_CLOSE => file::close(arg1),
        SYS_STAT => file::stat(arg1, arg2),
        SYS_SEEK => file::seek(arg1, arg2, arg3),
        SYS_REMOVE => file::remove(arg1, arg2),
        SYS_MOUNT => ipc::mount(arg1, arg2, arg3, arg4),
        SYS_BIND => ipc::bind(arg1, arg2, arg3, arg4),
        SYS_UNMOUNT => ipc::unmount(arg1, arg2),
        SYS_RFORK => process::rfork(arg1),
        SYS_EXEC => process::exec(arg1, arg2),
        SYS_WAIT => process::wait(arg1, arg2),
        SYS_EXIT => process::exit(arg1),
        SYS_PIPE => ipc::pipe(arg1),
        SYS_BRK => memory::brk(arg1),
        SYS_IPC_RECV => ipc::ipc_recv(arg1, arg2),
        SYS_IPC_REPLY => ipc::ipc_reply(arg1, arg2),
        SYS_SPAWN => process::spawn(arg1, arg2, arg3, arg4, arg5),
        SYS_PREAD => file::pread(arg1, arg2, arg3, arg4),
        SYS_PWRITE => file::pwrite(arg1, arg2, arg3, arg4),
        SYS_KLOG => system::klog(arg1, arg2, arg3),
        SYS_SYSINFO => system::sysinfo(arg1),
        SYS_SLEEP => process::sleep(arg1),
        SYS_SHUTDOWN => system::shutdown(arg1),
        SYS_GETPID => process::getpid(),
        SYS_RENAME => file::rename(arg1, arg2, arg3, arg4),
        SYS_TRUNCATE => file::truncate(arg1, arg2),
        SYS_WSTAT => file::wstat(arg1, arg2, arg3, arg4, arg5),
        SYS_SETUID => process::setuid(arg1),
        SYS_GETUID => process::getuid(),
        SYS_MMAP => memory::mmap(arg1, arg2, arg3, arg4),
        SYS_MUNMAP => memory::munmap(arg1, arg2),
        SYS_DUP => file::dup(arg1),
        SYS_DUP2 => file::dup2(arg1, arg2),
        SYS_ARCH_PRCTL => thread::arch_prctl(arg1, arg2),
        SYS_CLONE => thread::clone(arg1, arg2, arg3, arg4, arg5),
        SYS_FUTEX => thread::futex_syscall(arg1, arg2, arg3, arg4),
        SYS_IPC_PAIR => ipc::ipc_pair(arg1),
        _ => {
            crate::kwarn!("unknown syscall {}", nr);
            abi::err(errno::ENOSYS)
        }
    };
    result
}

/// Decide the return path after a syscall: true means the process can
/// sysret directly; false hands the core to the scheduler (the syscall
/// blocked, the process exited or was killed, or exec replaced its
/// image).
#[no_mangle]
extern "C" fn syscall_should_return() -> bool {
    let blocked = scheduler::take_block_pending();
    if blocked {
        return false;
    }
    match table::current().and_then(table::get) {
        Some(p) => p.state == ProcessState::Running,
        None => false,
    }
}

/// Never returns: picks the next runnable process.
#[no_mangle]
extern "C" fn syscall_yield_to_scheduler() -> ! {
    // A process killed while executing on this core finishes its
    // teardown here, before the core moves on.
    if let Some(slot) = table::current() {
        let killed = table::get(slot)
            .map(|p| p.state == ProcessState::Zombie && (p.pml4 != 0 || p.group.is_some()))
            .unwrap_or(false);
        if killed {
            process::finish_kill(slot);
        }
    }
    scheduler::run_next()
}

// Entry stub. Register use on arrival: RAX = nr, RDI RSI RDX R10 R8 =
// args, RCX = user RIP, R11 = user RFLAGS. The user register file goes
// to GS slots (smp::PerCpuArea layout), arguments shuffle into the
// SysV positions, and the return value rides back in RAX.
global_asm!(
    ".global syscall_entry_stub",
    "syscall_entry_stub:",
    "swapgs",
    "mov gs:[0], rsp",   // user rsp
    "mov gs:[32], rcx",  // user rip
    "mov gs:[40], r11",  // user rflags
    "mov gs:[48], rbx",
    "mov gs:[56], rbp",
    "mov gs:[64], r12",
    "mov gs:[72], r13",
    "mov gs:[80], r14",
    "mov gs:[88], r15",
    "mov gs:[96], rdi",
    "mov gs:[104], rsi",
    "mov gs:[112], rdx",
    "mov gs:[120], r10",
    "mov gs:[128], r8",
    "mov gs:[136], r9",
    "mov rsp, gs:[8]", // kernel stack
    // syscall_dispatch(nr, a1, a2, a3, a4, a5)
    "mov r9, r8",  // arg5
    "mov r8, r10", // arg4
    "mov rcx, rdx", // arg3
    "mov rdx, rsi", // arg2
    "mov rsi, rdi", // arg1
    "mov rdi, rax", // nr
    "call syscall_dispatch",
    "mov rbx, rax", // keep result across the next call
    "call syscall_should_return",
    "test al, al",
    "jz 2f",
    // Fast path: restore the user frame from the GS slots and sysret.
    "mov rax, rbx",
    "mov rbx, gs:[48]",
    "mov rbp, gs:[56]",
    "mov r12, gs:[64]",
    "mov r13, gs:[72]",
    "mov r14, gs:[80]",
    "mov r15, gs:[88]",
    "mov rdi, gs:[96]",
    "mov rsi, gs:[104]",
    "mov rdx, gs:[112]",
    "mov r10, gs:[120]",
    "mov r8, gs:[128]",
    "mov r9, gs:[136]",
    "mov rcx, gs:[32]", // user rip
    "mov r11, gs:[40]", // user rflags
    "mov rsp, gs:[0]",  // user rsp
    "swapgs",
    "sysretq",
    // Slow path: the scheduler owns this core now.
    "2:",
    "call syscall_yield_to_scheduler",
);
