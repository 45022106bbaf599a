//! User-mode resume trampoline
//!
//! Every suspension happens at the syscall boundary, so resuming a
//! process means reloading its full register file from the saved
//! `Context` and executing sysretq. RCX and R11 are architectural
//! clobbers of the syscall instruction; the trampoline feeds them the
//! saved RIP and RFLAGS instead of their dead field values.

use core::arch::global_asm;

use crate::process::Context;

extern "C" {
    fn enter_user_context(ctx: *const Context) -> !;
}

/// Per-CPU staging buffer so the context outlives the table lock.
static mut RESUME_CTX: [Context; crate::smp::MAX_CPUS] =
    [Context::zero(); crate::smp::MAX_CPUS];

/// Enter user mode with the given context; never returns.
pub fn resume(ctx: Context) -> ! {
    let cpu = crate::smp::current_cpu_id();
    unsafe {
        let slot = core::ptr::addr_of_mut!(RESUME_CTX[cpu]);
        *slot = ctx;
        enter_user_context(slot)
    }
}

// Context field offsets (repr(C), 8 bytes each):
//   r15=0 r14=8 r13=16 r12=24 r11=32 r10=40 r9=48 r8=56
//   rsi=64 rdi=72 rbp=80 rdx=88 rcx=96 rbx=104 rax=112
//   rip=120 rsp=128 rflags=136
global_asm!(
    ".global enter_user_context",
    "enter_user_context:",
    "mov r15, [rdi + 0]",
    "mov r14, [rdi + 8]",
    "mov r13, [rdi + 16]",
    "mov r12, [rdi + 24]",
    "mov r10, [rdi + 40]",
    "mov r9,  [rdi + 48]",
    "mov r8,  [rdi + 56]",
    "mov rsi, [rdi + 64]",
    "mov rbp, [rdi + 80]",
    "mov rdx, [rdi + 88]",
    "mov rbx, [rdi + 104]",
    "mov rax, [rdi + 112]",
    "mov rcx, [rdi + 120]", // rip for sysretq
    "mov r11, [rdi + 136]", // rflags for sysretq
    "mov rsp, [rdi + 128]",
    "mov rdi, [rdi + 72]",
    "swapgs",
    "sysretq",
);
