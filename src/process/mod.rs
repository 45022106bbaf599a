//! Process management subsystem
//!
//! - `types`: Process structure, states, pending-operation tags, layout
//! - `table`: the static process table and slot helpers
//! - `group`: thread groups (shared address space / fds / namespace)
//! - `loader`: ELF loading and argv staging for spawn/exec

pub mod group;
pub mod loader;
pub mod table;
mod types;

pub use types::{
    Context, IpcCont, PendingOp, Pid, Process, ProcessState, ARGV_ADDR, MAX_PROCESSES,
    USER_MMAP_BASE, USER_STACK_SIZE, USER_STACK_TOP,
};
