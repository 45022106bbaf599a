//! System call numbers
//!
//! The stable kernel ABI; userspace and the libc shim compile against
//! the same table.

pub const SYS_OPEN: u64 = 0;
pub const SYS_CREATE: u64 = 1;
pub const SYS_READ: u64 = 2;
pub const SYS_WRITE: u64 = 3;
pub const SYS_CLOSE: u64 = 4;
pub const SYS_STAT: u64 = 5;
pub const SYS_SEEK: u64 = 6;
pub const SYS_REMOVE: u64 = 7;
pub const SYS_MOUNT: u64 = 8;
pub const SYS_BIND: u64 = 9;
pub const SYS_UNMOUNT: u64 = 10;
pub const SYS_RFORK: u64 = 11;
pub const SYS_EXEC: u64 = 12;
pub const SYS_WAIT: u64 = 13;
pub const SYS_EXIT: u64 = 14;
pub const SYS_PIPE: u64 = 15;
pub const SYS_BRK: u64 = 16;
pub const SYS_IPC_RECV: u64 = 17;
pub const SYS_IPC_REPLY: u64 = 18;
pub const SYS_SPAWN: u64 = 19;
pub const SYS_PREAD: u64 = 20;
pub const SYS_PWRITE: u64 = 21;
pub const SYS_KLOG: u64 = 22;
pub const SYS_SYSINFO: u64 = 23;
pub const SYS_SLEEP: u64 = 24;
pub const SYS_SHUTDOWN: u64 = 25;
pub const SYS_GETPID: u64 = 26;
pub const SYS_RENAME: u64 = 27;
pub const SYS_TRUNCATE: u64 = 28;
pub const SYS_WSTAT: u64 = 29;
pub const SYS_SETUID: u64 = 30;
pub const SYS_GETUID: u64 = 31;
pub const SYS_MMAP: u64 = 32;
pub const SYS_MUNMAP: u64 = 33;
pub const SYS_DUP: u64 = 34;
pub const SYS_DUP2: u64 = 35;
pub const SYS_ARCH_PRCTL: u64 = 36;
pub const SYS_CLONE: u64 = 37;
pub const SYS_FUTEX: u64 = 38;
pub const SYS_IPC_PAIR: u64 = 39;
