//! Process type definitions
//!
//! The Process structure, its lifecycle states, the blocked-operation
//! tags, the saved CPU context, and the user memory layout constants.

/// Process ID type. Issued monotonically, never reused while a slot
/// holding it is live.
pub type Pid = u64;

/// Capacity of the static process table.
pub const MAX_PROCESSES: usize = 256;

/// Process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Zombie,
    Dead,
}

/// Continuation tag for a client blocked on an IPC reply: what the
/// kernel does with the server's response on behalf of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcCont {
    None,
    /// R_OK allocates a channel-client fd carrying the server handle.
    Open { chan: usize },
    /// Copy the reply payload into the user buffer and advance the fd
    /// offset.
    Read { buf: u64, len: usize, fd: usize },
    /// R_OK carries the authoritative byte count written.
    Write { fd: usize },
    /// Copy the reply Stat record out.
    Stat { buf: u64 },
    /// R_OK maps to 0 (close/remove/rename/truncate/wstat/ctl).
    Simple,
}

/// Why a blocked process is blocked, and therefore which wake condition
/// applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    None,
    IpcRecv,
    IpcReplyWait,
    PipeRead,
    PipeWrite,
    NetRead,
    NetWrite,
    TcpConnect,
    TcpAccept,
    Dns,
    Futex,
    Wait,
    Sleep,
}

// ---------------------------------------------------------------------------
// User memory layout
// ---------------------------------------------------------------------------

/// Top of the user stack, just below the canonical user ceiling.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;
/// Bytes of stack mapped at spawn/exec.
pub const USER_STACK_SIZE: u64 = 256 * 1024;
/// The argv block lives one page below the stack top; the initial user
/// RSP starts underneath it.
pub const ARGV_ADDR: u64 = USER_STACK_TOP - 4096;
/// Per-process anonymous mmap cursor start; allocations walk downward.
pub const USER_MMAP_BASE: u64 = 0x0000_6000_0000_0000;

/// CPU context saved at the syscall boundary. Field order is fixed: the
/// resume trampoline indexes it by offset.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

impl Context {
    pub const fn zero() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: 0,
            rsp: 0,
            rflags: 0x202, // IF set
        }
    }
}

/// Process structure
///
/// A process either owns its address space, fd table, and namespace
/// exclusively, or points at exactly one thread group that carries them;
/// never both. The fd table and namespace themselves live in pools
/// indexed by the owning slot (see `fs::fd` and `fs::ns`), so `group`
/// only redirects which slot's pool entries apply.
#[derive(Clone, Copy)]
pub struct Process {
    pub pid: Pid,
    pub ppid: Pid, // 0 = no parent
    pub state: ProcessState,
    pub pending_op: PendingOp,
    pub ctx: Context,
    pub fs_base: u64,

    /// Return value the resume path places in RAX when the process is
    /// next scheduled after blocking.
    pub syscall_ret: u64,
    /// Destination buffer of the operation in flight; the waker that
    /// completes a blocked read/recv copies through this.
    pub pending_buf: u64,
    pub pending_len: usize,
    /// Resource index of the operation in flight (pipe id, connection
    /// index, channel id), interpreted per `pending_op`.
    pub pending_obj: usize,
    /// Bytes already transferred by a partially completed blocked write.
    pub pending_progress: usize,
    /// Routing tag of the IPC request awaiting its reply.
    pub ipc_route: u32,
    /// What to do with the IPC reply when it arrives.
    pub ipc_cont: IpcCont,

    pub exit_status: i32,
    /// Valid while `pending_op == Wait`; 0 or -1 matches any child.
    pub waiting_for_pid: i64,
    pub sleep_deadline_ms: u64,

    /// Bitmap of cores that ever loaded this process's page tables.
    pub cores_ran_on: u64,

    /// Thread-group index, if this process shares resources.
    pub group: Option<usize>,
    /// Page-table root when ungrouped (group carries it otherwise).
    pub pml4: u64,
    pub brk_base: u64,
    pub brk: u64,
    pub mmap_next: u64,

    pub uid: u16,
    /// Address zeroed and futex-woken when this thread exits.
    pub clear_child_tid: u64,
    /// RFNOWAIT: reap immediately on exit, no zombie.
    pub auto_reap: bool,
}

impl Process {
    pub const fn empty() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            state: ProcessState::New,
            pending_op: PendingOp::None,
            ctx: Context::zero(),
            fs_base: 0,
            syscall_ret: 0,
            pending_buf: 0,
            pending_len: 0,
            pending_obj: 0,
            pending_progress: 0,
            ipc_route: 0,
            ipc_cont: IpcCont::None,
            exit_status: 0,
            waiting_for_pid: -1,
            sleep_deadline_ms: 0,
            cores_ran_on: 0,
            group: None,
            pml4: 0,
            brk_base: 0,
            brk: 0,
            mmap_next: USER_MMAP_BASE,
            uid: 0,
            clear_child_tid: 0,
            auto_reap: false,
        }
    }
}
