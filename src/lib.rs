#![no_std]

//! Fornax kernel core
//!
//! A Plan 9 inspired microkernel: per-process namespaces route every
//! path either to an in-kernel tree (`/net`, `/proc`, `/boot`,
//! `/dev/time`, the log) or to a userspace file server over a
//! synchronous IPC channel. The in-kernel TCP/IP stack is exposed as a
//! `/net` file tree in the same namespace mechanism.

extern crate alloc;

pub mod abi;
pub mod arch;
pub mod config;
pub mod elf;
pub mod fs;
pub mod futex;
pub mod ipc;
pub mod logger;
pub mod mm;
pub mod net;
pub mod process;
pub mod scheduler;
pub mod serial;
pub mod smp;
pub mod syscalls;

use core::panic::PanicInfo;
use multiboot2::{BootInformation, BootInformationHeader};

pub const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36d76289;

/// Physical span reserved for the kernel image and boot structures.
const KERNEL_RESERVED: (u64, u64) = (0, 32 * 1024 * 1024);

fn stage(name: &str) {
    kinfo!("boot: {} ({} us)", name, logger::boot_time_us());
}

pub fn kernel_main(multiboot_info_address: u64, magic: u32) -> ! {
    serial::init();
    let freq_hz = logger::init();

    kinfo!("Fornax kernel bootstrap start");
    if logger::tsc_frequency_is_guessed() {
        kwarn!(
            "Falling back to default TSC frequency: {}.{:03} MHz",
            freq_hz / 1_000_000,
            (freq_hz % 1_000_000) / 1_000
        );
    }

    if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
        kfatal!("Invalid multiboot2 magic value: {:#x}", magic);
        arch::halt_loop();
    }

    let boot_info = unsafe {
        BootInformation::load(multiboot_info_address as *const BootInformationHeader)
            .expect("valid multiboot info structure")
    };

    // The initrd rides as the first boot module.
    let initrd_range = boot_info
        .module_tags()
        .next()
        .map(|m| (m.start_address() as u64, m.end_address() as u64));

    let mbi_range = (
        multiboot_info_address,
        multiboot_info_address + boot_info.total_size() as u64,
    );
    let mut reserved = [KERNEL_RESERVED, mbi_range, (0, 0)];
    if let Some(range) = initrd_range {
        reserved[2] = range;
    }

    stage("pmm");
    mm::pmm::init(&boot_info, &reserved);

    stage("paging");
    mm::paging::init();

    stage("heap");
    mm::heap::init();

    stage("gdt");
    arch::gdt::init(0);

    stage("lapic");
    arch::lapic::init();
    arch::pic::init();
    arch::idt::init();

    stage("smp");
    smp::init_cpu(0);

    stage("syscall");
    syscalls::init_cpu();

    stage("net");
    let cmdline = boot_info
        .command_line_tag()
        .and_then(|t| t.cmdline().ok())
        .unwrap_or("");
    let net_config = config::apply_cmdline(cmdline);
    net::configure(net_config);
    net::init();
    #[cfg(feature = "net_dns")]
    net::dns::init();

    #[cfg(feature = "fs_initrd")]
    if let Some((start, end)) = initrd_range {
        stage("initrd");
        let base = mm::paging::phys_to_virt(start) as *const u8;
        match unsafe { fs::initrd::init(base, (end - start) as usize) } {
            Ok(()) => {}
            Err(e) => kwarn!("initrd: rejected boot module: {:?}", e),
        }
    }

    stage("scheduler");
    scheduler::init();

    let elapsed_us = logger::boot_time_us();
    kinfo!(
        "Kernel initialization completed in {}.{:03} ms",
        elapsed_us / 1_000,
        elapsed_us % 1_000
    );

    spawn_init();
    scheduler::run_next()
}

/// Build pid 1 from `/boot/init` and make it runnable.
fn spawn_init() {
    #[cfg(feature = "fs_initrd")]
    {
        let Some(image) = fs::initrd::lookup("init") else {
            kfatal!("no init binary in the boot image");
            arch::halt_loop();
        };

        let pml4 = mm::paging::new_user_pml4().expect("frames for init address space");
        let loaded = match process::loader::load_image(pml4, image) {
            Ok(l) => l,
            Err(e) => {
                kfatal!("init image rejected: {:?}", e);
                arch::halt_loop();
            }
        };

        // argv: {argc=1, total=5, "init\0"}
        let mut argv = [0u8; 16];
        argv[0..4].copy_from_slice(&1u32.to_le_bytes());
        argv[4..8].copy_from_slice(&5u32.to_le_bytes());
        argv[8..13].copy_from_slice(b"init\0");
        process::loader::install_argv(pml4, &argv).expect("argv page for init");

        let mut init = process::Process::empty();
        init.state = process::ProcessState::New;
        init.pml4 = pml4;
        init.brk_base = loaded.brk_base;
        init.brk = loaded.brk_base;
        init.ctx.rip = loaded.entry;
        init.ctx.rsp = loaded.stack_top;

        let (slot, pid) = process::table::alloc_slot(init).expect("empty process table");
        process::table::with_slot(slot, |p| p.state = process::ProcessState::Ready);
        kinfo!("init: pid {} entry {:#x}", pid, loaded.entry);
    }

    #[cfg(not(feature = "fs_initrd"))]
    {
        kfatal!("built without fs_initrd; nothing to run");
        arch::halt_loop();
    }
}

pub fn panic(info: &PanicInfo) -> ! {
    kfatal!("KERNEL PANIC: {}", info);
    arch::halt_loop()
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => { $crate::serial_print!("\n") };
    ($($arg:tt)*) => {{
        $crate::serial::_print(format_args!($($arg)*));
        $crate::serial::_print(format_args!("\n"));
    }};
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Fatal, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Trace, $($arg)*);
    }};
}
