//! Filesystem layer
//!
//! - `fd`: per-process file descriptor tables
//! - `ns`: per-process namespaces (mount table + kernel prefixes)
//! - `kfile`: kernel-backed virtual files and their dispatch
//! - `procfs`: the `/proc` tree
//! - `initrd`: the `/boot` tree backed by the boot image

pub mod fd;
pub mod kfile;
pub mod ns;

#[cfg(feature = "fs_initrd")]
pub mod initrd;

#[cfg(feature = "fs_procfs")]
pub mod procfs;
