//! Memory management
//!
//! - `pmm`: physical frame bitmap allocator
//! - `paging`: address spaces, user mappings, cross-space copies
//! - `heap`: kernel heap for ambient allocations

pub mod heap;
pub mod paging;
pub mod pmm;

/// Frame and page size used throughout the kernel.
pub const PAGE_SIZE: usize = 4096;
