// src/constants.rs

//! Kernel constants and configuration values
//!
//! Address-space layout and sizing used by the loader. `LoaderConfig::default()`
//! is built from these values.

/// Size of one page (4 KiB)
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SIZE_EXPONENT: u32 = 12;

/// Virtual base of every user stack
pub const USER_STACK_BASE: u64 = 0xBEEF_0000;

/// Number of pages in a user stack
pub const USER_STACK_PAGES: u64 = 32;

/// Virtual base of the kernel main stack used after a kernel self-load
pub const KERNEL_MAIN_STACK_BASE: u64 = 0xFFFF_FFFF_4000_0000;

/// Number of pages in the kernel main stack
pub const KERNEL_MAIN_STACK_PAGES: u64 = 2;

/// Number of pages in the kernel-side trap stack of each process
pub const KERNEL_STACK_PAGES_PER_PROCESS: u64 = 4;

/// Maximum number of program header entries accepted in one image
pub const MAX_PROGRAM_HEADERS: usize = 32;

/// Maximum number of usable physical memory regions tracked by the frame allocator
pub const MAX_USABLE_REGIONS: usize = 64;

/// Maximum number of persistent process records in one persistent memory region
pub const MAX_PERSISTENT_PROCESSES: usize = 64;

/// First PML4 index of the kernel half of every address space
pub const KERNEL_PML4_START: usize = 256;

/// End of the user half (first address covered by [`KERNEL_PML4_START`])
pub const USER_SPACE_END: u64 = (KERNEL_PML4_START as u64) << 39;

/// E820 memory type reported for persistent memory (ACPI 6.0)
pub const E820_PERSISTENT_MEMORY: u32 = 7;

/// UEFI memory type `EfiPersistentMemory`
pub const UEFI_PERSISTENT_MEMORY: u32 = 14;
