//! pmos カーネルイメージ
//!
//! ブートローダから起動し、ramdisk のプロセスをロードし、
//! 永続メモリに残っているプロセスを復元して停止します。

#![no_std]
#![no_main]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader_api::config::Mapping;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use bootloader_api::{entry_point, BootInfo, BootloaderConfig};
use linked_list_allocator::LockedHeap;
use x86_64::{PhysAddr, VirtAddr};

use pmos::arch::{ArchCpu, Cpu};
use pmos::constants::{E820_PERSISTENT_MEMORY, UEFI_PERSISTENT_MEMORY};
use pmos::kernel::mm::{AddressSpace, ContiguousFrameAllocator, PageSource, PersistentMemoryManager, PhysWindow};
use pmos::kernel::process::ProcessControl;
use pmos::{
    load_elf_and_create_ephemeral_process, recover_persistent_processes, File, KernelContext,
    KernelResult, LoaderConfig, MemoryContext,
};

/// ヒープに割り当てるページ数 (1 MiB)
const HEAP_PAGES: u64 = 256;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Bootloader configuration.
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    // 物理メモリ全体を動的なオフセットでマッピングするよう要求
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    if pmos::kernel::logger::init().is_err() {
        halt_loop();
    }
    log::info!("pmos: entry point reached");

    let Some(offset) = boot_info.physical_memory_offset.into_option() else {
        log::error!("pmos: physical memory is not mapped");
        halt_loop();
    };
    // SAFETY: ブートローダが物理メモリ全体をこのオフセットにマップしている
    let window = unsafe { PhysWindow::new(VirtAddr::new(offset)) };

    // SAFETY: Usable 領域はここで初めて使用し、この呼び出しは一度だけ
    let mut frames = match unsafe { ContiguousFrameAllocator::from_memory_regions(&boot_info.memory_regions) } {
        Ok(frames) => frames,
        Err(e) => {
            log::error!("pmos: frame allocator: {}", e);
            halt_loop();
        }
    };

    if let Err(e) = init_heap(&mut frames, window) {
        log::error!("pmos: heap: {}", e);
        halt_loop();
    }

    // SAFETY: CR3 はブートローダが設定したカーネルのページテーブルを指している
    let kernel_space = unsafe { AddressSpace::current(window) };
    let mut processes = ProcessControl::new();
    let mut kctx = KernelContext::new(
        MemoryContext::new(window, &mut frames, Some(kernel_space)),
        &mut processes,
        LoaderConfig::default(),
    );

    if let Err(e) = run(&mut kctx, boot_info) {
        log::error!("pmos: {}", e);
        if e.is_fatal() {
            halt_loop();
        }
    }

    for process in kctx.processes.iter() {
        if let Some(ctx) = process.context() {
            log::info!(
                "process {}: {:?}{} {}",
                process.pid(),
                process.state(),
                if process.is_persistent() { " (persistent)" } else { "" },
                ctx
            );
        }
    }
    log::info!("pmos: {} free frames left, halting", kctx.memory.frames.free_pages());
    halt_loop();
}

fn run(kctx: &mut KernelContext<'_>, boot_info: &BootInfo) -> KernelResult<()> {
    if let Some(addr) = boot_info.ramdisk_addr.into_option() {
        // SAFETY: ブートローダが ramdisk をこのアドレスに読み込んでマップしている
        let buf = unsafe { core::slice::from_raw_parts(addr as *const u8, boot_info.ramdisk_len as usize) };
        let file = File::new("ramdisk", buf)?;
        let pid = load_elf_and_create_ephemeral_process(&file, kctx)?;
        log::info!("ramdisk: loaded as process {}", pid);
    } else {
        log::info!("pmos: no ramdisk");
    }

    if let Some((base, size)) = find_persistent_region(&boot_info.memory_regions) {
        // SAFETY: メモリマップが永続メモリとして報告した領域で、他に使用者はいない
        let pmem = unsafe { PersistentMemoryManager::open(kctx.memory.window, base, size)? };
        log::info!("pmem: {} pages free", pmem.free_pages());
        let restored = recover_persistent_processes(kctx, &pmem)?;
        for pid in restored {
            log::info!("pmem: process {} is back", pid);
        }
    } else {
        log::info!("pmem: no persistent memory region");
    }
    Ok(())
}

/// メモリマップから最初の永続メモリ領域を探す
fn find_persistent_region(regions: &MemoryRegions) -> Option<(PhysAddr, u64)> {
    regions
        .iter()
        .find(|r| {
            matches!(
                r.kind,
                MemoryRegionKind::UnknownBios(E820_PERSISTENT_MEMORY)
                    | MemoryRegionKind::UnknownUefi(UEFI_PERSISTENT_MEMORY)
            )
        })
        .map(|r| (PhysAddr::new(r.start), r.end - r.start))
}

/// 揮発性フレームからヒープを確保して初期化する
fn init_heap(frames: &mut ContiguousFrameAllocator, window: PhysWindow) -> KernelResult<()> {
    let phys = frames.alloc_pages(HEAP_PAGES)?;
    let start = window.to_virt(phys);
    // SAFETY: 確保したばかりの連続ページで、直接マップ経由で書き込み可能
    unsafe {
        ALLOCATOR
            .lock()
            .init(start.as_mut_ptr::<u8>(), (HEAP_PAGES * pmos::constants::PAGE_SIZE) as usize);
    }
    log::debug!("heap: {} pages at {:#x}", HEAP_PAGES, start.as_u64());
    Ok(())
}

/// CPU を停止し続ける
fn halt_loop() -> ! {
    loop {
        ArchCpu::halt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("[KERNEL PANIC] {}", info);
    halt_loop();
}
