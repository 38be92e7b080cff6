//! End-to-end ephemeral loads over fake physical memory

mod common;

use common::*;
use pmos::arch::x86_64::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use pmos::constants::{PAGE_SIZE, USER_STACK_BASE, USER_STACK_PAGES};
use pmos::kernel::mm::{MemoryError, PageSource};
use pmos::kernel::process::context::INITIAL_RFLAGS;
use pmos::{load_elf_and_create_ephemeral_process, ErrorKind, File};
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

const USER_CODE: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::USER_ACCESSIBLE);
const USER_RW: PageTableFlags = USER_CODE
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::NO_EXECUTE);

#[test]
fn registers_point_at_entry_and_stack_top() {
    let mut m = Machine::standard();
    let image = ElfBuilder::standard().build();
    let file = File::new("hello", image.bytes()).unwrap();

    let pid = load_elf_and_create_ephemeral_process(&file, &mut m.kctx()).unwrap();

    let process = m.processes.get(pid).unwrap();
    assert!(!process.is_persistent());
    let ctx = process.context().unwrap();
    let stack_top = USER_STACK_BASE + USER_STACK_PAGES * PAGE_SIZE;
    assert_eq!(ctx.rip().as_u64(), CODE_VADDR);
    assert_eq!(ctx.rsp().as_u64(), stack_top);
    assert_eq!(ctx.cpu.frame.cs, u64::from(USER_CODE_SELECTOR.0));
    assert_eq!(ctx.cpu.frame.ss, u64::from(USER_DATA_SELECTOR.0));
    assert_eq!(ctx.cpu.ds, u64::from(USER_DATA_SELECTOR.0));
    assert_eq!(ctx.cpu.frame.rflags, INITIAL_RFLAGS);
    assert_ne!(ctx.kernel_rsp, 0);
    assert_eq!(ctx.kernel_rsp % PAGE_SIZE, 0);
    assert_eq!(ctx.map_info.stack.virt_end().as_u64(), stack_top);
}

#[test]
fn exactly_three_ranges_with_segment_flags() {
    let mut m = Machine::standard();
    let image = ElfBuilder::standard().build();
    let file = File::new("hello", image.bytes()).unwrap();
    let pid = load_elf_and_create_ephemeral_process(&file, &mut m.kctx()).unwrap();
    let cr3 = m.processes.get(pid).unwrap().context().unwrap().cpu.cr3;

    let ranges = m.space(cr3).user_mappings();
    assert_eq!(ranges.len(), 3, "{ranges:#?}");

    assert_eq!(ranges[0].virt.as_u64(), CODE_VADDR);
    assert_eq!(ranges[0].size, PAGE_SIZE);
    assert_eq!(ranges[0].flags, USER_CODE);

    // vaddr 0x60_0010: map_size = ceil(0x2000 + 0x10) = 0x3000
    assert_eq!(ranges[1].virt.as_u64(), 0x60_0000);
    assert_eq!(ranges[1].size, 0x3000);
    assert_eq!(ranges[1].flags, USER_RW);

    assert_eq!(ranges[2].virt.as_u64(), USER_STACK_BASE);
    assert_eq!(ranges[2].size, USER_STACK_PAGES * PAGE_SIZE);
    assert_eq!(ranges[2].flags, USER_RW);

    for range in &ranges {
        assert_eq!(range.virt.as_u64() % PAGE_SIZE, 0);
        assert_eq!(range.phys.as_u64() % PAGE_SIZE, 0);
        assert!(!m.is_persistent(range.phys));
    }
}

#[test]
fn bytes_are_copied_and_the_tail_is_zero() {
    let mut m = Machine::standard();
    let image = ElfBuilder::standard().build();
    let file = File::new("hello", image.bytes()).unwrap();
    let pid = load_elf_and_create_ephemeral_process(&file, &mut m.kctx()).unwrap();
    let cr3 = m.processes.get(pid).unwrap().context().unwrap().cpu.cr3;

    let code = code_bytes();
    assert_eq!(m.read_virt(cr3, CODE_VADDR, code.len()), code);
    let rest = PAGE_SIZE as usize - code.len();
    assert!(m.read_virt(cr3, CODE_VADDR + code.len() as u64, rest).iter().all(|&b| b == 0));

    let data = data_bytes();
    assert_eq!(m.read_virt(cr3, DATA_VADDR, data.len()), data);
    // .bss: everything after the file bytes up to the end of the last page
    let bss_start = DATA_VADDR + data.len() as u64;
    let bss = m.read_virt(cr3, bss_start, (0x60_1000 - bss_start) as usize);
    assert!(bss.iter().all(|&b| b == 0));
    assert!(m.read_virt(cr3, 0x60_2000, PAGE_SIZE as usize).iter().all(|&b| b == 0));

    let stack_last = USER_STACK_BASE + (USER_STACK_PAGES - 1) * PAGE_SIZE;
    assert!(m.read_virt(cr3, stack_last, PAGE_SIZE as usize).iter().all(|&b| b == 0));
}

#[test]
fn each_load_gets_its_own_space() {
    let mut m = Machine::standard();
    let image = ElfBuilder::standard().build();
    let file = File::new("hello", image.bytes()).unwrap();
    let a = load_elf_and_create_ephemeral_process(&file, &mut m.kctx()).unwrap();
    let b = load_elf_and_create_ephemeral_process(&file, &mut m.kctx()).unwrap();

    assert!(b > a);
    assert_eq!(m.processes.len(), 2);
    let cr3_a = m.processes.get(a).unwrap().context().unwrap().cpu.cr3;
    let cr3_b = m.processes.get(b).unwrap().context().unwrap().cpu.cr3;
    assert_ne!(cr3_a, cr3_b);

    m.write_virt(cr3_a, DATA_VADDR, &[0x55]);
    assert_eq!(m.read_virt(cr3_b, DATA_VADDR, 1), [0xA0]);
}

#[test]
fn kernel_half_is_shared() {
    let mut m = Machine::standard();
    let mut kernel = m.install_kernel_space();
    let kernel_page = VirtAddr::new(0xFFFF_8000_0000_0000);
    let kernel_frame = m.frames.alloc_pages(1).unwrap();
    kernel
        .map_range(kernel_page, kernel_frame, 1, PageTableFlags::PRESENT | PageTableFlags::WRITABLE, &mut m.frames)
        .unwrap();

    let image = ElfBuilder::standard().build();
    let file = File::new("hello", image.bytes()).unwrap();
    let pid = load_elf_and_create_ephemeral_process(&file, &mut m.kctx()).unwrap();
    let cr3 = m.processes.get(pid).unwrap().context().unwrap().cpu.cr3;

    assert_ne!(cr3, kernel.cr3());
    let (phys, _) = m.translate(cr3, kernel_page.as_u64()).unwrap();
    assert_eq!(phys, kernel_frame);
    assert!(m.translate(kernel.cr3(), CODE_VADDR).is_none());
    // user mappings stay out of the kernel table and vice versa
    assert!(kernel.user_mappings().is_empty());
    assert_eq!(m.space(cr3).user_mappings().len(), 3);
}

#[test]
fn overlapping_data_and_stack_is_rejected() {
    let mut m = Machine::standard();
    let image = ElfBuilder::empty()
        .segment(PF_R | PF_X, CODE_VADDR, code_bytes(), 0)
        .segment(PF_R | PF_W, USER_STACK_BASE + 0x10, data_bytes(), 0)
        .build();
    let file = File::new("clash", image.bytes()).unwrap();

    let err = load_elf_and_create_ephemeral_process(&file, &mut m.kctx()).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Memory(MemoryError::Overlap));
    assert!(m.processes.is_empty());
}

#[test]
fn running_out_of_frames_registers_nothing() {
    let mut m = Machine::new(16, 0);
    let image = ElfBuilder::standard().build();
    let file = File::new("hello", image.bytes()).unwrap();

    let err = load_elf_and_create_ephemeral_process(&file, &mut m.kctx()).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Memory(MemoryError::OutOfMemory));
    assert!(err.is_fatal());
    assert!(m.processes.is_empty());
}
