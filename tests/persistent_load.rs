//! Persistent processes: two-slot commit, crash and recovery

mod common;

use common::*;
use pmos::constants::{
    KERNEL_STACK_PAGES_PER_PROCESS, PAGE_SIZE, USER_STACK_BASE, USER_STACK_PAGES,
};
use pmos::kernel::process::{ProcessError, ProcessId};
use pmos::{
    load_elf_and_create_ephemeral_process, load_elf_and_create_persistent_process,
    recover_persistent_processes, ErrorKind, File,
};
use x86_64::PhysAddr;

fn load(m: &mut Machine) -> ProcessId {
    let image = ElfBuilder::standard().build();
    let file = File::new("counter", image.bytes()).unwrap();
    let mut pmem = m.open_pmem();
    load_elf_and_create_persistent_process(&file, &mut m.kctx(), &mut pmem).unwrap()
}

fn cr3_of(m: &Machine, pid: ProcessId) -> u64 {
    m.processes.get(pid).unwrap().context().unwrap().cpu.cr3
}

fn recover(m: &mut Machine) -> Vec<ProcessId> {
    let pmem = m.open_pmem();
    recover_persistent_processes(&mut m.kctx(), &pmem).unwrap()
}

#[test]
fn fresh_process_runs_on_the_working_slot() {
    let mut m = Machine::standard();
    let pid = load(&mut m);

    let process = m.processes.get(pid).unwrap();
    assert!(process.is_persistent());
    let info = process.record().unwrap().get();
    assert_eq!(info.valid_index(), Some(0));
    assert_eq!(info.working_index(), Some(1));

    let valid = info.context(0);
    let working = info.context(1);
    assert_eq!(working.rip().as_u64(), CODE_VADDR);
    assert_eq!(working.rsp().as_u64(), USER_STACK_BASE + USER_STACK_PAGES * PAGE_SIZE);
    assert_eq!(valid.kernel_rsp, 0);
    assert_ne!(working.kernel_rsp, 0);
    // the table built for slot 0 is the one the process runs on
    assert_eq!(valid.cpu.cr3, working.cpu.cr3);

    // code is shared, data and stack have separate persistent backing
    assert_eq!(working.map_info.code, valid.map_info.code);
    assert_ne!(working.map_info.data.phys(), valid.map_info.data.phys());
    assert_ne!(working.map_info.stack.phys(), valid.map_info.stack.phys());
    for segment in [valid.map_info.code, valid.map_info.data, working.map_info.data, working.map_info.stack] {
        assert!(m.is_persistent(segment.phys().unwrap()));
    }

    // the page table routes writes to the working slot
    let cr3 = working.cpu.cr3;
    assert!(!m.is_persistent(PhysAddr::new(cr3)));
    let (data_phys, _) = m.translate(cr3, DATA_VADDR).unwrap();
    assert_eq!(data_phys.as_u64(), working.map_info.data.phys().unwrap().as_u64() + 0x10);
    assert_eq!(m.read_virt(cr3, DATA_VADDR, 0x20), data_bytes());
    assert_eq!(m.read_virt(cr3, CODE_VADDR, 0x122), code_bytes());
}

#[test]
fn crash_before_commit_rolls_back() {
    let mut m = Machine::standard();
    let pid = load(&mut m);
    let cr3 = cr3_of(&m, pid);
    m.write_virt(cr3, DATA_VADDR, &[0xDE, 0xAD]);

    m.reboot();
    let restored = recover(&mut m);
    assert_eq!(restored.len(), 1);

    let cr3 = cr3_of(&m, restored[0]);
    assert_eq!(m.read_virt(cr3, DATA_VADDR, 0x20), data_bytes());
    let info = m.processes.get(restored[0]).unwrap().record().unwrap().get();
    assert_eq!(info.valid_index(), Some(0));
}

#[test]
fn crash_after_commit_keeps_the_checkpoint() {
    let mut m = Machine::standard();
    let pid = load(&mut m);
    let cr3 = cr3_of(&m, pid);
    m.write_virt(cr3, DATA_VADDR, &[0xDE, 0xAD]);
    let stack_word = USER_STACK_BASE + USER_STACK_PAGES * PAGE_SIZE - 8;
    m.write_virt(cr3, stack_word, &0x1234_u64.to_le_bytes());

    let mut kctx = m.kctx();
    let committed = kctx.processes.checkpoint(pid, &mut kctx.memory).unwrap();
    assert_eq!(committed, 1);

    // writes after the flip land in the other slot and are lost on crash
    m.write_virt(cr3, DATA_VADDR, &[0x00, 0x00]);

    m.reboot();
    let restored = recover(&mut m);
    assert_eq!(restored.len(), 1);

    let cr3 = cr3_of(&m, restored[0]);
    let data = m.read_virt(cr3, DATA_VADDR, 0x20);
    assert_eq!(&data[..2], &[0xDE, 0xAD]);
    assert_eq!(&data[2..], &data_bytes()[2..]);
    assert_eq!(m.read_virt(cr3, stack_word, 8), 0x1234_u64.to_le_bytes());
    let info = m.processes.get(restored[0]).unwrap().record().unwrap().get();
    assert_eq!(info.valid_index(), Some(1));
    assert_eq!(info.working_index(), Some(0));
}

#[test]
fn checkpoint_remaps_onto_the_new_working_slot() {
    let mut m = Machine::standard();
    let pid = load(&mut m);
    let cr3 = cr3_of(&m, pid);

    let mut kctx = m.kctx();
    kctx.processes.checkpoint(pid, &mut kctx.memory).unwrap();

    let info = m.processes.get(pid).unwrap().record().unwrap().get();
    let working = info.context(info.working_index().unwrap());
    let valid = info.valid_context().unwrap();
    let (data_phys, _) = m.translate(cr3, DATA_VADDR).unwrap();
    assert_eq!(data_phys.as_u64(), working.map_info.data.phys().unwrap().as_u64() + 0x10);
    assert_ne!(working.map_info.data.phys(), valid.map_info.data.phys());
    let (stack_phys, _) = m.translate(cr3, USER_STACK_BASE).unwrap();
    assert_eq!(stack_phys, working.map_info.stack.phys().unwrap());
}

#[test]
fn checkpoint_needs_a_persistent_process() {
    let mut m = Machine::standard();
    let image = ElfBuilder::standard().build();
    let file = File::new("hello", image.bytes()).unwrap();
    let pid = load_elf_and_create_ephemeral_process(&file, &mut m.kctx()).unwrap();

    let mut kctx = m.kctx();
    let err = kctx.processes.checkpoint(pid, &mut kctx.memory).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Process(ProcessError::NotPersistent));
    let err = kctx.processes.checkpoint(ProcessId::new(99), &mut kctx.memory).unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Process(ProcessError::UnknownProcess));
}

#[test]
fn uncommitted_records_are_skipped() {
    let mut m = Machine::standard();
    load(&mut m);
    // a record reserved by a load that never reached its commit
    let mut pmem = m.open_pmem();
    drop(pmem.alloc_persistent_process_info().unwrap());
    assert_eq!(pmem.record_addrs().len(), 2);

    m.reboot();
    assert_eq!(recover(&mut m).len(), 1);
    assert_eq!(m.processes.len(), 1);
}

#[test]
fn recovery_does_not_duplicate_live_processes() {
    let mut m = Machine::standard();
    let pid = load(&mut m);
    assert!(recover(&mut m).is_empty());
    assert_eq!(m.processes.len(), 1);
    assert!(m.processes.get(pid).is_some());
}

#[test]
fn reopening_keeps_the_region() {
    let mut m = Machine::standard();
    load(&mut m);
    let used = m.open_pmem().used_pages();
    assert!(used > 1);

    m.reboot();
    let pmem = m.open_pmem();
    assert_eq!(pmem.used_pages(), used);
    assert_eq!(pmem.record_addrs().len(), 1);
}

#[test]
fn several_processes_survive_together() {
    let mut m = Machine::new(512, 512);
    let a = load(&mut m);
    let b = load(&mut m);
    let cr3_b = cr3_of(&m, b);
    m.write_virt(cr3_b, DATA_VADDR, &[0x42]);
    let mut kctx = m.kctx();
    kctx.processes.checkpoint(b, &mut kctx.memory).unwrap();
    assert_ne!(a, b);

    m.reboot();
    let restored = recover(&mut m);
    assert_eq!(restored.len(), 2);
    let firsts: Vec<u8> = restored
        .iter()
        .map(|&pid| m.read_virt(cr3_of(&m, pid), DATA_VADDR, 1)[0])
        .collect();
    assert_eq!(firsts, [0xA0, 0x42]);
}

#[test]
fn load_builds_a_single_page_table() {
    let mut m = Machine::standard();
    load(&mut m);
    let after_load = m.frames.allocated_pages();

    // one table and one kernel stack, the same as a recovery after reboot
    m.reboot();
    recover(&mut m);
    assert_eq!(m.frames.allocated_pages(), after_load);
}

#[test]
fn kernel_stack_size_follows_the_config() {
    let mut small = Machine::standard();
    load(&mut small);

    let mut large = Machine::standard();
    large.config.kernel_stack_pages = KERNEL_STACK_PAGES_PER_PROCESS + 4;
    load(&mut large);
    assert_eq!(large.frames.allocated_pages(), small.frames.allocated_pages() + 4);

    large.reboot();
    small.reboot();
    recover(&mut large);
    recover(&mut small);
    assert_eq!(large.frames.allocated_pages(), small.frames.allocated_pages() + 4);
}
