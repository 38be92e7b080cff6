// src/kernel/process/mod.rs
//! Process management module
//!
//! This module provides the process structure and the process registry.
//! A process is either ephemeral (its context lives on the kernel heap) or
//! persistent (its context lives in a two-slot record in persistent memory).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::fmt;

use x86_64::structures::paging::{PageTableFlags, PhysFrame};
use x86_64::PhysAddr;

use crate::kernel::context::MemoryContext;
use crate::kernel::core::{KernelError, KernelResult};
use crate::kernel::mm::paging::AddressSpace;
use crate::kernel::mm::segment::{ProcessMappingInfo, SegmentKind};
use crate::kernel::mm::types::MemoryError;

pub mod binary_reader;
pub mod context;
pub mod elf_loader;
pub mod persistent;

pub use context::ExecutionContext;
pub use persistent::{PersistentProcessInfo, PersistentRecord};

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Create a new process ID
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is ready to run
    Ready,
    /// Process is currently running
    Running,
    /// Process has terminated
    Terminated,
}

/// Process management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// The persistent record has never been committed
    NoValidSlot,
    /// Slot index out of range
    InvalidSlot,
    /// No process with this ID
    UnknownProcess,
    /// Operation needs a persistent process
    NotPersistent,
    /// The persistent record is already owned by a registered process
    AlreadyRegistered,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoValidSlot => write!(f, "persistent record has no valid slot"),
            Self::InvalidSlot => write!(f, "slot index out of range"),
            Self::UnknownProcess => write!(f, "no such process"),
            Self::NotPersistent => write!(f, "process is not persistent"),
            Self::AlreadyRegistered => write!(f, "persistent record is already registered"),
        }
    }
}

/// Where the execution context of a process lives
#[derive(Debug)]
pub enum ProcessImage {
    /// Volatile context on the kernel heap
    Ephemeral(Box<ExecutionContext>),
    /// Two-slot record in persistent memory; the working slot is the running one
    Persistent(PersistentRecord),
}

/// Process control block
#[derive(Debug)]
pub struct Process {
    pid: ProcessId,
    state: ProcessState,
    image: ProcessImage,
}

impl Process {
    /// Get process ID
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// Whether the process is backed by persistent memory
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        matches!(self.image, ProcessImage::Persistent(_))
    }

    /// The context the process runs with
    ///
    /// For a persistent process this is the working slot.
    #[must_use]
    pub fn context(&self) -> Option<&ExecutionContext> {
        match &self.image {
            ProcessImage::Ephemeral(ctx) => Some(ctx),
            ProcessImage::Persistent(record) => {
                let info = record.get();
                info.working_index().map(|i| info.context(i))
            }
        }
    }

    /// The persistent record, if any
    #[must_use]
    pub fn record(&self) -> Option<&PersistentRecord> {
        match &self.image {
            ProcessImage::Persistent(record) => Some(record),
            ProcessImage::Ephemeral(_) => None,
        }
    }
}

/// Process registry
///
/// Owns every registered process and hands out increasing process IDs.
/// PID 0 is reserved for the kernel.
#[derive(Debug)]
pub struct ProcessControl {
    processes: BTreeMap<ProcessId, Process>,
    next_pid: u64,
}

impl Default for ProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl {
    /// Create an empty registry
    #[must_use]
    pub const fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            next_pid: 1,
        }
    }

    fn allocate_pid(&mut self) -> ProcessId {
        let pid = ProcessId::new(self.next_pid);
        self.next_pid += 1;
        pid
    }

    fn insert(&mut self, image: ProcessImage) -> ProcessId {
        let pid = self.allocate_pid();
        self.processes.insert(pid, Process { pid, state: ProcessState::Ready, image });
        pid
    }

    /// Register a fully built ephemeral process
    pub fn create_ephemeral(&mut self, ctx: ExecutionContext) -> ProcessId {
        let pid = self.insert(ProcessImage::Ephemeral(Box::new(ctx)));
        log::debug!("process {}: ephemeral, rip={:#x}", pid, ctx.cpu.frame.rip);
        pid
    }

    /// Restore a process from a committed persistent record
    ///
    /// The valid slot is copied into the working slot, a fresh page table is
    /// built over the working slot's segments, and a volatile kernel stack of
    /// `kernel_stack_pages` pages is allocated. The process then runs on the
    /// working slot; the valid slot is never written until the next commit.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::NoValidSlot`] if the record was never committed
    /// - [`ProcessError::AlreadyRegistered`] if another process owns the record
    /// - memory errors from page-table construction
    pub fn restore_from_persistent_process_info(
        &mut self,
        record: PersistentRecord,
        memory: &mut MemoryContext<'_>,
        kernel_stack_pages: u64,
    ) -> KernelResult<ProcessId> {
        self.restore(record, None, memory, kernel_stack_pages)
    }

    /// Like [`Self::restore_from_persistent_process_info`], but reuse `space`
    ///
    /// `space` must map the valid slot's segments. Its data and stack pages
    /// are moved onto the working slot's backing.
    pub(crate) fn restore_onto(
        &mut self,
        record: PersistentRecord,
        space: AddressSpace,
        memory: &mut MemoryContext<'_>,
        kernel_stack_pages: u64,
    ) -> KernelResult<ProcessId> {
        self.restore(record, Some(space), memory, kernel_stack_pages)
    }

    fn restore(
        &mut self,
        mut record: PersistentRecord,
        space: Option<AddressSpace>,
        memory: &mut MemoryContext<'_>,
        kernel_stack_pages: u64,
    ) -> KernelResult<ProcessId> {
        if self.owns_record(record.phys()) {
            return Err(ProcessError::AlreadyRegistered.into());
        }
        let window = memory.window;
        let info = record.get_mut();
        info.prepare_working(&window)?;

        let working = info.working_index().ok_or(ProcessError::NoValidSlot)?;
        let ctx = info.context_mut(working);
        let space = match space {
            Some(mut space) => {
                remap_writable(&mut space, &ctx.map_info, memory)?;
                space
            }
            None => {
                let mut space = memory.create_page_table()?;
                ctx.map_info
                    .install(&mut space, PageTableFlags::USER_ACCESSIBLE, &mut *memory.frames)?;
                space
            }
        };
        let kernel_rsp = memory.alloc_kernel_stack(kernel_stack_pages)?;
        ctx.cpu.cr3 = space.cr3();
        ctx.kernel_rsp = kernel_rsp.as_u64();
        info.persist_slot(working);

        let pid = self.insert(ProcessImage::Persistent(record));
        log::info!("process {}: restored from persistent slot {}", pid, 1 - working);
        Ok(pid)
    }

    /// Commit the running state of a persistent process
    ///
    /// The working slot becomes the valid one. The new working slot is then
    /// prepared from it and the process's data and stack pages are remapped
    /// onto the new working backing, so the snapshot is never written through.
    /// Returns the index of the newly valid slot.
    ///
    /// The process must not be running while this is called.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::UnknownProcess`] / [`ProcessError::NotPersistent`]
    /// - [`ProcessError::NoValidSlot`] if the record was never committed
    pub fn checkpoint(
        &mut self,
        pid: ProcessId,
        memory: &mut MemoryContext<'_>,
    ) -> KernelResult<usize> {
        let process = self.processes.get_mut(&pid).ok_or(ProcessError::UnknownProcess)?;
        let ProcessImage::Persistent(record) = &mut process.image else {
            return Err(ProcessError::NotPersistent.into());
        };
        let window = memory.window;
        let info = record.get_mut();

        let committed = info.commit_working(&window)?;
        info.prepare_working(&window)?;

        let working = 1 - committed;
        let ctx = info.context(working);
        let root = PhysFrame::from_start_address(PhysAddr::new_truncate(ctx.cpu.cr3))
            .map_err(|_| KernelError::from(MemoryError::MisalignedAccess))?;
        // SAFETY: cr3 was set by restore to a table this registry built, and the
        // process is not running, so the table is not loaded
        let mut space = unsafe { AddressSpace::from_root(root, window) };
        remap_writable(&mut space, &ctx.map_info, memory)?;
        info.persist_slot(working);

        log::debug!("process {}: checkpoint committed slot {}", pid, committed);
        Ok(committed)
    }

    /// Whether a registered process owns the persistent record at `phys`
    #[must_use]
    pub fn owns_record(&self, phys: PhysAddr) -> bool {
        self.processes
            .values()
            .filter_map(Process::record)
            .any(|r| r.phys() == phys)
    }

    /// Get a process by ID
    #[must_use]
    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// Get a mutable process by ID
    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// Remove a process from the registry
    pub fn remove(&mut self, pid: ProcessId) -> Option<Process> {
        self.processes.remove(&pid)
    }

    /// Number of registered processes
    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether no process is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Iterate over registered processes in PID order
    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }
}

/// Point the data and stack pages at the backing recorded in `map_info`
fn remap_writable(
    space: &mut AddressSpace,
    map_info: &ProcessMappingInfo,
    memory: &mut MemoryContext<'_>,
) -> KernelResult<()> {
    for kind in [SegmentKind::Data, SegmentKind::Stack] {
        let segment = map_info.segment(kind);
        segment.unmap(space)?;
        let flags = ProcessMappingInfo::flags_for(kind, PageTableFlags::USER_ACCESSIBLE);
        segment.map(space, flags, &mut *memory.frames)?;
    }
    Ok(())
}
