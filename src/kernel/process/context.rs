// src/kernel/process/context.rs
//! Execution context
//!
//! The complete CPU and address-space state needed to start or resume a
//! process. The layout is `#[repr(C)]` so the same record can be stored in
//! persistent memory and read back by the context-switch path.

use core::fmt;

use x86_64::registers::rflags::RFlags;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::VirtAddr;

use crate::kernel::mm::segment::ProcessMappingInfo;

/// Reserved bit 1 of RFLAGS, always reads as one.
const RFLAGS_RESERVED_1: u64 = 1 << 1;

/// Initial RFLAGS for a new process: interrupts enabled.
pub const INITIAL_RFLAGS: u64 = RFlags::INTERRUPT_FLAG.bits() | RFLAGS_RESERVED_1;

/// General purpose registers, in the order the switch path pushes them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
#[allow(missing_docs)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rcx: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// The frame consumed by `iretq`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptFrame {
    /// Instruction pointer
    pub rip: u64,
    /// Code segment selector
    pub cs: u64,
    /// Flags register
    pub rflags: u64,
    /// Stack pointer
    pub rsp: u64,
    /// Stack segment selector
    pub ss: u64,
}

/// Saved CPU state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CpuContext {
    /// Page-table root loaded into CR3
    pub cr3: u64,
    /// iret frame
    pub frame: InterruptFrame,
    /// Data segment selector
    pub ds: u64,
    /// General purpose registers
    pub regs: GeneralRegisters,
}

/// Execution context of one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ExecutionContext {
    /// Saved CPU state
    pub cpu: CpuContext,
    /// Top of the kernel stack used on traps from this process (0 = none yet)
    pub kernel_rsp: u64,
    /// Code, data and stack segments of the address space
    pub map_info: ProcessMappingInfo,
}

impl ExecutionContext {
    /// An all-zero context
    pub const fn empty() -> Self {
        Self {
            cpu: CpuContext {
                cr3: 0,
                frame: InterruptFrame { rip: 0, cs: 0, rflags: 0, rsp: 0, ss: 0 },
                ds: 0,
                regs: GeneralRegisters {
                    rax: 0,
                    rdx: 0,
                    rbx: 0,
                    rbp: 0,
                    rsi: 0,
                    rdi: 0,
                    rcx: 0,
                    r8: 0,
                    r9: 0,
                    r10: 0,
                    r11: 0,
                    r12: 0,
                    r13: 0,
                    r14: 0,
                    r15: 0,
                },
            },
            kernel_rsp: 0,
            map_info: ProcessMappingInfo::empty(),
        }
    }

    /// Set the registers a process starts with
    ///
    /// `ss` is also used as the data segment. General purpose registers are
    /// cleared so nothing from a previous occupant of the slot leaks through.
    #[allow(clippy::too_many_arguments)]
    pub fn set_registers(
        &mut self,
        rip: VirtAddr,
        cs: SegmentSelector,
        rsp: VirtAddr,
        ss: SegmentSelector,
        cr3: u64,
        rflags: u64,
        kernel_rsp: u64,
    ) {
        self.cpu.cr3 = cr3;
        self.cpu.frame = InterruptFrame {
            rip: rip.as_u64(),
            cs: u64::from(cs.0),
            rflags,
            rsp: rsp.as_u64(),
            ss: u64::from(ss.0),
        };
        self.cpu.ds = u64::from(ss.0);
        self.cpu.regs = GeneralRegisters::default();
        self.kernel_rsp = kernel_rsp;
    }

    /// Entry point (or resume point) of the process
    #[inline]
    pub fn rip(&self) -> VirtAddr {
        VirtAddr::new_truncate(self.cpu.frame.rip)
    }

    /// User stack pointer
    #[inline]
    pub fn rsp(&self) -> VirtAddr {
        VirtAddr::new_truncate(self.cpu.frame.rsp)
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "rip={:#x} rsp={:#x} cs={:#x} ss={:#x} rflags={:#x} cr3={:#x} kernel_rsp={:#x}",
            self.cpu.frame.rip,
            self.cpu.frame.rsp,
            self.cpu.frame.cs,
            self.cpu.frame.ss,
            self.cpu.frame.rflags,
            self.cpu.cr3,
            self.kernel_rsp
        )?;
        write!(f, "{}", self.map_info)
    }
}
