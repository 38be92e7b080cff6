// src/arch/mod.rs

//! Architecture-specific abstractions.
//!
//! Only x86_64 is supported. Items that execute privileged or
//! architecture-specific instructions are gated on `target_arch`.

pub mod x86_64;

pub use self::x86_64::flush_cache_range;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::X86Cpu as ArchCpu;

/// Trait for CPU-specific operations.
pub trait Cpu {
    /// Halt the CPU until the next interrupt.
    fn halt();

    /// Disable interrupts.
    fn disable_interrupts();

    /// Enable interrupts.
    fn enable_interrupts();

    /// Check if interrupts are enabled.
    fn are_interrupts_enabled() -> bool;
}
