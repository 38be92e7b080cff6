// src/arch/x86_64/mod.rs
//! x86_64 architecture-specific implementations.

pub mod gdt;

#[cfg(target_arch = "x86_64")]
use core::arch::asm;

#[cfg(target_arch = "x86_64")]
use crate::arch::Cpu;
#[cfg(target_arch = "x86_64")]
use x86_64::VirtAddr;
#[cfg(target_arch = "x86_64")]
use x86_64::instructions::{hlt, interrupts};

/// キャッシュラインサイズ（clflush の粒度）
pub const CACHE_LINE_SIZE: usize = 64;

/// x86_64 CPU operations.
#[cfg(target_arch = "x86_64")]
#[derive(Debug)]
pub struct X86Cpu;

#[cfg(target_arch = "x86_64")]
impl Cpu for X86Cpu {
    fn halt() {
        hlt();
    }

    fn disable_interrupts() {
        interrupts::disable();
    }

    fn enable_interrupts() {
        interrupts::enable();
    }

    fn are_interrupts_enabled() -> bool {
        interrupts::are_enabled()
    }
}

/// `value` が占めるキャッシュラインをすべて書き戻し、ストアフェンスを発行する
///
/// 永続メモリ上のレコードはこの関数を通過した時点で電源断に耐えます。
/// `clflush` と `sfence` は非特権命令なので、ホスト上のテストでもそのまま動作します。
pub fn flush_cache_range<T: ?Sized>(value: &T) {
    let start = core::ptr::from_ref(value).cast::<u8>() as usize;
    let len = core::mem::size_of_val(value);

    #[cfg(target_arch = "x86_64")]
    {
        let end = start + len;
        let mut line = start & !(CACHE_LINE_SIZE - 1);
        while line < end {
            // SAFETY: line は `value` の参照が指す、マップ済みの領域内にある
            unsafe {
                asm!("clflush [{}]", in(reg) line, options(nostack, preserves_flags));
            }
            line += CACHE_LINE_SIZE;
        }
        // SAFETY: sfence は副作用としてストアの順序付けのみを行う
        unsafe {
            asm!("sfence", options(nostack, preserves_flags));
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (start, len);
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// スタックを切り替えてカーネルのエントリポイントへジャンプする
///
/// `handoff` は System V 呼び出し規約の第 1 引数 (rdi) として渡されます。
/// 戻りアドレスの代わりに 0 を積むため、エントリ関数から見たスタックの
/// アラインメントは通常の `call` 直後と同じになります。
///
/// # Safety
///
/// - `entry` と `stack_top` が現在のアドレス空間でマップ済みであること
/// - `stack_top` が 16 バイト境界に揃っていること
/// - この呼び出し以降、現在のスタック上のデータが参照されないこと
#[cfg(target_arch = "x86_64")]
pub unsafe fn jump_to_kernel(entry: VirtAddr, handoff: u64, stack_top: VirtAddr) -> ! {
    // SAFETY: 呼び出し元が上記の条件を保証している
    unsafe {
        asm!(
            "mov rsp, {stack}",
            "xor rbp, rbp",
            "push 0",
            "jmp {entry}",
            stack = in(reg) stack_top.as_u64(),
            entry = in(reg) entry.as_u64(),
            in("rdi") handoff,
            options(noreturn),
        );
    }
}
