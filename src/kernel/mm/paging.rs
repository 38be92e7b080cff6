// src/kernel/mm/paging.rs
//! ページテーブル（アドレス空間）の構築
//!
//! 新しいユーザ空間は PML4 を 1 フレーム確保してゼロクリアし、
//! カーネルの上位半分 (エントリ 256..512) だけを共有します。
//! マッピングの登録は `x86_64` クレートの [`OffsetPageTable`] に任せます。

use alloc::vec::Vec;
use core::fmt;

use x86_64::structures::paging::mapper::{MapToError, MapperFlush, TranslateResult, UnmapError};
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
    Size4KiB, Translate,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::constants::{KERNEL_PML4_START, PAGE_SIZE};
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::mm::types::{MemoryError, PhysWindow};

/// ページテーブル 1 段あたりのエントリ数
const ENTRY_COUNT: usize = 512;

/// 1 つの PML4 エントリがカバーする範囲 (512 GiB)
const PML4_ENTRY_SPAN: u64 = 1 << 39;
const PDPT_ENTRY_SPAN: u64 = 1 << 30;
const PD_ENTRY_SPAN: u64 = 1 << 21;

/// `user_mappings` が比較するリーフのフラグ
///
/// CPU が書き換える ACCESSED / DIRTY は除外します。
const REPORTED_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE)
    .union(PageTableFlags::NO_EXECUTE);

/// 1 つのアドレス空間（PML4 ルート）
///
/// `active` は CR3 にロード済みかどうかを表します。アクティブな空間への
/// 変更だけが TLB フラッシュを必要とします。
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysFrame,
    window: PhysWindow,
    active: bool,
}

/// `user_mappings` が返す連続したマッピング
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// 仮想アドレスの先頭
    pub virt: VirtAddr,
    /// 物理アドレスの先頭
    pub phys: PhysAddr,
    /// バイト数
    pub size: u64,
    /// リーフエントリのフラグ
    pub flags: PageTableFlags,
}

impl MappedRange {
    /// 範囲の終端（排他的）
    #[inline]
    pub fn virt_end(&self) -> VirtAddr {
        self.virt + self.size
    }
}

impl fmt::Display for MappedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#018x}-{:#018x} -> {:#x} {:?}",
            self.virt.as_u64(),
            self.virt.as_u64() + self.size,
            self.phys.as_u64(),
            self.flags
        )
    }
}

impl AddressSpace {
    /// 新しいアドレス空間を作成
    ///
    /// PML4 を 1 フレーム確保してゼロクリアし、`kernel` が与えられていれば
    /// その上位半分のエントリをコピーします。作成直後の空間は非アクティブです。
    ///
    /// # Errors
    ///
    /// フレームが確保できない場合は [`MemoryError::OutOfMemory`]。
    pub fn create<A>(
        frames: &mut A,
        window: PhysWindow,
        kernel: Option<&AddressSpace>,
    ) -> KernelResult<Self>
    where
        A: FrameAllocator<Size4KiB> + ?Sized,
    {
        let root = frames
            .allocate_frame()
            .ok_or(KernelError::with_context(ErrorKind::Memory(MemoryError::OutOfMemory), "page table root"))?;

        // SAFETY: 確保したばかりのフレームで、他に参照は存在しない
        let pml4 = unsafe { window.as_mut::<PageTable>(root.start_address()) };
        pml4.zero();

        if let Some(kernel) = kernel {
            let kernel_pml4 = kernel.table(kernel.root.start_address());
            for i in KERNEL_PML4_START..ENTRY_COUNT {
                pml4[i] = kernel_pml4[i].clone();
            }
        }

        Ok(Self { root, window, active: false })
    }

    /// 現在 CR3 にロードされているアドレス空間
    ///
    /// # Safety
    ///
    /// `window` が現在のページテーブルを含む全物理メモリを覆っていること。
    /// 同じルートに対する `AddressSpace` を同時に複数作らないこと。
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn current(window: PhysWindow) -> Self {
        let (root, _) = x86_64::registers::control::Cr3::read();
        Self { root, window, active: true }
    }

    /// 既存のルートから非アクティブなアドレス空間を作る
    ///
    /// # Safety
    ///
    /// `root` が有効な PML4 を保持し、CR3 にロードされていないこと。
    pub unsafe fn from_root(root: PhysFrame, window: PhysWindow) -> Self {
        Self { root, window, active: false }
    }

    /// PML4 の物理フレーム
    #[inline]
    pub const fn root(&self) -> PhysFrame {
        self.root
    }

    /// CR3 にロードする値
    #[inline]
    pub fn cr3(&self) -> u64 {
        self.root.start_address().as_u64()
    }

    /// CR3 にロード済みかどうか
    #[inline]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    fn mapper(&mut self) -> OffsetPageTable<'_> {
        // SAFETY: ルートは有効な PML4 で、`&mut self` が排他性を保証する。
        // window は全物理メモリを直接マップしている。
        unsafe {
            let pml4 = self.window.as_mut::<PageTable>(self.root.start_address());
            OffsetPageTable::new(pml4, self.window.offset())
        }
    }

    /// `pages` ページを `virt` から `phys` へ連続にマップする
    ///
    /// 中間テーブルは `frames` から確保します。アクティブな空間では
    /// 割り込みを禁止した状態で登録し、ページごとに TLB をフラッシュします。
    ///
    /// # Errors
    ///
    /// - アドレスがページ境界にない場合は [`MemoryError::MisalignedAccess`]
    /// - 既にマップ済みのページがある場合は [`MemoryError::MapFailed`]
    /// - 中間テーブルが確保できない場合は [`MemoryError::OutOfMemory`]
    pub fn map_range<A>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        pages: u64,
        flags: PageTableFlags,
        frames: &mut A,
    ) -> KernelResult<()>
    where
        A: FrameAllocator<Size4KiB> + ?Sized,
    {
        let first_page = Page::<Size4KiB>::from_start_address(virt)
            .map_err(|_| MemoryError::MisalignedAccess)?;
        let first_frame = PhysFrame::<Size4KiB>::from_start_address(phys)
            .map_err(|_| MemoryError::MisalignedAccess)?;

        let active = self.active;
        let mut mapper = self.mapper();
        let mut install = || -> KernelResult<()> {
            for i in 0..pages {
                // SAFETY: 呼び出し元がフレームをこのマッピング専用に確保している
                let flush = unsafe {
                    mapper.map_to(first_page + i, first_frame + i, flags, frames)
                }
                .map_err(map_error)?;
                complete(flush, active);
            }
            Ok(())
        };

        if active { without_interrupts(install) } else { install() }
    }

    /// `pages` ページのマッピングを外す
    ///
    /// # Errors
    ///
    /// マップされていないページがある場合は [`MemoryError::InvalidAddress`]。
    pub fn unmap_range(&mut self, virt: VirtAddr, pages: u64) -> KernelResult<()> {
        let first_page = Page::<Size4KiB>::from_start_address(virt)
            .map_err(|_| MemoryError::MisalignedAccess)?;

        let active = self.active;
        let mut mapper = self.mapper();
        let mut remove = || -> KernelResult<()> {
            for i in 0..pages {
                let (_, flush) = mapper.unmap(first_page + i).map_err(unmap_error)?;
                complete(flush, active);
            }
            Ok(())
        };

        if active { without_interrupts(remove) } else { remove() }
    }

    /// 仮想アドレスを物理アドレスとリーフのフラグに変換
    pub fn translate(&mut self, addr: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
        match self.mapper().translate(addr) {
            TranslateResult::Mapped { frame, offset, flags } => {
                Some((frame.start_address() + offset, flags))
            }
            TranslateResult::NotMapped | TranslateResult::InvalidFrameAddress(_) => None,
        }
    }

    /// 下位半分のマッピングを列挙する
    ///
    /// 仮想・物理ともに連続し、フラグが等しい隣接ページは 1 つの範囲にまとめます。
    pub fn user_mappings(&self) -> Vec<MappedRange> {
        let mut out: Vec<MappedRange> = Vec::new();
        let mut push = |virt: u64, phys: PhysAddr, size: u64, flags: PageTableFlags| {
            let flags = flags & REPORTED_FLAGS;
            if let Some(last) = out.last_mut() {
                if last.virt.as_u64() + last.size == virt
                    && last.phys + last.size == phys
                    && last.flags == flags
                {
                    last.size += size;
                    return;
                }
            }
            out.push(MappedRange { virt: VirtAddr::new_truncate(virt), phys, size, flags });
        };

        let pml4 = self.table(self.root.start_address());
        for (i4, e4) in pml4.iter().enumerate().take(KERNEL_PML4_START) {
            if !e4.flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            let base4 = i4 as u64 * PML4_ENTRY_SPAN;
            for (i3, e3) in self.table(e4.addr()).iter().enumerate() {
                let flags3 = e3.flags();
                if !flags3.contains(PageTableFlags::PRESENT) {
                    continue;
                }
                let base3 = base4 + i3 as u64 * PDPT_ENTRY_SPAN;
                if flags3.contains(PageTableFlags::HUGE_PAGE) {
                    push(base3, e3.addr(), PDPT_ENTRY_SPAN, flags3);
                    continue;
                }
                for (i2, e2) in self.table(e3.addr()).iter().enumerate() {
                    let flags2 = e2.flags();
                    if !flags2.contains(PageTableFlags::PRESENT) {
                        continue;
                    }
                    let base2 = base3 + i2 as u64 * PD_ENTRY_SPAN;
                    if flags2.contains(PageTableFlags::HUGE_PAGE) {
                        push(base2, e2.addr(), PD_ENTRY_SPAN, flags2);
                        continue;
                    }
                    for (i1, e1) in self.table(e2.addr()).iter().enumerate() {
                        if e1.flags().contains(PageTableFlags::PRESENT) {
                            push(base2 + i1 as u64 * PAGE_SIZE, e1.addr(), PAGE_SIZE, e1.flags());
                        }
                    }
                }
            }
        }
        out
    }

    fn table(&self, phys: PhysAddr) -> &PageTable {
        // SAFETY: present なエントリが指すフレームは有効なページテーブルで、
        // `&self` の間は書き換えられない
        unsafe { &*self.window.to_virt(phys).as_ptr::<PageTable>() }
    }
}

fn map_error(err: MapToError<Size4KiB>) -> KernelError {
    match err {
        MapToError::FrameAllocationFailed => {
            KernelError::with_context(ErrorKind::Memory(MemoryError::OutOfMemory), "intermediate page table")
        }
        MapToError::PageAlreadyMapped(_) => {
            KernelError::with_context(ErrorKind::Memory(MemoryError::MapFailed), "page already mapped")
        }
        MapToError::ParentEntryHugePage => {
            KernelError::with_context(ErrorKind::Memory(MemoryError::MapFailed), "parent entry is a huge page")
        }
    }
}

fn unmap_error(err: UnmapError) -> KernelError {
    match err {
        UnmapError::PageNotMapped => {
            KernelError::with_context(ErrorKind::Memory(MemoryError::InvalidAddress), "page not mapped")
        }
        UnmapError::ParentEntryHugePage | UnmapError::InvalidFrameAddress(_) => {
            KernelError::with_context(ErrorKind::Memory(MemoryError::MapFailed), "cannot unmap page")
        }
    }
}

/// アクティブな空間なら TLB をフラッシュし、そうでなければ破棄する
fn complete(flush: MapperFlush<Size4KiB>, active: bool) {
    if active {
        #[cfg(target_arch = "x86_64")]
        flush.flush();
        #[cfg(not(target_arch = "x86_64"))]
        flush.ignore();
    } else {
        flush.ignore();
    }
}

#[cfg(target_arch = "x86_64")]
fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(not(target_arch = "x86_64"))]
fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    f()
}
