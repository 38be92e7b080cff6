// src/kernel/mm/frame.rs
//! 物理フレーム管理
//!
//! ブートローダから渡されたメモリマップの Usable 領域から、揮発性 RAM の
//! 連続フレームを払い出します。

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::constants::{MAX_USABLE_REGIONS, PAGE_SIZE};
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::mm::segment::SegmentMapping;
use crate::kernel::mm::types::{ceil_to_page, floor_to_page, pages_to_bytes, MemoryError};

/// 連続した物理ページの供給元
///
/// 揮発性 RAM（[`ContiguousFrameAllocator`]）と永続メモリ
/// （[`PersistentMemoryManager`](crate::kernel::mm::pmem::PersistentMemoryManager)）が実装します。
pub trait PageSource {
    /// 供給元の名前（ログ用）
    fn name(&self) -> &'static str;

    /// `count` ページの連続した物理メモリを確保する
    ///
    /// # Errors
    ///
    /// 連続した空きがない場合は [`MemoryError::OutOfMemory`]。
    fn alloc_pages(&mut self, count: u64) -> KernelResult<PhysAddr>;

    /// セグメントのサイズ分を確保して物理アドレスを割り当てる
    ///
    /// # Errors
    ///
    /// [`PageSource::alloc_pages`] のエラー。
    fn alloc_segment(&mut self, segment: &mut SegmentMapping) -> KernelResult<()> {
        let phys = self.alloc_pages(segment.page_count())?;
        segment.set_backing(phys)?;
        log::trace!("{}: backed {} pages at {:#x}", self.name(), segment.page_count(), phys.as_u64());
        Ok(())
    }
}

/// 物理アドレスの半開区間
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhysRange {
    /// 先頭
    pub start: u64,
    /// 終端（排他的）
    pub end: u64,
}

impl PhysRange {
    /// 新しい区間
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// 連続フレームアロケータ
///
/// 単純なバンプアロケータとして実装されており、一度割り当てたフレームは再利用しません。
/// 物理ページ 0 は「未割り当て」を表す値と衝突するため払い出しません。
#[derive(Debug)]
pub struct ContiguousFrameAllocator {
    ranges: [PhysRange; MAX_USABLE_REGIONS],
    len: usize,
    current: usize,
    next: u64,
    allocated: u64,
}

impl ContiguousFrameAllocator {
    /// 区間の列からアロケータを作成
    ///
    /// 各区間はページ境界に丸められ、空になった区間は捨てられます。
    ///
    /// # Errors
    ///
    /// 区間が [`MAX_USABLE_REGIONS`] を超える場合は [`MemoryError::CapacityExceeded`]。
    pub fn new(ranges: &[PhysRange]) -> Result<Self, MemoryError> {
        let mut alloc = Self {
            ranges: [PhysRange::default(); MAX_USABLE_REGIONS],
            len: 0,
            current: 0,
            next: 0,
            allocated: 0,
        };
        for range in ranges {
            alloc.push(*range)?;
        }
        alloc.next = alloc.ranges[0].start;
        Ok(alloc)
    }

    /// ブートローダのメモリマップから Usable 領域を集めて作成
    ///
    /// # Safety
    ///
    /// Usable 領域が他の目的で使用中でないこと。この関数は一度だけ呼び出すこと。
    ///
    /// # Errors
    ///
    /// Usable 領域が [`MAX_USABLE_REGIONS`] を超える場合は [`MemoryError::CapacityExceeded`]。
    pub unsafe fn from_memory_regions(regions: &MemoryRegions) -> Result<Self, MemoryError> {
        let mut alloc = Self::new(&[])?;
        for region in regions.iter().filter(|r| r.kind == MemoryRegionKind::Usable) {
            alloc.push(PhysRange::new(region.start, region.end))?;
        }
        alloc.next = alloc.ranges[0].start;
        log::debug!("frame allocator: {} usable ranges", alloc.len);
        Ok(alloc)
    }

    fn push(&mut self, range: PhysRange) -> Result<(), MemoryError> {
        // 物理ページ 0 は払い出さない
        let start = ceil_to_page(range.start.max(PAGE_SIZE))?;
        let end = floor_to_page(range.end);
        if start >= end {
            return Ok(());
        }
        if self.len == MAX_USABLE_REGIONS {
            return Err(MemoryError::CapacityExceeded);
        }
        self.ranges[self.len] = PhysRange::new(start, end);
        self.len += 1;
        Ok(())
    }

    /// これまでに払い出したページ数
    #[inline]
    pub const fn allocated_pages(&self) -> u64 {
        self.allocated
    }

    /// 残りのページ数
    pub fn free_pages(&self) -> u64 {
        if self.current >= self.len {
            return 0;
        }
        let rest: u64 = self.ranges[self.current + 1..self.len]
            .iter()
            .map(|r| (r.end - r.start) / PAGE_SIZE)
            .sum();
        (self.ranges[self.current].end - self.next) / PAGE_SIZE + rest
    }
}

impl PageSource for ContiguousFrameAllocator {
    fn name(&self) -> &'static str {
        "volatile"
    }

    fn alloc_pages(&mut self, count: u64) -> KernelResult<PhysAddr> {
        let bytes = pages_to_bytes(count.max(1))?;
        while self.current < self.len {
            let range = self.ranges[self.current];
            if range.end - self.next >= bytes {
                let phys = self.next;
                self.next += bytes;
                self.allocated += count.max(1);
                return Ok(PhysAddr::new(phys));
            }
            // 残りは連続確保に使えないので次の区間へ進む
            self.current += 1;
            if self.current < self.len {
                self.next = self.ranges[self.current].start;
            }
        }
        Err(KernelError::with_context(
            ErrorKind::Memory(MemoryError::OutOfMemory),
            "volatile frames exhausted",
        ))
    }
}

unsafe impl FrameAllocator<Size4KiB> for ContiguousFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let phys = self.alloc_pages(1).ok()?;
        PhysFrame::from_start_address(phys).ok()
    }
}
