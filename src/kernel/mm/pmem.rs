// src/kernel/mm/pmem.rs
//! 永続メモリマネージャ
//!
//! 永続メモリ領域の先頭ページをヘッダとして使い、残りをページ単位の
//! バンプアロケータとして払い出します。ヘッダには払い出した永続プロセス情報の
//! 物理アドレスを記録し、再起動後に列挙できるようにします。
//!
//! ヘッダを更新するたびにキャッシュラインを書き戻します。
//! フォーマット時はシグネチャを最後に書くため、途中で電源断が起きた領域は
//! 次回起動時に再フォーマットされます。

use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::NonNull;

use x86_64::PhysAddr;

use crate::arch::flush_cache_range;
use crate::constants::{MAX_PERSISTENT_PROCESSES, PAGE_SIZE};
use crate::kernel::core::{ErrorKind, KernelError, KernelResult};
use crate::kernel::mm::frame::PageSource;
use crate::kernel::mm::types::{bytes_to_pages, is_page_aligned, MemoryError, PhysWindow};
use crate::kernel::process::persistent::{PersistentProcessInfo, PersistentRecord};

/// ヘッダのシグネチャ ("PMOSPMEM")
pub const PMEM_SIGNATURE: u64 = u64::from_le_bytes(*b"PMOSPMEM");

/// 永続メモリ領域のヘッダ（領域の先頭ページ）
#[repr(C)]
#[derive(Debug)]
struct PmemHeader {
    signature: u64,
    page_count: u64,
    next_free_page: u64,
    record_count: u64,
    records: [u64; MAX_PERSISTENT_PROCESSES],
}

const _: () = assert!(size_of::<PmemHeader>() as u64 <= PAGE_SIZE);

/// 永続メモリマネージャ
#[derive(Debug)]
pub struct PersistentMemoryManager {
    window: PhysWindow,
    base: PhysAddr,
}

impl PersistentMemoryManager {
    /// 永続メモリ領域を開く
    ///
    /// シグネチャが一致すれば既存の内容をそのまま使い、一致しなければフォーマットします。
    ///
    /// # Safety
    ///
    /// `[base, base + size)` が永続メモリであり、`window` でアクセスでき、
    /// 他の目的で使用されていないこと。
    ///
    /// # Errors
    ///
    /// - `base` がページ境界にない場合は [`MemoryError::MisalignedAccess`]
    /// - ヘッダ以外に 1 ページも無い場合は [`MemoryError::OutOfMemory`]
    /// - シグネチャは一致するがヘッダの値が矛盾している場合は [`MemoryError::CorruptedRegion`]
    pub unsafe fn open(window: PhysWindow, base: PhysAddr, size: u64) -> KernelResult<Self> {
        if !is_page_aligned(base.as_u64()) {
            return Err(MemoryError::MisalignedAccess.into());
        }
        let page_count = size / PAGE_SIZE;
        if page_count < 2 {
            return Err(KernelError::with_context(
                ErrorKind::Memory(MemoryError::OutOfMemory),
                "persistent region too small",
            ));
        }

        let mut pmem = Self { window, base };
        let header = pmem.header();
        if header.signature == PMEM_SIGNATURE {
            let consistent = header.page_count <= page_count
                && header.next_free_page >= 1
                && header.next_free_page <= header.page_count
                && header.record_count as usize <= MAX_PERSISTENT_PROCESSES;
            if !consistent {
                log::error!("pmem: header at {:#x} is inconsistent", base.as_u64());
                return Err(KernelError::with_context(
                    ErrorKind::Memory(MemoryError::CorruptedRegion),
                    "persistent memory header",
                ));
            }
            log::info!(
                "pmem: reusing region at {:#x} ({} of {} pages used, {} records)",
                base.as_u64(),
                header.next_free_page,
                header.page_count,
                header.record_count
            );
        } else {
            pmem.format(page_count);
            log::info!("pmem: formatted region at {:#x} ({} pages)", base.as_u64(), page_count);
        }
        Ok(pmem)
    }

    fn format(&mut self, page_count: u64) {
        let header = self.header();
        header.signature = 0;
        flush_cache_range(&header.signature);
        header.page_count = page_count;
        header.next_free_page = 1;
        header.record_count = 0;
        header.records = [0; MAX_PERSISTENT_PROCESSES];
        flush_cache_range(header);
        header.signature = PMEM_SIGNATURE;
        flush_cache_range(&header.signature);
    }

    fn header(&mut self) -> &mut PmemHeader {
        // SAFETY: open の条件により先頭ページはこのマネージャ専用
        unsafe { self.window.as_mut::<PmemHeader>(self.base) }
    }

    fn header_ref(&self) -> &PmemHeader {
        // SAFETY: open の条件により先頭ページはこのマネージャ専用
        unsafe { &*self.window.to_virt(self.base).as_ptr::<PmemHeader>() }
    }

    /// 領域の先頭アドレス
    #[inline]
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// 物理メモリへのアクセス窓
    #[inline]
    pub const fn window(&self) -> PhysWindow {
        self.window
    }

    /// 使用済みページ数（ヘッダを含む）
    pub fn used_pages(&self) -> u64 {
        self.header_ref().next_free_page
    }

    /// 残りのページ数
    pub fn free_pages(&self) -> u64 {
        let header = self.header_ref();
        header.page_count - header.next_free_page
    }

    /// 永続プロセス情報を 1 つ確保し、「有効スロットなし」で初期化する
    ///
    /// 初期化を書き戻してからヘッダに公開します。
    ///
    /// # Errors
    ///
    /// - 記録数が [`MAX_PERSISTENT_PROCESSES`] に達している場合は [`MemoryError::CapacityExceeded`]
    /// - 空きページが足りない場合は [`MemoryError::OutOfMemory`]
    pub fn alloc_persistent_process_info(&mut self) -> KernelResult<PersistentRecord> {
        if self.header_ref().record_count as usize >= MAX_PERSISTENT_PROCESSES {
            return Err(KernelError::with_context(
                ErrorKind::Memory(MemoryError::CapacityExceeded),
                "persistent process table",
            ));
        }
        let pages = bytes_to_pages(size_of::<PersistentProcessInfo>() as u64);
        let phys = self.alloc_pages(pages)?;

        let window = self.window;
        let ptr = NonNull::new(window.to_virt(phys).as_mut_ptr::<PersistentProcessInfo>())
            .ok_or(MemoryError::InvalidAddress)?;
        // SAFETY: 確保したばかりのページで、他に参照は存在しない
        unsafe { PersistentProcessInfo::init(ptr) };

        let header = self.header();
        let slot = header.record_count as usize;
        header.records[slot] = phys.as_u64();
        flush_cache_range(&header.records[slot]);
        header.record_count += 1;
        flush_cache_range(&header.record_count);

        log::debug!("pmem: persistent process info #{} at {:#x}", slot, phys.as_u64());
        // SAFETY: 初期化済みで、このハンドルが唯一の所有者
        Ok(unsafe { PersistentRecord::from_phys(&window, phys)? })
    }

    /// 公開済みの永続プロセス情報の物理アドレスを列挙する
    pub fn record_addrs(&self) -> Vec<PhysAddr> {
        let header = self.header_ref();
        header.records[..header.record_count as usize]
            .iter()
            .map(|&addr| PhysAddr::new_truncate(addr))
            .collect()
    }

    /// 公開済みの永続プロセス情報へのハンドルを作る
    ///
    /// # Safety
    ///
    /// `phys` のレコードへのハンドルが他に存在しないこと。
    ///
    /// # Errors
    ///
    /// - `phys` が公開済みのレコードでない場合は [`MemoryError::InvalidAddress`]
    /// - 記録されたアドレスが領域外を指す場合は [`MemoryError::CorruptedRegion`]
    pub unsafe fn record(&self, phys: PhysAddr) -> KernelResult<PersistentRecord> {
        if !self.record_addrs().contains(&phys) {
            return Err(MemoryError::InvalidAddress.into());
        }
        let end = self.base.as_u64() + self.header_ref().page_count * PAGE_SIZE;
        let last = phys.as_u64() + size_of::<PersistentProcessInfo>() as u64;
        if phys.as_u64() < self.base.as_u64() + PAGE_SIZE || last > end {
            return Err(MemoryError::CorruptedRegion.into());
        }
        // SAFETY: 領域内の初期化済みレコードで、排他性は呼び出し元が保証している
        Ok(unsafe { PersistentRecord::from_phys(&self.window, phys)? })
    }

    /// 公開済みの永続プロセス情報へのハンドルを列挙する
    ///
    /// # Safety
    ///
    /// 返されたレコードへのハンドルが他に存在しないこと（通常は起動時に 1 回だけ呼ぶ）。
    ///
    /// # Errors
    ///
    /// [`Self::record`] と同じ。
    pub unsafe fn records(&self) -> KernelResult<Vec<PersistentRecord>> {
        self.record_addrs()
            .into_iter()
            // SAFETY: 呼び出し元が排他性を保証している
            .map(|phys| unsafe { self.record(phys) })
            .collect()
    }
}

impl PageSource for PersistentMemoryManager {
    fn name(&self) -> &'static str {
        "persistent"
    }

    fn alloc_pages(&mut self, count: u64) -> KernelResult<PhysAddr> {
        let count = count.max(1);
        let base = self.base;
        let header = self.header();
        let next = header.next_free_page;
        if header.page_count - next < count {
            return Err(KernelError::with_context(
                ErrorKind::Memory(MemoryError::OutOfMemory),
                "persistent memory exhausted",
            ));
        }
        header.next_free_page = next + count;
        flush_cache_range(&header.next_free_page);
        Ok(base + next * PAGE_SIZE)
    }
}
