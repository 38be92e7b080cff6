// src/kernel/mm/segment.rs
//! セグメントマッピング
//!
//! 仮想アドレスの連続範囲と、それを裏付ける物理アドレスの連続範囲の組です。
//! 永続メモリ上に置かれるため `#[repr(C)]` かつ `Copy` で、
//! 未割り当ての物理アドレスは 0 で表します（フレームアロケータは物理ページ 0 を返しません）。

use core::fmt;

use x86_64::structures::paging::{FrameAllocator, PageTableFlags, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::kernel::core::KernelResult;
use crate::kernel::mm::paging::AddressSpace;
use crate::kernel::mm::types::{bytes_to_pages, is_page_aligned, MemoryError, PhysWindow};

/// セグメントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// 実行可能・書き込み不可
    Code,
    /// 書き込み可能・実行不可
    Data,
    /// 書き込み可能・実行不可
    Stack,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code => write!(f, "code"),
            Self::Data => write!(f, "data"),
            Self::Stack => write!(f, "stack"),
        }
    }
}

/// 仮想→物理の連続範囲
///
/// 仮想アドレスとサイズはページ境界に揃っていることが構築時に保証されます。
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentMapping {
    virt: u64,
    phys: u64,
    size: u64,
}

impl SegmentMapping {
    /// 空のマッピング
    pub const fn empty() -> Self {
        Self { virt: 0, phys: 0, size: 0 }
    }

    /// 物理アドレス未割り当てのマッピングを作成
    ///
    /// # Errors
    ///
    /// - `virt` または `size` がページ境界にない場合は [`MemoryError::MisalignedAccess`]
    /// - 範囲の終端が正規アドレスでない場合は [`MemoryError::AddressOverflow`]
    pub fn new(virt: VirtAddr, size: u64) -> Result<Self, MemoryError> {
        if !is_page_aligned(virt.as_u64()) || !is_page_aligned(size) {
            return Err(MemoryError::MisalignedAccess);
        }
        if size > 0 {
            let last = virt
                .as_u64()
                .checked_add(size - 1)
                .ok_or(MemoryError::AddressOverflow)?;
            // 下位半分と上位半分を跨ぐ範囲も拒否する
            if VirtAddr::try_new(last).is_err() || (virt.as_u64() ^ last) >> 63 != 0 {
                return Err(MemoryError::AddressOverflow);
            }
        }
        Ok(Self { virt: virt.as_u64(), phys: 0, size })
    }

    /// 物理アドレスを割り当てる
    ///
    /// # Errors
    ///
    /// - ページ境界にない場合は [`MemoryError::MisalignedAccess`]
    /// - 物理ページ 0 の場合は [`MemoryError::InvalidAddress`]
    pub fn set_backing(&mut self, phys: PhysAddr) -> Result<(), MemoryError> {
        if !is_page_aligned(phys.as_u64()) {
            return Err(MemoryError::MisalignedAccess);
        }
        if phys.as_u64() == 0 {
            return Err(MemoryError::InvalidAddress);
        }
        self.phys = phys.as_u64();
        Ok(())
    }

    /// 仮想アドレスの先頭
    #[inline]
    pub fn virt(&self) -> VirtAddr {
        VirtAddr::new_truncate(self.virt)
    }

    /// 仮想アドレスの終端（排他的）
    #[inline]
    pub fn virt_end(&self) -> VirtAddr {
        VirtAddr::new_truncate(self.virt.wrapping_add(self.size))
    }

    /// 物理アドレスの先頭（未割り当てなら `None`）
    #[inline]
    pub fn phys(&self) -> Option<PhysAddr> {
        if self.phys == 0 { None } else { PhysAddr::try_new(self.phys).ok() }
    }

    /// マップするバイト数
    #[inline]
    pub const fn map_size(&self) -> u64 {
        self.size
    }

    /// マップするページ数
    #[inline]
    pub const fn page_count(&self) -> u64 {
        bytes_to_pages(self.size)
    }

    /// 空のマッピングか
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// 仮想アドレス範囲が重なっているか（空の範囲は何とも重ならない）
    #[inline]
    pub fn overlaps(&self, other: &SegmentMapping) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.virt < other.virt.saturating_add(other.size)
            && other.virt < self.virt.saturating_add(self.size)
    }

    /// 裏付けの物理メモリをバイト列として借用する
    ///
    /// # Safety
    ///
    /// 裏付けのページがこのセグメント専用であり、返されたスライスの生存中に
    /// 他から参照されないこと。
    ///
    /// # Errors
    ///
    /// 物理アドレス未割り当ての場合は [`MemoryError::BackingNotAssigned`]。
    pub unsafe fn backing_mut<'a>(&self, window: &PhysWindow) -> Result<&'a mut [u8], MemoryError> {
        let phys = self.phys().ok_or(MemoryError::BackingNotAssigned)?;
        let len = usize::try_from(self.size).map_err(|_| MemoryError::AddressOverflow)?;
        // SAFETY: 呼び出し元が排他性を保証している
        Ok(unsafe { window.bytes_mut(phys, len) })
    }

    /// `src` を先頭にコピーし、残りをゼロで埋める
    ///
    /// # Safety
    ///
    /// [`SegmentMapping::backing_mut`] と同じ。
    ///
    /// # Errors
    ///
    /// - 物理アドレス未割り当ての場合は [`MemoryError::BackingNotAssigned`]
    /// - `src` がセグメントより大きい場合は [`MemoryError::AddressOverflow`]
    pub unsafe fn fill_from(&self, window: &PhysWindow, src: &[u8]) -> Result<(), MemoryError> {
        // SAFETY: 呼び出し元が排他性を保証している
        let dst = unsafe { self.backing_mut(window)? };
        if src.len() > dst.len() {
            return Err(MemoryError::AddressOverflow);
        }
        let (head, tail) = dst.split_at_mut(src.len());
        head.copy_from_slice(src);
        tail.fill(0);
        Ok(())
    }

    /// 他のセグメントの内容を自身の裏付けへコピーする
    ///
    /// # Safety
    ///
    /// 2 つの裏付けが重ならず、どちらも他から参照されていないこと。
    ///
    /// # Errors
    ///
    /// - どちらかが未割り当ての場合は [`MemoryError::BackingNotAssigned`]
    /// - サイズが異なる場合は [`MemoryError::InvalidAddress`]
    pub unsafe fn copy_contents_from(
        &self,
        window: &PhysWindow,
        src: &SegmentMapping,
    ) -> Result<(), MemoryError> {
        if src.size != self.size {
            return Err(MemoryError::InvalidAddress);
        }
        // SAFETY: 呼び出し元が 2 つの裏付けの排他性を保証している
        let (from, to) = unsafe { (src.backing_mut(window)?, self.backing_mut(window)?) };
        to.copy_from_slice(from);
        Ok(())
    }

    /// アドレス空間にマップする
    ///
    /// 全ての 4 KiB ページを `flags` で登録します。中間テーブルは `frames` から確保します。
    ///
    /// # Errors
    ///
    /// 物理アドレス未割り当ての場合は [`MemoryError::BackingNotAssigned`]。
    /// その他は [`AddressSpace::map_range`] のエラー。
    pub fn map<A>(
        &self,
        space: &mut AddressSpace,
        flags: PageTableFlags,
        frames: &mut A,
    ) -> KernelResult<()>
    where
        A: FrameAllocator<Size4KiB> + ?Sized,
    {
        let phys = self.phys().ok_or(MemoryError::BackingNotAssigned)?;
        space.map_range(self.virt(), phys, self.page_count(), flags, frames)
    }

    /// アドレス空間からマッピングを外す
    ///
    /// # Errors
    ///
    /// [`AddressSpace::unmap_range`] のエラー。
    pub fn unmap(&self, space: &mut AddressSpace) -> KernelResult<()> {
        space.unmap_range(self.virt(), self.page_count())
    }
}

impl fmt::Display for SegmentMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "virt {:#018x}-{:#018x} phys {:#x} ({} pages)",
            self.virt,
            self.virt.wrapping_add(self.size),
            self.phys,
            self.page_count()
        )
    }
}

/// プロセスの 3 つのセグメント
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessMappingInfo {
    /// コードセグメント
    pub code: SegmentMapping,
    /// データセグメント
    pub data: SegmentMapping,
    /// スタック
    pub stack: SegmentMapping,
}

impl ProcessMappingInfo {
    /// 全てのセグメントが空の状態
    pub const fn empty() -> Self {
        Self {
            code: SegmentMapping::empty(),
            data: SegmentMapping::empty(),
            stack: SegmentMapping::empty(),
        }
    }

    /// 全てのセグメントを空にする
    pub fn clear(&mut self) {
        *self = Self::empty();
    }

    /// 種類に対応するセグメント
    pub fn segment(&self, kind: SegmentKind) -> &SegmentMapping {
        match kind {
            SegmentKind::Code => &self.code,
            SegmentKind::Data => &self.data,
            SegmentKind::Stack => &self.stack,
        }
    }

    /// セグメント同士が仮想アドレス空間で重ならないことを確認
    ///
    /// # Errors
    ///
    /// 重なりがある場合は [`MemoryError::Overlap`]。
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.code.overlaps(&self.data)
            || self.code.overlaps(&self.stack)
            || self.data.overlaps(&self.stack)
        {
            return Err(MemoryError::Overlap);
        }
        Ok(())
    }

    /// セグメントの種類に応じたページフラグ
    ///
    /// `base` には `USER_ACCESSIBLE` など全セグメント共通のフラグを渡します。
    pub fn flags_for(kind: SegmentKind, base: PageTableFlags) -> PageTableFlags {
        let flags = PageTableFlags::PRESENT | base;
        match kind {
            SegmentKind::Code => flags,
            SegmentKind::Data | SegmentKind::Stack => {
                flags | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE
            }
        }
    }

    /// 3 つのセグメントをアドレス空間に登録する
    ///
    /// # Errors
    ///
    /// 重なりがある場合は [`MemoryError::Overlap`]。その他は [`SegmentMapping::map`] のエラー。
    pub fn install<A>(
        &self,
        space: &mut AddressSpace,
        base: PageTableFlags,
        frames: &mut A,
    ) -> KernelResult<()>
    where
        A: FrameAllocator<Size4KiB> + ?Sized,
    {
        self.validate()?;
        for kind in [SegmentKind::Code, SegmentKind::Data, SegmentKind::Stack] {
            self.segment(kind).map(space, Self::flags_for(kind, base), frames)?;
        }
        Ok(())
    }
}

impl fmt::Display for ProcessMappingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "code : {}", self.code)?;
        writeln!(f, "data : {}", self.data)?;
        write!(f, "stack: {}", self.stack)
    }
}
