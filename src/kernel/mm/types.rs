// src/kernel/mm/types.rs
//! メモリ管理の基本型
//!
//! アドレス自体は `x86_64` クレートの [`VirtAddr`] / [`PhysAddr`] を使います。
//! このモジュールはページ境界への丸め、物理メモリへのアクセス窓、
//! メモリ関連エラーを提供します。

use core::fmt;

use x86_64::{PhysAddr, VirtAddr};

use crate::constants::{PAGE_SIZE, PAGE_SIZE_EXPONENT};

/// メモリ関連のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// 無効なアドレス（アドレス空間外、NULL等）
    InvalidAddress,
    /// アラインメント違反（ページ境界に揃っていない）
    MisalignedAccess,
    /// アドレスオーバーフロー（演算結果がアドレス空間を超える）
    AddressOverflow,
    /// 物理フレームまたは永続メモリの枯渇
    OutOfMemory,
    /// 物理アドレスが未割り当てのままマップしようとした
    BackingNotAssigned,
    /// セグメント同士が仮想アドレス空間で重なっている
    Overlap,
    /// ページテーブルへの登録に失敗（既にマップ済み等）
    MapFailed,
    /// 固定容量の表が満杯
    CapacityExceeded,
    /// 永続メモリ領域のヘッダが壊れている
    CorruptedRegion,
}

impl MemoryError {
    /// 致命的なエラーかどうか
    #[inline]
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress => write!(f, "Invalid memory address"),
            Self::MisalignedAccess => write!(f, "Address or size not page aligned"),
            Self::AddressOverflow => write!(f, "Address calculation overflow"),
            Self::OutOfMemory => write!(f, "Out of physical memory"),
            Self::BackingNotAssigned => write!(f, "Segment has no physical backing"),
            Self::Overlap => write!(f, "Segments overlap in virtual address space"),
            Self::MapFailed => write!(f, "Failed to install page mapping"),
            Self::CapacityExceeded => write!(f, "Fixed-capacity table is full"),
            Self::CorruptedRegion => write!(f, "Persistent memory region is corrupted"),
        }
    }
}

/// ページ境界に揃っているか確認
#[inline]
#[must_use]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// ページ境界に切り下げ
#[inline]
#[must_use]
pub const fn floor_to_page(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

/// ページ境界に切り上げ
///
/// # Errors
///
/// 切り上げ結果が `u64` を超える場合は [`MemoryError::AddressOverflow`]。
#[inline]
pub const fn ceil_to_page(value: u64) -> Result<u64, MemoryError> {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => Ok(v & !(PAGE_SIZE - 1)),
        None => Err(MemoryError::AddressOverflow),
    }
}

/// バイト数を必要なページ数に変換（切り上げ）
#[inline]
#[must_use]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// ページ数をバイト数に変換
///
/// # Errors
///
/// 結果が `u64` を超える場合は [`MemoryError::AddressOverflow`]。
#[inline]
pub const fn pages_to_bytes(pages: u64) -> Result<u64, MemoryError> {
    match pages.checked_shl(PAGE_SIZE_EXPONENT) {
        Some(bytes) if bytes >> PAGE_SIZE_EXPONENT == pages => Ok(bytes),
        _ => Err(MemoryError::AddressOverflow),
    }
}

/// 物理メモリへのアクセス窓
///
/// 物理アドレス `p` は仮想アドレス `offset + p` から読み書きできる、という
/// 直接マップを表します。カーネルではブートローダが用意した物理メモリマップ、
/// テストではホスト上に確保したバッファを指します。
///
/// `x86_64::structures::paging::OffsetPageTable` と同じ規約です。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysWindow {
    offset: VirtAddr,
}

impl PhysWindow {
    /// 新しいアクセス窓を作成
    ///
    /// # Safety
    ///
    /// 呼び出し元は、利用する全ての物理アドレス `p` について
    /// `offset + p` が `p` の内容にマップされていることを保証する必要があります。
    #[inline]
    pub const unsafe fn new(offset: VirtAddr) -> Self {
        Self { offset }
    }

    /// 直接マップのオフセットを取得
    #[inline]
    pub const fn offset(&self) -> VirtAddr {
        self.offset
    }

    /// 物理アドレスを直接マップ上の仮想アドレスに変換
    #[inline]
    pub fn to_virt(&self, phys: PhysAddr) -> VirtAddr {
        self.offset + phys.as_u64()
    }

    /// 物理メモリの範囲をバイト列として借用する
    ///
    /// # Safety
    ///
    /// - `[phys, phys + len)` が呼び出し元の所有する物理メモリであること
    /// - 返されたスライスの生存中、同じ範囲への他の参照が存在しないこと
    #[inline]
    pub unsafe fn bytes_mut<'a>(&self, phys: PhysAddr, len: usize) -> &'a mut [u8] {
        let ptr = self.to_virt(phys).as_mut_ptr::<u8>();
        // SAFETY: 呼び出し元が範囲の有効性と排他性を保証している
        unsafe { core::slice::from_raw_parts_mut(ptr, len) }
    }

    /// 物理メモリ上の値を型付きで借用する
    ///
    /// # Safety
    ///
    /// - `phys` が `T` のアラインメントを満たし、有効な `T` を保持していること
    /// - 返された参照の生存中、同じ範囲への他の参照が存在しないこと
    #[inline]
    pub unsafe fn as_mut<'a, T>(&self, phys: PhysAddr) -> &'a mut T {
        let ptr = self.to_virt(phys).as_mut_ptr::<T>();
        // SAFETY: 呼び出し元がアラインメントと排他性を保証している
        unsafe { &mut *ptr }
    }

    /// 直接マップ上のアドレスを物理アドレスに戻す
    #[inline]
    pub fn to_phys<T>(&self, ptr: *const T) -> PhysAddr {
        PhysAddr::new((ptr as u64).wrapping_sub(self.offset.as_u64()))
    }
}
