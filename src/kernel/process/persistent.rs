// src/kernel/process/persistent.rs
//! 永続プロセス情報
//!
//! 実行コンテキストを 2 つのスロットに二重化し、タグ付きの有効スロット番号を
//! 1 回書き換えることでコミットします。電源断から復帰したとき、信頼できるのは
//! 正しいタグを持つ番号が指すスロットだけです。
//!
//! 書き込みの順序:
//! 1. 作業スロット（有効でない方）を完成させ、キャッシュラインを書き戻す
//! 2. 有効スロット番号を作業スロットに切り替え、書き戻す
//!
//! 2 の書き込みだけが永続化の境界です。

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::PhysAddr;

use crate::arch::flush_cache_range;
use crate::kernel::core::KernelResult;
use crate::kernel::mm::segment::SegmentMapping;
use crate::kernel::mm::types::{MemoryError, PhysWindow};
use crate::kernel::process::context::ExecutionContext;
use crate::kernel::process::ProcessError;

/// 有効スロット番号の上位ビットに付けるタグ
///
/// ゼロクリアされた（まだ一度もコミットされていない）レコードと区別するためのものです。
pub const VALID_SLOT_TAG: u64 = 0x5045_5253_0000_0000;

/// スロット数
pub const SLOT_COUNT: usize = 2;

const SLOT_INDEX_MASK: u64 = 1;

/// 永続プロセス情報
#[repr(C)]
pub struct PersistentProcessInfo {
    valid_slot: AtomicU64,
    contexts: [ExecutionContext; SLOT_COUNT],
}

impl PersistentProcessInfo {
    /// レコードを「有効スロットなし」の状態に初期化し、書き戻す
    ///
    /// # Safety
    ///
    /// `ptr` が `Self` のサイズとアラインメントを満たす書き込み可能なメモリを指し、
    /// 他から参照されていないこと。
    pub unsafe fn init(ptr: NonNull<Self>) {
        // SAFETY: 呼び出し元がメモリの有効性と排他性を保証している
        let info = unsafe {
            ptr.as_ptr().write(Self {
                valid_slot: AtomicU64::new(0),
                contexts: [ExecutionContext::empty(); SLOT_COUNT],
            });
            &*ptr.as_ptr()
        };
        flush_cache_range(info);
    }

    /// 有効なスロット番号（まだコミットされていなければ `None`）
    pub fn valid_index(&self) -> Option<usize> {
        let raw = self.valid_slot.load(Ordering::Acquire);
        if raw & !SLOT_INDEX_MASK == VALID_SLOT_TAG {
            Some((raw & SLOT_INDEX_MASK) as usize)
        } else {
            None
        }
    }

    /// 作業スロット番号（有効でない方）
    pub fn working_index(&self) -> Option<usize> {
        self.valid_index().map(|i| 1 - i)
    }

    /// スロット `index` のコンテキスト
    ///
    /// # Panics
    ///
    /// `index >= SLOT_COUNT` の場合。
    pub fn context(&self, index: usize) -> &ExecutionContext {
        &self.contexts[index]
    }

    /// スロット `index` のコンテキスト（可変）
    ///
    /// 有効スロットを書き換えると永続化の保証が失われます。
    /// ロード時の初期構築以外では [`Self::working_context_mut`] を使います。
    ///
    /// # Panics
    ///
    /// `index >= SLOT_COUNT` の場合。
    pub fn context_mut(&mut self, index: usize) -> &mut ExecutionContext {
        &mut self.contexts[index]
    }

    /// 有効スロットのコンテキスト
    pub fn valid_context(&self) -> Option<&ExecutionContext> {
        self.valid_index().map(|i| &self.contexts[i])
    }

    /// 作業スロットのコンテキスト
    pub fn working_context_mut(&mut self) -> Option<&mut ExecutionContext> {
        let i = self.working_index()?;
        Some(&mut self.contexts[i])
    }

    /// スロット `index` のキャッシュラインを書き戻す
    pub fn persist_slot(&self, index: usize) {
        flush_cache_range(&self.contexts[index]);
    }

    /// スロット `index` のコード・データ・スタックの裏付けを書き戻す
    ///
    /// # Errors
    ///
    /// 裏付けが未割り当ての場合は [`MemoryError::BackingNotAssigned`]。
    pub fn persist_segments(&self, index: usize, window: &PhysWindow) -> KernelResult<()> {
        let map_info = &self.contexts[index].map_info;
        persist_backing(window, &map_info.code)?;
        persist_backing(window, &map_info.data)?;
        persist_backing(window, &map_info.stack)
    }

    /// スロット `index` を有効にする
    ///
    /// タグ付き番号を 1 回書き込み、書き戻します。呼び出し前にスロットの内容が
    /// 書き戻されている必要があります。
    ///
    /// # Errors
    ///
    /// `index` が範囲外の場合は [`ProcessError::InvalidSlot`]。
    pub fn commit_slot(&self, index: usize) -> KernelResult<()> {
        if index >= SLOT_COUNT {
            return Err(ProcessError::InvalidSlot.into());
        }
        self.valid_slot
            .store(VALID_SLOT_TAG | index as u64, Ordering::Release);
        flush_cache_range(&self.valid_slot);
        log::trace!("persistent record: slot {} committed", index);
        Ok(())
    }

    /// 作業スロットを有効スロットと同じ状態にする
    ///
    /// レジスタとコードセグメントは有効スロットからコピーし、データとスタックは
    /// 作業スロット自身の裏付けを保ったまま中身だけをコピーします。
    /// 最後に作業スロットとその裏付けを書き戻します。
    ///
    /// # Errors
    ///
    /// - まだコミットされていない場合は [`ProcessError::NoValidSlot`]
    /// - 作業スロットの裏付けが未割り当て、またはサイズが異なる場合は [`MemoryError`]
    pub fn prepare_working(&mut self, window: &PhysWindow) -> KernelResult<()> {
        let valid = self.valid_index().ok_or(ProcessError::NoValidSlot)?;
        let working = 1 - valid;
        let src = self.contexts[valid];
        let dst = &mut self.contexts[working];

        let mut data = src.map_info.data;
        let mut stack = src.map_info.stack;
        data.set_backing(dst.map_info.data.phys().ok_or(MemoryError::BackingNotAssigned)?)?;
        stack.set_backing(dst.map_info.stack.phys().ok_or(MemoryError::BackingNotAssigned)?)?;

        // SAFETY: 2 つのスロットの裏付けは別々に確保されており重ならない。
        // 作業スロットの裏付けはどのアドレス空間からも書き込まれていない。
        unsafe {
            data.copy_contents_from(window, &src.map_info.data)?;
            stack.copy_contents_from(window, &src.map_info.stack)?;
        }

        dst.cpu = src.cpu;
        dst.kernel_rsp = src.kernel_rsp;
        dst.map_info.code = src.map_info.code;
        dst.map_info.data = data;
        dst.map_info.stack = stack;

        persist_backing(window, &data)?;
        persist_backing(window, &stack)?;
        self.persist_slot(working);
        Ok(())
    }

    /// 作業スロットをコミットする
    ///
    /// 作業スロットのデータとスタックの裏付け、コンテキストを書き戻してから
    /// 有効スロット番号を切り替えます。新しい有効スロット番号を返します。
    ///
    /// # Errors
    ///
    /// まだコミットされていない場合は [`ProcessError::NoValidSlot`]。
    pub fn commit_working(&self, window: &PhysWindow) -> KernelResult<usize> {
        let working = self.working_index().ok_or(ProcessError::NoValidSlot)?;
        let ctx = &self.contexts[working];
        persist_backing(window, &ctx.map_info.data)?;
        persist_backing(window, &ctx.map_info.stack)?;
        self.persist_slot(working);
        self.commit_slot(working)?;
        Ok(working)
    }
}

impl fmt::Debug for PersistentProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentProcessInfo")
            .field("valid_slot", &self.valid_index())
            .finish_non_exhaustive()
    }
}

/// セグメントの裏付けのキャッシュラインを書き戻す
fn persist_backing(window: &PhysWindow, segment: &SegmentMapping) -> KernelResult<()> {
    // SAFETY: 読み取りのみで、書き戻し命令はメモリ内容を変更しない
    let bytes = unsafe { segment.backing_mut(window)? };
    flush_cache_range(&*bytes);
    Ok(())
}

/// 永続メモリ上の [`PersistentProcessInfo`] へのハンドル
///
/// 永続メモリマネージャが払い出し、[`ProcessControl`](super::ProcessControl) が
/// 所有します。1 つのレコードに対してハンドルは 1 つだけ存在します。
pub struct PersistentRecord {
    ptr: NonNull<PersistentProcessInfo>,
    phys: PhysAddr,
}

// SAFETY: ハンドルはレコードを排他的に所有し、ポインタは永続メモリの直接マップを指す
unsafe impl Send for PersistentRecord {}

impl PersistentRecord {
    /// ハンドルを作成
    ///
    /// # Safety
    ///
    /// `phys` に初期化済みの [`PersistentProcessInfo`] があり、`window` で
    /// アクセスできること。同じレコードへのハンドルが他に存在しないこと。
    ///
    /// # Errors
    ///
    /// - アラインメントを満たさない場合は [`MemoryError::MisalignedAccess`]
    /// - 変換後のアドレスがヌルの場合は [`MemoryError::InvalidAddress`]
    pub unsafe fn from_phys(window: &PhysWindow, phys: PhysAddr) -> Result<Self, MemoryError> {
        let raw = window.to_virt(phys).as_mut_ptr::<PersistentProcessInfo>();
        if !raw.is_aligned() {
            return Err(MemoryError::MisalignedAccess);
        }
        let ptr = NonNull::new(raw).ok_or(MemoryError::InvalidAddress)?;
        Ok(Self { ptr, phys })
    }

    /// レコードの物理アドレス
    #[inline]
    pub const fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// レコードへの参照
    #[inline]
    pub fn get(&self) -> &PersistentProcessInfo {
        // SAFETY: from_phys の条件により、有効で排他的に所有されている
        unsafe { self.ptr.as_ref() }
    }

    /// レコードへの可変参照
    #[inline]
    pub fn get_mut(&mut self) -> &mut PersistentProcessInfo {
        // SAFETY: from_phys の条件により、有効で排他的に所有されている
        unsafe { self.ptr.as_mut() }
    }
}

impl fmt::Debug for PersistentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentRecord")
            .field("phys", &format_args!("{:#x}", self.phys.as_u64()))
            .field("valid_slot", &self.get().valid_index())
            .finish()
    }
}
