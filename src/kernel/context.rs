// src/kernel/context.rs
//! カーネルコンテキスト
//!
//! ローダとプロセス管理が必要とする資源（物理メモリの窓、フレームアロケータ、
//! カーネルのアドレス空間、プロセス表、設定）をまとめて明示的に渡します。
//! グローバルな可変状態は持ちません。

use x86_64::VirtAddr;

use crate::kernel::core::KernelResult;
use crate::kernel::loader::LoaderConfig;
use crate::kernel::mm::frame::{ContiguousFrameAllocator, PageSource};
use crate::kernel::mm::paging::AddressSpace;
use crate::kernel::mm::types::{pages_to_bytes, PhysWindow};
use crate::kernel::process::ProcessControl;

/// メモリ管理の資源
#[derive(Debug)]
pub struct MemoryContext<'k> {
    /// 物理メモリへのアクセス窓
    pub window: PhysWindow,
    /// 揮発性 RAM のフレームアロケータ
    pub frames: &'k mut ContiguousFrameAllocator,
    /// カーネルのアドレス空間（上位半分の共有元）
    pub kernel_space: Option<AddressSpace>,
}

impl<'k> MemoryContext<'k> {
    /// 新しいメモリコンテキスト
    pub fn new(
        window: PhysWindow,
        frames: &'k mut ContiguousFrameAllocator,
        kernel_space: Option<AddressSpace>,
    ) -> Self {
        Self { window, frames, kernel_space }
    }

    /// ユーザプロセス用のページテーブルを作成
    ///
    /// カーネルの上位半分を共有した、非アクティブな空間を返します。
    ///
    /// # Errors
    ///
    /// フレームが確保できない場合は [`MemoryError::OutOfMemory`](crate::kernel::mm::MemoryError::OutOfMemory)。
    pub fn create_page_table(&mut self) -> KernelResult<AddressSpace> {
        AddressSpace::create(&mut *self.frames, self.window, self.kernel_space.as_ref())
    }

    /// カーネルスタックを確保し、その上端（直接マップ上の仮想アドレス）を返す
    ///
    /// # Errors
    ///
    /// フレームが確保できない場合は [`MemoryError::OutOfMemory`](crate::kernel::mm::MemoryError::OutOfMemory)。
    pub fn alloc_kernel_stack(&mut self, pages: u64) -> KernelResult<VirtAddr> {
        let phys = self.frames.alloc_pages(pages)?;
        let bytes = pages_to_bytes(pages)?;
        // SAFETY: 確保したばかりのページで、他に参照は存在しない
        let stack = unsafe { self.window.bytes_mut(phys, bytes as usize) };
        stack.fill(0);
        Ok(self.window.to_virt(phys) + bytes)
    }
}

/// カーネルコンテキスト
#[derive(Debug)]
pub struct KernelContext<'k> {
    /// メモリ管理の資源
    pub memory: MemoryContext<'k>,
    /// プロセス表
    pub processes: &'k mut ProcessControl,
    /// ローダの設定
    pub config: LoaderConfig,
}

impl<'k> KernelContext<'k> {
    /// 新しいカーネルコンテキスト
    pub fn new(memory: MemoryContext<'k>, processes: &'k mut ProcessControl, config: LoaderConfig) -> Self {
        Self { memory, processes, config }
    }
}
