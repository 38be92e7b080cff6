// src/kernel/mm/mod.rs
//! メモリ管理モジュール
//!
//! - `types`: ページ境界演算、物理メモリウィンドウ、メモリエラー
//! - `segment`: 仮想→物理の連続範囲とプロセスの 3 セグメント
//! - `frame`: 揮発性 RAM の連続フレームアロケータ
//! - `paging`: ページテーブル（アドレス空間）の構築
//! - `pmem`: 永続メモリマネージャ

pub mod frame;
pub mod paging;
pub mod pmem;
pub mod segment;
pub mod types;

pub use frame::{ContiguousFrameAllocator, PageSource};
pub use paging::{AddressSpace, MappedRange};
pub use pmem::PersistentMemoryManager;
pub use segment::{ProcessMappingInfo, SegmentKind, SegmentMapping};
pub use types::{MemoryError, PhysWindow};
