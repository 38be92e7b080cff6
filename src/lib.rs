// src/lib.rs
//! pmos - プロセスローダとメモリマッピングのコア
//!
//! ELF64 実行イメージを検証し、揮発性 RAM または永続メモリを裏付けとする
//! ユーザアドレス空間を構築します。カーネル自身のイメージも同じ経路で展開します。
//!
//! # モジュール構成
//!
//! - `kernel::mm`: セグメントマッピング、フレームアロケータ、ページテーブル、永続メモリ
//! - `kernel::process`: ELF 検証、実行コンテキスト、永続プロセス情報、プロセス管理
//! - `kernel::loader`: エフェメラル / 永続 / カーネル の 3 つのロード経路
//! - `arch::x86_64`: セレクタ定数、キャッシュフラッシュ、カーネルへのジャンプ

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

extern crate alloc;

pub mod arch;
pub mod constants;
pub mod kernel;

pub use kernel::context::{KernelContext, MemoryContext};
pub use kernel::core::{ErrorKind, KernelError, KernelResult};
pub use kernel::fs::File;
pub use kernel::loader::{
    load_elf_and_create_ephemeral_process, load_elf_and_create_persistent_process,
    prepare_kernel_image, recover_persistent_processes, KernelImage, LoaderConfig,
};
#[cfg(target_arch = "x86_64")]
pub use kernel::loader::load_kernel_elf;
