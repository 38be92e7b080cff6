// src/kernel/core/mod.rs
//! カーネルコア
//!
//! サブシステム共通のエラー型を提供します。

pub mod result;

pub use result::{ErrorKind, KernelError, KernelResult, ResultExt};
