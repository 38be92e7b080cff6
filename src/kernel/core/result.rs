// src/kernel/core/result.rs
//! カーネル共通エラーハンドリング
//!
//! コンテキスト情報付きエラーで、デバッグを容易にします。
//! 各サブシステムのエラー（[`ElfError`], [`MemoryError`], [`ProcessError`]）は
//! `?` 演算子で [`KernelError`] に変換されます。

use core::fmt;

use crate::kernel::mm::types::MemoryError;
use crate::kernel::process::ProcessError;
use crate::kernel::process::elf_loader::ElfError;

/// カーネル Result 型
pub type KernelResult<T> = Result<T, KernelError>;

/// カーネルエラー（コンテキスト情報付き）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelError {
    kind: ErrorKind,
    context: Option<&'static str>,
}

impl KernelError {
    /// 新しいエラーを作成
    #[inline]
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, context: None }
    }

    /// コンテキスト情報付きエラーを作成
    #[inline]
    pub const fn with_context(kind: ErrorKind, ctx: &'static str) -> Self {
        Self { kind, context: Some(ctx) }
    }

    /// エラー種類を取得
    #[inline]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// コンテキストを取得
    #[inline]
    pub const fn context(&self) -> Option<&'static str> {
        self.context
    }

    /// イメージ形式のエラーか確認
    #[inline]
    #[must_use]
    pub const fn is_format_error(&self) -> bool {
        matches!(self.kind, ErrorKind::Elf(e) if e.is_format_error())
    }

    /// 致命的なエラーかどうかをチェック
    ///
    /// フレームや永続メモリの枯渇はこの層では回復手段がありません。
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

/// エラー種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 実行イメージの形式または構造のエラー
    Elf(ElfError),
    /// メモリ管理のエラー
    Memory(MemoryError),
    /// プロセス管理のエラー
    Process(ProcessError),
}

impl ErrorKind {
    /// 致命的なエラーかどうかをチェック
    #[inline]
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        match self {
            Self::Memory(e) => e.is_fatal(),
            _ => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Elf(e) => write!(f, "ELF error: {e}"),
            Self::Memory(e) => write!(f, "Memory error: {e}"),
            Self::Process(e) => write!(f, "Process error: {e}"),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ctx) = self.context {
            write!(f, " (context: {ctx})")?;
        }
        Ok(())
    }
}

impl From<ElfError> for KernelError {
    #[inline]
    fn from(e: ElfError) -> Self {
        KernelError::new(ErrorKind::Elf(e))
    }
}

impl From<MemoryError> for KernelError {
    #[inline]
    fn from(e: MemoryError) -> Self {
        KernelError::new(ErrorKind::Memory(e))
    }
}

impl From<ProcessError> for KernelError {
    #[inline]
    fn from(e: ProcessError) -> Self {
        KernelError::new(ErrorKind::Process(e))
    }
}

impl From<ErrorKind> for KernelError {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        KernelError::new(kind)
    }
}

/// `Result` にコンテキスト文字列を付与する拡張 trait
pub trait ResultExt<T> {
    /// エラー時に `ctx` を [`KernelError`] のコンテキストとして記録する
    ///
    /// # Errors
    ///
    /// 元の `Result` がエラーの場合、コンテキスト付きの [`KernelError`] を返します。
    fn context(self, ctx: &'static str) -> KernelResult<T>;
}

impl<T, E: Into<KernelError>> ResultExt<T> for Result<T, E> {
    fn context(self, ctx: &'static str) -> KernelResult<T> {
        self.map_err(|e| {
            let err: KernelError = e.into();
            KernelError::with_context(err.kind, ctx)
        })
    }
}
