// src/kernel/loader/config.rs
//! ローダの実行時設定

use x86_64::VirtAddr;

use crate::constants::{
    KERNEL_MAIN_STACK_BASE, KERNEL_MAIN_STACK_PAGES, KERNEL_STACK_PAGES_PER_PROCESS,
    USER_STACK_BASE, USER_STACK_PAGES,
};

/// スタック配置などのローダ設定
///
/// 既定値は [`crate::constants`] のレイアウト定数です。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// ユーザスタックの下端
    pub user_stack_base: VirtAddr,
    /// ユーザスタックのページ数
    pub user_stack_pages: u64,
    /// カーネルイメージのメインスタックの下端
    pub kernel_main_stack_base: VirtAddr,
    /// カーネルイメージのメインスタックのページ数
    pub kernel_main_stack_pages: u64,
    /// プロセスごとのカーネルスタックのページ数
    pub kernel_stack_pages: u64,
}

impl LoaderConfig {
    /// 定数から作る既定の設定
    pub const fn new() -> Self {
        Self {
            user_stack_base: VirtAddr::new_truncate(USER_STACK_BASE),
            user_stack_pages: USER_STACK_PAGES,
            kernel_main_stack_base: VirtAddr::new_truncate(KERNEL_MAIN_STACK_BASE),
            kernel_main_stack_pages: KERNEL_MAIN_STACK_PAGES,
            kernel_stack_pages: KERNEL_STACK_PAGES_PER_PROCESS,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::new()
    }
}
