// src/arch/x86_64/gdt.rs
//! Global Descriptor Table のセレクタ定義
//!
//! GDT 自体の構築はブートローダ側の責務です。ローダが必要とするのは
//! 実行コンテキストに書き込むセグメントセレクタの値だけです。
//!
//! レイアウトは `syscall`/`sysret` の要求に合わせています:
//!
//! | index | descriptor          |
//! |-------|---------------------|
//! | 1     | kernel code (64bit) |
//! | 2     | kernel data         |
//! | 3     | user data           |
//! | 4     | user code (64bit)   |

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

/// ユーザーデータセグメント（Ring 3）
pub const USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring3);

/// ユーザーコードセグメント（Ring 3, 64-bit）
pub const USER_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(4, PrivilegeLevel::Ring3);
