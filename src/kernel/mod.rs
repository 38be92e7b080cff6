// src/kernel/mod.rs
//! カーネル抽象化
//!
//! # モジュール構成
//!
//! - `core`: エラー型
//! - `mm`: 物理フレーム、ページテーブル、セグメント、永続メモリ
//! - `process`: ELF 検証、実行コンテキスト、プロセス管理
//! - `loader`: 実行イメージのロード経路
//! - `context`: ローダに渡すカーネルの能力セット
//! - `fs`: ロード対象のファイルイメージ
//! - `driver` / `logger`: シリアル出力と `log` バックエンド

pub mod core;
pub mod context;
pub mod driver;
pub mod fs;
pub mod loader;
pub mod logger;
pub mod mm;
pub mod process;
