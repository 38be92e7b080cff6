// src/kernel/driver/mod.rs
//! デバイスドライバモジュール
//!
//! ローダが必要とするのはログ出力先のシリアルポートだけです。

#[cfg(target_arch = "x86_64")]
pub mod serial;

#[cfg(target_arch = "x86_64")]
pub use serial::{write_debug, SerialError, SerialPort, SERIAL1};
