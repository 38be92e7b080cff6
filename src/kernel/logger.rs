// src/kernel/logger.rs
//! `log` クレートのバックエンド
//!
//! すべてのレコードをシリアルポート (COM1) に出力します。
//! `loader_trace` フィーチャ有効時は Trace レベルまで、無効時は Info までを出力します。

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// 出力する最大レベル
#[cfg(feature = "loader_trace")]
pub const MAX_LEVEL: LevelFilter = LevelFilter::Trace;
/// 出力する最大レベル
#[cfg(not(feature = "loader_trace"))]
pub const MAX_LEVEL: LevelFilter = LevelFilter::Info;

/// シリアルロガー
#[derive(Debug)]
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= MAX_LEVEL
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(target_arch = "x86_64")]
        crate::kernel::driver::write_debug(format_args!(
            "[{:<5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// ロガーを登録する
///
/// # Errors
///
/// 既に別のロガーが登録されている場合。
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(MAX_LEVEL);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn level_filter() {
        let info = Metadata::builder().level(Level::Info).build();
        let trace = Metadata::builder().level(Level::Trace).build();
        assert!(KernelLogger.enabled(&info));
        assert_eq!(KernelLogger.enabled(&trace), cfg!(feature = "loader_trace"));
    }
}
