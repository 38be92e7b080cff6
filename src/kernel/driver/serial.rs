// src/kernel/driver/serial.rs
//! Serial ポートドライバ (UART 16550)
//!
//! ログの出力先として COM1 だけを扱います。

use core::fmt;

use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::{Port, PortReadOnly};

/// COM1 の I/O ベースアドレス
const COM1_BASE: u16 = 0x3F8;

/// 送信バッファが空くまでの最大ポーリング回数
const TX_TIMEOUT: usize = 100_000;

/// Line Status Register: 送信ホールディングレジスタが空
const LSR_TX_EMPTY: u8 = 0x20;

/// シリアルポートのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    /// 送信バッファが空かなかった
    Timeout,
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "serial transmit timeout"),
        }
    }
}

/// Serial ポート
#[derive(Debug)]
pub struct SerialPort {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: PortReadOnly<u8>,
    initialized: bool,
}

impl SerialPort {
    /// COM1 を作成 (0x3F8)
    pub const fn com1() -> Self {
        Self {
            data: Port::new(COM1_BASE),
            int_enable: Port::new(COM1_BASE + 1),
            fifo_ctrl: Port::new(COM1_BASE + 2),
            line_ctrl: Port::new(COM1_BASE + 3),
            modem_ctrl: Port::new(COM1_BASE + 4),
            line_status: PortReadOnly::new(COM1_BASE + 5),
            initialized: false,
        }
    }

    /// 38400 baud, 8N1, FIFO 有効で初期化する
    pub fn init(&mut self) {
        // SAFETY: UART 16550 の標準的な初期化シーケンス。
        // 0x3F8-0x3FC は COM1 のレジスタで、他のデバイスと共有されない。
        unsafe {
            // 割り込み無効化
            self.int_enable.write(0x00);
            // DLAB を立てて分周比 3 (38400 baud)
            self.line_ctrl.write(0x80);
            self.data.write(0x03);
            self.int_enable.write(0x00);
            // 8N1
            self.line_ctrl.write(0x03);
            // FIFO 有効化
            self.fifo_ctrl.write(0xC7);
            // DTR/RTS 設定
            self.modem_ctrl.write(0x0B);
        }
        self.initialized = true;
    }

    /// 初期化済みか
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_tx_empty(&mut self) -> bool {
        // SAFETY: Line Status Register の読み取りに副作用はない
        unsafe { self.line_status.read() & LSR_TX_EMPTY != 0 }
    }

    /// 1 バイト送信する
    ///
    /// # Errors
    ///
    /// 送信バッファが空かない場合は [`SerialError::Timeout`]。
    pub fn write_byte(&mut self, byte: u8) -> Result<(), SerialError> {
        for _ in 0..TX_TIMEOUT {
            if self.is_tx_empty() {
                // SAFETY: 送信バッファが空であることを確認済み
                unsafe { self.data.write(byte) };
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(SerialError::Timeout)
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r').map_err(|_| fmt::Error)?;
            }
            self.write_byte(byte).map_err(|_| fmt::Error)?;
        }
        Ok(())
    }
}

/// グローバル Serial ポート (const 初期化可能)
pub static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::com1());

/// デバッグ出力をシリアルポートに書き込む
///
/// ロックが取れない場合（パニック中に出力中だった場合など）は黙って捨てます。
pub fn write_debug(args: fmt::Arguments<'_>) {
    use core::fmt::Write;

    interrupts::without_interrupts(|| {
        if let Some(mut serial) = SERIAL1.try_lock() {
            if !serial.is_initialized() {
                serial.init();
            }
            let _ = serial.write_fmt(args);
        }
    });
}
