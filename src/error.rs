//! 統一エラーハンドリングモジュール
//!
//! デバイスコントローラドライバの同期エラー型を定義します。
//! 転送完了時に判明するエラー（トランザクションエラー、HALT、バッファエラー）は
//! ここには含まれず、完了通知の [`TransferEvent::Error`] として届きます。
//!
//! [`TransferEvent::Error`]: crate::usb::dcd::TransferEvent::Error

use core::fmt;

/// DCDエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcdError {
    /// サポートされていない転送タイプ（アイソクロナス）
    Unsupported,
    /// エンドポイントが既に有効
    AlreadyOpen,
    /// エンドポイントが有効化されていない
    NotOpen,
    /// 空きQTDがない、またはQHDのキューが満杯
    PoolExhausted,
    /// コントロール転送が実行中
    Busy,
    /// コントローラがエラー割り込みを報告
    ControllerError,
    /// ハードウェアのスロット数を超えるエンドポイント
    InvalidEndpoint,
    /// 1ディスクリプタで扱えない転送長
    TransferTooLarge,
    /// ハードウェアのポーリングがタイムアウト
    Timeout,
    /// コントローラの 32 ビット DMA 空間に収まらないアドレス
    DmaOutOfRange,
}

impl fmt::Display for DcdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DcdError::Unsupported => write!(f, "transfer type not supported"),
            DcdError::AlreadyOpen => write!(f, "endpoint already open"),
            DcdError::NotOpen => write!(f, "endpoint not open"),
            DcdError::PoolExhausted => write!(f, "transfer descriptor pool exhausted"),
            DcdError::Busy => write!(f, "control transfer in progress"),
            DcdError::ControllerError => write!(f, "controller reported an error"),
            DcdError::InvalidEndpoint => write!(f, "invalid endpoint"),
            DcdError::TransferTooLarge => write!(f, "transfer too large for one descriptor"),
            DcdError::Timeout => write!(f, "hardware poll timed out"),
            DcdError::DmaOutOfRange => write!(f, "address outside the 32-bit DMA window"),
        }
    }
}

/// DCDの結果型エイリアス
pub type DcdResult<T> = Result<T, DcdError>;
