// ============================================================================
// src/config.rs - Device Controller Configuration
// ============================================================================
//!
//! DCDの実行時設定。
//!
//! すべての値は `const` で構築できるため、`static` なコントローラの
//! 初期化式に直接書ける。

use crate::usb::dcd::regs::InterruptFlags;

/// コントロールエンドポイントのデフォルト最大パケットサイズ
pub const DEFAULT_CONTROL_MAX_PACKET_SIZE: u16 = 64;

/// ハードウェアポーリングのデフォルト上限（ループ回数）
///
/// ## 注意: CPU周波数依存
/// 早期ブート時にも使えるようタイマーではなくループ回数で数える。
/// 200MHz クラスのコアで数ミリ秒程度。
pub const DEFAULT_POLL_TIMEOUT_LOOPS: u32 = 100_000;

/// コントローラエラー割り込み時の方針
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerErrorPolicy {
    /// 上位スタックへ報告して処理を継続
    Report,
    /// バスリセットを実行してから報告
    ResetBus,
}

/// DCD設定
#[derive(Debug, Clone, Copy)]
pub struct DcdConfig {
    /// コントロールエンドポイントの最大パケットサイズ
    pub control_max_packet_size: u16,
    /// プライム完了/フラッシュ完了/リセット完了待ちの上限ループ回数
    pub poll_timeout_loops: u32,
    /// エラー割り込みの扱い
    pub error_policy: ControllerErrorPolicy,
    /// 有効化する割り込み
    pub interrupts: InterruptFlags,
    /// ディスクリプタテーブルの CPU アドレスとバスアドレスの差
    ///
    /// コントローラが CPU と同じアドレスで RAM を見るなら 0。
    pub dma_offset: usize,
}

impl DcdConfig {
    /// デフォルト設定
    pub const fn new() -> Self {
        Self {
            control_max_packet_size: DEFAULT_CONTROL_MAX_PACKET_SIZE,
            poll_timeout_loops: DEFAULT_POLL_TIMEOUT_LOOPS,
            error_policy: ControllerErrorPolicy::Report,
            interrupts: InterruptFlags::DEFAULT_ENABLED,
            dma_offset: 0,
        }
    }

    pub const fn with_control_max_packet_size(mut self, size: u16) -> Self {
        self.control_max_packet_size = size;
        self
    }

    pub const fn with_poll_timeout_loops(mut self, loops: u32) -> Self {
        self.poll_timeout_loops = loops;
        self
    }

    pub const fn with_error_policy(mut self, policy: ControllerErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub const fn with_interrupts(mut self, interrupts: InterruptFlags) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub const fn with_dma_offset(mut self, offset: usize) -> Self {
        self.dma_offset = offset;
        self
    }
}

impl Default for DcdConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DcdConfig::default();
        assert_eq!(config.control_max_packet_size, 64);
        assert_eq!(config.error_policy, ControllerErrorPolicy::Report);
        assert!(config.interrupts.contains(InterruptFlags::RESET));
        assert!(!config.interrupts.contains(InterruptFlags::SOF));
        assert_eq!(config.dma_offset, 0);
    }

    #[test]
    fn test_builder() {
        const CONFIG: DcdConfig = DcdConfig::new()
            .with_poll_timeout_loops(10)
            .with_error_policy(ControllerErrorPolicy::ResetBus);
        assert_eq!(CONFIG.poll_timeout_loops, 10);
        assert_eq!(CONFIG.error_policy, ControllerErrorPolicy::ResetBus);
    }
}
