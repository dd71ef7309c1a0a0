// ============================================================================
// src/usb/dcd/qhd.rs - Queue Head (dQH)
// ============================================================================
//!
//! エンドポイントキューヘッド (QHD) のハードウェアレイアウトと操作。
//!
//! ## メモリ構造 (64バイト, 64バイト境界)
//! - Word 0: 能力フィールド（最大パケットサイズ、ZLT、IOS）
//! - Word 1: 現在の QTD ポインタ（ハードウェア）
//! - Word 2-9: 転送オーバーレイ（ハードウェアが先頭 QTD を写す）
//! - Word 10-11: セットアップパケット（コントロール OUT のみ）
//! - 残り 16 バイト: ソフトウェア領域（クラス、転送タイプ、未完了キュー）
//!
//! 未完了キューは固定長配列の先頭詰めで、値 0 は空きを表す。
//! QTD 0/1 はコントロール専用で、このキューに入ることはない。

use core::ptr;

use bitflags::bitflags;

use super::qtd::{DmaAddr, QTD_NEXT_INVALID, TransferDescriptor};
use crate::error::{DcdError, DcdResult};
use crate::usb::{ClassId, SetupPacket, TransferType};

/// 1つの QHD に同時にリンクできる QTD の数（ダブルバッファ）
pub const QTD_PER_QHD: usize = 2;

const MAX_PACKET_SHIFT: u32 = 16;
const MAX_PACKET_MASK: u32 = 0x7FF;

bitflags! {
    /// QHD 能力フィールド
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueHeadCapabilities: u32 {
        /// Interrupt On Setup（コントロール OUT のみ）
        const INTERRUPT_ON_SETUP = 1 << 15;
        /// Zero Length Termination Select
        const ZERO_LENGTH_TERMINATION = 1 << 29;
    }
}

/// エンドポイントキューヘッド (dQH)
#[repr(C, align(64))]
pub struct QueueHead {
    /// 能力フィールド
    capabilities: u32,
    /// 現在の QTD（ハードウェア）
    current_qtd: u32,
    /// 転送オーバーレイ（ハードウェア）
    overlay: TransferDescriptor,
    /// セットアップパケット（ハードウェア）
    setup_request: [u8; 8],
    /// 所有クラス
    class_code: u8,
    /// 転送タイプ
    transfer_type: u8,
    /// 未完了キュー（QTD インデックス、0 = 空き）
    queue: [u8; QTD_PER_QHD],
    _reserved: [u8; 14 - QTD_PER_QHD],
}

const _: () = assert!(core::mem::size_of::<QueueHead>() == 64);
const _: () = assert!(core::mem::offset_of!(QueueHead, setup_request) == 40);

impl QueueHead {
    /// ゼロクリア状態
    pub const EMPTY: Self = Self {
        capabilities: 0,
        current_qtd: 0,
        overlay: TransferDescriptor::EMPTY,
        setup_request: [0; 8],
        class_code: 0,
        transfer_type: 0,
        queue: [0; QTD_PER_QHD],
        _reserved: [0; 14 - QTD_PER_QHD],
    };

    /// 全フィールドをゼロクリア
    pub fn clear(&mut self) {
        // SAFETY: &mut self は有効で整列済み
        unsafe { ptr::write_volatile(self, Self::EMPTY) }
    }

    /// 能力フィールドを設定し、オーバーレイをアイドルにする
    pub fn configure(&mut self, max_packet_size: u16, zero_length_termination: bool, interrupt_on_setup: bool) {
        let mut caps = QueueHeadCapabilities::empty();
        caps.set(QueueHeadCapabilities::ZERO_LENGTH_TERMINATION, zero_length_termination);
        caps.set(QueueHeadCapabilities::INTERRUPT_ON_SETUP, interrupt_on_setup);

        let value = caps.bits() | ((max_packet_size as u32 & MAX_PACKET_MASK) << MAX_PACKET_SHIFT);
        // SAFETY: &mut self は有効で整列済み
        unsafe { ptr::write_volatile(&mut self.capabilities, value) }
        self.overlay.write_next(QTD_NEXT_INVALID);
    }

    /// 能力フラグ
    pub fn capabilities(&self) -> QueueHeadCapabilities {
        // SAFETY: &self は有効で整列済み
        QueueHeadCapabilities::from_bits_truncate(unsafe { ptr::read_volatile(&self.capabilities) })
    }

    /// 最大パケットサイズ
    pub fn max_packet_size(&self) -> u16 {
        // SAFETY: 同上
        let value = unsafe { ptr::read_volatile(&self.capabilities) };
        ((value >> MAX_PACKET_SHIFT) & MAX_PACKET_MASK) as u16
    }

    // ------------------------------------------------------------------------
    // Software metadata
    // ------------------------------------------------------------------------

    /// 所有クラスと転送タイプを記録
    pub fn set_owner(&mut self, class: ClassId, transfer_type: TransferType) {
        self.class_code = class.as_u8();
        self.transfer_type = transfer_type.as_u8();
    }

    /// 所有クラス
    pub fn class(&self) -> ClassId {
        ClassId(self.class_code)
    }

    /// 転送タイプ
    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.transfer_type)
    }

    // ------------------------------------------------------------------------
    // Transfer overlay (hardware-owned once primed)
    // ------------------------------------------------------------------------

    /// オーバーレイ（読み取り専用ビュー）
    pub fn overlay(&self) -> &TransferDescriptor {
        &self.overlay
    }

    /// オーバーレイが処理中?
    pub fn is_active(&self) -> bool {
        self.overlay.is_active()
    }

    /// 処理中かつ HALT していない
    pub fn is_busy(&self) -> bool {
        let status = self.overlay.status();
        status.contains(super::qtd::TokenStatus::ACTIVE) && !status.contains(super::qtd::TokenStatus::HALTED)
    }

    /// QTD をオーバーレイの次ポインタに接続（プライム前に呼ぶ）
    pub fn attach(&mut self, qtd: DmaAddr) {
        self.overlay.link(qtd);
    }

    /// オーバーレイの Active をソフトウェア側でクリア（フラッシュ後）
    pub fn clear_active(&mut self) {
        self.overlay.clear_active();
    }

    /// オーバーレイの次ポインタを終端にする
    pub fn detach(&mut self) {
        self.overlay.write_next(QTD_NEXT_INVALID);
    }

    /// ハードウェアが書き込んだセットアップパケットを読み取る
    pub fn setup_request(&self) -> SetupPacket {
        // SAFETY: &self は有効で整列済み、[u8; 8] は任意のビット列で有効
        let bytes = unsafe { ptr::read_volatile(&self.setup_request) };
        SetupPacket::from_bytes(bytes)
    }

    // ------------------------------------------------------------------------
    // Outstanding-transfer queue
    // ------------------------------------------------------------------------

    /// キュー内の QTD 数
    pub fn queue_len(&self) -> usize {
        self.queue.iter().take_while(|&&idx| idx != 0).count()
    }

    /// キューが空?
    pub fn queue_is_empty(&self) -> bool {
        self.queue[0] == 0
    }

    /// キューが満杯?
    pub fn queue_is_full(&self) -> bool {
        self.queue_len() == QTD_PER_QHD
    }

    /// キュー先頭の QTD インデックス
    pub fn queue_head(&self) -> Option<usize> {
        match self.queue[0] {
            0 => None,
            idx => Some(idx as usize),
        }
    }

    /// キュー末尾の QTD インデックス
    pub fn queue_tail(&self) -> Option<usize> {
        match self.queue_len() {
            0 => None,
            len => Some(self.queue[len - 1] as usize),
        }
    }

    /// キュー内の QTD インデックス（先頭から）
    pub fn queued(&self) -> impl Iterator<Item = usize> + '_ {
        self.queue.iter().take_while(|&&idx| idx != 0).map(|&idx| idx as usize)
    }

    /// 末尾に追加
    pub fn push_queue(&mut self, qtd_index: usize) -> DcdResult<()> {
        debug_assert!(qtd_index != 0 && qtd_index <= u8::MAX as usize);
        let len = self.queue_len();
        if len == QTD_PER_QHD {
            return Err(DcdError::PoolExhausted);
        }
        self.queue[len] = qtd_index as u8;
        Ok(())
    }

    /// 先頭を取り出し、残りを左に詰める
    pub fn pop_queue(&mut self) -> Option<usize> {
        let head = self.queue_head()?;
        self.queue.copy_within(1.., 0);
        self.queue[QTD_PER_QHD - 1] = 0;
        Some(head)
    }

    /// テスト用: ハードウェアがセットアップパケットを書き込んだことを模擬
    #[cfg(test)]
    pub(crate) fn write_setup(&mut self, setup: &SetupPacket) {
        self.setup_request = setup.to_bytes();
    }

    /// テスト用: オーバーレイへのアクセス
    #[cfg(test)]
    pub(crate) fn overlay_mut(&mut self) -> &mut TransferDescriptor {
        &mut self.overlay
    }
}
