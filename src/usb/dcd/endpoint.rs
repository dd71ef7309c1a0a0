// ============================================================================
// src/usb/dcd/endpoint.rs - Endpoint Index Translation
// ============================================================================
//!
//! エンドポイントのインデックス変換。
//!
//! ## 3種類のインデックス
//! - 論理エンドポイント: USB上の番号 (0-5) + 方向
//! - 物理スロット: QHD配列のインデックス。偶数 = OUT, 奇数 = IN
//! - ハードウェアビット: ENDPTPRIME/ENDPTCOMPLETE 等のビット位置。
//!   OUT は下位ハーフ (0..N)、IN は上位ハーフ (16..16+N)
//!
//! 入力は検証済みの呼び出しから来るため、変換関数にエラー経路はない。

use crate::usb::{ClassId, ControllerId, EndpointAddress, TransferDirection, TransferType};

/// 物理スロット数（ハードウェア上限）
pub const MAX_SLOTS: usize = 12;

/// 論理エンドポイント数
pub const MAX_LOGICAL_ENDPOINTS: usize = MAX_SLOTS / 2;

/// IN方向ビットのバンク境界
pub const IN_BANK_OFFSET: u8 = 16;

// ============================================================================
// Physical Slot
// ============================================================================

/// 物理スロット (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalSlot(pub u8);

impl PhysicalSlot {
    /// コントロールOUT
    pub const CONTROL_OUT: Self = Self(0);
    /// コントロールIN
    pub const CONTROL_IN: Self = Self(1);

    /// エンドポイントアドレスから変換: 2 × 番号 + (IN なら 1)
    pub fn from_address(address: EndpointAddress) -> Self {
        Self(2 * address.number() + address.is_in() as u8)
    }

    /// 論理エンドポイント番号と方向から変換
    pub fn from_logical(number: u8, direction: TransferDirection) -> Self {
        Self(2 * number + (direction == TransferDirection::In) as u8)
    }

    /// 論理エンドポイント番号
    pub fn logical(&self) -> u8 {
        self.0 / 2
    }

    /// IN方向?
    pub fn is_in(&self) -> bool {
        self.0 % 2 == 1
    }

    /// 転送方向
    pub fn direction(&self) -> TransferDirection {
        if self.is_in() {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }

    /// 同じ論理エンドポイントの反対方向スロット
    pub fn opposite(&self) -> Self {
        Self(self.0 ^ 1)
    }

    /// コントロールパイプ用の予約スロット?
    pub fn is_control(&self) -> bool {
        self.0 < 2
    }

    /// ハードウェアの範囲内?
    pub fn is_valid(&self) -> bool {
        (self.0 as usize) < MAX_SLOTS
    }

    /// エンドポイントアドレスに戻す
    pub fn address(&self) -> EndpointAddress {
        match self.direction() {
            TransferDirection::In => EndpointAddress::in_endpoint(self.logical()),
            TransferDirection::Out => EndpointAddress::out_endpoint(self.logical()),
        }
    }

    /// ステータス/プライムレジスタ上のビット位置
    pub fn hardware_bit(&self) -> HardwareBit {
        if self.is_in() {
            HardwareBit(self.logical() + IN_BANK_OFFSET)
        } else {
            HardwareBit(self.logical())
        }
    }

    /// ステータス/プライムレジスタ用のマスク
    pub fn mask(&self) -> u32 {
        self.hardware_bit().mask()
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// 全スロット
    pub fn all() -> impl Iterator<Item = PhysicalSlot> {
        (0..MAX_SLOTS as u8).map(PhysicalSlot)
    }

    /// コントロール以外の全スロット
    pub fn non_control() -> impl Iterator<Item = PhysicalSlot> {
        (2..MAX_SLOTS as u8).map(PhysicalSlot)
    }
}

// ============================================================================
// Hardware Bit
// ============================================================================

/// レジスタ上のビット位置 (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HardwareBit(pub u8);

impl HardwareBit {
    /// 物理スロットへ逆変換
    pub fn to_physical(&self) -> PhysicalSlot {
        if self.0 >= IN_BANK_OFFSET {
            PhysicalSlot(2 * (self.0 - IN_BANK_OFFSET) + 1)
        } else {
            PhysicalSlot(2 * self.0)
        }
    }

    pub fn mask(&self) -> u32 {
        1 << self.0
    }
}

// ============================================================================
// Endpoint Handle
// ============================================================================

/// エンドポイントハンドル
///
/// パイプのオープン時に返され、以降の操作で使う。
/// ハードウェア状態の所有権は持たない（逆参照のみ）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointHandle {
    /// コントローラID
    pub controller: ControllerId,
    /// 転送タイプ
    pub transfer_type: TransferType,
    /// 物理スロット
    pub slot: PhysicalSlot,
    /// 所有クラス
    pub class: ClassId,
}

impl EndpointHandle {
    /// エンドポイントアドレス
    pub fn address(&self) -> EndpointAddress {
        self.slot.address()
    }
}
