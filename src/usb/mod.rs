// ============================================================================
// src/usb/mod.rs - USB Device-Side Types
// ============================================================================
//!
//! # USBデバイス側の共通型
//!
//! デバイスコントローラドライバと上位のデバイススタックが共有する型。
//!
//! ## 型安全性
//! - Newtype パターンによるコントローラ/クラス/エンドポイント識別子
//! - セットアップパケットはワイヤ形式 (8バイト) のまま保持

pub mod dcd;
pub mod descriptor;

pub use descriptor::EndpointDescriptor;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// コントローラID (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ControllerId(pub u8);

impl ControllerId {
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// エンドポイントを所有するクラスドライバの識別子 (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClassId(pub u8);

impl ClassId {
    /// 未割り当て
    pub const NONE: Self = Self(0);

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// エンドポイントアドレス (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// 方向ビット (Device-to-Host)
    pub const DIR_IN: u8 = 0x80;

    /// エンドポイント番号を取得 (0-15)
    pub fn number(&self) -> u8 {
        self.0 & 0x0F
    }

    /// 方向を取得 (true = IN, false = OUT)
    pub fn is_in(&self) -> bool {
        (self.0 & Self::DIR_IN) != 0
    }

    /// 転送方向を取得
    pub fn direction(&self) -> TransferDirection {
        if self.is_in() {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }

    /// INエンドポイントを作成
    pub fn in_endpoint(num: u8) -> Self {
        Self(Self::DIR_IN | (num & 0x0F))
    }

    /// OUTエンドポイントを作成
    pub fn out_endpoint(num: u8) -> Self {
        Self(num & 0x0F)
    }
}

// ============================================================================
// USB Transfer Types
// ============================================================================

/// USB転送タイプ
///
/// 値は bmAttributes の下位2ビット、および ENDPTCTRL の TXT/RXT フィールドと一致する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    /// コントロール転送
    Control = 0,
    /// アイソクロナス転送
    Isochronous = 1,
    /// バルク転送
    Bulk = 2,
    /// インタラプト転送
    Interrupt = 3,
}

impl TransferType {
    /// bmAttributes から変換（上位ビットは無視）
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// USB転送方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// ホストからデバイス
    Out,
    /// デバイスからホスト
    In,
}

impl TransferDirection {
    /// 反対方向
    pub fn opposite(&self) -> Self {
        match self {
            TransferDirection::Out => TransferDirection::In,
            TransferDirection::In => TransferDirection::Out,
        }
    }
}

// ============================================================================
// USB Setup Packet
// ============================================================================

/// USBセットアップパケット (8バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    /// リクエストタイプ
    pub bm_request_type: u8,
    /// リクエスト
    pub b_request: u8,
    /// 値
    pub w_value: u16,
    /// インデックス
    pub w_index: u16,
    /// 長さ
    pub w_length: u16,
}

impl SetupPacket {
    /// ワイヤ形式の8バイトから作成（リトルエンディアン）
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// ワイヤ形式の8バイトに変換
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = { self.w_value }.to_le_bytes();
        let index = { self.w_index }.to_le_bytes();
        let length = { self.w_length }.to_le_bytes();
        [
            self.bm_request_type,
            self.b_request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// データフェーズの方向
    pub fn direction(&self) -> TransferDirection {
        if self.bm_request_type & 0x80 != 0 {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }

    /// データフェーズの長さ
    pub fn length(&self) -> u16 {
        self.w_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address() {
        let ep = EndpointAddress(0x81);
        assert_eq!(ep.number(), 1);
        assert!(ep.is_in());
        assert_eq!(ep.direction(), TransferDirection::In);
        assert_eq!(EndpointAddress::out_endpoint(2), EndpointAddress(0x02));
        assert_eq!(EndpointAddress::in_endpoint(3), EndpointAddress(0x83));
    }

    #[test]
    fn test_transfer_type_from_attributes() {
        assert_eq!(TransferType::from_attributes(0x02), TransferType::Bulk);
        assert_eq!(TransferType::from_attributes(0x03), TransferType::Interrupt);
        assert_eq!(TransferType::from_attributes(0x0D), TransferType::Isochronous);
        assert_eq!(TransferType::Bulk.as_u8(), 2);
    }

    #[test]
    fn test_setup_packet_wire_format() {
        // GET_DESCRIPTOR(Device), 18 bytes
        let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupPacket::from_bytes(bytes);
        assert_eq!(setup.b_request, 0x06);
        assert_eq!({ setup.w_value }, 0x0100);
        assert_eq!(setup.length(), 18);
        assert_eq!(setup.direction(), TransferDirection::In);
        assert_eq!(setup.to_bytes(), bytes);
    }
}
