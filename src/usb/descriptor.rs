// ============================================================================
// src/usb/descriptor.rs - USB Endpoint Descriptor
// ============================================================================
//!
//! パイプのオープンに必要なエンドポイントディスクリプタ。
//! ディスクリプタ表の内容（デバイス/コンフィグ/ストリング）は上位スタックが持つ。

use super::{EndpointAddress, TransferType};

/// ディスクリプタタイプ: エンドポイント
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 5;

/// エンドポイントディスクリプタの長さ
pub const ENDPOINT_DESCRIPTOR_LEN: usize = 7;

/// wMaxPacketSize のうちパケット長を表すビット
const MAX_PACKET_SIZE_MASK: u16 = 0x07FF;

/// ワイヤ上の 7 バイト表現
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub fn new(address: EndpointAddress, transfer_type: TransferType, max_packet_size: u16, interval: u8) -> Self {
        Self {
            b_length: ENDPOINT_DESCRIPTOR_LEN as u8,
            b_descriptor_type: DESCRIPTOR_TYPE_ENDPOINT,
            b_endpoint_address: address.0,
            bm_attributes: transfer_type.as_u8(),
            w_max_packet_size: max_packet_size,
            b_interval: interval,
        }
    }

    /// コンフィグレーションディスクリプタ中のバイト列から読み取る
    ///
    /// 長さ不足またはタイプ違いなら `None`。
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let raw: &[u8; ENDPOINT_DESCRIPTOR_LEN] = raw.get(..ENDPOINT_DESCRIPTOR_LEN)?.try_into().ok()?;
        if raw[1] != DESCRIPTOR_TYPE_ENDPOINT {
            return None;
        }

        let [len, kind, address, attributes, mps_lo, mps_hi, interval] = *raw;
        Some(Self {
            b_length: len,
            b_descriptor_type: kind,
            b_endpoint_address: address,
            bm_attributes: attributes,
            w_max_packet_size: u16::from_le_bytes([mps_lo, mps_hi]),
            b_interval: interval,
        })
    }

    pub fn address(&self) -> EndpointAddress {
        EndpointAddress(self.b_endpoint_address)
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.bm_attributes)
    }

    /// 最大パケットサイズ（bit 11-12 の high-bandwidth 指定は含まない）
    pub fn max_packet_size(&self) -> u16 {
        let raw = self.w_max_packet_size;
        raw & MAX_PACKET_SIZE_MASK
    }
}
