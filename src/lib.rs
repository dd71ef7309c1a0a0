// ============================================================================
// src/lib.rs - USB Device Controller Driver
// ============================================================================
//!
//! # rany_usbd
//!
//! dQH/dTD (EHCI 互換のキューヘッド/転送ディスクリプタ) 方式の
//! USB 2.0 デバイスコントローラドライバ (DCD)。
//!
//! ## アーキテクチャ
//! - エンドポイントインデックス変換（論理アドレス ⇔ 物理スロット ⇔ レジスタビット）
//! - 固定長ディスクリプタプール（QHD × 12, QTD × 12、ヒープ不要）
//! - パイプマネージャ（バルク/インタラプト転送のキューイングとプライム）
//! - コントロール転送ハンドラ（データ/ステータスフェーズ）
//! - 割り込みサービス（完了ディスクリプタの回収と上位スタックへの通知）
//! - バスリセット/コントローラ初期化
//!
//! 上位のデバイススタック（列挙、クラスドライバ）は
//! [`usb::dcd::DeviceStack`] トレイトを実装してイベントを受け取る。

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod usb;

pub use config::{ControllerErrorPolicy, DcdConfig};
pub use error::{DcdError, DcdResult};
pub use usb::dcd::{
    DeviceController, DeviceStack, DmaAddr, DmaBuffer, EndpointHandle, MmioRegisters,
    PhysicalSlot, RegisterAccess, TransferEvent,
};
pub use usb::{
    ClassId, ControllerId, EndpointAddress, EndpointDescriptor, SetupPacket, TransferDirection,
    TransferType,
};
