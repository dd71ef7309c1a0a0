// ============================================================================
// src/usb/dcd/mod.rs - Device Controller Driver
// ============================================================================
//!
//! # dQH/dTD 方式 USB デバイスコントローラドライバ
//!
//! ## 構成（依存の葉から順に）
//! - `endpoint`: 論理アドレス ⇔ 物理スロット ⇔ レジスタビットの変換
//! - `regs`, `qtd`, `qhd`: レジスタ定義とハードウェア可視ディスクリプタ
//! - `pool`: 固定長ディスクリプタプール
//! - `controller`: コントローラ本体とデバイススタック境界
//! - `pipe`: バルク/インタラプトパイプ
//! - `control`: コントロール転送
//! - `isr`: 割り込みサービス（完了の回収と通知）
//! - `reset`: バスリセット/初期化/接続制御
//!
//! ## 使用例
//! ```ignore
//! static DCD: DeviceController<MmioRegisters, MyStack> = DeviceController::new(
//!     ControllerId(0),
//!     unsafe { MmioRegisters::new(USB0_BASE) },
//!     MyStack::new(),
//!     DcdConfig::new(),
//! );
//!
//! DCD.controller_reset()?;
//! DCD.init()?;
//! DCD.connect();
//! // USB0 割り込みから
//! DCD.handle_interrupt();
//! ```

pub mod control;
pub mod controller;
pub mod endpoint;
pub mod isr;
pub mod pipe;
pub mod pool;
pub mod qhd;
pub mod qtd;
pub mod regs;
pub mod reset;

#[cfg(test)]
mod mock;

pub use controller::{DcdStats, DcdStatsSnapshot, DeviceController, DeviceStack, TransferEvent};
pub use endpoint::{EndpointHandle, HardwareBit, IN_BANK_OFFSET, MAX_LOGICAL_ENDPOINTS, MAX_SLOTS, PhysicalSlot};
pub use pool::{DescriptorPool, QTD_MAX};
pub use qhd::{QTD_PER_QHD, QueueHead};
pub use qtd::{DmaAddr, DmaBuffer, MAX_TRANSFER_BYTES, TransferDescriptor};
pub use regs::{InterruptFlags, MmioRegisters, Register, RegisterAccess};
